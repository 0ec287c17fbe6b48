//! Partial-order reduction.
//!
//! Explores one representative per equivalence class of interleavings.
//! Three filters apply in order: enabledness (computed by the scheduler),
//! the unique-interleaving filter driven by `Independent` constraints from
//! the predecessor state, and the locality optimisation that advances a
//! purely-local thread deterministically. The surviving selection produces
//! fresh independence constraints for the successor states.

use crate::state::{ExecutionState, InterleavingConstraint, Thread, ThreadId, TracePoint};
use crate::{Engine, EngineResult};
use oox_cfg::NodeKind;
use oox_syntax::{Expression, Lhs, Reference, Rhs, Statement};
use std::collections::BTreeSet;

/// Outcome of thread selection.
#[derive(Debug)]
pub(crate) enum Scheduled {
    Threads(Vec<ThreadId>),
    Deadlock,
}

/// A heap location in a read/write set. `Unknown` is the bottom marker for
/// a symbolic reference whose aliases are not materialised yet; it is
/// pessimistically dependent on anything non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum HeapRef {
    Concrete(Reference),
    Unknown,
}

impl<'a> Engine<'a> {
    /// Select the threads to branch over and update the interleaving
    /// constraints of the state for its successors.
    pub(crate) fn por(
        &mut self,
        state: &mut ExecutionState,
        enabled: Vec<ThreadId>,
    ) -> EngineResult<Scheduled> {
        if enabled.is_empty() {
            if state.threads.is_empty() {
                return Ok(Scheduled::Threads(Vec::new()));
            }
            return Ok(Scheduled::Deadlock);
        }
        if !self.config.apply_por {
            return Ok(Scheduled::Threads(enabled));
        }

        // Unique-interleaving filter: a thread whose next action was already
        // recorded independent of an action in our past leads to a state
        // reachable through an already-chosen interleaving.
        let unique: Vec<ThreadId> = enabled
            .into_iter()
            .filter(|tid| self.is_unique(state, *tid))
            .collect();

        // Locality optimisation: a purely-local step commutes with
        // everything, so advance the first such thread deterministically.
        let locals: Vec<ThreadId> = unique
            .iter()
            .copied()
            .filter(|tid| self.next_action_is_local(state, *tid))
            .collect();
        let selected = if let Some(first) = locals.first() {
            vec![*first]
        } else {
            unique
        };

        // Fresh constraints for every ordered pair of selected threads.
        let mut fresh: Vec<InterleavingConstraint> = Vec::new();
        for (i, &x) in selected.iter().enumerate() {
            for &y in &selected[i + 1..] {
                let point_x: TracePoint = (x, state.threads[&x].pc);
                let point_y: TracePoint = (y, state.threads[&y].pc);
                if self.is_independent(state, x, y) {
                    fresh.push(InterleavingConstraint::Independent(point_x, point_y));
                } else {
                    fresh.push(InterleavingConstraint::NotIndependent(point_x, point_y));
                }
            }
        }

        // Successor constraints: drop old Independent entries; keep an old
        // NotIndependent only when its endpoints are disjoint from every
        // fresh Independent pair.
        let fresh_independents: Vec<(TracePoint, TracePoint)> = fresh
            .iter()
            .filter_map(|c| match c {
                InterleavingConstraint::Independent(a, b) => Some((*a, *b)),
                InterleavingConstraint::NotIndependent(_, _) => None,
            })
            .collect();
        let mut next: Vec<InterleavingConstraint> = state
            .interleaving_constraints
            .iter()
            .filter(|old| match old {
                InterleavingConstraint::Independent(_, _) => false,
                InterleavingConstraint::NotIndependent(a, b) => fresh_independents
                    .iter()
                    .all(|(c, d)| not_conflicting((*a, *b), (*c, *d))),
            })
            .cloned()
            .collect();
        next.extend(fresh);
        state.interleaving_constraints = next;

        Ok(Scheduled::Threads(selected))
    }

    /// A thread is unique unless some `Independent(prev, cur)` constraint
    /// names its next action as `cur` and `prev` already occurred in the
    /// program trace.
    fn is_unique(&self, state: &ExecutionState, tid: ThreadId) -> bool {
        let current: TracePoint = (tid, state.threads[&tid].pc);
        !state.interleaving_constraints.iter().any(|c| match c {
            InterleavingConstraint::Independent(prev, cur) => {
                *cur == current && state.trace_contains(*prev)
            }
            InterleavingConstraint::NotIndependent(_, _) => false,
        })
    }

    /// Whether a thread's next action touches no heap location.
    fn next_action_is_local(&self, state: &ExecutionState, tid: ThreadId) -> bool {
        let (writes, reads) = self.dependent_operations(state, tid);
        writes.is_empty() && reads.is_empty()
    }

    /// Independence of the next actions of two threads.
    fn is_independent(&self, state: &ExecutionState, x: ThreadId, y: ThreadId) -> bool {
        let (writes_x, reads_x) = self.dependent_operations(state, x);
        let (writes_y, reads_y) = self.dependent_operations(state, y);

        // A fully local left-hand action is declared dependent, forcing an
        // ordering. Asymmetric on purpose; see DESIGN.md.
        if writes_x.is_empty() && reads_x.is_empty() {
            return false;
        }

        // Bottom is pessimistically dependent on anything non-empty.
        let x_has_bottom = writes_x.contains(&HeapRef::Unknown) || reads_x.contains(&HeapRef::Unknown);
        let y_has_bottom = writes_y.contains(&HeapRef::Unknown) || reads_y.contains(&HeapRef::Unknown);
        if x_has_bottom && !(writes_y.is_empty() && reads_y.is_empty()) {
            return false;
        }
        if y_has_bottom && !(writes_x.is_empty() && reads_x.is_empty()) {
            return false;
        }

        writes_x.is_disjoint(&writes_y)
            && reads_x.is_disjoint(&writes_y)
            && reads_y.is_disjoint(&writes_x)
    }

    /// The (write, read) heap locations a thread's next action touches.
    fn dependent_operations(
        &self,
        state: &ExecutionState,
        tid: ThreadId,
    ) -> (BTreeSet<HeapRef>, BTreeSet<HeapRef>) {
        let thread = &state.threads[&tid];
        let mut writes = BTreeSet::new();
        let mut reads = BTreeSet::new();

        if let NodeKind::Statement(stmt) = self.cfg.kind(thread.pc) {
            match stmt {
                Statement::Assign { lhs, rhs, .. } => {
                    self.lhs_refs(state, thread, lhs, &mut writes);
                    self.rhs_refs(state, thread, rhs, &mut reads);
                }
                Statement::Assert { assertion, .. } => {
                    self.expression_refs(state, thread, assertion, &mut reads);
                }
                Statement::Assume { assumption, .. } => {
                    self.expression_refs(state, thread, assumption, &mut reads);
                }
                Statement::Lock { var, .. } | Statement::Unlock { var, .. } => {
                    self.variable_refs(state, thread, var, &mut writes);
                    self.variable_refs(state, thread, var, &mut reads);
                }
                _ => {}
            }
        }
        (writes, reads)
    }

    /// Heap locations a variable's value may denote, following the alias
    /// map for symbolic references.
    fn variable_refs(
        &self,
        state: &ExecutionState,
        thread: &Thread,
        var: &str,
        out: &mut BTreeSet<HeapRef>,
    ) {
        let Some(value) = thread.read_var(var) else {
            return;
        };
        match value {
            Expression::Ref { handle, .. } => {
                out.insert(HeapRef::Concrete(*handle));
            }
            Expression::SymbolicRef { name, .. } => match state.alias_map.get(name) {
                Some(aliases) => {
                    for alias in aliases {
                        if let Expression::Ref { handle, .. } = alias {
                            out.insert(HeapRef::Concrete(*handle));
                        }
                    }
                }
                None => {
                    out.insert(HeapRef::Unknown);
                }
            },
            _ => {}
        }
    }

    fn lhs_refs(
        &self,
        state: &ExecutionState,
        thread: &Thread,
        lhs: &Lhs,
        out: &mut BTreeSet<HeapRef>,
    ) {
        match lhs {
            // A local slot is not a heap location.
            Lhs::Var { .. } => {}
            Lhs::Field { var, .. } => self.variable_refs(state, thread, var, out),
            Lhs::Elem { var, .. } => self.variable_refs(state, thread, var, out),
        }
    }

    fn rhs_refs(
        &self,
        state: &ExecutionState,
        thread: &Thread,
        rhs: &Rhs,
        out: &mut BTreeSet<HeapRef>,
    ) {
        match rhs {
            Rhs::Expression { value, .. } => self.expression_refs(state, thread, value, out),
            Rhs::Field { var, .. } => self.variable_refs(state, thread, var, out),
            Rhs::Elem { var, index, .. } => {
                self.variable_refs(state, thread, var, out);
                self.expression_refs(state, thread, index, out);
            }
            Rhs::Call { .. } | Rhs::NewArray { .. } => {}
        }
    }

    /// Heap locations an expression reads: array length reads and
    /// quantifier domains dereference the heap; plain variable reads do not.
    fn expression_refs(
        &self,
        state: &ExecutionState,
        thread: &Thread,
        expr: &Expression,
        out: &mut BTreeSet<HeapRef>,
    ) {
        match expr {
            Expression::SizeOf { array, .. } => self.variable_refs(state, thread, array, out),
            Expression::Forall { array, body, .. } | Expression::Exists { array, body, .. } => {
                self.variable_refs(state, thread, array, out);
                self.expression_refs(state, thread, body, out);
            }
            Expression::Binary { left, right, .. } => {
                self.expression_refs(state, thread, left, out);
                self.expression_refs(state, thread, right, out);
            }
            Expression::Unary { operand, .. } => self.expression_refs(state, thread, operand, out),
            Expression::Ite {
                guard,
                then_branch,
                else_branch,
                ..
            } => {
                self.expression_refs(state, thread, guard, out);
                self.expression_refs(state, thread, then_branch, out);
                self.expression_refs(state, thread, else_branch, out);
            }
            Expression::Var { .. }
            | Expression::SymbolicVar { .. }
            | Expression::Lit { .. }
            | Expression::Ref { .. }
            | Expression::SymbolicRef { .. } => {}
        }
    }
}

/// Endpoint-set disjointness between an old NotIndependent pair and a fresh
/// Independent pair.
fn not_conflicting(old: (TracePoint, TracePoint), fresh: (TracePoint, TracePoint)) -> bool {
    let (a, b) = old;
    let (c, d) = fresh;
    a != c && a != d && b != c && b != d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_conflicting_endpoint_disjointness() {
        let p = |t: u64, n: u64| (t, n);
        assert!(not_conflicting((p(0, 1), p(1, 2)), (p(2, 3), p(3, 4))));
        assert!(!not_conflicting((p(0, 1), p(1, 2)), (p(1, 2), p(3, 4))));
        assert!(!not_conflicting((p(0, 1), p(1, 2)), (p(3, 4), p(0, 1))));
    }

    #[test]
    fn test_heap_ref_ordering_in_sets() {
        let mut set = BTreeSet::new();
        set.insert(HeapRef::Concrete(2));
        set.insert(HeapRef::Unknown);
        set.insert(HeapRef::Concrete(1));
        assert!(set.contains(&HeapRef::Unknown));
        assert_eq!(set.len(), 3);
    }
}
