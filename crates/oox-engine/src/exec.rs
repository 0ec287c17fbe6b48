//! The thread interpreter and the process scheduler.
//!
//! `exec_p` is the scheduler loop: it computes the enabled threads, lets
//! partial-order reduction narrow the selection, and branches over the
//! surviving choices. `exec_t` advances one thread by one CFG node,
//! delegating to the per-statement transition functions. Exploration is a
//! depth-first search; `Invalid` and `Deadlock` short-circuit the whole
//! search through [`Search::Halt`].

use crate::concretize::{symbolic_value, variable_names};
use crate::eval::EvaluatedBool;
use crate::por::Scheduled;
use crate::state::{ExecutionState, HeapValue, StackFrame, Thread, ThreadId};
use crate::{Engine, EngineError, EngineResult, VerificationResult};
use oox_cfg::{MemberInfo, MemberRef, NodeKind};
use oox_syntax::{
    Expression, Identifier, Invocation, Lhs, Lit, Rhs, RuntimeType, Span, Statement, RETVAL, THIS,
};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// Result of exploring a subtree.
#[derive(Debug)]
pub(crate) enum Search {
    /// Subtree fully explored; every terminal contributed `Valid`.
    Done,
    /// Short-circuit the whole search.
    Halt(VerificationResult),
}

/// Result of stepping one thread.
#[derive(Debug)]
pub(crate) enum TStep {
    /// Successor states; empty when the branch was pruned.
    Successors(Vec<ExecutionState>),
    Halt(VerificationResult),
}

/// Outcome of discharging a single assertion in a single state.
pub(crate) enum AssertOutcome {
    Holds,
    Infeasible,
    Violated(String),
}

/// Outcome of discharging an assertion across its concretisation branches.
pub(crate) enum Discharged {
    Halt(VerificationResult),
    Branches(Vec<ExecutionState>),
}

impl<'a> Engine<'a> {
    /// The root state: thread 0 parked at the entry member, its parameters
    /// seeded with symbolic values of their declared types.
    pub(crate) fn initial_state(&mut self, member: &MemberInfo) -> EngineResult<ExecutionState> {
        let mut state = ExecutionState::new(self.config.maximum_depth);
        let tid = state.fresh_tid();
        let member_ref = MemberRef::new(member.class_name.clone(), member.decl.name().clone());

        let mut frame = StackFrame::new(member.exit, None, member_ref);
        for param in member.decl.params() {
            frame.declarations.insert(
                param.name.clone(),
                symbolic_value(&param.name, &param.ty.runtime_type()),
            );
        }
        if !member.is_static() {
            frame.declarations.insert(
                THIS.to_string(),
                Expression::SymbolicRef {
                    name: THIS.to_string(),
                    ty: RuntimeType::Reference(member.class_name.clone()),
                },
            );
        }

        state.threads.insert(
            tid,
            Thread {
                tid,
                parent: tid,
                pc: member.entry,
                call_stack: vec![frame],
                handler_stack: Vec::new(),
            },
        );
        Ok(state)
    }

    /// The scheduler loop.
    pub(crate) fn exec_p(&mut self, mut state: ExecutionState) -> EngineResult<Search> {
        if state.threads.is_empty() {
            self.stats.completed_paths += 1;
            return Ok(Search::Done);
        }
        if state.remaining_k == 0 {
            self.stats.depth_exhausted += 1;
            return Ok(Search::Done);
        }
        self.stats.observe_threads(state.threads.len());

        let enabled: Vec<ThreadId> = state
            .threads
            .values()
            .filter(|thread| self.is_enabled(&state, thread))
            .map(|thread| thread.tid)
            .collect();

        let mut selected = match self.por(&mut state, enabled)? {
            Scheduled::Deadlock => return Ok(Search::Halt(VerificationResult::Deadlock)),
            Scheduled::Threads(threads) => threads,
        };
        if self.config.apply_random_interleaving && selected.len() > 1 {
            if let Some(rng) = self.rng.as_mut() {
                selected.shuffle(rng);
            }
        }
        if selected.len() > 1 {
            self.stats.branches += selected.len() as u64 - 1;
        }

        for tid in selected {
            let mut child = state.clone();
            child.current_thread = Some(tid);
            match self.exec_t(child)? {
                TStep::Halt(verdict) => return Ok(Search::Halt(verdict)),
                TStep::Successors(successors) => {
                    for mut successor in successors {
                        successor.remaining_k -= 1;
                        successor.current_thread = None;
                        self.stats.steps += 1;
                        match self.exec_p(successor)? {
                            Search::Halt(verdict) => return Ok(Search::Halt(verdict)),
                            Search::Done => {}
                        }
                    }
                }
            }
        }
        Ok(Search::Done)
    }

    /// Whether a thread can take a step: blocked on a lock held by another
    /// thread or on a `join` with live children, otherwise yes. A lock on a
    /// still-symbolic reference is optimistically enabled; concretisation
    /// happens inside the step.
    fn is_enabled(&self, state: &ExecutionState, thread: &Thread) -> bool {
        match self.cfg.kind(thread.pc) {
            NodeKind::Statement(Statement::Lock { var, .. }) => {
                let Some(value) = thread.read_var(var) else {
                    return true;
                };
                match self.as_concrete_reference(state, value) {
                    Some(handle) => match state.locks.holder(handle) {
                        Some(holder) => holder == thread.tid,
                        None => true,
                    },
                    None => true,
                }
            }
            NodeKind::Join => state.child_count(thread.tid) == 0,
            _ => true,
        }
    }

    /// Advance the current thread through one CFG node.
    pub(crate) fn exec_t(&mut self, mut state: ExecutionState) -> EngineResult<TStep> {
        let tid = state
            .current_thread
            .ok_or(EngineError::CannotGetCurrentThread)?;
        let thread = state
            .threads
            .get(&tid)
            .ok_or(EngineError::CannotGetCurrentThread)?;
        let pc = thread.pc;
        let is_root_entry = state.program_trace.is_empty();
        state.program_trace.push((tid, pc));
        trace!(tid, pc, kind = self.cfg.kind(pc).name(), "step");

        let kind = self.cfg.kind(pc).clone();
        match kind {
            NodeKind::Statement(stmt) => self.exec_statement(state, &stmt),
            NodeKind::MemberEntry { member } => {
                self.exec_member_entry(state, &member, is_root_entry)
            }
            NodeKind::MemberExit { member, .. } => self.exec_member_exit(state, &member),
            NodeKind::TryEntry { handler } => {
                let thread = state.threads.get_mut(&tid).expect("thread looked up above");
                thread.handler_stack.push((handler, 0));
                self.advance(state)
            }
            NodeKind::TryExit | NodeKind::CatchEntry => {
                let thread = state.threads.get_mut(&tid).expect("thread looked up above");
                thread.handler_stack.pop();
                self.advance(state)
            }
            NodeKind::CatchExit => self.advance(state),
            NodeKind::Exceptional { .. } => self.exec_exceptional(state),
            NodeKind::Call { invocation, target } => {
                self.exec_invocation(state, &invocation, target)
            }
            NodeKind::Join => self.advance(state),
        }
    }

    // === Statement semantics ===

    fn exec_statement(&mut self, state: ExecutionState, stmt: &Statement) -> EngineResult<TStep> {
        match stmt {
            Statement::Declare { ty, var, .. } => {
                let mut state = state;
                self.write_local(&mut state, var, ty.runtime_type().default_expression())?;
                self.advance(state)
            }

            Statement::Assign { lhs, rhs, .. } => {
                // A call right-hand side is deferred: the call node pushes
                // the frame and the copy-back happens at member exit.
                if matches!(rhs, Rhs::Call { .. }) {
                    return self.advance(state);
                }
                let targets = assign_targets(lhs, rhs);
                let branches = self.concretes_of_type(state, &targets)?;
                let mut successors = Vec::new();
                for mut branch in branches {
                    let Some(value) = self.evaluate_rhs(&mut branch, rhs)? else {
                        self.stats.pruned += 1;
                        continue;
                    };
                    let Some(()) = self.write_lhs(&mut branch, lhs, value)? else {
                        self.stats.pruned += 1;
                        continue;
                    };
                    successors.extend(self.advance_states(branch)?);
                }
                Ok(TStep::Successors(successors))
            }

            Statement::Assert { assertion, span } => {
                let mut names = BTreeSet::new();
                variable_names(assertion, &mut names);
                let branches = self.concretes_of_type(state, &names)?;
                let mut successors = Vec::new();
                for mut branch in branches {
                    match self.discharge_assertion(&mut branch, assertion)? {
                        AssertOutcome::Violated(formula) => {
                            return Ok(TStep::Halt(VerificationResult::Invalid {
                                location: Some(*span),
                                formula: Some(formula),
                            }))
                        }
                        AssertOutcome::Infeasible => self.stats.pruned += 1,
                        AssertOutcome::Holds => successors.extend(self.advance_states(branch)?),
                    }
                }
                Ok(TStep::Successors(successors))
            }

            Statement::Assume { assumption, .. } => {
                let branches = self.assume_clause(state, assumption)?;
                let mut successors = Vec::new();
                for branch in branches {
                    successors.extend(self.advance_states(branch)?);
                }
                Ok(TStep::Successors(successors))
            }

            Statement::Lock { var, .. } => self.exec_lock(state, var),
            Statement::Unlock { var, .. } => self.exec_unlock(state, var),
            Statement::Fork { invocation, .. } => self.exec_fork(state, invocation),

            Statement::Return { expression, .. } => match expression {
                None => self.advance(state),
                Some(expr) => {
                    let mut names = BTreeSet::new();
                    variable_names(expr, &mut names);
                    let branches = self.concretes_of_type(state, &names)?;
                    let mut successors = Vec::new();
                    for mut branch in branches {
                        let Some(value) = self.evaluate(&mut branch, expr)? else {
                            self.stats.pruned += 1;
                            continue;
                        };
                        self.write_local(&mut branch, RETVAL, value)?;
                        successors.extend(self.advance_states(branch)?);
                    }
                    Ok(TStep::Successors(successors))
                }
            },

            Statement::Skip { .. } | Statement::Continue { .. } | Statement::Break { .. } => {
                self.advance(state)
            }

            Statement::While { .. }
            | Statement::Ite { .. }
            | Statement::Block { .. }
            | Statement::Try { .. }
            | Statement::Call { .. }
            | Statement::Join { .. }
            | Statement::Throw { .. } => {
                unreachable!("control-flow statements are flattened during CFG construction")
            }
        }
    }

    /// Evaluate an assumption, branching over concretisations, keeping the
    /// feasible states.
    pub(crate) fn assume_clause(
        &mut self,
        state: ExecutionState,
        clause: &Expression,
    ) -> EngineResult<Vec<ExecutionState>> {
        let mut names = BTreeSet::new();
        variable_names(clause, &mut names);
        let branches = self.concretes_of_type(state, &names)?;
        let mut kept = Vec::new();
        for mut branch in branches {
            match self.evaluate_as_bool(&mut branch, clause)? {
                None | Some(EvaluatedBool::Known(false)) => self.stats.pruned += 1,
                Some(EvaluatedBool::Known(true)) => kept.push(branch),
                Some(EvaluatedBool::Symbolic(phi)) => {
                    branch.constraints.push(phi);
                    let feasible = self
                        .solver
                        .is_satisfiable(&branch.constraints.conjunction(), &mut self.stats)?;
                    if feasible {
                        kept.push(branch);
                    } else {
                        self.stats.pruned += 1;
                    }
                }
            }
        }
        Ok(kept)
    }

    fn exec_lock(&mut self, state: ExecutionState, var: &str) -> EngineResult<TStep> {
        let value = self.read_local(&state, var)?;
        if value.is_null() {
            self.stats.pruned += 1;
            return Ok(TStep::Successors(Vec::new()));
        }
        match value {
            Expression::Ref { handle, .. } => {
                Ok(TStep::Successors(self.try_acquire(state, handle)?))
            }
            Expression::SymbolicRef { .. } => {
                let mut names = BTreeSet::new();
                names.insert(var.to_string());
                let branches = self.concretes_of_type(state, &names)?;
                let mut successors = Vec::new();
                for branch in branches {
                    let value = self.read_local(&branch, var)?;
                    match self.as_concrete_reference(&branch, &value) {
                        Some(handle) => successors.extend(self.try_acquire(branch, handle)?),
                        // The null alias cannot be locked.
                        None => self.stats.pruned += 1,
                    }
                }
                Ok(TStep::Successors(successors))
            }
            other => Err(EngineError::ExpectedReference(other)),
        }
    }

    fn try_acquire(
        &mut self,
        mut state: ExecutionState,
        handle: oox_syntax::Reference,
    ) -> EngineResult<Vec<ExecutionState>> {
        let tid = state
            .current_thread
            .ok_or(EngineError::CannotGetCurrentThread)?;
        if state.locks.acquire(handle, tid) {
            self.advance_states(state)
        } else {
            // Held by another thread; this schedule does not fire.
            self.stats.pruned += 1;
            Ok(Vec::new())
        }
    }

    fn exec_unlock(&mut self, mut state: ExecutionState, var: &str) -> EngineResult<TStep> {
        let value = self.read_local(&state, var)?;
        match self.as_concrete_reference(&state, &value) {
            Some(handle) => {
                state.locks.release(handle);
                self.advance(state)
            }
            None => Err(EngineError::ExpectedReference(value)),
        }
    }

    fn exec_fork(&mut self, state: ExecutionState, invocation: &Invocation) -> EngineResult<TStep> {
        let mut names = BTreeSet::new();
        for arg in invocation.arguments() {
            variable_names(arg, &mut names);
        }
        let branches = self.concretes_of_type(state, &names)?;
        let mut successors = Vec::new();
        for mut branch in branches {
            let Some((info, this_value)) = self.resolve_method(&mut branch, invocation)? else {
                self.stats.pruned += 1;
                continue;
            };
            let Some(declarations) = self.bind_arguments(&mut branch, invocation, &info, this_value)?
            else {
                self.stats.pruned += 1;
                continue;
            };
            let parent = branch
                .current_thread
                .ok_or(EngineError::CannotGetCurrentThread)?;
            let tid = branch.fresh_tid();
            let member = MemberRef::new(info.class_name.clone(), info.decl.name().clone());
            let mut frame = StackFrame::new(info.exit, None, member);
            frame.declarations = declarations;
            branch.threads.insert(
                tid,
                Thread {
                    tid,
                    parent,
                    pc: info.entry,
                    call_stack: vec![frame],
                    handler_stack: Vec::new(),
                },
            );
            successors.extend(self.advance_states(branch)?);
        }
        Ok(TStep::Successors(successors))
    }

    // === Members and invocations ===

    fn exec_member_entry(
        &mut self,
        state: ExecutionState,
        member: &MemberRef,
        is_root: bool,
    ) -> EngineResult<TStep> {
        let info = self
            .symbols
            .lookup(&member.class_name, &member.member_name)
            .ok_or_else(|| EngineError::Unresolved(member.to_string()))?;
        let requires = info
            .decl
            .specification()
            .and_then(|spec| spec.requires.clone());
        let span = info.decl.span();

        match requires {
            // The root caller is unconstrained: its pre-condition is
            // assumed, making the contract check meaningful.
            Some(clause) if is_root => {
                let branches = self.assume_clause(state, &clause)?;
                let mut successors = Vec::new();
                for branch in branches {
                    successors.extend(self.advance_states(branch)?);
                }
                Ok(TStep::Successors(successors))
            }
            Some(clause) if self.config.verify_requires => {
                match self.discharge_branches(state, &clause, Some(span))? {
                    Discharged::Halt(verdict) => Ok(TStep::Halt(verdict)),
                    Discharged::Branches(branches) => {
                        let mut successors = Vec::new();
                        for branch in branches {
                            successors.extend(self.advance_states(branch)?);
                        }
                        Ok(TStep::Successors(successors))
                    }
                }
            }
            _ => self.advance(state),
        }
    }

    fn exec_member_exit(
        &mut self,
        mut state: ExecutionState,
        member: &MemberRef,
    ) -> EngineResult<TStep> {
        let info = self
            .symbols
            .lookup(&member.class_name, &member.member_name)
            .ok_or_else(|| EngineError::Unresolved(member.to_string()))?
            .clone();
        let tid = state
            .current_thread
            .ok_or(EngineError::CannotGetCurrentThread)?;

        // Constructors return the object under construction.
        if info.is_constructor() {
            let this = self.read_local(&state, THIS)?;
            self.write_local(&mut state, RETVAL, this)?;
        }

        let ensures = info
            .decl
            .specification()
            .and_then(|spec| spec.ensures.clone());
        let branches = match ensures {
            Some(clause) if self.config.verify_ensures => {
                match self.discharge_branches(state, &clause, Some(info.decl.span()))? {
                    Discharged::Halt(verdict) => return Ok(TStep::Halt(verdict)),
                    Discharged::Branches(branches) => branches,
                }
            }
            _ => vec![state],
        };

        let mut successors = Vec::new();
        for branch in branches {
            successors.extend(self.finish_member_exit(branch, tid)?);
        }
        Ok(TStep::Successors(successors))
    }

    /// Pop the frame (or despawn the thread) after a member exit.
    fn finish_member_exit(
        &mut self,
        mut state: ExecutionState,
        tid: ThreadId,
    ) -> EngineResult<Vec<ExecutionState>> {
        let thread = state
            .threads
            .get_mut(&tid)
            .ok_or(EngineError::CannotGetCurrentThread)?;

        if thread.call_stack.len() <= 1 {
            state.despawn(tid);
            return Ok(vec![state]);
        }

        let frame = thread.call_stack.pop().expect("length checked above");
        if let Some((_, pops)) = thread.handler_stack.last_mut() {
            if *pops > 0 {
                *pops -= 1;
            }
        }
        thread.pc = frame.return_point;

        if let Some(lhs) = &frame.target {
            let value = frame
                .declarations
                .get(RETVAL)
                .cloned()
                .ok_or_else(|| EngineError::UndeclaredVariable(RETVAL.to_string()))?;
            let Some(()) = self.write_lhs(&mut state, lhs, value)? else {
                self.stats.pruned += 1;
                return Ok(Vec::new());
            };
        }
        Ok(vec![state])
    }

    fn exec_invocation(
        &mut self,
        state: ExecutionState,
        invocation: &Invocation,
        target: Option<Lhs>,
    ) -> EngineResult<TStep> {
        let tid = state
            .current_thread
            .ok_or(EngineError::CannotGetCurrentThread)?;
        let pc = state.threads[&tid].pc;
        let return_point = self.unique_successor(pc)?;

        let mut names = BTreeSet::new();
        for arg in invocation.arguments() {
            variable_names(arg, &mut names);
        }
        let branches = self.concretes_of_type(state, &names)?;
        let mut successors = Vec::new();
        for mut branch in branches {
            let Some((info, this_value)) = self.resolve_method(&mut branch, invocation)? else {
                self.stats.pruned += 1;
                continue;
            };
            let Some(declarations) = self.bind_arguments(&mut branch, invocation, &info, this_value)?
            else {
                self.stats.pruned += 1;
                continue;
            };
            let member = MemberRef::new(info.class_name.clone(), info.decl.name().clone());
            let thread = branch.threads.get_mut(&tid).expect("thread looked up above");
            let mut frame = StackFrame::new(return_point, target.clone(), member);
            frame.declarations = declarations;
            thread.call_stack.push(frame);
            thread.increment_last_handler_pops();
            thread.pc = info.entry;
            successors.push(branch);
        }
        Ok(TStep::Successors(successors))
    }

    /// Resolve an invocation to a member. Returns the receiver value for
    /// instance calls and the freshly allocated object for constructors;
    /// `None` prunes (null receiver).
    fn resolve_method(
        &mut self,
        state: &mut ExecutionState,
        invocation: &Invocation,
    ) -> EngineResult<Option<(MemberInfo, Option<Expression>)>> {
        match invocation {
            Invocation::Method { lhs, rhs, .. } => {
                if self.symbols.is_class(lhs) {
                    let info = self
                        .symbols
                        .lookup(lhs, rhs)
                        .ok_or_else(|| EngineError::Unresolved(invocation.to_string()))?
                        .clone();
                    if info.is_constructor() {
                        return Err(EngineError::ExpectedMethodMember(invocation.to_string()));
                    }
                    return Ok(Some((info, None)));
                }

                let receiver = self.read_local(state, lhs)?;
                if receiver.is_null() {
                    return Ok(None);
                }
                let class_name = match receiver.ty() {
                    RuntimeType::Reference(class_name) => class_name.clone(),
                    _ => return Err(EngineError::ExpectedReference(receiver)),
                };
                let info = self
                    .symbols
                    .lookup(&class_name, rhs)
                    .ok_or_else(|| EngineError::Unresolved(invocation.to_string()))?
                    .clone();
                if info.is_constructor() {
                    return Err(EngineError::ExpectedMethodMember(invocation.to_string()));
                }
                Ok(Some((info, Some(receiver))))
            }
            Invocation::Constructor { class_name, .. } => {
                let info = self
                    .symbols
                    .constructor(class_name)
                    .ok_or_else(|| EngineError::Unresolved(invocation.to_string()))?
                    .clone();
                let mut fields = BTreeMap::new();
                if let Some(declared) = self.symbols.fields(class_name) {
                    for (field_name, field_ty) in declared {
                        fields.insert(
                            field_name.clone(),
                            field_ty.runtime_type().default_expression(),
                        );
                    }
                }
                let handle = state.heap.allocate(HeapValue::Object {
                    fields,
                    ty: RuntimeType::Reference(class_name.clone()),
                });
                let this = Expression::reference(handle, RuntimeType::Reference(class_name.clone()));
                Ok(Some((info, Some(this))))
            }
        }
    }

    /// Evaluate the arguments and bind them to the member's parameters.
    /// `None` prunes (an argument evaluated into an infeasible read).
    fn bind_arguments(
        &mut self,
        state: &mut ExecutionState,
        invocation: &Invocation,
        info: &MemberInfo,
        this_value: Option<Expression>,
    ) -> EngineResult<Option<BTreeMap<Identifier, Expression>>> {
        let params = info.decl.params();
        let arguments = invocation.arguments();
        if params.len() != arguments.len() {
            return Err(EngineError::Unresolved(invocation.to_string()));
        }

        let mut declarations = BTreeMap::new();
        for (param, argument) in params.iter().zip(arguments) {
            let Some(value) = self.evaluate(state, argument)? else {
                return Ok(None);
            };
            declarations.insert(param.name.clone(), value);
        }
        if let Some(this) = this_value {
            declarations.insert(THIS.to_string(), this);
        }
        Ok(Some(declarations))
    }

    // === Assertion discharge ===

    /// Discharge one assertion in one state: `¬(constraints ⇒ e)` goes to
    /// the solver; satisfiable means a counterexample exists.
    pub(crate) fn discharge_assertion(
        &mut self,
        state: &mut ExecutionState,
        assertion: &Expression,
    ) -> EngineResult<AssertOutcome> {
        match self.evaluate_as_bool(state, assertion)? {
            None => Ok(AssertOutcome::Infeasible),
            Some(EvaluatedBool::Known(true)) => Ok(AssertOutcome::Holds),
            Some(EvaluatedBool::Known(false)) => {
                Ok(AssertOutcome::Violated(format!("{:?}", assertion)))
            }
            Some(EvaluatedBool::Symbolic(phi)) => {
                let negated = Expression::and(
                    state.constraints.conjunction(),
                    Expression::not(phi.clone()),
                );
                if self.solver.is_satisfiable(&negated, &mut self.stats)? {
                    Ok(AssertOutcome::Violated(format!("{:?}", phi)))
                } else {
                    Ok(AssertOutcome::Holds)
                }
            }
        }
    }

    /// Discharge an assertion across all concretisation branches of its
    /// symbolic references.
    pub(crate) fn discharge_branches(
        &mut self,
        state: ExecutionState,
        assertion: &Expression,
        location: Option<Span>,
    ) -> EngineResult<Discharged> {
        let mut names = BTreeSet::new();
        variable_names(assertion, &mut names);
        let branches = self.concretes_of_type(state, &names)?;
        let mut kept = Vec::new();
        for mut branch in branches {
            match self.discharge_assertion(&mut branch, assertion)? {
                AssertOutcome::Violated(formula) => {
                    return Ok(Discharged::Halt(VerificationResult::Invalid {
                        location,
                        formula: Some(formula),
                    }))
                }
                AssertOutcome::Infeasible => self.stats.pruned += 1,
                AssertOutcome::Holds => kept.push(branch),
            }
        }
        Ok(Discharged::Branches(kept))
    }

    // === Right-hand sides and assignment targets ===

    fn evaluate_rhs(
        &mut self,
        state: &mut ExecutionState,
        rhs: &Rhs,
    ) -> EngineResult<Option<Expression>> {
        match rhs {
            Rhs::Expression { value, .. } => self.evaluate(state, value),
            Rhs::Field { var, field, .. } => {
                let base = self.read_local(state, var)?;
                self.read_field(state, &base, field)
            }
            Rhs::Elem { var, index, .. } => {
                let base = self.read_local(state, var)?;
                let Some(index) = self.evaluate(state, index)? else {
                    return Ok(None);
                };
                self.read_elem(state, &base, &index)
            }
            Rhs::NewArray {
                element_type, size, ..
            } => {
                let Some(size) = self.evaluate(state, size)? else {
                    return Ok(None);
                };
                let Expression::Lit {
                    lit: Lit::Int(n), ..
                } = size
                else {
                    return Err(EngineError::UnencodableFormula(
                        "symbolic length in array allocation".to_string(),
                    ));
                };
                if n < 0 {
                    return Ok(None);
                }
                let element_type = element_type.runtime_type();
                let elements = vec![element_type.default_expression(); n as usize];
                let handle = state.heap.allocate(HeapValue::Array {
                    elements,
                    element_type: element_type.clone(),
                });
                Ok(Some(Expression::reference(
                    handle,
                    RuntimeType::Array(Box::new(element_type)),
                )))
            }
            Rhs::Call { .. } => {
                unreachable!("call right-hand sides are lowered to call nodes")
            }
        }
    }

    pub(crate) fn write_lhs(
        &mut self,
        state: &mut ExecutionState,
        lhs: &Lhs,
        value: Expression,
    ) -> EngineResult<Option<()>> {
        match lhs {
            Lhs::Var { var, .. } => {
                self.write_local(state, var, value)?;
                Ok(Some(()))
            }
            Lhs::Field { var, field, .. } => {
                let base = self.read_local(state, var)?;
                self.write_field(state, &base, field, value)
            }
            Lhs::Elem { var, index, .. } => {
                let base = self.read_local(state, var)?;
                let Some(index) = self.evaluate(state, index)? else {
                    return Ok(None);
                };
                self.write_elem(state, &base, &index, value)
            }
        }
    }

    // === CFG plumbing ===

    fn unique_successor(&self, pc: oox_cfg::NodeId) -> EngineResult<oox_cfg::NodeId> {
        let successors = self.cfg.successors(pc);
        if successors.len() == 1 {
            Ok(successors[0])
        } else {
            Err(EngineError::ExpectedNumberOfNeighbours {
                kind: self.cfg.kind(pc).name(),
                expected: 1,
                found: successors.len(),
            })
        }
    }

    /// Move the current thread to every CFG successor, fanning out when the
    /// node branches.
    fn advance_states(&mut self, state: ExecutionState) -> EngineResult<Vec<ExecutionState>> {
        let tid = state
            .current_thread
            .ok_or(EngineError::CannotGetCurrentThread)?;
        let pc = state.threads[&tid].pc;
        let successors = self.cfg.successors(pc);
        match successors {
            [] => Err(EngineError::ExpectedNumberOfNeighbours {
                kind: self.cfg.kind(pc).name(),
                expected: 1,
                found: 0,
            }),
            [next] => {
                let next = *next;
                let mut state = state;
                state
                    .threads
                    .get_mut(&tid)
                    .expect("thread looked up above")
                    .pc = next;
                Ok(vec![state])
            }
            many => {
                let many = many.to_vec();
                self.stats.branches += many.len() as u64 - 1;
                Ok(many
                    .into_iter()
                    .map(|next| {
                        let mut clone = state.clone();
                        clone
                            .threads
                            .get_mut(&tid)
                            .expect("thread looked up above")
                            .pc = next;
                        clone
                    })
                    .collect())
            }
        }
    }

    fn advance(&mut self, state: ExecutionState) -> EngineResult<TStep> {
        Ok(TStep::Successors(self.advance_states(state)?))
    }
}

/// Variables an assignment must concretise: bases of field and element
/// accesses on either side, plus heap-dependent reads inside evaluated
/// expressions (array lengths, quantifier domains).
fn assign_targets(lhs: &Lhs, rhs: &Rhs) -> BTreeSet<Identifier> {
    let mut names = BTreeSet::new();
    match lhs {
        Lhs::Var { .. } => {}
        Lhs::Field { var, .. } => {
            names.insert(var.clone());
        }
        Lhs::Elem { var, index, .. } => {
            names.insert(var.clone());
            heap_dependent_names(index, &mut names);
        }
    }
    match rhs {
        Rhs::Expression { value, .. } => heap_dependent_names(value, &mut names),
        Rhs::Field { var, .. } => {
            names.insert(var.clone());
        }
        Rhs::Elem { var, index, .. } => {
            names.insert(var.clone());
            heap_dependent_names(index, &mut names);
        }
        Rhs::NewArray { size, .. } => heap_dependent_names(size, &mut names),
        Rhs::Call { .. } => {}
    }
    names
}

/// Names whose values must be concrete for an expression to reduce: array
/// length reads and quantifier domains.
fn heap_dependent_names(expr: &Expression, out: &mut BTreeSet<Identifier>) {
    match expr {
        Expression::SizeOf { array, .. } => {
            out.insert(array.clone());
        }
        Expression::Forall { array, body, .. } | Expression::Exists { array, body, .. } => {
            out.insert(array.clone());
            heap_dependent_names(body, out);
        }
        Expression::Binary { left, right, .. } => {
            heap_dependent_names(left, out);
            heap_dependent_names(right, out);
        }
        Expression::Unary { operand, .. } => heap_dependent_names(operand, out),
        Expression::Ite {
            guard,
            then_branch,
            else_branch,
            ..
        } => {
            heap_dependent_names(guard, out);
            heap_dependent_names(then_branch, out);
            heap_dependent_names(else_branch, out);
        }
        Expression::Var { .. }
        | Expression::SymbolicVar { .. }
        | Expression::Lit { .. }
        | Expression::Ref { .. }
        | Expression::SymbolicRef { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_targets_cover_both_sides() {
        let span = Span::synthetic();
        let lhs = Lhs::Field {
            var: "x".to_string(),
            field: "f".to_string(),
            span,
        };
        let rhs = Rhs::Elem {
            var: "a".to_string(),
            index: Expression::SizeOf {
                array: "b".to_string(),
                ty: RuntimeType::Int,
            },
            span,
        };
        let names = assign_targets(&lhs, &rhs);
        assert!(names.contains("x"));
        assert!(names.contains("a"));
        assert!(names.contains("b"));
    }

    #[test]
    fn test_heap_dependent_names_skip_plain_variables() {
        let expr = Expression::eq(
            Expression::Var {
                name: "x".to_string(),
                ty: RuntimeType::Unknown,
            },
            Expression::int(1),
        );
        let mut names = BTreeSet::new();
        heap_dependent_names(&expr, &mut names);
        assert!(names.is_empty());
    }
}
