//! Concretisation of symbolic references and arrays.
//!
//! Operations that depend on the concrete identity of a symbolic reference
//! (assertions, assumes, returns, lock acquisition, argument passing, field
//! and element accesses) first branch over the alias set of every symbolic
//! reference involved. Each branch pins one alias, records the equality in
//! the path constraints, and is dropped if that makes them unsatisfiable.
//!
//! A symbolic array additionally needs a length: a fresh array is allocated
//! per length up to the configured bound, holding fresh symbolic elements.

use crate::state::{ExecutionState, HeapValue};
use crate::{Engine, EngineError, EngineResult};
use oox_syntax::{Expression, Identifier, RuntimeType};
use std::collections::BTreeSet;

impl<'a> Engine<'a> {
    /// Lazily populate the alias entry of a symbolic object reference: a
    /// fresh object of its class, null when enabled, and (when alias
    /// expansion is on) every previously materialised alias of the same
    /// type.
    pub(crate) fn init_symbolic_object(
        &mut self,
        state: &mut ExecutionState,
        name: &str,
        ty: &RuntimeType,
    ) {
        if state.alias_map.contains(name) {
            return;
        }

        let mut aliases: Vec<Expression> = Vec::new();
        if self.config.symbolic_aliases {
            for alias in state.alias_map.all_aliases() {
                if let Expression::Ref { ty: alias_ty, .. } = alias {
                    if alias_ty.is_of_type(ty) && !aliases.contains(alias) {
                        aliases.push(alias.clone());
                    }
                }
            }
        }

        let fresh = self.allocate_symbolic_object(state, name, ty);
        aliases.push(Expression::reference(fresh, ty.clone()));
        if self.config.symbolic_nulls {
            aliases.push(Expression::null());
        }
        state.alias_map.insert(name.to_string(), aliases);
    }

    /// Allocate an object of the class named by `ty` whose fields hold
    /// fresh symbolic values derived from `name`.
    fn allocate_symbolic_object(
        &mut self,
        state: &mut ExecutionState,
        name: &str,
        ty: &RuntimeType,
    ) -> oox_syntax::Reference {
        let mut fields = std::collections::BTreeMap::new();
        if let RuntimeType::Reference(class_name) = ty {
            if let Some(declared) = self.symbols.fields(class_name) {
                for (field_name, field_ty) in declared {
                    let symbolic_name = format!("{}__{}", name, field_name);
                    fields.insert(
                        field_name.clone(),
                        symbolic_value(&symbolic_name, &field_ty.runtime_type()),
                    );
                }
            }
        }
        state.heap.allocate(HeapValue::Object {
            fields,
            ty: ty.clone(),
        })
    }

    /// Branch over all concrete identities of the symbolic references held
    /// by the named variables. Returns one refined state per feasible
    /// combination; an empty result prunes the containing operation.
    pub(crate) fn concretes_of_type(
        &mut self,
        state: ExecutionState,
        names: &BTreeSet<Identifier>,
    ) -> EngineResult<Vec<ExecutionState>> {
        let mut states = vec![state];
        for name in names {
            let mut expanded = Vec::new();
            for current in states {
                expanded.extend(self.concretize_variable(current, name)?);
            }
            states = expanded;
        }
        Ok(states)
    }

    /// Branch over the identities of one variable's value, when it is a
    /// symbolic reference that is not pinned yet.
    fn concretize_variable(
        &mut self,
        state: ExecutionState,
        name: &str,
    ) -> EngineResult<Vec<ExecutionState>> {
        let value = match self.read_local(&state, name) {
            Ok(value) => value,
            // Not a local of this frame (e.g. a quantifier-bound name).
            Err(EngineError::UndeclaredVariable(_)) => return Ok(vec![state]),
            Err(e) => return Err(e),
        };
        let Expression::SymbolicRef {
            name: symbolic,
            ty,
        } = value
        else {
            return Ok(vec![state]);
        };

        if matches!(ty, RuntimeType::Array(_) | RuntimeType::Arr) {
            self.concretize_array(state, &symbolic, &ty)
        } else {
            self.concretize_object(state, &symbolic, &ty)
        }
    }

    fn concretize_object(
        &mut self,
        mut state: ExecutionState,
        symbolic: &str,
        ty: &RuntimeType,
    ) -> EngineResult<Vec<ExecutionState>> {
        self.init_symbolic_object(&mut state, symbolic, ty);
        let aliases = state
            .alias_map
            .get(symbolic)
            .ok_or_else(|| EngineError::NoAliases(symbolic.to_string()))?
            .to_vec();
        if aliases.len() <= 1 {
            return Ok(vec![state]);
        }

        self.stats.branches += aliases.len() as u64 - 1;
        let mut branches = Vec::new();
        for alias in aliases {
            let mut branch = state.clone();
            branch.alias_map.resolve(symbolic.to_string(), alias.clone());
            if self.pin_alias(&mut branch, symbolic, ty, alias)? {
                branches.push(branch);
            } else {
                self.stats.pruned += 1;
            }
        }
        Ok(branches)
    }

    /// One branch per possible length of a symbolic array (plus null when
    /// enabled), or per remaining alias if the identity was already
    /// narrowed.
    fn concretize_array(
        &mut self,
        state: ExecutionState,
        symbolic: &str,
        ty: &RuntimeType,
    ) -> EngineResult<Vec<ExecutionState>> {
        if let Some(aliases) = state.alias_map.get(symbolic) {
            if aliases.len() <= 1 {
                return Ok(vec![state]);
            }
            let aliases = aliases.to_vec();
            self.stats.branches += aliases.len() as u64 - 1;
            let mut branches = Vec::new();
            for alias in aliases {
                let mut branch = state.clone();
                branch.alias_map.resolve(symbolic.to_string(), alias.clone());
                if self.pin_alias(&mut branch, symbolic, ty, alias)? {
                    branches.push(branch);
                } else {
                    self.stats.pruned += 1;
                }
            }
            return Ok(branches);
        }

        let element_type = match ty {
            RuntimeType::Array(inner) => (**inner).clone(),
            _ => RuntimeType::Int,
        };

        let mut branches = Vec::new();
        if self.config.symbolic_nulls {
            let mut branch = state.clone();
            branch
                .alias_map
                .resolve(symbolic.to_string(), Expression::null());
            if self.pin_alias(&mut branch, symbolic, ty, Expression::null())? {
                branches.push(branch);
            } else {
                self.stats.pruned += 1;
            }
        }
        for length in 0..=self.config.symbolic_array_size {
            let mut branch = state.clone();
            let elements = (0..length)
                .map(|i| symbolic_value(&format!("{}${}", symbolic, i), &element_type))
                .collect();
            let fresh = branch.heap.allocate(HeapValue::Array {
                elements,
                element_type: element_type.clone(),
            });
            let alias = Expression::reference(fresh, ty.clone());
            branch.alias_map.resolve(symbolic.to_string(), alias.clone());
            if self.pin_alias(&mut branch, symbolic, ty, alias)? {
                branches.push(branch);
            } else {
                self.stats.pruned += 1;
            }
        }
        self.stats.branches += branches.len().saturating_sub(1) as u64;
        Ok(branches)
    }

    /// Record the chosen identity as a path constraint and check that the
    /// branch stays feasible.
    fn pin_alias(
        &mut self,
        state: &mut ExecutionState,
        symbolic: &str,
        ty: &RuntimeType,
        alias: Expression,
    ) -> EngineResult<bool> {
        let equality = Expression::eq(
            Expression::SymbolicRef {
                name: symbolic.to_string(),
                ty: ty.clone(),
            },
            alias,
        );
        state.constraints.push(equality);
        self.solver
            .is_satisfiable(&state.constraints.conjunction(), &mut self.stats)
    }
}

/// A fresh symbolic value of the given type under the given name.
pub(crate) fn symbolic_value(name: &str, ty: &RuntimeType) -> Expression {
    match ty {
        RuntimeType::Int | RuntimeType::Bool => Expression::SymbolicVar {
            name: name.to_string(),
            ty: ty.clone(),
        },
        _ => Expression::SymbolicRef {
            name: name.to_string(),
            ty: ty.clone(),
        },
    }
}

/// Collect variable names whose values an expression's heap-dependent
/// operations may dereference: quantifier domains, array length reads, and
/// every plain variable (whose value may be a symbolic reference compared
/// or passed along).
pub(crate) fn variable_names(expr: &Expression, out: &mut BTreeSet<Identifier>) {
    match expr {
        Expression::Var { name, .. } => {
            out.insert(name.clone());
        }
        Expression::SizeOf { array, .. } => {
            out.insert(array.clone());
        }
        Expression::Forall { array, body, .. } | Expression::Exists { array, body, .. } => {
            out.insert(array.clone());
            variable_names(body, out);
        }
        Expression::Binary { left, right, .. } => {
            variable_names(left, out);
            variable_names(right, out);
        }
        Expression::Unary { operand, .. } => variable_names(operand, out),
        Expression::Ite {
            guard,
            then_branch,
            else_branch,
            ..
        } => {
            variable_names(guard, out);
            variable_names(then_branch, out);
            variable_names(else_branch, out);
        }
        Expression::Lit { .. }
        | Expression::SymbolicVar { .. }
        | Expression::Ref { .. }
        | Expression::SymbolicRef { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbolic_value_by_type() {
        assert!(matches!(
            symbolic_value("x", &RuntimeType::Int),
            Expression::SymbolicVar { .. }
        ));
        assert!(matches!(
            symbolic_value("n", &RuntimeType::Reference("Node".to_string())),
            Expression::SymbolicRef { .. }
        ));
    }

    #[test]
    fn test_variable_names_collects_quantifier_domains() {
        let expr = Expression::Forall {
            elem: "v".to_string(),
            index: "i".to_string(),
            array: "a".to_string(),
            body: Box::new(Expression::Var {
                name: "v".to_string(),
                ty: RuntimeType::Unknown,
            }),
            ty: RuntimeType::Bool,
        };
        let mut names = BTreeSet::new();
        variable_names(&expr, &mut names);
        assert!(names.contains("a"));
        assert!(names.contains("v"));
    }
}
