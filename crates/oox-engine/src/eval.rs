//! Expression evaluation.
//!
//! `evaluate` reduces an expression to a runtime value under the current
//! stack frame and heap: variables resolve to their stored values, operators
//! fold when their operands are literals (the local-solver fast path), and
//! anything still symbolic stays a tree for the solver. Heap reads through a
//! symbolic reference fan into an if-then-else chain over its aliases.
//!
//! Evaluation returns `None` when the branch is infeasible (null
//! dereference, out-of-bounds access on a zero-length array, division by
//! zero); the caller prunes.

use crate::state::ExecutionState;
use crate::{Engine, EngineError, EngineResult};
use oox_syntax::{BinOp, Expression, Lit, Reference, RuntimeType, UnOp};

/// Result of [`Engine::evaluate_as_bool`].
#[derive(Debug, Clone)]
pub enum EvaluatedBool {
    /// The expression reduced to a boolean literal.
    Known(bool),
    /// Still symbolic.
    Symbolic(Expression),
}

impl<'a> Engine<'a> {
    /// Read a local variable of the current thread's innermost frame.
    pub(crate) fn read_local(
        &self,
        state: &ExecutionState,
        name: &str,
    ) -> EngineResult<Expression> {
        let tid = state
            .current_thread
            .ok_or(EngineError::CannotGetCurrentThread)?;
        let thread = state
            .threads
            .get(&tid)
            .ok_or(EngineError::CannotGetCurrentThread)?;
        thread
            .read_var(name)
            .cloned()
            .ok_or_else(|| EngineError::UndeclaredVariable(name.to_string()))
    }

    /// Write a local variable of the current thread's innermost frame.
    pub(crate) fn write_local(
        &self,
        state: &mut ExecutionState,
        name: &str,
        value: Expression,
    ) -> EngineResult<()> {
        let tid = state
            .current_thread
            .ok_or(EngineError::CannotGetCurrentThread)?;
        let thread = state
            .threads
            .get_mut(&tid)
            .ok_or(EngineError::CannotGetCurrentThread)?;
        let frame = thread
            .top_frame_mut()
            .ok_or(EngineError::CannotGetCurrentThread)?;
        frame.declarations.insert(name.to_string(), value);
        Ok(())
    }

    /// Reduce an expression to a value. `None` prunes the branch.
    pub(crate) fn evaluate(
        &mut self,
        state: &mut ExecutionState,
        expr: &Expression,
    ) -> EngineResult<Option<Expression>> {
        match expr {
            Expression::Lit { .. }
            | Expression::Ref { .. }
            | Expression::SymbolicRef { .. }
            | Expression::SymbolicVar { .. } => Ok(Some(expr.clone())),

            Expression::Var { name, .. } => Ok(Some(self.read_local(state, name)?)),

            Expression::SizeOf { array, .. } => {
                let value = self.read_local(state, array)?;
                if value.is_null() || self.is_pinned_null(state, &value) {
                    return Ok(None);
                }
                match self.as_concrete_reference(state, &value) {
                    Some(handle) => {
                        let cell = self.array_cell(state, handle)?;
                        Ok(Some(Expression::int(cell.len() as i64)))
                    }
                    // Not concretised yet; stays symbolic.
                    None => Ok(Some(expr.clone())),
                }
            }

            Expression::Unary { op, operand, ty } => {
                let Some(operand) = self.evaluate(state, operand)? else {
                    return Ok(None);
                };
                Ok(Some(self.fold_unary(*op, operand, ty.clone())))
            }

            Expression::Binary {
                op,
                left,
                right,
                ty,
            } => {
                let Some(left) = self.evaluate(state, left)? else {
                    return Ok(None);
                };
                let Some(right) = self.evaluate(state, right)? else {
                    return Ok(None);
                };
                self.fold_binary(*op, left, right, ty.clone())
            }

            Expression::Ite {
                guard,
                then_branch,
                else_branch,
                ty,
            } => {
                let Some(guard) = self.evaluate(state, guard)? else {
                    return Ok(None);
                };
                if guard.is_true() {
                    return self.evaluate(state, then_branch);
                }
                if guard.is_false() {
                    return self.evaluate(state, else_branch);
                }
                let Some(then_branch) = self.evaluate(state, then_branch)? else {
                    return Ok(None);
                };
                let Some(else_branch) = self.evaluate(state, else_branch)? else {
                    return Ok(None);
                };
                Ok(Some(Expression::Ite {
                    guard: Box::new(guard),
                    then_branch: Box::new(then_branch),
                    else_branch: Box::new(else_branch),
                    ty: ty.clone(),
                }))
            }

            Expression::Forall { .. } | Expression::Exists { .. } => {
                self.evaluate_quantifier(state, expr)
            }
        }
    }

    /// Evaluate, short-circuiting to a known boolean when possible.
    pub(crate) fn evaluate_as_bool(
        &mut self,
        state: &mut ExecutionState,
        expr: &Expression,
    ) -> EngineResult<Option<EvaluatedBool>> {
        let Some(value) = self.evaluate(state, expr)? else {
            return Ok(None);
        };
        if value.is_true() {
            Ok(Some(EvaluatedBool::Known(true)))
        } else if value.is_false() {
            Ok(Some(EvaluatedBool::Known(false)))
        } else {
            Ok(Some(EvaluatedBool::Symbolic(value)))
        }
    }

    /// Expand a quantifier over a concretised array into a finite
    /// conjunction or disjunction.
    fn evaluate_quantifier(
        &mut self,
        state: &mut ExecutionState,
        expr: &Expression,
    ) -> EngineResult<Option<Expression>> {
        let (elem, index, array, body, is_forall) = match expr {
            Expression::Forall {
                elem,
                index,
                array,
                body,
                ..
            } => (elem, index, array, body, true),
            Expression::Exists {
                elem,
                index,
                array,
                body,
                ..
            } => (elem, index, array, body, false),
            _ => unreachable!("caller matched a quantifier"),
        };

        let value = self.read_local(state, array)?;
        if value.is_null() || self.is_pinned_null(state, &value) {
            return Ok(None);
        }
        let Some(handle) = self.as_concrete_reference(state, &value) else {
            // Array identity not fixed yet; the caller concretises first.
            return Ok(Some(expr.clone()));
        };
        let elements = self.array_cell(state, handle)?.to_vec();

        let mut acc: Option<Expression> = None;
        for (i, element) in elements.iter().enumerate() {
            let instance = substitute(body, elem, element);
            let instance = substitute(&instance, index, &Expression::int(i as i64));
            let Some(reduced) = self.evaluate(state, &instance)? else {
                return Ok(None);
            };
            acc = Some(match acc {
                None => reduced,
                Some(prev) if is_forall => Expression::and(prev, reduced),
                Some(prev) => Expression::or(prev, reduced),
            });
        }
        let expanded = acc.unwrap_or_else(|| Expression::bool(is_forall));
        // Re-evaluate to fold literals produced by the expansion.
        self.evaluate(state, &expanded)
    }

    fn fold_unary(&self, op: UnOp, operand: Expression, ty: RuntimeType) -> Expression {
        if self.config.apply_local_solver {
            match (op, &operand) {
                (
                    UnOp::Not,
                    Expression::Lit {
                        lit: Lit::Bool(b), ..
                    },
                ) => return Expression::bool(!b),
                (
                    UnOp::Neg,
                    Expression::Lit {
                        lit: Lit::Int(n), ..
                    },
                ) => return Expression::int(-n),
                // double negation
                (UnOp::Not, Expression::Unary {
                    op: UnOp::Not,
                    operand: inner,
                    ..
                }) => return (**inner).clone(),
                _ => {}
            }
        }
        Expression::Unary {
            op,
            operand: Box::new(operand),
            ty,
        }
    }

    fn fold_binary(
        &self,
        op: BinOp,
        left: Expression,
        right: Expression,
        ty: RuntimeType,
    ) -> EngineResult<Option<Expression>> {
        if !self.config.apply_local_solver {
            return Ok(Some(rebuild(op, left, right, ty)));
        }

        // Integer folding.
        if let (
            Expression::Lit {
                lit: Lit::Int(a), ..
            },
            Expression::Lit {
                lit: Lit::Int(b), ..
            },
        ) = (&left, &right)
        {
            let folded = match op {
                BinOp::Add => Expression::int(a + b),
                BinOp::Sub => Expression::int(a - b),
                BinOp::Mul => Expression::int(a * b),
                BinOp::Div => {
                    if *b == 0 {
                        return Ok(None);
                    }
                    Expression::int(a / b)
                }
                BinOp::Mod => {
                    if *b == 0 {
                        return Ok(None);
                    }
                    Expression::int(a % b)
                }
                BinOp::Lt => Expression::bool(a < b),
                BinOp::Le => Expression::bool(a <= b),
                BinOp::Gt => Expression::bool(a > b),
                BinOp::Ge => Expression::bool(a >= b),
                BinOp::Eq => Expression::bool(a == b),
                BinOp::Ne => Expression::bool(a != b),
                _ => rebuild(op, left, right, ty),
            };
            return Ok(Some(folded));
        }

        // Boolean short-circuiting with one literal side.
        match op {
            BinOp::And => {
                if left.is_false() || right.is_false() {
                    return Ok(Some(Expression::bool(false)));
                }
                if left.is_true() {
                    return Ok(Some(right));
                }
                if right.is_true() {
                    return Ok(Some(left));
                }
            }
            BinOp::Or => {
                if left.is_true() || right.is_true() {
                    return Ok(Some(Expression::bool(true)));
                }
                if left.is_false() {
                    return Ok(Some(right));
                }
                if right.is_false() {
                    return Ok(Some(left));
                }
            }
            BinOp::Implies => {
                if left.is_false() || right.is_true() {
                    return Ok(Some(Expression::bool(true)));
                }
                if left.is_true() {
                    return Ok(Some(right));
                }
            }
            BinOp::Eq | BinOp::Ne => {
                if let Some(equal) = reference_equality(&left, &right) {
                    let truth = if op == BinOp::Eq { equal } else { !equal };
                    return Ok(Some(Expression::bool(truth)));
                }
                if left == right {
                    return Ok(Some(Expression::bool(op == BinOp::Eq)));
                }
            }
            _ => {}
        }

        Ok(Some(rebuild(op, left, right, ty)))
    }

    /// Whether a symbolic reference's alias set was pinned to null.
    pub(crate) fn is_pinned_null(&self, state: &ExecutionState, value: &Expression) -> bool {
        match value {
            Expression::SymbolicRef { name, .. } => {
                matches!(state.alias_map.get(name), Some([alias]) if alias.is_null())
            }
            _ => false,
        }
    }

    /// The concrete handle of a value, looking through singleton alias sets.
    pub(crate) fn as_concrete_reference(
        &self,
        state: &ExecutionState,
        value: &Expression,
    ) -> Option<Reference> {
        match value {
            Expression::Ref { handle, .. } => Some(*handle),
            Expression::SymbolicRef { name, .. } => match state.alias_map.get(name) {
                Some([Expression::Ref { handle, .. }]) => Some(*handle),
                _ => None,
            },
            _ => None,
        }
    }

    fn array_cell<'s>(
        &self,
        state: &'s ExecutionState,
        handle: Reference,
    ) -> EngineResult<&'s [Expression]> {
        match state.heap.get(handle) {
            Some(crate::state::HeapValue::Array { elements, .. }) => Ok(elements),
            _ => Err(EngineError::ExpectedConcreteReference(Expression::reference(
                handle,
                RuntimeType::Arr,
            ))),
        }
    }

    // === Heap reads and writes ===

    /// Read `base.field`. A symbolic base fans into an if-then-else chain
    /// over its non-null aliases.
    pub(crate) fn read_field(
        &mut self,
        state: &mut ExecutionState,
        base: &Expression,
        field: &str,
    ) -> EngineResult<Option<Expression>> {
        match base {
            Expression::Lit { lit: Lit::Null, .. } => Ok(None),
            Expression::Ref { handle, .. } => self.read_field_concrete(state, *handle, field),
            Expression::SymbolicRef { name, ty } => {
                self.init_symbolic_object(state, name, ty);
                let aliases = concrete_aliases(state, name)?;
                if aliases.is_empty() {
                    return Ok(None);
                }
                let mut iter = aliases.iter().rev();
                let last = *iter.next().expect("non-empty checked");
                let Some(mut acc) = self.read_field_concrete(state, last, field)? else {
                    return Ok(None);
                };
                for handle in iter {
                    let Some(read) = self.read_field_concrete(state, *handle, field)? else {
                        return Ok(None);
                    };
                    let guard = Expression::eq(
                        base.clone(),
                        Expression::reference(*handle, ty.clone()),
                    );
                    acc = Expression::ite(guard, read, acc);
                }
                Ok(Some(acc))
            }
            Expression::Ite {
                guard,
                then_branch,
                else_branch,
                ..
            } => {
                let Some(then_read) = self.read_field(state, then_branch, field)? else {
                    return Ok(None);
                };
                let Some(else_read) = self.read_field(state, else_branch, field)? else {
                    return Ok(None);
                };
                Ok(Some(Expression::ite((**guard).clone(), then_read, else_read)))
            }
            other => Err(EngineError::ExpectedReference(other.clone())),
        }
    }

    fn read_field_concrete(
        &self,
        state: &ExecutionState,
        handle: Reference,
        field: &str,
    ) -> EngineResult<Option<Expression>> {
        match state.heap.get(handle) {
            Some(crate::state::HeapValue::Object { fields, .. }) => fields
                .get(field)
                .cloned()
                .map(Some)
                .ok_or_else(|| EngineError::UnknownField(field.to_string())),
            _ => Err(EngineError::ExpectedConcreteReference(Expression::reference(
                handle,
                RuntimeType::Ref,
            ))),
        }
    }

    /// Write `base.field := value`. Through a multi-alias symbolic base,
    /// every alias cell receives a conditional value.
    pub(crate) fn write_field(
        &mut self,
        state: &mut ExecutionState,
        base: &Expression,
        field: &str,
        value: Expression,
    ) -> EngineResult<Option<()>> {
        match base {
            Expression::Lit { lit: Lit::Null, .. } => Ok(None),
            Expression::Ref { handle, .. } => {
                self.write_field_concrete(state, *handle, field, value)?;
                Ok(Some(()))
            }
            Expression::SymbolicRef { name, ty } => {
                self.init_symbolic_object(state, name, ty);
                let aliases = concrete_aliases(state, name)?;
                match aliases.as_slice() {
                    [] => Ok(None),
                    [handle] => {
                        self.write_field_concrete(state, *handle, field, value)?;
                        Ok(Some(()))
                    }
                    handles => {
                        for handle in handles {
                            let Some(old) = self.read_field_concrete(state, *handle, field)?
                            else {
                                return Ok(None);
                            };
                            let guard = Expression::eq(
                                base.clone(),
                                Expression::reference(*handle, ty.clone()),
                            );
                            let conditional = Expression::ite(guard, value.clone(), old);
                            self.write_field_concrete(state, *handle, field, conditional)?;
                        }
                        Ok(Some(()))
                    }
                }
            }
            other => Err(EngineError::ExpectedReference(other.clone())),
        }
    }

    fn write_field_concrete(
        &self,
        state: &mut ExecutionState,
        handle: Reference,
        field: &str,
        value: Expression,
    ) -> EngineResult<()> {
        match state.heap.get_mut(handle) {
            Some(crate::state::HeapValue::Object { fields, .. }) => {
                if !fields.contains_key(field) {
                    return Err(EngineError::UnknownField(field.to_string()));
                }
                fields.insert(field.to_string(), value);
                Ok(())
            }
            _ => Err(EngineError::ExpectedConcreteReference(Expression::reference(
                handle,
                RuntimeType::Ref,
            ))),
        }
    }

    /// Read `base[index]`. A symbolic index fans into an if-then-else chain
    /// over the element positions and constrains the index into bounds.
    pub(crate) fn read_elem(
        &mut self,
        state: &mut ExecutionState,
        base: &Expression,
        index: &Expression,
    ) -> EngineResult<Option<Expression>> {
        match base {
            Expression::Lit { lit: Lit::Null, .. } => Ok(None),
            Expression::Ref { handle, .. } => {
                let elements = self.array_cell(state, *handle)?.to_vec();
                self.read_elem_concrete(state, &elements, index)
            }
            Expression::SymbolicRef { .. } => match self.as_concrete_reference(state, base) {
                Some(handle) => {
                    let elements = self.array_cell(state, handle)?.to_vec();
                    self.read_elem_concrete(state, &elements, index)
                }
                None if self.is_pinned_null(state, base) => Ok(None),
                None => Err(EngineError::ExpectedConcreteReference(base.clone())),
            },
            other => Err(EngineError::ExpectedReference(other.clone())),
        }
    }

    fn read_elem_concrete(
        &mut self,
        state: &mut ExecutionState,
        elements: &[Expression],
        index: &Expression,
    ) -> EngineResult<Option<Expression>> {
        if let Expression::Lit {
            lit: Lit::Int(i), ..
        } = index
        {
            if *i < 0 || *i as usize >= elements.len() {
                return Ok(None);
            }
            return Ok(Some(elements[*i as usize].clone()));
        }

        if elements.is_empty() {
            return Ok(None);
        }
        if !self.constrain_index(state, index, elements.len())? {
            return Ok(None);
        }
        let mut iter = elements.iter().enumerate().rev();
        let (_, last) = iter.next().expect("non-empty checked");
        let mut acc = last.clone();
        for (i, element) in iter {
            let guard = Expression::eq(index.clone(), Expression::int(i as i64));
            acc = Expression::ite(guard, element.clone(), acc);
        }
        Ok(Some(acc))
    }

    /// Write `base[index] := value`.
    pub(crate) fn write_elem(
        &mut self,
        state: &mut ExecutionState,
        base: &Expression,
        index: &Expression,
        value: Expression,
    ) -> EngineResult<Option<()>> {
        let handle = match base {
            Expression::Lit { lit: Lit::Null, .. } => return Ok(None),
            Expression::Ref { handle, .. } => *handle,
            Expression::SymbolicRef { .. } => match self.as_concrete_reference(state, base) {
                Some(handle) => handle,
                None if self.is_pinned_null(state, base) => return Ok(None),
                None => return Err(EngineError::ExpectedConcreteReference(base.clone())),
            },
            other => return Err(EngineError::ExpectedReference(other.clone())),
        };
        let len = self.array_cell(state, handle)?.len();

        if let Expression::Lit {
            lit: Lit::Int(i), ..
        } = index
        {
            if *i < 0 || *i as usize >= len {
                return Ok(None);
            }
            let i = *i as usize;
            if let Some(crate::state::HeapValue::Array { elements, .. }) =
                state.heap.get_mut(handle)
            {
                elements[i] = value;
            }
            return Ok(Some(()));
        }

        if len == 0 {
            return Ok(None);
        }
        if !self.constrain_index(state, index, len)? {
            return Ok(None);
        }
        let old: Vec<Expression> = self.array_cell(state, handle)?.to_vec();
        let updated: Vec<Expression> = old
            .into_iter()
            .enumerate()
            .map(|(i, element)| {
                let guard = Expression::eq(index.clone(), Expression::int(i as i64));
                Expression::ite(guard, value.clone(), element)
            })
            .collect();
        if let Some(crate::state::HeapValue::Array { elements, .. }) = state.heap.get_mut(handle) {
            *elements = updated;
        }
        Ok(Some(()))
    }

    /// Constrain a symbolic index into `0..len`. Returns false when the
    /// constraints become unsatisfiable.
    fn constrain_index(
        &mut self,
        state: &mut ExecutionState,
        index: &Expression,
        len: usize,
    ) -> EngineResult<bool> {
        let lower = Expression::Binary {
            op: BinOp::Ge,
            left: Box::new(index.clone()),
            right: Box::new(Expression::int(0)),
            ty: RuntimeType::Bool,
        };
        let upper = Expression::Binary {
            op: BinOp::Lt,
            left: Box::new(index.clone()),
            right: Box::new(Expression::int(len as i64)),
            ty: RuntimeType::Bool,
        };
        state.constraints.push(Expression::and(lower, upper));
        let feasible = self
            .solver
            .is_satisfiable(&state.constraints.conjunction(), &mut self.stats)?;
        Ok(feasible)
    }
}

fn rebuild(op: BinOp, left: Expression, right: Expression, ty: RuntimeType) -> Expression {
    Expression::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
        ty,
    }
}

/// Literal reference (dis)equality: null vs null, ref vs ref, ref vs null.
fn reference_equality(left: &Expression, right: &Expression) -> Option<bool> {
    let class = |e: &Expression| match e {
        Expression::Lit { lit: Lit::Null, .. } => Some(None),
        Expression::Ref { handle, .. } => Some(Some(*handle)),
        _ => None,
    };
    let l = class(left)?;
    let r = class(right)?;
    Some(l == r)
}

/// Non-null concrete handles in a symbolic reference's alias set.
fn concrete_aliases(state: &ExecutionState, name: &str) -> EngineResult<Vec<Reference>> {
    let aliases = state
        .alias_map
        .get(name)
        .ok_or_else(|| EngineError::NoAliases(name.to_string()))?;
    Ok(aliases
        .iter()
        .filter_map(|alias| match alias {
            Expression::Ref { handle, .. } => Some(*handle),
            _ => None,
        })
        .collect())
}

/// Replace free occurrences of variable `var` with `replacement`.
/// Quantifiers that rebind the name shadow it.
pub(crate) fn substitute(expr: &Expression, var: &str, replacement: &Expression) -> Expression {
    match expr {
        Expression::Var { name, .. } if name == var => replacement.clone(),
        Expression::Var { .. }
        | Expression::SymbolicVar { .. }
        | Expression::Lit { .. }
        | Expression::SizeOf { .. }
        | Expression::Ref { .. }
        | Expression::SymbolicRef { .. } => expr.clone(),
        Expression::Binary {
            op,
            left,
            right,
            ty,
        } => Expression::Binary {
            op: *op,
            left: Box::new(substitute(left, var, replacement)),
            right: Box::new(substitute(right, var, replacement)),
            ty: ty.clone(),
        },
        Expression::Unary { op, operand, ty } => Expression::Unary {
            op: *op,
            operand: Box::new(substitute(operand, var, replacement)),
            ty: ty.clone(),
        },
        Expression::Ite {
            guard,
            then_branch,
            else_branch,
            ty,
        } => Expression::Ite {
            guard: Box::new(substitute(guard, var, replacement)),
            then_branch: Box::new(substitute(then_branch, var, replacement)),
            else_branch: Box::new(substitute(else_branch, var, replacement)),
            ty: ty.clone(),
        },
        Expression::Forall {
            elem,
            index,
            array,
            body,
            ty,
        } => {
            let body = if elem == var || index == var {
                (**body).clone()
            } else {
                substitute(body, var, replacement)
            };
            Expression::Forall {
                elem: elem.clone(),
                index: index.clone(),
                array: array.clone(),
                body: Box::new(body),
                ty: ty.clone(),
            }
        }
        Expression::Exists {
            elem,
            index,
            array,
            body,
            ty,
        } => {
            let body = if elem == var || index == var {
                (**body).clone()
            } else {
                substitute(body, var, replacement)
            };
            Expression::Exists {
                elem: elem.clone(),
                index: index.clone(),
                array: array.clone(),
                body: Box::new(body),
                ty: ty.clone(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_respects_shadowing() {
        let body = Expression::Var {
            name: "v".to_string(),
            ty: RuntimeType::Unknown,
        };
        let quantifier = Expression::Forall {
            elem: "v".to_string(),
            index: "i".to_string(),
            array: "a".to_string(),
            body: Box::new(body.clone()),
            ty: RuntimeType::Bool,
        };
        let result = substitute(&quantifier, "v", &Expression::int(1));
        let Expression::Forall { body: inner, .. } = result else {
            panic!("expected quantifier");
        };
        assert_eq!(*inner, body);
    }

    #[test]
    fn test_reference_equality_folding() {
        let r1 = Expression::reference(1, RuntimeType::Ref);
        let r2 = Expression::reference(2, RuntimeType::Ref);
        assert_eq!(reference_equality(&r1, &r1.clone()), Some(true));
        assert_eq!(reference_equality(&r1, &r2), Some(false));
        assert_eq!(reference_equality(&r1, &Expression::null()), Some(false));
        assert_eq!(
            reference_equality(&Expression::null(), &Expression::null()),
            Some(true)
        );
        assert_eq!(reference_equality(&r1, &Expression::int(1)), None);
    }
}
