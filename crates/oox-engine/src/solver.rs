//! Encoding of path formulas into Z3 and the `check-sat` oracle.
//!
//! References are encoded as integers: the null literal is 0 and concrete
//! heap handles are their (positive) reference values, so alias equalities
//! discharge as integer equalities. `Unknown` from the solver is treated as
//! satisfiable, which keeps `Invalid` verdicts sound.

use crate::stats::Statistics;
use crate::{EngineError, EngineResult};
use oox_syntax::{BinOp, Expression, Lit, RuntimeType, UnOp};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use z3::ast::{Bool, Dynamic, Int};
use z3::{SatResult, Solver};

/// Integer encoding of the null reference.
const NULL_CODE: i64 = 0;

/// The `check-sat` oracle with an optional formula cache.
pub struct SolverOracle {
    solver: Solver,
    /// Structural formula hash -> satisfiability.
    cache: HashMap<u64, bool>,
    cache_enabled: bool,
}

impl SolverOracle {
    pub fn new(cache_enabled: bool) -> Self {
        Self {
            solver: Solver::new(),
            cache: HashMap::new(),
            cache_enabled,
        }
    }

    /// Check whether the formula is satisfiable. `Unknown` counts as
    /// satisfiable.
    pub fn is_satisfiable(
        &mut self,
        formula: &Expression,
        stats: &mut Statistics,
    ) -> EngineResult<bool> {
        let key = formula_hash(formula);
        if self.cache_enabled {
            if let Some(sat) = self.cache.get(&key) {
                stats.cache_hits += 1;
                return Ok(*sat);
            }
        }

        let encoded = encode_bool(formula)?;
        self.solver.push();
        self.solver.assert(&encoded);
        let outcome = self.solver.check();
        self.solver.pop(1);
        stats.solver_calls += 1;

        let sat = match outcome {
            SatResult::Sat => true,
            SatResult::Unsat => false,
            // Conservative: stay sound for invalidity.
            SatResult::Unknown => true,
        };
        if self.cache_enabled {
            self.cache.insert(key, sat);
        }
        Ok(sat)
    }
}

/// Structural hash of a formula; the cache key.
fn formula_hash(formula: &Expression) -> u64 {
    let mut hasher = DefaultHasher::new();
    formula.hash(&mut hasher);
    hasher.finish()
}

fn encode_bool(expr: &Expression) -> EngineResult<Bool> {
    let encoded = encode(expr)?;
    encoded
        .as_bool()
        .ok_or_else(|| EngineError::UnencodableFormula(format!("expected Bool, got {:?}", expr)))
}

fn encode_int(expr: &Expression) -> EngineResult<Int> {
    let encoded = encode(expr)?;
    encoded
        .as_int()
        .ok_or_else(|| EngineError::UnencodableFormula(format!("expected Int, got {:?}", expr)))
}

/// Translate an evaluated, quantifier-free expression to a Z3 AST.
fn encode(expr: &Expression) -> EngineResult<Dynamic> {
    match expr {
        Expression::Lit { lit, .. } => match lit {
            Lit::Bool(b) => Ok(Dynamic::from_ast(&Bool::from_bool(*b))),
            Lit::Int(n) => Ok(Dynamic::from_ast(&Int::from_i64(*n))),
            Lit::Null => Ok(Dynamic::from_ast(&Int::from_i64(NULL_CODE))),
            Lit::String(s) => Err(EngineError::UnencodableFormula(format!(
                "string literal \"{}\" in formula",
                s
            ))),
        },
        // A concrete reference is its handle.
        Expression::Ref { handle, .. } => Ok(Dynamic::from_ast(&Int::from_i64(*handle))),
        // Symbolic references are unconstrained integers; alias equalities
        // pin them down.
        Expression::SymbolicRef { name, .. } => {
            Ok(Dynamic::from_ast(&Int::new_const(name.clone())))
        }
        Expression::SymbolicVar { name, ty } | Expression::Var { name, ty } => match ty {
            RuntimeType::Bool => Ok(Dynamic::from_ast(&Bool::new_const(name.clone()))),
            _ => Ok(Dynamic::from_ast(&Int::new_const(name.clone()))),
        },
        Expression::SizeOf { array, .. } => {
            Ok(Dynamic::from_ast(&Int::new_const(format!("#{}", array))))
        }
        Expression::Binary {
            op, left, right, ..
        } => encode_binary(*op, left, right),
        Expression::Unary { op, operand, .. } => match op {
            UnOp::Not => {
                let v = encode_bool(operand)?;
                Ok(Dynamic::from_ast(&v.not()))
            }
            UnOp::Neg => {
                let v = encode_int(operand)?;
                Ok(Dynamic::from_ast(&v.unary_minus()))
            }
        },
        Expression::Ite {
            guard,
            then_branch,
            else_branch,
            ..
        } => {
            let c = encode_bool(guard)?;
            let t = encode(then_branch)?;
            let e = encode(else_branch)?;
            if let (Some(ti), Some(ei)) = (t.as_int(), e.as_int()) {
                Ok(Dynamic::from_ast(&c.ite(&ti, &ei)))
            } else if let (Some(tb), Some(eb)) = (t.as_bool(), e.as_bool()) {
                Ok(Dynamic::from_ast(&c.ite(&tb, &eb)))
            } else {
                Err(EngineError::UnencodableFormula(
                    "if-then-else branches have incompatible types".to_string(),
                ))
            }
        }
        // Quantifiers are expanded over concretised arrays during
        // evaluation; one reaching the solver is an engine bug.
        Expression::Forall { array, .. } | Expression::Exists { array, .. } => {
            Err(EngineError::UnencodableFormula(format!(
                "unexpanded quantifier over '{}'",
                array
            )))
        }
    }
}

fn encode_binary(op: BinOp, left: &Expression, right: &Expression) -> EngineResult<Dynamic> {
    match op {
        BinOp::And => {
            let l = encode_bool(left)?;
            let r = encode_bool(right)?;
            Ok(Dynamic::from_ast(&Bool::and(&[l, r])))
        }
        BinOp::Or => {
            let l = encode_bool(left)?;
            let r = encode_bool(right)?;
            Ok(Dynamic::from_ast(&Bool::or(&[l, r])))
        }
        BinOp::Implies => {
            let l = encode_bool(left)?;
            let r = encode_bool(right)?;
            Ok(Dynamic::from_ast(&l.implies(&r)))
        }
        BinOp::Eq => encode_eq(left, right),
        BinOp::Ne => {
            let eq = encode_eq(left, right)?;
            let eq_bool = eq
                .as_bool()
                .ok_or_else(|| EngineError::UnencodableFormula("equality".to_string()))?;
            Ok(Dynamic::from_ast(&eq_bool.not()))
        }
        BinOp::Lt => {
            let l = encode_int(left)?;
            let r = encode_int(right)?;
            Ok(Dynamic::from_ast(&l.lt(&r)))
        }
        BinOp::Le => {
            let l = encode_int(left)?;
            let r = encode_int(right)?;
            Ok(Dynamic::from_ast(&l.le(&r)))
        }
        BinOp::Gt => {
            let l = encode_int(left)?;
            let r = encode_int(right)?;
            Ok(Dynamic::from_ast(&l.gt(&r)))
        }
        BinOp::Ge => {
            let l = encode_int(left)?;
            let r = encode_int(right)?;
            Ok(Dynamic::from_ast(&l.ge(&r)))
        }
        BinOp::Add => {
            let l = encode_int(left)?;
            let r = encode_int(right)?;
            Ok(Dynamic::from_ast(&Int::add(&[l, r])))
        }
        BinOp::Sub => {
            let l = encode_int(left)?;
            let r = encode_int(right)?;
            Ok(Dynamic::from_ast(&Int::sub(&[l, r])))
        }
        BinOp::Mul => {
            let l = encode_int(left)?;
            let r = encode_int(right)?;
            Ok(Dynamic::from_ast(&Int::mul(&[l, r])))
        }
        BinOp::Div => {
            let l = encode_int(left)?;
            let r = encode_int(right)?;
            Ok(Dynamic::from_ast(&l.div(&r)))
        }
        BinOp::Mod => {
            let l = encode_int(left)?;
            let r = encode_int(right)?;
            Ok(Dynamic::from_ast(&l.modulo(&r)))
        }
    }
}

fn encode_eq(left: &Expression, right: &Expression) -> EngineResult<Dynamic> {
    let l = encode(left)?;
    let r = encode(right)?;
    if let (Some(li), Some(ri)) = (l.as_int(), r.as_int()) {
        Ok(Dynamic::from_ast(&li.eq(&ri)))
    } else if let (Some(lb), Some(rb)) = (l.as_bool(), r.as_bool()) {
        Ok(Dynamic::from_ast(&lb.eq(&rb)))
    } else {
        Err(EngineError::UnencodableFormula(
            "equality between incompatible types".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym_int(name: &str) -> Expression {
        Expression::SymbolicVar {
            name: name.to_string(),
            ty: RuntimeType::Int,
        }
    }

    #[test]
    fn test_literal_contradiction_is_unsat() {
        let mut oracle = SolverOracle::new(false);
        let mut stats = Statistics::new();
        let x = sym_int("x");
        // x > 0 && x < 0
        let formula = Expression::and(
            Expression::Binary {
                op: BinOp::Gt,
                left: Box::new(x.clone()),
                right: Box::new(Expression::int(0)),
                ty: RuntimeType::Bool,
            },
            Expression::Binary {
                op: BinOp::Lt,
                left: Box::new(x),
                right: Box::new(Expression::int(0)),
                ty: RuntimeType::Bool,
            },
        );
        assert!(!oracle.is_satisfiable(&formula, &mut stats).unwrap());
        assert_eq!(stats.solver_calls, 1);
    }

    #[test]
    fn test_satisfiable_formula() {
        let mut oracle = SolverOracle::new(false);
        let mut stats = Statistics::new();
        let formula = Expression::eq(sym_int("x"), Expression::int(3));
        assert!(oracle.is_satisfiable(&formula, &mut stats).unwrap());
    }

    #[test]
    fn test_cache_hits_on_repeat_queries() {
        let mut oracle = SolverOracle::new(true);
        let mut stats = Statistics::new();
        let formula = Expression::eq(sym_int("x"), Expression::int(3));
        oracle.is_satisfiable(&formula, &mut stats).unwrap();
        oracle.is_satisfiable(&formula, &mut stats).unwrap();
        assert_eq!(stats.solver_calls, 1);
        assert_eq!(stats.cache_hits, 1);
    }

    #[test]
    fn test_null_encodes_distinct_from_references() {
        let mut oracle = SolverOracle::new(false);
        let mut stats = Statistics::new();
        // ref 1 == null must be unsatisfiable
        let formula = Expression::eq(
            Expression::reference(1, RuntimeType::Reference("C".to_string())),
            Expression::null(),
        );
        assert!(!oracle.is_satisfiable(&formula, &mut stats).unwrap());
    }
}
