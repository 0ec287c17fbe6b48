//! Symbolic execution engine for OOX programs.
//!
//! Consumes a pre-built control-flow graph and symbol table, explores all
//! feasible interleaved executions of the entry point up to a depth bound,
//! and discharges assertions and contracts to Z3. Produces one of three
//! verdicts: `Valid`, `Invalid` (with a counterexample location), or
//! `Deadlock`.

mod concretize;
pub mod config;
mod eval;
mod exception;
mod exec;
mod por;
pub mod solver;
pub mod state;
pub mod stats;

pub use config::Configuration;
pub use state::{
    AliasMap, ExecutionState, HandlerEntry, Heap, HeapValue, InterleavingConstraint, LockSet,
    PathConstraints, StackFrame, Thread, ThreadId, TracePoint,
};
pub use stats::Statistics;

use oox_cfg::{ControlFlowGraph, SymbolTable};
use oox_syntax::{Expression, Span};
use rand::rngs::StdRng;
use rand::SeedableRng;
use solver::SolverOracle;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

/// A fatal engine error: a bug in the engine or malformed input. Verdicts
/// and infeasibility are not errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown entry point '{0}'")]
    UnknownEntryPoint(String),

    #[error("unresolved invocation '{0}'")]
    Unresolved(String),

    #[error("expected a reference value, found '{0:?}'")]
    ExpectedReference(Expression),

    #[error("expected a concrete reference, found '{0:?}'")]
    ExpectedConcreteReference(Expression),

    #[error("expected a method member, found '{0}'")]
    ExpectedMethodMember(String),

    #[error("no thread is currently scheduled")]
    CannotGetCurrentThread,

    #[error("expected {expected} successors of a {kind} node, found {found}")]
    ExpectedNumberOfNeighbours {
        kind: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("no aliases recorded for symbolic reference '{0}'")]
    NoAliases(String),

    #[error("undeclared variable '{0}'")]
    UndeclaredVariable(String),

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("formula cannot be encoded for the solver: {0}")]
    UnencodableFormula(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// The verdict of a verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    /// Every explored path satisfies its assertions and contracts.
    Valid,
    /// A reachable violation was found.
    Invalid {
        /// Source location of the violated assertion or contract.
        location: Option<Span>,
        /// Text of the violated formula.
        formula: Option<String>,
    },
    /// Live threads remain but none is enabled.
    Deadlock,
}

impl VerificationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerificationResult::Valid)
    }

    /// Invalid verdict without location information.
    pub fn invalid() -> Self {
        VerificationResult::Invalid {
            location: None,
            formula: None,
        }
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationResult::Valid => write!(f, "VALID"),
            VerificationResult::Invalid { location, .. } => match location {
                Some(span) => write!(f, "INVALID (at {})", span),
                None => write!(f, "INVALID"),
            },
            VerificationResult::Deadlock => write!(f, "DEADLOCK"),
        }
    }
}

/// Verdict plus statistics.
#[derive(Debug)]
pub struct VerifyOutcome {
    pub result: VerificationResult,
    pub stats: Statistics,
}

/// Shared context threaded through every semantic operation.
pub(crate) struct Engine<'a> {
    pub cfg: &'a ControlFlowGraph,
    pub symbols: &'a SymbolTable,
    pub config: &'a Configuration,
    pub solver: SolverOracle,
    pub stats: Statistics,
    /// Present only when random interleaving is enabled.
    pub rng: Option<StdRng>,
}

impl<'a> Engine<'a> {
    fn new(cfg: &'a ControlFlowGraph, symbols: &'a SymbolTable, config: &'a Configuration) -> Self {
        Self {
            cfg,
            symbols,
            config,
            solver: SolverOracle::new(config.cache_formulas),
            stats: Statistics::new(),
            rng: config
                .apply_random_interleaving
                .then(StdRng::from_entropy),
        }
    }
}

/// Verify the configured entry point against the given program.
///
/// The entry point's parameters are seeded with symbolic values of their
/// declared types; for instance methods the receiver is a fresh symbolic
/// reference.
pub fn verify(
    cfg: &ControlFlowGraph,
    symbols: &SymbolTable,
    config: &Configuration,
) -> EngineResult<VerifyOutcome> {
    let member = symbols
        .lookup_qualified(&config.entry_point)
        .ok_or_else(|| EngineError::UnknownEntryPoint(config.entry_point.clone()))?;
    if member.is_constructor() {
        return Err(EngineError::ExpectedMethodMember(config.entry_point.clone()));
    }

    info!(
        entry = %config.entry_point,
        depth = config.maximum_depth,
        por = config.apply_por,
        "starting symbolic execution"
    );

    let mut engine = Engine::new(cfg, symbols, config);
    let state = engine.initial_state(member)?;
    let result = match engine.exec_p(state)? {
        exec::Search::Done => VerificationResult::Valid,
        exec::Search::Halt(verdict) => verdict,
    };

    debug!(verdict = %result, "symbolic execution finished");
    if config.run_benchmark {
        let stats = &engine.stats;
        info!(
            steps = stats.steps,
            branches = stats.branches,
            pruned = stats.pruned,
            completed_paths = stats.completed_paths,
            depth_exhausted = stats.depth_exhausted,
            solver_calls = stats.solver_calls,
            cache_hits = stats.cache_hits,
            max_threads = stats.max_threads,
            "exploration statistics"
        );
    }

    Ok(VerifyOutcome {
        result,
        stats: engine.stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use oox_syntax::parse;

    fn run(source: &str, entry: &str, config: Configuration) -> VerificationResult {
        let unit = parse(source).expect("parse");
        let (cfg, symbols) = oox_cfg::build(&unit).expect("cfg");
        let config = Configuration {
            entry_point: entry.to_string(),
            ..config
        };
        verify(&cfg, &symbols, &config).expect("verify").result
    }

    #[test]
    fn test_unknown_entry_point() {
        let unit = parse("class C { static void m() { skip; } }").expect("parse");
        let (cfg, symbols) = oox_cfg::build(&unit).expect("cfg");
        let config = Configuration {
            entry_point: "C.missing".to_string(),
            ..Configuration::default()
        };
        assert!(matches!(
            verify(&cfg, &symbols, &config),
            Err(EngineError::UnknownEntryPoint(_))
        ));
    }

    #[test]
    fn test_trivial_valid() {
        let verdict = run(
            "class C { static void m() { assert true; } }",
            "C.m",
            Configuration::default(),
        );
        assert!(verdict.is_valid());
    }

    #[test]
    fn test_literal_false_assert_is_invalid() {
        let verdict = run(
            "class C { static void m() { assert false; } }",
            "C.m",
            Configuration::default(),
        );
        assert!(matches!(verdict, VerificationResult::Invalid { .. }));
    }

    #[test]
    fn test_caught_exception_resumes_after_catch() {
        let verdict = run(
            "class C {
                static void m() {
                    int x := 0;
                    try {
                        throw \"boom\";
                    } catch {
                        x := 1;
                    }
                    assert x == 1;
                }
            }",
            "C.m",
            Configuration::default(),
        );
        assert!(verdict.is_valid());
    }

    #[test]
    fn test_uncaught_exception_at_root_is_valid() {
        let verdict = run(
            "class C {
                static void m() {
                    throw \"boom\";
                }
            }",
            "C.m",
            Configuration::default(),
        );
        assert!(verdict.is_valid());
    }

    #[test]
    fn test_violated_exceptional_contract_is_invalid() {
        let verdict = run(
            "class C {
                static void m()
                    exceptional(false)
                {
                    throw \"boom\";
                }
            }",
            "C.m",
            Configuration::default(),
        );
        assert!(matches!(verdict, VerificationResult::Invalid { .. }));
    }

    #[test]
    fn test_exception_unwinds_through_call_into_handler() {
        let verdict = run(
            "class C {
                static void m() {
                    try {
                        C.f();
                        assert false;
                    } catch {
                        skip;
                    }
                }
                static void f()
                    exceptional(true)
                {
                    throw \"x\";
                }
            }",
            "C.m",
            Configuration::default(),
        );
        assert!(verdict.is_valid());
    }

    #[test]
    fn test_lock_on_null_is_infeasible_not_invalid() {
        let verdict = run(
            "class C {
                static void m() {
                    C n := null;
                    lock (n) {
                        assert false;
                    }
                }
            }",
            "C.m",
            Configuration::default(),
        );
        assert!(verdict.is_valid());
    }

    #[test]
    fn test_depth_zero_is_vacuously_valid() {
        let verdict = run(
            "class C { static void m() { assert false; } }",
            "C.m",
            Configuration {
                maximum_depth: 0,
                ..Configuration::default()
            },
        );
        assert!(verdict.is_valid());
    }
}
