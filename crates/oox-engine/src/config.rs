//! Configuration for the symbolic execution engine.

use std::path::PathBuf;

/// Configuration for a verification run.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// OOX source file to verify.
    pub file_name: PathBuf,
    /// Entry point in `Class.method` form.
    pub entry_point: String,
    /// Step budget per exploration branch.
    pub maximum_depth: u64,
    /// Check `ensures` clauses at member exit.
    pub verify_ensures: bool,
    /// Check `requires` clauses at member entry of non-root calls.
    pub verify_requires: bool,
    /// Check `exceptional` clauses along unwinding paths.
    pub verify_exceptional: bool,
    /// Allow null in the alias sets of symbolic references.
    pub symbolic_nulls: bool,
    /// Let fresh symbolic references alias earlier ones of the same type.
    pub symbolic_aliases: bool,
    /// Upper bound on the length of a symbolic array.
    pub symbolic_array_size: usize,
    /// Memoise solver queries on formula identity.
    pub cache_formulas: bool,
    /// Apply partial-order reduction to thread scheduling.
    pub apply_por: bool,
    /// Fold concrete subexpressions locally instead of deferring to the solver.
    pub apply_local_solver: bool,
    /// Shuffle the selected thread list before branching.
    pub apply_random_interleaving: bool,
    /// 0 = silent, 1 = info, 2 = debug, 3+ = trace.
    pub log_level: u8,
    /// Emit exploration statistics at the end of the run.
    pub run_benchmark: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            file_name: PathBuf::new(),
            entry_point: String::new(),
            maximum_depth: 40,
            verify_ensures: true,
            verify_requires: true,
            verify_exceptional: true,
            symbolic_nulls: true,
            symbolic_aliases: true,
            symbolic_array_size: 2,
            cache_formulas: true,
            apply_por: true,
            apply_local_solver: true,
            apply_random_interleaving: false,
            log_level: 1,
            run_benchmark: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();
        assert!(config.apply_por);
        assert!(!config.apply_random_interleaving);
        assert_eq!(config.maximum_depth, 40);
    }
}
