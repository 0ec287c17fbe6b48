//! Exploration statistics.

/// Counters accumulated over a verification run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    /// Scheduler steps taken across all branches.
    pub steps: u64,
    /// Choice points where exploration branched.
    pub branches: u64,
    /// Branches pruned as infeasible.
    pub pruned: u64,
    /// Terminal states that contributed `Valid`.
    pub completed_paths: u64,
    /// Branches cut off by the depth budget.
    pub depth_exhausted: u64,
    /// Solver invocations (after cache).
    pub solver_calls: u64,
    /// Formula cache hits.
    pub cache_hits: u64,
    /// Maximum number of live threads observed in any state.
    pub max_threads: usize,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_threads(&mut self, count: usize) {
        if count > self.max_threads {
            self.max_threads = count;
        }
    }
}
