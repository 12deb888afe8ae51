use std::env;

pub const DEFAULT_LOOP_LIMIT: usize = 3;
pub const DEFAULT_TRY_BUDGET: usize = 32;
pub const DEFAULT_MAX_SLICES: usize = 64;
pub const DEFAULT_SOLVER_TIMEOUT_MS: u32 = 60_000;

/// Search knobs shared by every orchestration call on a `Project`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParams {
    /// Maximum number of times one path may pass through the same block.
    pub loop_limit: usize,
    /// Candidate paths tried before the caller sees a budget sentinel.
    pub try_budget: usize,
    /// Upper bound on backward slices requested per instruction.
    pub max_slices: usize,
    pub solver_timeout_ms: u32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            loop_limit: DEFAULT_LOOP_LIMIT,
            try_budget: DEFAULT_TRY_BUDGET,
            max_slices: DEFAULT_MAX_SLICES,
            solver_timeout_ms: DEFAULT_SOLVER_TIMEOUT_MS,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<T>().ok())
}

impl SearchParams {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let loop_limit = parse_env::<usize>("PATHFINDER_LOOP_LIMIT")
            .filter(|v| *v > 0)
            .unwrap_or(defaults.loop_limit);
        let try_budget =
            parse_env::<usize>("PATHFINDER_TRY_BUDGET").unwrap_or(defaults.try_budget);
        let max_slices = parse_env::<usize>("PATHFINDER_MAX_SLICES")
            .filter(|v| *v > 0)
            .unwrap_or(defaults.max_slices);
        let solver_timeout_ms = parse_env::<u32>("PATHFINDER_SOLVER_TIMEOUT_MS")
            .unwrap_or(defaults.solver_timeout_ms);
        Self {
            loop_limit,
            try_budget,
            max_slices,
            solver_timeout_ms,
        }
    }
}
