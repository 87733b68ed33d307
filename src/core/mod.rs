mod engine;
mod returns;
mod shocks;
mod solver;
mod types;

pub use engine::{simulate, simulate_sequential, simulate_with, simulate_with_trace, summarize};
pub use returns::{mean, percentile_sorted, real_return};
pub use shocks::{ShockMatrix, ShockSource, StdNormalShocks, XorShiftShocks};
pub use solver::{
    WithdrawalSolveConfig, WithdrawalSolveIteration, WithdrawalSolveResult,
    binomial_ci_half_width, solve_max_withdrawal,
};
pub use types::{
    DEFAULT_EXPECTED_RETURN, DEFAULT_SEED, DEFAULT_TRIALS, DEFAULT_VOLATILITY, SimulationError,
    SimulationParams, SimulationResult, SimulationSummary, YearSnapshot,
};
