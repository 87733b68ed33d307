use serde::Serialize;

pub const DEFAULT_EXPECTED_RETURN: f64 = 0.06;
pub const DEFAULT_VOLATILITY: f64 = 0.15;
pub const DEFAULT_TRIALS: u32 = 10_000;
pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationParams {
    pub starting_balance: f64,
    pub annual_contribution: f64,
    pub annual_withdrawal: f64,
    pub years: u32,
    pub expected_return: f64,
    pub volatility: f64,
    pub trials: u32,
    /// `None` draws the generator seed from OS entropy.
    pub random_seed: Option<u64>,
}

impl SimulationParams {
    pub fn new(
        starting_balance: f64,
        annual_contribution: f64,
        annual_withdrawal: f64,
        years: u32,
    ) -> Self {
        Self {
            starting_balance,
            annual_contribution,
            annual_withdrawal,
            years,
            expected_return: DEFAULT_EXPECTED_RETURN,
            volatility: DEFAULT_VOLATILITY,
            trials: DEFAULT_TRIALS,
            random_seed: Some(DEFAULT_SEED),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimulationError {
    #[error("trials must be >= 1, got {0}")]
    InvalidTrials(u32),
    #[error("years must be >= 1, got {0}")]
    InvalidYears(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub trials: u32,
    pub success_rate: f64,
    pub final_values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    pub trials: u32,
    pub success_rate: f64,
    pub mean_final_value: f64,
    pub p10_final_value: f64,
    pub median_final_value: f64,
    pub p90_final_value: f64,
    pub min_final_value: f64,
    pub max_final_value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearSnapshot {
    pub year: u32,
    pub p10_balance: f64,
    pub median_balance: f64,
    pub p90_balance: f64,
    pub solvent_fraction: f64,
}
