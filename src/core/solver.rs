use serde::Serialize;

use super::{SimulationParams, simulate};

#[derive(Debug, Clone, Copy)]
pub struct WithdrawalSolveConfig {
    pub target_success_rate: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub max_iterations: u32,
    pub trials_per_iteration: u32,
    pub final_trials: u32,
}

impl Default for WithdrawalSolveConfig {
    fn default() -> Self {
        Self {
            target_success_rate: 0.9,
            search_min: 0.0,
            search_max: 200_000.0,
            tolerance: 50.0,
            max_iterations: 40,
            trials_per_iteration: 2_000,
            final_trials: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalSolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_withdrawal: f64,
    pub success_rate: f64,
    pub success_ci_half_width: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalSolveResult {
    pub target_success_rate: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub tolerance: f64,
    pub solved_withdrawal: Option<f64>,
    pub achieved_success_rate: Option<f64>,
    pub achieved_success_ci_half_width: Option<f64>,
    pub iterations: Vec<WithdrawalSolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

/// Bisects on `annual_withdrawal` for the largest value whose success rate
/// still meets the target. Every candidate reuses the caller's seed.
pub fn solve_max_withdrawal(
    params: &SimulationParams,
    config: WithdrawalSolveConfig,
) -> Result<WithdrawalSolveResult, String> {
    validate_config(params, config)?;

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let low_eval = evaluate_candidate(params, config.trials_per_iteration, config.search_min)?;
    let high_eval = evaluate_candidate(params, config.trials_per_iteration, config.search_max)?;

    let mut solved_withdrawal = None;
    let mut converged = false;
    let feasible;
    let message;

    if !meets_target(low_eval, config) {
        feasible = false;
        message = "No feasible withdrawal found within the search bounds.".to_string();
    } else if meets_target(high_eval, config) {
        solved_withdrawal = Some(config.search_max);
        converged = true;
        feasible = true;
        message =
            "Upper withdrawal bound is still feasible; increase search max for a higher target."
                .to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = config.search_max;
        let mut it = 0;
        while it < config.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let eval = evaluate_candidate(params, config.trials_per_iteration, mid)?;
            iterations.push(WithdrawalSolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_withdrawal: mid,
                success_rate: eval.success_rate,
                success_ci_half_width: eval.success_ci_half_width,
            });

            if meets_target(eval, config) {
                lo = mid;
            } else {
                hi = mid;
            }

            if (hi - lo).abs() <= config.tolerance {
                converged = true;
                solved_withdrawal = Some(lo);
                break;
            }
        }
        if solved_withdrawal.is_none() {
            solved_withdrawal = Some(lo);
        }
        feasible = true;
        message = if converged {
            "Solved maximum sustainable withdrawal.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate."
                .to_string()
        };
    }

    let mut achieved_success_rate = None;
    let mut achieved_success_ci_half_width = None;
    if let Some(value) = solved_withdrawal {
        let final_eval = evaluate_candidate(params, config.final_trials, value)?;
        achieved_success_rate = Some(final_eval.success_rate);
        achieved_success_ci_half_width = Some(final_eval.success_ci_half_width);
    }

    Ok(WithdrawalSolveResult {
        target_success_rate: config.target_success_rate,
        search_min: config.search_min,
        search_max: config.search_max,
        tolerance: config.tolerance,
        solved_withdrawal,
        achieved_success_rate,
        achieved_success_ci_half_width,
        iterations,
        converged,
        feasible,
        message,
    })
}

#[derive(Debug, Clone, Copy)]
struct CandidateEval {
    success_rate: f64,
    success_ci_half_width: f64,
}

fn meets_target(eval: CandidateEval, config: WithdrawalSolveConfig) -> bool {
    eval.success_rate + 1e-12 >= config.target_success_rate
}

fn evaluate_candidate(
    base: &SimulationParams,
    trials: u32,
    withdrawal: f64,
) -> Result<CandidateEval, String> {
    let params = SimulationParams {
        annual_withdrawal: withdrawal.max(0.0),
        trials,
        ..base.clone()
    };
    let result = simulate(&params).map_err(|e| e.to_string())?;
    Ok(CandidateEval {
        success_rate: result.success_rate,
        success_ci_half_width: binomial_ci_half_width(result.success_rate, trials),
    })
}

pub fn binomial_ci_half_width(p: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}

fn validate_config(params: &SimulationParams, config: WithdrawalSolveConfig) -> Result<(), String> {
    if params.years == 0 {
        return Err("years must be > 0".to_string());
    }
    if !(0.0..=1.0).contains(&config.target_success_rate) {
        return Err("target_success_rate must be between 0 and 1".to_string());
    }
    if !config.search_min.is_finite() || !config.search_max.is_finite() {
        return Err("search bounds must be finite".to_string());
    }
    if config.search_min < 0.0 {
        return Err("search_min must be >= 0".to_string());
    }
    if config.search_max <= config.search_min {
        return Err("search_max must be greater than search_min".to_string());
    }
    if !config.tolerance.is_finite() || config.tolerance <= 0.0 {
        return Err("tolerance must be > 0".to_string());
    }
    if config.max_iterations == 0 {
        return Err("max_iterations must be > 0".to_string());
    }
    if config.trials_per_iteration == 0 {
        return Err("trials_per_iteration must be > 0".to_string());
    }
    if config.final_trials == 0 {
        return Err("final_trials must be > 0".to_string());
    }
    Ok(())
}
