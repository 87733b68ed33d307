#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::debug;

use super::returns::{mean, percentile_sorted};
use super::shocks::{ShockMatrix, ShockSource, StdNormalShocks};
use super::types::{
    SimulationError, SimulationParams, SimulationResult, SimulationSummary, YearSnapshot,
};

/// Trials per rayon task. Chunking only splits the trial axis, so every trial
/// still reads the draws at its own column of the shock matrix.
#[cfg(feature = "parallel")]
const TRIAL_CHUNK: usize = 1024;

/// Years per step of the discretisation.
const DT: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
enum Execution {
    Sequential,
    #[cfg(feature = "parallel")]
    Parallel,
}

impl Execution {
    fn preferred() -> Self {
        #[cfg(feature = "parallel")]
        {
            Execution::Parallel
        }
        #[cfg(not(feature = "parallel"))]
        {
            Execution::Sequential
        }
    }
}

/// Cash flows and GBM coefficients shared by every trial and every year.
#[derive(Debug, Clone, Copy)]
struct YearlyStep {
    contribution: f64,
    withdrawal: f64,
    drift: f64,
    diffusion: f64,
}

impl YearlyStep {
    fn from_params(params: &SimulationParams) -> Self {
        let mu = params.expected_return;
        let sigma = params.volatility;
        Self {
            contribution: params.annual_contribution,
            withdrawal: params.annual_withdrawal,
            drift: (mu - 0.5 * sigma * sigma) * DT,
            diffusion: sigma * DT.sqrt(),
        }
    }

    fn growth_factor(self, z: f64) -> f64 {
        (self.drift + self.diffusion * z).exp()
    }

    /// One year for a slice of trials: contribute, grow, withdraw, floor.
    /// A floored balance goes through the same arithmetic next year, so it
    /// recovers whenever `contribution * growth > withdrawal`.
    fn apply(self, balances: &mut [f64], shocks: &[f64]) {
        debug_assert_eq!(balances.len(), shocks.len());
        for (balance, &z) in balances.iter_mut().zip(shocks) {
            let mut b = *balance + self.contribution;
            b *= self.growth_factor(z);
            b -= self.withdrawal;
            *balance = b.max(0.0);
        }
    }
}

pub fn simulate(params: &SimulationParams) -> Result<SimulationResult, SimulationError> {
    validate_params(params)?;
    let mut source = StdNormalShocks::from_seed(params.random_seed);
    run(params, &mut source, Execution::preferred())
}

/// Same engine, single-threaded regardless of the `parallel` feature.
pub fn simulate_sequential(
    params: &SimulationParams,
) -> Result<SimulationResult, SimulationError> {
    validate_params(params)?;
    let mut source = StdNormalShocks::from_seed(params.random_seed);
    run(params, &mut source, Execution::Sequential)
}

/// Runs the engine against a caller-supplied shock generator.
/// `params.random_seed` is ignored; the source carries its own seed.
pub fn simulate_with<S: ShockSource + ?Sized>(
    params: &SimulationParams,
    source: &mut S,
) -> Result<SimulationResult, SimulationError> {
    validate_params(params)?;
    run(params, source, Execution::preferred())
}

/// Sequential run that also records the ensemble's distribution after every
/// year's floor.
pub fn simulate_with_trace(
    params: &SimulationParams,
) -> Result<(SimulationResult, Vec<YearSnapshot>), SimulationError> {
    validate_params(params)?;
    let mut source = StdNormalShocks::from_seed(params.random_seed);
    let (years, trials) = (params.years as usize, params.trials as usize);
    let shocks = source.standard_normal_matrix(years, trials);
    let step = YearlyStep::from_params(params);

    let mut balances = vec![params.starting_balance; trials];
    let mut snapshots = Vec::with_capacity(years);
    let mut scratch = Vec::with_capacity(trials);
    for year in 0..years {
        step.apply(&mut balances, shocks.row(year));

        scratch.clear();
        scratch.extend_from_slice(&balances);
        scratch.sort_by(|a, b| a.total_cmp(b));
        snapshots.push(YearSnapshot {
            year: year as u32 + 1,
            p10_balance: percentile_sorted(&scratch, 10.0),
            median_balance: percentile_sorted(&scratch, 50.0),
            p90_balance: percentile_sorted(&scratch, 90.0),
            solvent_fraction: solvent_fraction(&balances),
        });
    }

    Ok((build_result(params, balances), snapshots))
}

pub fn summarize(result: &SimulationResult) -> SimulationSummary {
    let mut sorted = result.final_values.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));

    SimulationSummary {
        trials: result.trials,
        success_rate: result.success_rate,
        mean_final_value: mean(&sorted),
        p10_final_value: percentile_sorted(&sorted, 10.0),
        median_final_value: percentile_sorted(&sorted, 50.0),
        p90_final_value: percentile_sorted(&sorted, 90.0),
        min_final_value: sorted.first().copied().unwrap_or(0.0),
        max_final_value: sorted.last().copied().unwrap_or(0.0),
    }
}

fn validate_params(params: &SimulationParams) -> Result<(), SimulationError> {
    if params.trials == 0 {
        return Err(SimulationError::InvalidTrials(params.trials));
    }
    if params.years == 0 {
        return Err(SimulationError::InvalidYears(params.years));
    }
    Ok(())
}

fn run<S: ShockSource + ?Sized>(
    params: &SimulationParams,
    source: &mut S,
    execution: Execution,
) -> Result<SimulationResult, SimulationError> {
    let (years, trials) = (params.years as usize, params.trials as usize);
    let shocks = source.standard_normal_matrix(years, trials);
    let step = YearlyStep::from_params(params);

    let mut balances = vec![params.starting_balance; trials];
    match execution {
        Execution::Sequential => evolve_trials(&mut balances, 0, &shocks, step),
        #[cfg(feature = "parallel")]
        Execution::Parallel => balances
            .par_chunks_mut(TRIAL_CHUNK)
            .enumerate()
            .for_each(|(chunk, slice)| {
                evolve_trials(slice, chunk * TRIAL_CHUNK, &shocks, step);
            }),
    }

    let result = build_result(params, balances);
    debug!(
        years = params.years,
        trials = params.trials,
        seed = ?params.random_seed,
        success_rate = result.success_rate,
        ?execution,
        "simulation finished"
    );
    Ok(result)
}

/// Evolves the trials `offset..offset + balances.len()` through every year.
fn evolve_trials(balances: &mut [f64], offset: usize, shocks: &ShockMatrix, step: YearlyStep) {
    let end = offset + balances.len();
    for year in 0..shocks.years() {
        step.apply(balances, &shocks.row(year)[offset..end]);
    }
}

fn solvent_fraction(balances: &[f64]) -> f64 {
    let solvent = balances.iter().filter(|&&b| b > 0.0).count();
    solvent as f64 / balances.len() as f64
}

fn build_result(params: &SimulationParams, final_values: Vec<f64>) -> SimulationResult {
    SimulationResult {
        trials: params.trials,
        success_rate: solvent_fraction(&final_values),
        final_values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shocks::XorShiftShocks;
    use proptest::prelude::{any, prop_assert, prop_assert_eq, proptest};

    struct ZeroShocks;

    impl ShockSource for ZeroShocks {
        fn standard_normal(&mut self) -> f64 {
            0.0
        }
    }

    /// Mirrors every draw of the wrapped source.
    struct NegatedShocks<S>(S);

    impl<S: ShockSource> ShockSource for NegatedShocks<S> {
        fn standard_normal(&mut self) -> f64 {
            -self.0.standard_normal()
        }

        fn standard_normal_matrix(&mut self, years: usize, trials: usize) -> ShockMatrix {
            let inner = self.0.standard_normal_matrix(years, trials);
            let mut values = Vec::with_capacity(years * trials);
            for year in 0..years {
                values.extend(inner.row(year).iter().map(|z| -z));
            }
            ShockMatrix::from_values(years, trials, values)
        }
    }

    fn assert_rel(actual: f64, expected: f64, rel: f64) {
        let scale = expected.abs().max(1.0);
        assert!(
            (actual - expected).abs() <= rel * scale,
            "expected {expected}, got {actual}, relative tolerance {rel}"
        );
    }

    fn sample_params() -> SimulationParams {
        SimulationParams {
            starting_balance: 100_000.0,
            annual_contribution: 5_000.0,
            annual_withdrawal: 2_000.0,
            years: 10,
            expected_return: 0.05,
            volatility: 0.1,
            trials: 500,
            random_seed: Some(1),
        }
    }

    fn deterministic_recurrence(params: &SimulationParams, growth: f64) -> f64 {
        let mut balance = params.starting_balance;
        for _ in 0..params.years {
            balance = ((balance + params.annual_contribution) * growth.exp()
                - params.annual_withdrawal)
                .max(0.0);
        }
        balance
    }

    #[test]
    fn basic_run_has_expected_shape_and_bounds() {
        let params = sample_params();
        let result = simulate(&params).expect("valid params");

        assert_eq!(result.trials, params.trials);
        assert_eq!(result.final_values.len(), params.trials as usize);
        assert!((0.0..=1.0).contains(&result.success_rate));
        assert!(result.final_values.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn fixed_seed_reruns_are_bit_identical() {
        let params = sample_params();
        let a = simulate(&params).expect("valid params");
        let b = simulate(&params).expect("valid params");
        assert_eq!(a.final_values, b.final_values);
        assert_eq!(a.success_rate.to_bits(), b.success_rate.to_bits());
    }

    #[test]
    fn different_seeds_give_different_ensembles() {
        let params = sample_params();
        let other = SimulationParams {
            random_seed: Some(2),
            ..params.clone()
        };
        let a = simulate(&params).expect("valid params");
        let b = simulate(&other).expect("valid params");
        assert_ne!(a.final_values, b.final_values);
    }

    #[test]
    fn unseeded_run_still_produces_full_ensemble() {
        let params = SimulationParams {
            random_seed: None,
            trials: 64,
            ..sample_params()
        };
        let result = simulate(&params).expect("valid params");
        assert_eq!(result.final_values.len(), 64);
    }

    #[test]
    fn zero_volatility_matches_closed_form_recurrence() {
        let params = SimulationParams {
            starting_balance: 50_000.0,
            annual_contribution: 1_000.0,
            annual_withdrawal: 500.0,
            years: 5,
            expected_return: 0.03,
            volatility: 0.0,
            trials: 100,
            random_seed: Some(2),
        };
        let result = simulate(&params).expect("valid params");
        let expected = deterministic_recurrence(&params, params.expected_return);

        let first = result.final_values[0];
        assert!(result.final_values.iter().all(|v| *v == first));
        for value in &result.final_values {
            assert_rel(*value, expected, 1e-9);
        }
        assert_eq!(result.success_rate, 1.0);
    }

    #[test]
    fn zero_trials_is_rejected() {
        let params = SimulationParams {
            trials: 0,
            ..sample_params()
        };
        assert_eq!(simulate(&params), Err(SimulationError::InvalidTrials(0)));
        assert!(simulate_with_trace(&params).is_err());
        assert!(simulate_with(&params, &mut ZeroShocks).is_err());
    }

    #[test]
    fn zero_years_is_rejected() {
        let params = SimulationParams {
            years: 0,
            ..sample_params()
        };
        assert_eq!(
            simulate_sequential(&params).map(|r| r.trials),
            Err(SimulationError::InvalidYears(0))
        );
    }

    #[test]
    fn floored_trajectory_recovers_when_contributions_outgrow_withdrawals() {
        let base = SimulationParams {
            starting_balance: -100_000.0,
            annual_contribution: 2_000.0,
            annual_withdrawal: 500.0,
            years: 1,
            expected_return: 0.5,
            volatility: 0.0,
            trials: 3,
            random_seed: Some(9),
        };
        let after_one = simulate(&base).expect("valid params");
        assert!(after_one.final_values.iter().all(|v| *v == 0.0));
        assert_eq!(after_one.success_rate, 0.0);

        let longer = SimulationParams {
            years: 3,
            ..base.clone()
        };
        let (result, trace) = simulate_with_trace(&longer).expect("valid params");
        assert_eq!(trace[0].solvent_fraction, 0.0);
        assert_eq!(trace[1].solvent_fraction, 1.0);
        assert_eq!(result.success_rate, 1.0);

        let expected = deterministic_recurrence(&longer, longer.expected_return);
        assert!(expected > 0.0);
        for value in &result.final_values {
            assert_rel(*value, expected, 1e-9);
        }
    }

    #[test]
    fn floored_trajectory_stays_at_zero_when_withdrawals_dominate() {
        let params = SimulationParams {
            starting_balance: -1.0,
            annual_contribution: 100.0,
            annual_withdrawal: 1_000.0,
            years: 8,
            expected_return: 0.05,
            volatility: 0.0,
            trials: 4,
            random_seed: Some(1),
        };
        let (result, trace) = simulate_with_trace(&params).expect("valid params");
        assert!(trace.iter().all(|year| year.solvent_fraction == 0.0));
        assert!(result.final_values.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn trace_agrees_with_plain_run() {
        let params = sample_params();
        let plain = simulate_sequential(&params).expect("valid params");
        let (traced, snapshots) = simulate_with_trace(&params).expect("valid params");

        assert_eq!(plain.final_values, traced.final_values);
        assert_eq!(snapshots.len(), params.years as usize);
        assert_eq!(snapshots.last().map(|s| s.year), Some(params.years));
        let last = snapshots.last().expect("one snapshot per year");
        assert_eq!(last.solvent_fraction, plain.success_rate);
        for snapshot in &snapshots {
            assert!(snapshot.p10_balance <= snapshot.median_balance);
            assert!(snapshot.median_balance <= snapshot.p90_balance);
        }
    }

    #[test]
    fn parallel_and_sequential_paths_are_identical() {
        let params = SimulationParams {
            trials: 5_000,
            years: 40,
            ..sample_params()
        };
        let parallel = simulate(&params).expect("valid params");
        let sequential = simulate_sequential(&params).expect("valid params");
        assert_eq!(parallel.final_values, sequential.final_values);
        assert_eq!(parallel.success_rate, sequential.success_rate);
    }

    #[test]
    fn zero_shock_source_yields_drift_only_recurrence() {
        let params = SimulationParams {
            volatility: 0.2,
            ..sample_params()
        };
        let result = simulate_with(&params, &mut ZeroShocks).expect("valid params");
        let growth = params.expected_return - 0.5 * 0.2 * 0.2;
        let expected = deterministic_recurrence(&params, growth);
        for value in &result.final_values {
            assert_rel(*value, expected, 1e-9);
        }
    }

    #[test]
    fn negative_volatility_mirrors_the_shock_stream() {
        // The drift only sees sigma squared, so flipping the sign of sigma is
        // the same as flipping every shock.
        let negative = SimulationParams {
            volatility: -0.15,
            ..sample_params()
        };
        let positive = SimulationParams {
            volatility: 0.15,
            ..sample_params()
        };

        let result = simulate(&negative).expect("negative volatility is accepted");
        assert_eq!(result.final_values.len(), negative.trials as usize);
        assert!(result.final_values.iter().all(|v| v.is_finite() && *v >= 0.0));

        let mirrored = simulate_with(
            &positive,
            &mut NegatedShocks(StdNormalShocks::from_seed(positive.random_seed)),
        )
        .expect("valid params");
        assert_eq!(result.success_rate, mirrored.success_rate);
        for (a, b) in result.final_values.iter().zip(&mirrored.final_values) {
            assert_rel(*a, *b, 1e-12);
        }

        let same_seed = simulate(&positive).expect("valid params");
        assert_ne!(result.final_values, same_seed.final_values);
    }

    #[test]
    fn alternate_generator_plugs_into_engine() {
        let params = sample_params();
        let a = simulate_with(&params, &mut XorShiftShocks::new(5)).expect("valid params");
        let b = simulate_with(&params, &mut XorShiftShocks::new(5)).expect("valid params");
        let default_source = simulate(&params).expect("valid params");

        assert_eq!(a.final_values, b.final_values);
        assert_ne!(a.final_values, default_source.final_values);
        assert!((0.0..=1.0).contains(&a.success_rate));
    }

    #[test]
    fn summary_orders_percentiles_and_echoes_result() {
        let result = SimulationResult {
            trials: 5,
            success_rate: 0.8,
            final_values: vec![0.0, 400.0, 100.0, 300.0, 200.0],
        };
        let summary = summarize(&result);
        assert_eq!(summary.trials, 5);
        assert_eq!(summary.success_rate, 0.8);
        assert_eq!(summary.median_final_value, 200.0);
        assert_eq!(summary.mean_final_value, 200.0);
        assert_eq!(summary.min_final_value, 0.0);
        assert_eq!(summary.max_final_value, 400.0);
        assert_rel(summary.p10_final_value, 40.0, 1e-12);
        assert_rel(summary.p90_final_value, 360.0, 1e-12);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(32))]

        #[test]
        fn prop_outputs_are_bounded_non_negative_and_shaped(
            seed in any::<u64>(),
            start in -50_000.0f64..2_000_000.0,
            contribution in 0.0f64..50_000.0,
            withdrawal in 0.0f64..150_000.0,
            years in 1u32..60,
            mu in -0.1f64..0.15,
            sigma in 0.0f64..0.4,
            trials in 1u32..300,
        ) {
            let params = SimulationParams {
                starting_balance: start,
                annual_contribution: contribution,
                annual_withdrawal: withdrawal,
                years,
                expected_return: mu,
                volatility: sigma,
                trials,
                random_seed: Some(seed),
            };
            let result = simulate(&params).expect("valid params");

            prop_assert_eq!(result.trials, trials);
            prop_assert_eq!(result.final_values.len(), trials as usize);
            prop_assert!((0.0..=1.0).contains(&result.success_rate));
            for value in &result.final_values {
                prop_assert!(*value >= 0.0);
            }

            let again = simulate(&params).expect("valid params");
            prop_assert_eq!(&result.final_values, &again.final_values);
        }

        #[test]
        fn prop_higher_starting_balance_does_not_reduce_success_rate(
            seed in any::<u64>(),
            start in 0.0f64..1_000_000.0,
            extra in 0.0f64..1_000_000.0,
            withdrawal in 10_000.0f64..80_000.0,
            years in 1u32..45,
            sigma in 0.0f64..0.35,
        ) {
            let low = SimulationParams {
                starting_balance: start,
                annual_contribution: 5_000.0,
                annual_withdrawal: withdrawal,
                years,
                expected_return: 0.05,
                volatility: sigma,
                trials: 200,
                random_seed: Some(seed),
            };
            let high = SimulationParams {
                starting_balance: start + extra,
                ..low.clone()
            };

            let low_result = simulate(&low).expect("valid params");
            let high_result = simulate(&high).expect("valid params");

            prop_assert!(high_result.success_rate >= low_result.success_rate);
            for (lo, hi) in low_result.final_values.iter().zip(&high_result.final_values) {
                prop_assert!(hi >= lo);
            }
        }
    }
}
