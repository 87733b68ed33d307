use retirement_sim::core::{
    DEFAULT_EXPECTED_RETURN, DEFAULT_SEED, DEFAULT_TRIALS, DEFAULT_VOLATILITY, SimulationError,
    SimulationParams, XorShiftShocks, real_return, simulate, simulate_with, summarize,
};

#[test]
fn new_params_carry_documented_defaults() {
    let params = SimulationParams::new(200_000.0, 10_000.0, 30_000.0, 25);
    assert_eq!(params.expected_return, DEFAULT_EXPECTED_RETURN);
    assert_eq!(params.volatility, DEFAULT_VOLATILITY);
    assert_eq!(params.trials, DEFAULT_TRIALS);
    assert_eq!(params.random_seed, Some(DEFAULT_SEED));
    assert_eq!(DEFAULT_EXPECTED_RETURN, 0.06);
    assert_eq!(DEFAULT_VOLATILITY, 0.15);
    assert_eq!(DEFAULT_TRIALS, 10_000);
    assert_eq!(DEFAULT_SEED, 42);
}

#[test]
fn demo_scenario_runs_end_to_end() {
    let params = SimulationParams {
        trials: 2_000,
        random_seed: Some(3),
        ..SimulationParams::new(200_000.0, 10_000.0, 30_000.0, 25)
    };
    let result = simulate(&params).expect("valid params");
    let summary = summarize(&result);

    assert_eq!(summary.trials, 2_000);
    assert!(summary.success_rate > 0.0 && summary.success_rate < 1.0);
    assert!(summary.p10_final_value <= summary.median_final_value);
    assert!(summary.median_final_value <= summary.p90_final_value);
    assert!(summary.min_final_value >= 0.0);
}

#[test]
fn inflation_adjusted_drift_lowers_success() {
    let nominal = SimulationParams {
        trials: 3_000,
        ..SimulationParams::new(800_000.0, 0.0, 40_000.0, 30)
    };
    let real = SimulationParams {
        expected_return: real_return(nominal.expected_return, 0.03),
        ..nominal.clone()
    };

    let nominal_rate = simulate(&nominal).expect("valid params").success_rate;
    let real_rate = simulate(&real).expect("valid params").success_rate;
    assert!(real_rate <= nominal_rate);
}

#[test]
fn errors_display_the_offending_count() {
    let params = SimulationParams {
        trials: 0,
        ..SimulationParams::new(1.0, 0.0, 0.0, 1)
    };
    let err = simulate_with(&params, &mut XorShiftShocks::new(1)).expect_err("must reject");
    assert_eq!(err, SimulationError::InvalidTrials(0));
    assert_eq!(err.to_string(), "trials must be >= 1, got 0");
}
