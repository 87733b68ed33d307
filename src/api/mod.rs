use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::{
    SimulationParams, SimulationSummary, WithdrawalSolveConfig, WithdrawalSolveResult,
    YearSnapshot, real_return, simulate, simulate_with_trace, solve_max_withdrawal, summarize,
};

const MAX_TRIALS: u32 = 1_000_000;
const MAX_YEARS: u32 = 200;
/// Upper bound on `years * trials`, the length of the shock matrix.
const MAX_SHOCKS: u64 = 50_000_000;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Bad flags, `--help` and `--version`; `main` hands these to `clap::Error::exit`.
    #[error(transparent)]
    Args(#[from] clap::Error),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "retirement-sim",
    about = "Monte Carlo retirement survival estimator (single-asset GBM returns)"
)]
struct Cli {
    #[arg(long, default_value_t = 500_000.0, help = "Starting balance")]
    start: f64,
    #[arg(
        long,
        default_value_t = 10_000.0,
        help = "Annual contribution, added at the start of each year"
    )]
    contrib: f64,
    #[arg(
        long,
        default_value_t = 40_000.0,
        help = "Annual withdrawal, taken at the end of each year"
    )]
    withdraw: f64,
    #[arg(long, default_value_t = 30, help = "Number of years to simulate")]
    years: u32,
    #[arg(long, default_value_t = 5_000, help = "Number of trials to run")]
    trials: u32,
    #[arg(
        long,
        default_value_t = 6.0,
        help = "Expected annual return (drift) in percent"
    )]
    expected_return: f64,
    #[arg(
        long,
        default_value_t = 15.0,
        help = "Annual return volatility in percent"
    )]
    volatility: f64,
    #[arg(
        long,
        help = "Annual inflation in percent; when set the expected return is converted to a real return"
    )]
    inflation: Option<f64>,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, help = "Seed from OS entropy instead of --seed")]
    no_seed: bool,
    #[arg(long, help = "Print the yearly percentile trace")]
    trace: bool,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
    #[arg(
        long,
        help = "Also solve for the largest withdrawal meeting this success rate in percent"
    )]
    solve_target: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    starting_balance: Option<f64>,
    annual_contribution: Option<f64>,
    annual_withdrawal: Option<f64>,
    years: Option<u32>,
    trials: Option<u32>,
    expected_return: Option<f64>,
    volatility: Option<f64>,
    inflation: Option<f64>,
    seed: Option<u64>,
    no_seed: Option<bool>,
    solve_target: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    expected_return_used: f64,
    summary: SimulationSummary,
    yearly_trace: Vec<YearSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    withdrawal_solve: Option<WithdrawalSolveResult>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Parses `args` (program name first) and renders the report.
pub fn run_cli<I, T>(args: I) -> Result<String, CliError>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::try_parse_from(args)?;
    let json = cli.json;
    let trace = cli.trace;
    let report = build_report(&cli).map_err(CliError::Invalid)?;

    if json {
        return serde_json::to_string_pretty(&report)
            .map(|json| json + "\n")
            .map_err(|e| CliError::Invalid(format!("Failed to serialize report: {e}")));
    }

    let mut out = render_summary(&report.summary);
    if trace {
        out.push('\n');
        out.push_str(&render_trace(&report.yearly_trace));
    }
    if let Some(solve) = &report.withdrawal_solve {
        out.push('\n');
        out.push_str(&render_solve(solve));
    }
    Ok(out)
}

fn build_params(cli: &Cli) -> Result<SimulationParams, String> {
    if cli.years == 0 {
        return Err("--years must be > 0".to_string());
    }

    if cli.trials == 0 {
        return Err("--trials must be > 0".to_string());
    }

    if cli.years > MAX_YEARS {
        return Err(format!("--years must be <= {MAX_YEARS}"));
    }

    if cli.trials > MAX_TRIALS {
        return Err(format!("--trials must be <= {MAX_TRIALS}"));
    }

    if u64::from(cli.years) * u64::from(cli.trials) > MAX_SHOCKS {
        return Err(format!("--years x --trials must be <= {MAX_SHOCKS}"));
    }

    for (flag, value) in [
        ("--start", cli.start),
        ("--contrib", cli.contrib),
        ("--withdraw", cli.withdraw),
        ("--expected-return", cli.expected_return),
        ("--volatility", cli.volatility),
    ] {
        if !value.is_finite() {
            return Err(format!("{flag} must be a finite number"));
        }
    }

    if cli.volatility < 0.0 {
        return Err("--volatility must be >= 0".to_string());
    }

    if cli.expected_return <= -100.0 {
        return Err("--expected-return must be > -100".to_string());
    }

    let nominal = cli.expected_return / 100.0;
    let expected_return = match cli.inflation {
        Some(inflation) => {
            if !inflation.is_finite() || inflation <= -100.0 {
                return Err("--inflation must be a finite number > -100".to_string());
            }
            real_return(nominal, inflation / 100.0)
        }
        None => nominal,
    };

    Ok(SimulationParams {
        starting_balance: cli.start,
        annual_contribution: cli.contrib,
        annual_withdrawal: cli.withdraw,
        years: cli.years,
        expected_return,
        volatility: cli.volatility / 100.0,
        trials: cli.trials,
        random_seed: if cli.no_seed { None } else { Some(cli.seed) },
    })
}

fn build_solve_config(cli: &Cli) -> Result<Option<WithdrawalSolveConfig>, String> {
    let Some(target) = cli.solve_target else {
        return Ok(None);
    };
    if !(0.0..=100.0).contains(&target) {
        return Err("--solve-target must be between 0 and 100".to_string());
    }

    let search_max = (cli.start.max(0.0) + cli.contrib.max(0.0) * cli.years as f64).max(1.0);
    Ok(Some(WithdrawalSolveConfig {
        target_success_rate: target / 100.0,
        search_min: 0.0,
        search_max,
        tolerance: (search_max * 1e-4).max(1.0),
        max_iterations: 60,
        trials_per_iteration: cli.trials,
        final_trials: cli.trials,
    }))
}

fn build_report(cli: &Cli) -> Result<Report, String> {
    let params = build_params(cli)?;
    let solve_config = build_solve_config(cli)?;

    let (result, yearly_trace) = if cli.trace {
        simulate_with_trace(&params).map_err(|e| e.to_string())?
    } else {
        (simulate(&params).map_err(|e| e.to_string())?, Vec::new())
    };

    let withdrawal_solve = match solve_config {
        Some(config) => Some(solve_max_withdrawal(&params, config)?),
        None => None,
    };

    Ok(Report {
        expected_return_used: params.expected_return,
        summary: summarize(&result),
        yearly_trace,
        withdrawal_solve,
    })
}

fn render_summary(summary: &SimulationSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Trials: {}", summary.trials);
    let _ = writeln!(out, "Success rate: {:.2}%", summary.success_rate * 100.0);
    let _ = writeln!(
        out,
        "Median final value: {}",
        format_amount(summary.median_final_value)
    );
    let _ = writeln!(
        out,
        "10th percentile final value: {}",
        format_amount(summary.p10_final_value)
    );
    let _ = writeln!(
        out,
        "90th percentile final value: {}",
        format_amount(summary.p90_final_value)
    );
    let _ = writeln!(
        out,
        "Mean final value: {}",
        format_amount(summary.mean_final_value)
    );
    out
}

fn render_trace(trace: &[YearSnapshot]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>4}  {:>18}  {:>18}  {:>18}  {:>8}",
        "Year", "P10", "Median", "P90", "Solvent"
    );
    for row in trace {
        let _ = writeln!(
            out,
            "{:>4}  {:>18}  {:>18}  {:>18}  {:>7.2}%",
            row.year,
            format_amount(row.p10_balance),
            format_amount(row.median_balance),
            format_amount(row.p90_balance),
            row.solvent_fraction * 100.0
        );
    }
    out
}

fn render_solve(solve: &WithdrawalSolveResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", solve.message);
    if let (Some(withdrawal), Some(rate)) = (solve.solved_withdrawal, solve.achieved_success_rate)
    {
        let _ = writeln!(
            out,
            "Max withdrawal at {:.2}% target: {} (achieved {:.2}% +/- {:.2}%)",
            solve.target_success_rate * 100.0,
            format_amount(withdrawal),
            rate * 100.0,
            solve.achieved_success_ci_half_width.unwrap_or(0.0) * 100.0
        );
    }
    out
}

/// Two decimals with thousands separators, e.g. `1,234,567.89`.
fn format_amount(value: f64) -> String {
    let cents_total = (value.abs() * 100.0).round() as u64;
    let whole = cents_total / 100;
    let cents = cents_total % 100;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    if value < 0.0 && cents_total > 0 {
        format!("-{grouped}.{cents:02}")
    } else {
        format!("{grouped}.{cents:02}")
    }
}

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .fallback(not_found_handler)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "retirement simulator HTTP API listening");

    axum::serve(listener, router()).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    let cli = cli_from_payload(payload);
    let outcome = tokio::task::spawn_blocking(move || build_report(&cli)).await;

    match outcome {
        Ok(Ok(report)) => {
            info!(
                trials = report.summary.trials,
                success_rate = report.summary.success_rate,
                "simulate request served"
            );
            json_response(StatusCode::OK, report)
        }
        Ok(Err(msg)) => {
            warn!(error = %msg, "simulate request rejected");
            error_response(StatusCode::BAD_REQUEST, &msg)
        }
        Err(e) => {
            warn!(error = %e, "simulation task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Simulation failed")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

/// The API always returns the yearly trace; percentages use the CLI's units.
fn cli_from_payload(payload: SimulatePayload) -> Cli {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.starting_balance {
        cli.start = v;
    }
    if let Some(v) = payload.annual_contribution {
        cli.contrib = v;
    }
    if let Some(v) = payload.annual_withdrawal {
        cli.withdraw = v;
    }
    if let Some(v) = payload.years {
        cli.years = v;
    }
    if let Some(v) = payload.trials {
        cli.trials = v;
    }
    if let Some(v) = payload.expected_return {
        cli.expected_return = v;
    }
    if let Some(v) = payload.volatility {
        cli.volatility = v;
    }
    if payload.inflation.is_some() {
        cli.inflation = payload.inflation;
    }
    if let Some(v) = payload.seed {
        cli.seed = v;
    }
    if let Some(v) = payload.no_seed {
        cli.no_seed = v;
    }
    if payload.solve_target.is_some() {
        cli.solve_target = payload.solve_target;
    }

    cli
}

fn default_cli_for_api() -> Cli {
    Cli {
        start: 500_000.0,
        contrib: 10_000.0,
        withdraw: 40_000.0,
        years: 30,
        trials: 5_000,
        expected_return: 6.0,
        volatility: 15.0,
        inflation: None,
        seed: 42,
        no_seed: false,
        trace: true,
        json: true,
        solve_target: None,
    }
}
