use std::env;

use anyhow::{Context, Result, bail};
use retirement_sim::api::CliError;
use tracing::info;

const DEFAULT_PORT: u16 = 8080;
const PORT_ENV: &str = "RETIREMENT_SIM_PORT";

#[tokio::main]
async fn main() -> Result<()> {
    retirement_sim::logging::init_logging("info");

    let raw_args: Vec<String> = env::args().collect();
    match raw_args.get(1).map(|s| s.as_str()) {
        Some("serve") => {
            let port = match raw_args.get(2) {
                Some(arg) => arg
                    .parse::<u16>()
                    .with_context(|| format!("invalid port {arg:?}"))?,
                None => env::var(PORT_ENV)
                    .ok()
                    .and_then(|s| s.parse::<u16>().ok())
                    .unwrap_or(DEFAULT_PORT),
            };
            info!(port, "starting server");
            retirement_sim::api::run_http_server(port)
                .await
                .context("server error")?;
        }
        Some("simulate") => {
            match retirement_sim::api::run_cli(raw_args.iter().skip(1)) {
                Ok(report) => print!("{report}"),
                Err(CliError::Args(e)) => e.exit(),
                Err(CliError::Invalid(msg)) => bail!(msg),
            }
        }
        _ => {
            eprintln!("Usage: retirement-sim simulate [OPTIONS]");
            eprintln!("       retirement-sim serve [port]");
            bail!("missing or unknown subcommand");
        }
    }

    Ok(())
}
