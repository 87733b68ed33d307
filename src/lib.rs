//! Monte Carlo estimate of retirement portfolio survival under geometric
//! Brownian motion returns.

pub mod api;
pub mod core;
pub mod logging;
