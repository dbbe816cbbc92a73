//! # Sleeve Rebalancer
//!
//! Daily portfolio rebalancing for a sleeve-structured equity/ETF book:
//! fit a Gaussian mixture to historical log returns, simulate price paths,
//! report value-at-risk, solve for constrained target weights and reconcile
//! them into cash-feasible whole-share orders.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `market`: Alpaca market-data client and price/return containers
//! - `model`: Gaussian mixture return model and Monte Carlo simulation
//! - `risk`: Value-at-risk from simulated P&L
//! - `portfolio`: Sleeve-constrained mean-variance allocator
//! - `trader`: Brokerage gateway, order reconciliation and the trade log
//! - `engine`: Cycle orchestration tying the pipeline together

pub mod config;
pub mod engine;
pub mod error;
pub mod market;
pub mod model;
pub mod portfolio;
pub mod risk;
pub mod trader;

pub use config::Config;
pub use error::{CycleError, CycleResult};
