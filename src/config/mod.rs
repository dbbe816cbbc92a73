//! Configuration management for the rebalancer.
//!
//! Loads settings from a TOML file and environment variables. Sleeves are a
//! list, not a map: their declared order (and the declared order of symbols
//! within each sleeve) is the order the execution reconciler consumes cash
//! in, so it is part of observable behavior.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Market data settings
    #[serde(default)]
    pub data: DataConfig,
    /// Return model settings
    #[serde(default)]
    pub model: ModelConfig,
    /// Risk reporting settings
    #[serde(default)]
    pub risk: RiskConfig,
    /// Order execution settings
    #[serde(default)]
    pub trading: TradingConfig,
    /// Alpaca API credentials
    #[serde(default)]
    pub alpaca: AlpacaConfig,
    /// Tracked symbols grouped into sleeves, in execution order
    #[serde(default)]
    pub sleeves: Vec<SleeveConfig>,
}

/// A named category of assets with its own target portfolio weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleeveConfig {
    /// Sleeve name (e.g., "EQUITY")
    pub name: String,
    /// Target fraction of the portfolio for this sleeve (0.0-1.0)
    pub target: f64,
    /// Member symbols, in execution order
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Calendar days of price history to request
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    /// Minimum usable return rows per symbol before it is dropped for the cycle
    #[serde(default = "default_min_return_rows")]
    pub min_return_rows: usize,
    /// Market data API base URL
    #[serde(default = "default_data_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of mixture components
    #[serde(default = "default_n_components")]
    pub n_components: usize,
    /// Monte Carlo paths per cycle
    #[serde(default = "default_n_paths")]
    pub n_paths: usize,
    /// Simulation horizon in trading days
    #[serde(default = "default_horizon")]
    pub horizon: usize,
    /// RNG seed for fitting and sampling
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Optional path for checkpointing the fitted model between cycles
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// VaR confidence level, strictly between 0 and 1
    #[serde(default = "default_var_confidence")]
    pub var_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Append-only trade log path
    #[serde(default = "default_trade_log_path")]
    pub trade_log_path: PathBuf,
    /// Trade against the in-memory paper gateway instead of the brokerage
    #[serde(default)]
    pub paper: bool,
    /// Brokerage API base URL
    #[serde(default = "default_trading_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlpacaConfig {
    /// API key id
    #[serde(default)]
    pub key_id: String,
    /// API secret key
    #[serde(default)]
    pub secret_key: String,
}

// Default value functions

fn default_lookback_days() -> i64 {
    365
}

fn default_min_return_rows() -> usize {
    60
}

fn default_data_base_url() -> String {
    "https://data.alpaca.markets".to_string()
}

fn default_n_components() -> usize {
    4
}

fn default_n_paths() -> usize {
    5000
}

fn default_horizon() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

fn default_var_confidence() -> f64 {
    0.95
}

fn default_trade_log_path() -> PathBuf {
    PathBuf::from("data/trade_log.csv")
}

fn default_trading_base_url() -> String {
    "https://paper-api.alpaca.markets".to_string()
}

impl Config {
    /// Load configuration from `config.toml` (if present) and environment
    /// variables prefixed with `SLEEVE` (e.g. `SLEEVE__ALPACA__KEY_ID`).
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("SLEEVE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Load from an explicit file path, still layering environment variables.
    pub fn load_from(path: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::default().separator("__").prefix("SLEEVE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.sleeves.is_empty(), "at least one sleeve must be configured");

        let target_sum: f64 = self.sleeves.iter().map(|s| s.target).sum();
        anyhow::ensure!(
            (target_sum - 1.0).abs() < 1e-9,
            "sleeve targets must sum to 1, got {target_sum}"
        );

        let mut seen = HashSet::new();
        for sleeve in &self.sleeves {
            anyhow::ensure!(
                sleeve.target >= 0.0 && sleeve.target <= 1.0,
                "sleeve {} target must be between 0 and 1",
                sleeve.name
            );
            anyhow::ensure!(
                !sleeve.symbols.is_empty(),
                "sleeve {} has no symbols",
                sleeve.name
            );
            for symbol in &sleeve.symbols {
                anyhow::ensure!(
                    seen.insert(symbol.clone()),
                    "symbol {symbol} appears in more than one sleeve"
                );
            }
        }

        anyhow::ensure!(
            self.risk.var_confidence > 0.0 && self.risk.var_confidence < 1.0,
            "var_confidence must be strictly between 0 and 1"
        );

        anyhow::ensure!(self.model.n_components >= 1, "n_components must be >= 1");
        anyhow::ensure!(self.model.n_paths >= 1, "n_paths must be >= 1");
        anyhow::ensure!(self.model.horizon >= 1, "horizon must be >= 1");
        anyhow::ensure!(self.data.lookback_days >= 1, "lookback_days must be >= 1");

        Ok(())
    }

    /// Maximum weight for any single ticker, derived as the largest
    /// per-member share across sleeves: max of `target / symbol_count`.
    pub fn max_weight_per_name(&self) -> f64 {
        self.sleeves
            .iter()
            .map(|s| s.target / s.symbols.len() as f64)
            .fold(0.0, f64::max)
    }

    /// All tracked symbols in sleeve-then-declaration order.
    pub fn universe(&self) -> Vec<String> {
        self.sleeves
            .iter()
            .flat_map(|s| s.symbols.iter().cloned())
            .collect()
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            min_return_rows: default_min_return_rows(),
            base_url: default_data_base_url(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_components: default_n_components(),
            n_paths: default_n_paths(),
            horizon: default_horizon(),
            seed: default_seed(),
            checkpoint_path: None,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            var_confidence: default_var_confidence(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            trade_log_path: default_trade_log_path(),
            paper: false,
            base_url: default_trading_base_url(),
        }
    }
}

impl Default for AlpacaConfig {
    fn default() -> Self {
        Self {
            key_id: String::new(),
            secret_key: String::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            model: ModelConfig::default(),
            risk: RiskConfig::default(),
            trading: TradingConfig::default(),
            alpaca: AlpacaConfig::default(),
            sleeves: Vec::new(),
        }
    }
}
