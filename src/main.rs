//! Sleeve Rebalancer - Main Entry Point
//!
//! One invocation runs one rebalancing cycle (scheduling lives outside,
//! e.g. in cron). `--paper` trades against the in-memory gateway instead
//! of the brokerage.

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use sleeve_rebalancer::config::Config;
use sleeve_rebalancer::engine::Engine;
use sleeve_rebalancer::error::CycleError;
use sleeve_rebalancer::market::{AlpacaDataClient, PriceFeed};
use sleeve_rebalancer::trader::{AccountGateway, AlpacaTradingClient, PaperGateway};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Sleeve Rebalancer CLI
#[derive(Parser)]
#[command(name = "sleeve-rebalancer")]
#[command(version, about = "Mixture-model portfolio rebalancing over Alpaca")]
struct Cli {
    /// Path to a configuration file (default: ./config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one rebalancing cycle (the default)
    Rebalance {
        /// Trade against the in-memory paper gateway
        #[arg(long)]
        paper: bool,
    },

    /// Fit the model, simulate and print value-at-risk without trading
    Var,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = match cli.config.as_deref() {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.validate()?;

    match cli.command.unwrap_or(Commands::Rebalance { paper: false }) {
        Commands::Rebalance { paper } => run_rebalance(config, paper).await,
        Commands::Var => run_var(config).await,
    }
}

async fn run_rebalance(config: Config, paper_flag: bool) -> Result<()> {
    let paper = paper_flag || config.trading.paper;
    let feed = AlpacaDataClient::new(&config.data, &config.alpaca);

    let gateway: Box<dyn AccountGateway> = if paper {
        info!("Paper mode: trading against the in-memory gateway");
        Box::new(seeded_paper_gateway(&feed, &config).await?)
    } else {
        Box::new(AlpacaTradingClient::new(
            &config.trading.base_url,
            &config.alpaca.key_id,
            &config.alpaca.secret_key,
        ))
    };

    let engine = Engine::new(config, Box::new(feed), gateway)?;
    match engine.run_cycle().await {
        Ok(Some(outcome)) => {
            info!(
                var = format!("{:.2}", outcome.var),
                orders = outcome.orders_submitted,
                skipped = outcome.skipped.len(),
                projected_cash = %outcome.projected_cash,
                "Cycle complete"
            );
            Ok(())
        }
        Ok(None) => {
            warn!("Cycle skipped: another cycle is already running");
            Ok(())
        }
        Err(CycleError::InsufficientCash { shortfall }) => {
            error!(%shortfall, "Cash still short after emergency deleveraging");
            Err(CycleError::InsufficientCash { shortfall }.into())
        }
        Err(error) => Err(error.into()),
    }
}

async fn run_var(config: Config) -> Result<()> {
    let feed = AlpacaDataClient::new(&config.data, &config.alpaca);
    let confidence = config.risk.var_confidence;
    let engine = Engine::new(
        config,
        Box::new(feed),
        Box::new(PaperGateway::new(dec!(0))),
    )?;

    let var = engine.risk_report().await?;
    println!("VaR({:.0}%): {var:.2}", confidence * 100.0);
    Ok(())
}

/// Paper fills need a reference price per symbol; seed them from the most
/// recent closes.
async fn seeded_paper_gateway(feed: &AlpacaDataClient, config: &Config) -> Result<PaperGateway> {
    let end = chrono::Utc::now().date_naive();
    let start = end - chrono::Duration::days(7);
    let history = feed.daily_closes(&config.universe(), start, end).await?;

    let gateway = PaperGateway::new(dec!(100_000));
    for (symbol, price) in history.last_prices() {
        gateway.set_price(&symbol, price).await;
    }
    Ok(gateway)
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();
}
