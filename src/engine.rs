//! Cycle orchestration: one sequential unit of work from price history to
//! submitted orders.

use crate::config::{Config, SleeveConfig};
use crate::error::{CycleError, CycleResult};
use crate::market::{PriceFeed, ReturnSeries};
use crate::model::{GaussianMixture, MonteCarloSimulator};
use crate::portfolio::{Allocator, TargetWeights};
use crate::risk::{portfolio_pnl, VarCalculator};
use crate::trader::{AccountGateway, Reconciler, SkippedSymbol, TradeLog};
use chrono::{Duration, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// What one completed cycle decided and did.
#[derive(Debug)]
pub struct CycleOutcome {
    /// Value-at-risk of the current-universe equal-exposure P&L, informational
    pub var: f64,
    pub weights: TargetWeights,
    pub orders_submitted: usize,
    pub skipped: Vec<SkippedSymbol>,
    pub projected_cash: Decimal,
}

/// Everything the model and allocator need from one data fetch.
struct MarketView {
    series: ReturnSeries,
    /// Latest close per symbol, including symbols dropped from the series
    latest_prices: HashMap<String, Decimal>,
    /// Latest closes aligned to `series.symbols`
    aligned_prices: Vec<f64>,
}

/// Drives one rebalancing cycle end to end. Collaborators are injected so
/// paper and live runs share the same path.
pub struct Engine {
    config: Config,
    feed: Box<dyn PriceFeed>,
    gateway: Box<dyn AccountGateway>,
    trade_log: tokio::sync::Mutex<TradeLog>,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl Engine {
    pub fn new(
        config: Config,
        feed: Box<dyn PriceFeed>,
        gateway: Box<dyn AccountGateway>,
    ) -> anyhow::Result<Self> {
        let trade_log = TradeLog::open(&config.trading.trade_log_path)?;
        Ok(Self {
            config,
            feed,
            gateway,
            trade_log: tokio::sync::Mutex::new(trade_log),
            cycle_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Run one full cycle. Returns `None` when a cycle is already in
    /// flight: cycles are strictly sequential, never concurrent.
    pub async fn run_cycle(&self) -> CycleResult<Option<CycleOutcome>> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            warn!("Cycle already running, skipping this trigger");
            return Ok(None);
        };

        let view = self.fetch_market_view().await?;
        let var = self.estimate_var(&view)?;
        info!(
            var = format!("{var:.2}"),
            confidence = self.config.risk.var_confidence,
            "Simulated portfolio value-at-risk"
        );

        let weights = self.allocate(&view)?;
        for (symbol, weight) in weights.iter() {
            info!(%symbol, weight = format!("{weight:.4}"), "Target weight");
        }

        let account = self.gateway.account().await?;
        let holdings: HashMap<String, Decimal> = self
            .gateway
            .positions()
            .await?
            .into_iter()
            .map(|p| (p.symbol, p.qty))
            .collect();
        info!(cash = %account.cash, nav = %account.nav, "Account snapshot");

        let plan = Reconciler::default().plan(
            &weights,
            &view.latest_prices,
            &holdings,
            account.cash,
            account.nav,
        );

        let mut orders_submitted = 0;
        for order in &plan.orders {
            // Log first: an order that reached the gateway is always on disk.
            self.trade_log
                .lock()
                .await
                .append(order, account.nav)
                .map_err(CycleError::Gateway)?;
            self.gateway.submit_order(&order.as_request()).await?;
            info!(
                symbol = %order.symbol,
                side = %order.side,
                qty = order.qty,
                price = %order.price,
                cash_after = %order.cash_after,
                "Order submitted"
            );
            orders_submitted += 1;
        }

        if let Some(shortfall) = plan.residual_shortfall {
            return Err(CycleError::InsufficientCash { shortfall });
        }

        Ok(Some(CycleOutcome {
            var,
            weights,
            orders_submitted,
            skipped: plan.skipped,
            projected_cash: plan.projected_cash,
        }))
    }

    /// Fit, simulate and report value-at-risk without touching the account.
    pub async fn risk_report(&self) -> CycleResult<f64> {
        let view = self.fetch_market_view().await?;
        self.estimate_var(&view)
    }

    async fn fetch_market_view(&self) -> CycleResult<MarketView> {
        let end = Utc::now().date_naive();
        let start = end - Duration::days(self.config.data.lookback_days);
        let universe = self.config.universe();
        info!(
            symbols = universe.len(),
            %start,
            %end,
            "Fetching daily close history"
        );

        let history = self.feed.daily_closes(&universe, start, end).await?;
        let (series, gaps) = history.log_returns(self.config.data.min_return_rows);
        for gap in &gaps {
            warn!("{gap}");
        }
        let Some(series) = series else {
            return Err(gaps.into_iter().next().unwrap_or_else(|| {
                CycleError::ModelFit("no symbol has usable price history".into())
            }));
        };

        let latest_prices: HashMap<String, Decimal> = history.last_prices().into_iter().collect();
        let aligned_prices = series
            .symbols
            .iter()
            .map(|symbol| {
                latest_prices
                    .get(symbol)
                    .and_then(|p| p.to_f64())
                    .ok_or_else(|| CycleError::UnknownPrice(symbol.clone()))
            })
            .collect::<CycleResult<Vec<f64>>>()?;

        Ok(MarketView {
            series,
            latest_prices,
            aligned_prices,
        })
    }

    fn estimate_var(&self, view: &MarketView) -> CycleResult<f64> {
        let mut rng = StdRng::seed_from_u64(self.config.model.seed);
        let model = GaussianMixture::fit(&view.series, self.config.model.n_components, &mut rng)?;
        if let Some(path) = &self.config.model.checkpoint_path {
            // Non-fatal: the checkpoint is for inspection, not the decision.
            if let Err(error) = model.save(path) {
                warn!(%error, path = %path.display(), "Failed to write model checkpoint");
            }
        }

        let prices = MonteCarloSimulator::new(&model).simulate_prices(
            &view.aligned_prices,
            self.config.model.n_paths,
            self.config.model.horizon,
            &mut rng,
        )?;
        let pnl = portfolio_pnl(&prices, &view.aligned_prices);
        Ok(VarCalculator::new(self.config.risk.var_confidence).value_at_risk(&pnl))
    }

    fn allocate(&self, view: &MarketView) -> CycleResult<TargetWeights> {
        // Expected returns and covariance come from the historical series
        // directly; the mixture only feeds the simulation.
        let surviving: HashSet<&str> = view.series.symbols.iter().map(String::as_str).collect();
        let sleeves: Vec<SleeveConfig> = self
            .config
            .sleeves
            .iter()
            .map(|sleeve| SleeveConfig {
                name: sleeve.name.clone(),
                target: sleeve.target,
                symbols: sleeve
                    .symbols
                    .iter()
                    .filter(|symbol| surviving.contains(symbol.as_str()))
                    .cloned()
                    .collect(),
            })
            .collect();

        let allocator = Allocator::new(&sleeves, self.config.max_weight_per_name());
        allocator.optimise(&view.series.mean(), &view.series.covariance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, SleeveConfig, TradingConfig};
    use crate::market::PriceHistory;
    use crate::trader::PaperGateway;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rand::Rng;
    use rand_distr::{Distribution, Normal};
    use rust_decimal_macros::dec;

    /// Serves a fixed pre-generated history regardless of the requested range.
    struct StubFeed {
        history: PriceHistory,
    }

    #[async_trait]
    impl PriceFeed for StubFeed {
        async fn daily_closes(
            &self,
            _symbols: &[String],
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<PriceHistory> {
            Ok(self.history.clone())
        }
    }

    /// 251 daily closes for X and Y: two mild random-walk regimes so the
    /// mixture has something to find. Returns the history and last closes.
    fn synthetic_history() -> (PriceHistory, f64, f64) {
        let mut rng = StdRng::seed_from_u64(7);
        let calm = Normal::new(0.0003, 0.008).unwrap();
        let wild = Normal::new(-0.001, 0.025).unwrap();

        let mut x = 100.0_f64;
        let mut y = 50.0_f64;
        let mut closes = Vec::with_capacity(251 * 2);
        let mut dates = Vec::with_capacity(251);
        let start = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        for day in 0..251 {
            dates.push(start + Duration::days(day));
            closes.push(Some(x));
            closes.push(Some(y));
            let (rx, ry): (f64, f64) = if rng.gen_bool(0.8) {
                (calm.sample(&mut rng), calm.sample(&mut rng))
            } else {
                (wild.sample(&mut rng), wild.sample(&mut rng))
            };
            x *= rx.exp();
            y *= (0.6 * rx + 0.4 * ry).exp();
        }
        // The stored closes stop one step before the final multiplication.
        let last_x = closes[closes.len() - 2].unwrap();
        let last_y = closes[closes.len() - 1].unwrap();

        let history = PriceHistory::new(
            dates,
            vec!["X".to_string(), "Y".to_string()],
            closes,
        );
        (history, last_x, last_y)
    }

    fn engine_config(dir: &std::path::Path) -> Config {
        Config {
            sleeves: vec![
                SleeveConfig {
                    name: "GROWTH".to_string(),
                    target: 0.6,
                    symbols: vec!["X".to_string()],
                },
                SleeveConfig {
                    name: "BALLAST".to_string(),
                    target: 0.4,
                    symbols: vec!["Y".to_string()],
                },
            ],
            model: ModelConfig {
                n_components: 2,
                n_paths: 2000,
                horizon: 1,
                seed: 42,
                checkpoint_path: None,
            },
            trading: TradingConfig {
                trade_log_path: dir.join("trades.csv"),
                paper: true,
                ..TradingConfig::default()
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_full_cycle_allocates_and_trades_within_cash() {
        let dir = tempfile::tempdir().unwrap();
        let (history, last_x, last_y) = synthetic_history();

        let gateway = PaperGateway::new(dec!(100_000));
        gateway
            .set_price("X", Decimal::from_f64_retain(last_x).unwrap())
            .await;
        gateway
            .set_price("Y", Decimal::from_f64_retain(last_y).unwrap())
            .await;

        let engine = Engine::new(
            engine_config(dir.path()),
            Box::new(StubFeed { history }),
            Box::new(gateway),
        )
        .unwrap();

        let outcome = engine.run_cycle().await.unwrap().expect("cycle should run");

        // Singleton sleeves pin the weights to the sleeve targets.
        assert_eq!(outcome.weights.len(), 2);
        let weight_sum: f64 = outcome.weights.iter().map(|(_, w)| w).sum();
        assert!((weight_sum - 1.0).abs() < 1e-6);
        assert!((outcome.weights.weight("X").unwrap() - 0.6).abs() < 1e-6);
        assert!((outcome.weights.weight("Y").unwrap() - 0.4).abs() < 1e-6);

        // Both symbols start unheld, so both get one buy each.
        assert_eq!(outcome.orders_submitted, 2);
        assert!(outcome.projected_cash >= Decimal::ZERO);
        assert!(outcome.var.is_finite());

        let log = std::fs::read_to_string(dir.path().join("trades.csv")).unwrap();
        assert_eq!(log.lines().count(), 1 + outcome.orders_submitted);
    }

    #[tokio::test]
    async fn test_risk_report_does_not_trade() {
        let dir = tempfile::tempdir().unwrap();
        let (history, _, _) = synthetic_history();
        let gateway = PaperGateway::new(dec!(100_000));

        let engine = Engine::new(
            engine_config(dir.path()),
            Box::new(StubFeed { history }),
            Box::new(gateway),
        )
        .unwrap();

        let var = engine.risk_report().await.unwrap();
        assert!(var.is_finite());

        let log = std::fs::read_to_string(dir.path().join("trades.csv")).unwrap();
        assert_eq!(log.lines().count(), 1); // header only
    }
}
