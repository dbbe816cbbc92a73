//! Quantile-based Value-at-Risk from simulated profit-and-loss.

use crate::model::SimulatedPaths;

/// Computes empirical VaR at a configured confidence level.
///
/// Purely informational per cycle: the figure is reported, never fed back
/// into the optimization.
#[derive(Debug, Clone, Copy)]
pub struct VarCalculator {
    confidence: f64,
}

impl VarCalculator {
    /// `confidence` must be strictly between 0 and 1 (validated at config
    /// load).
    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }

    /// Loss at the `(1 - confidence)` empirical quantile of the P&L sample,
    /// negated so a positive result denotes a loss magnitude.
    ///
    /// The quantile uses linear interpolation between order statistics. With
    /// fewer than roughly `1 / (1 - confidence)` samples the estimate is
    /// bounded by the sample extremes rather than failing; precision is
    /// sample-size-bounded by construction. An empty sample yields 0.
    pub fn value_at_risk(&self, pnl: &[f64]) -> f64 {
        if pnl.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<f64> = pnl.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let rank = (1.0 - self.confidence) * (sorted.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        let quantile = if lo == hi {
            sorted[lo]
        } else {
            let frac = rank - lo as f64;
            sorted[lo] * (1.0 - frac) + sorted[hi] * frac
        };

        -quantile
    }
}

/// Per-path portfolio P&L: the sum across assets of each asset's relative
/// terminal move against its last observed price.
pub fn portfolio_pnl(terminal_prices: &SimulatedPaths, last_prices: &[f64]) -> Vec<f64> {
    debug_assert_eq!(last_prices.len(), terminal_prices.n_assets);
    (0..terminal_prices.n_paths)
        .map(|path| {
            (0..terminal_prices.n_assets)
                .map(|asset| {
                    (terminal_prices.terminal(path, asset) - last_prices[asset])
                        / last_prices[asset]
                })
                .sum()
        })
        .collect()
}
