//! Monte Carlo price-path simulation from a fitted return model.

use crate::error::CycleResult;
use crate::model::GaussianMixture;
use rand::Rng;

/// Sampled trajectories, always three-dimensional:
/// (paths x horizon steps x assets), horizon = 1 included.
#[derive(Debug, Clone)]
pub struct SimulatedPaths {
    pub n_paths: usize,
    pub horizon: usize,
    pub n_assets: usize,
    values: Vec<f64>,
}

impl SimulatedPaths {
    pub fn new(n_paths: usize, horizon: usize, n_assets: usize, values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), n_paths * horizon * n_assets);
        Self {
            n_paths,
            horizon,
            n_assets,
            values,
        }
    }

    pub fn at(&self, path: usize, step: usize, asset: usize) -> f64 {
        self.values[(path * self.horizon + step) * self.n_assets + asset]
    }

    fn set(&mut self, path: usize, step: usize, asset: usize, value: f64) {
        self.values[(path * self.horizon + step) * self.n_assets + asset] = value;
    }

    /// Value at the last horizon slice.
    pub fn terminal(&self, path: usize, asset: usize) -> f64 {
        self.at(path, self.horizon - 1, asset)
    }
}

/// Converts sampled return paths into simulated price paths.
pub struct MonteCarloSimulator<'a> {
    model: &'a GaussianMixture,
}

impl<'a> MonteCarloSimulator<'a> {
    pub fn new(model: &'a GaussianMixture) -> Self {
        Self { model }
    }

    /// Simulate price trajectories: cumulative log-return sums along the
    /// horizon axis, then `price = last_price * exp(cumulative_return)`.
    /// Pure given the rng.
    pub fn simulate_prices<R: Rng>(
        &self,
        last_prices: &[f64],
        n_paths: usize,
        horizon: usize,
        rng: &mut R,
    ) -> CycleResult<SimulatedPaths> {
        let returns = self.model.sample(rng, n_paths, horizon)?;
        Ok(Self::compound_prices(&returns, last_prices))
    }

    /// Apply `price = last_price * exp(cumulative_return)` along the horizon
    /// axis of sampled return paths.
    pub fn compound_prices(returns: &SimulatedPaths, last_prices: &[f64]) -> SimulatedPaths {
        debug_assert_eq!(last_prices.len(), returns.n_assets);
        let mut prices = returns.clone();
        for path in 0..returns.n_paths {
            for asset in 0..returns.n_assets {
                let mut cumulative = 0.0;
                for step in 0..returns.horizon {
                    cumulative += returns.at(path, step, asset);
                    prices.set(path, step, asset, last_prices[asset] * cumulative.exp());
                }
            }
        }
        prices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::ReturnSeries;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fitted_model() -> GaussianMixture {
        let mut rows = Vec::new();
        for i in 0..120 {
            let j = (i % 5) as f64 * 1e-4;
            rows.push(vec![0.001 + j, -0.001 - j]);
        }
        let series = ReturnSeries::from_rows(vec!["A".to_string(), "B".to_string()], rows);
        let mut rng = StdRng::seed_from_u64(11);
        GaussianMixture::fit(&series, 2, &mut rng).unwrap()
    }

    #[test]
    fn test_output_is_three_dimensional_at_horizon_one() {
        let model = fitted_model();
        let sim = MonteCarloSimulator::new(&model);
        let mut rng = StdRng::seed_from_u64(5);
        let paths = sim.simulate_prices(&[100.0, 50.0], 10, 1, &mut rng).unwrap();

        assert_eq!(paths.n_paths, 10);
        assert_eq!(paths.horizon, 1);
        assert_eq!(paths.n_assets, 2);
        assert_eq!(paths.terminal(0, 0), paths.at(0, 0, 0));
    }

    #[test]
    fn test_terminal_is_last_horizon_slice() {
        let model = fitted_model();
        let sim = MonteCarloSimulator::new(&model);
        let mut rng = StdRng::seed_from_u64(6);
        let paths = sim.simulate_prices(&[100.0, 50.0], 4, 3, &mut rng).unwrap();

        for p in 0..4 {
            for a in 0..2 {
                assert_eq!(paths.terminal(p, a), paths.at(p, 2, a));
            }
        }
    }

    #[test]
    fn test_prices_compound_along_horizon() {
        // With positive per-step returns for asset A, the price path must be
        // increasing; prices are always positive either way.
        let model = fitted_model();
        let sim = MonteCarloSimulator::new(&model);
        let mut rng = StdRng::seed_from_u64(8);
        let paths = sim.simulate_prices(&[100.0, 50.0], 5, 4, &mut rng).unwrap();

        for p in 0..5 {
            for s in 0..4 {
                for a in 0..2 {
                    assert!(paths.at(p, s, a) > 0.0);
                }
            }
        }
    }

    #[test]
    fn test_degenerate_zero_returns_keep_last_price() {
        // Horizon 1 with zero return samples must reproduce last_price exactly.
        let zero_returns = SimulatedPaths::new(3, 1, 2, vec![0.0; 6]);
        let prices = MonteCarloSimulator::compound_prices(&zero_returns, &[101.5, 42.0]);
        for path in 0..3 {
            assert_eq!(prices.terminal(path, 0), 101.5);
            assert_eq!(prices.terminal(path, 1), 42.0);
        }
    }
}
