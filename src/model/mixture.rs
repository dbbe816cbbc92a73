//! Multi-modal return model: a K-component Gaussian mixture fit on the
//! joint vector of per-date asset log returns.
//!
//! Sampling is joint: each draw selects a component from the mixture
//! weights and then draws a full multivariate-normal vector from that
//! component's covariance, so cross-asset correlation is preserved in the
//! simulated paths.

use crate::error::{CycleError, CycleResult};
use crate::market::ReturnSeries;
use crate::model::SimulatedPaths;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::seq::index::sample as sample_indices;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

const COV_RIDGE: f64 = 1e-9;
const MAX_ITER: usize = 200;
const LL_TOL: f64 = 1e-6;

/// Immutable fitted mixture model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaussianMixture {
    weights: Vec<f64>,
    means: Vec<DVector<f64>>,
    covariances: Vec<DMatrix<f64>>,
}

impl GaussianMixture {
    /// Fit a `n_components`-component mixture on the return series with a
    /// seeded, deterministic EM run.
    pub fn fit<R: Rng>(
        returns: &ReturnSeries,
        n_components: usize,
        rng: &mut R,
    ) -> CycleResult<Self> {
        let n_rows = returns.rows;
        let n_assets = returns.n_assets();

        if n_components == 0 {
            return Err(CycleError::ModelFit("n_components must be >= 1".into()));
        }
        if n_rows < n_components {
            return Err(CycleError::ModelFit(format!(
                "{n_rows} return rows cannot support {n_components} components"
            )));
        }

        let data = returns.as_matrix();
        if data.iter().any(|v| !v.is_finite()) {
            return Err(CycleError::ModelFit("non-finite return values".into()));
        }

        // Constant returns leave nothing to fit and a singular covariance.
        let base_cov = returns.covariance();
        if base_cov.diagonal().iter().all(|&v| v < 1e-16) {
            return Err(CycleError::ModelFit("degenerate (constant) returns".into()));
        }

        // Seeded init: means from distinct observations, shared sample
        // covariance, uniform weights.
        let picks = sample_indices(rng, n_rows, n_components);
        let mut weights = vec![1.0 / n_components as f64; n_components];
        let mut means: Vec<DVector<f64>> = picks
            .iter()
            .map(|row| data.row(row).transpose())
            .collect();
        let mut covariances: Vec<DMatrix<f64>> = (0..n_components)
            .map(|_| ridge(&base_cov, COV_RIDGE))
            .collect();

        let mut responsibilities = DMatrix::zeros(n_rows, n_components);
        let mut prev_ll = f64::NEG_INFINITY;
        let mut converged = false;

        for iter in 0..MAX_ITER {
            // E-step: log responsibilities via log-sum-exp.
            let factors = factorize(&covariances)?;
            let mut ll = 0.0;
            for row in 0..n_rows {
                let x = data.row(row).transpose();
                let mut log_probs = vec![0.0; n_components];
                for k in 0..n_components {
                    log_probs[k] = weights[k].max(f64::MIN_POSITIVE).ln()
                        + factors[k].log_density(&x, &means[k]);
                }
                let max = log_probs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let sum: f64 = log_probs.iter().map(|lp| (lp - max).exp()).sum();
                for k in 0..n_components {
                    responsibilities[(row, k)] = (log_probs[k] - max).exp() / sum;
                }
                ll += max + sum.ln();
            }
            let mean_ll = ll / n_rows as f64;
            if !mean_ll.is_finite() {
                return Err(CycleError::ModelFit("log-likelihood diverged".into()));
            }

            // M-step.
            for k in 0..n_components {
                let resp_k = responsibilities.column(k);
                let nk: f64 = resp_k.sum();
                if nk < 1e-12 {
                    return Err(CycleError::ModelFit(format!(
                        "component {k} collapsed to zero responsibility"
                    )));
                }
                weights[k] = nk / n_rows as f64;

                let mut mean = DVector::zeros(n_assets);
                for row in 0..n_rows {
                    mean += data.row(row).transpose() * resp_k[row];
                }
                mean /= nk;

                let mut cov = DMatrix::zeros(n_assets, n_assets);
                for row in 0..n_rows {
                    let d = data.row(row).transpose() - &mean;
                    cov += (&d * d.transpose()) * resp_k[row];
                }
                cov /= nk;

                means[k] = mean;
                covariances[k] = ridge(&cov, COV_RIDGE);
            }

            if (mean_ll - prev_ll).abs() < LL_TOL {
                debug!(iterations = iter + 1, mean_ll, "EM converged");
                converged = true;
                break;
            }
            prev_ll = mean_ll;
        }

        if !converged {
            warn!(max_iter = MAX_ITER, "EM hit the iteration cap without converging");
        }

        Ok(Self {
            weights,
            means,
            covariances,
        })
    }

    pub fn n_components(&self) -> usize {
        self.weights.len()
    }

    pub fn n_assets(&self) -> usize {
        self.means.first().map_or(0, |m| m.len())
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn means(&self) -> &[DVector<f64>] {
        &self.means
    }

    pub fn covariances(&self) -> &[DMatrix<f64>] {
        &self.covariances
    }

    /// Draw `n_paths` independent return trajectories of length `horizon`.
    ///
    /// For every path and every horizon step a component index is drawn from
    /// the mixture weights, then a joint multivariate-normal vector across
    /// assets is drawn from that component.
    pub fn sample<R: Rng>(
        &self,
        rng: &mut R,
        n_paths: usize,
        horizon: usize,
    ) -> CycleResult<SimulatedPaths> {
        let factors = factorize(&self.covariances)?;
        let n_assets = self.n_assets();
        let mut values = Vec::with_capacity(n_paths * horizon * n_assets);

        for _ in 0..n_paths {
            for _ in 0..horizon {
                let k = self.pick_component(rng);
                let z = DVector::from_fn(n_assets, |_, _| rng.sample::<f64, _>(StandardNormal));
                let draw = &self.means[k] + factors[k].lower() * z;
                values.extend(draw.iter());
            }
        }

        Ok(SimulatedPaths::new(n_paths, horizon, n_assets, values))
    }

    fn pick_component<R: Rng>(&self, rng: &mut R) -> usize {
        let u: f64 = rng.gen();
        let mut acc = 0.0;
        for (k, w) in self.weights.iter().enumerate() {
            acc += w;
            if u < acc {
                return k;
            }
        }
        self.weights.len() - 1
    }

    /// Checkpoint the fitted model as an opaque JSON blob.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    /// Restore a checkpointed model.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}

/// Cholesky factor plus the bits needed for the multivariate-normal
/// log density.
struct Factor {
    chol: Cholesky<f64, Dyn>,
    log_det: f64,
    dim: usize,
}

impl Factor {
    fn log_density(&self, x: &DVector<f64>, mean: &DVector<f64>) -> f64 {
        let d = x - mean;
        let mahalanobis = d.dot(&self.chol.solve(&d));
        -0.5 * (self.dim as f64 * (2.0 * std::f64::consts::PI).ln() + self.log_det + mahalanobis)
    }

    fn lower(&self) -> DMatrix<f64> {
        self.chol.l()
    }
}

fn factorize(covariances: &[DMatrix<f64>]) -> CycleResult<Vec<Factor>> {
    covariances
        .iter()
        .enumerate()
        .map(|(k, cov)| {
            let dim = cov.nrows();
            let chol = Cholesky::new(cov.clone())
                .or_else(|| {
                    // One stronger regularisation attempt before failing.
                    let bump = cov.trace().abs().max(1.0) * 1e-8 / dim as f64;
                    Cholesky::new(ridge(cov, bump))
                })
                .ok_or_else(|| {
                    CycleError::ModelFit(format!("component {k} covariance is not positive definite"))
                })?;
            let log_det = 2.0 * chol.l().diagonal().iter().map(|v| v.ln()).sum::<f64>();
            Ok(Factor { chol, log_det, dim })
        })
        .collect()
}

fn ridge(cov: &DMatrix<f64>, eps: f64) -> DMatrix<f64> {
    let mut out = cov.clone();
    for i in 0..out.nrows() {
        out[(i, i)] += eps;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::ReturnSeries;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_cluster_series(rows_per_cluster: usize) -> ReturnSeries {
        // Deterministic, well-separated clusters around -0.05 and +0.05
        // with small jitter so covariances stay positive definite.
        let mut rows = Vec::new();
        for i in 0..rows_per_cluster {
            let j = (i % 7) as f64 * 1e-4;
            rows.push(vec![-0.05 + j, -0.05 - j + 2e-4]);
            rows.push(vec![0.05 - j, 0.05 + j + 1e-4]);
        }
        ReturnSeries::from_rows(vec!["A".to_string(), "B".to_string()], rows)
    }

    #[test]
    fn test_fit_recovers_separated_clusters() {
        let series = two_cluster_series(100);
        let mut rng = StdRng::seed_from_u64(42);
        let model = GaussianMixture::fit(&series, 2, &mut rng).unwrap();

        let weight_sum: f64 = model.weights().iter().sum();
        assert!((weight_sum - 1.0).abs() < 1e-9);
        assert!(model.weights().iter().all(|&w| w >= 0.0));

        // Each fitted mean should sit near one of the true cluster centers.
        for mean in model.means() {
            let near_low = (mean[0] + 0.05).abs() < 0.01;
            let near_high = (mean[0] - 0.05).abs() < 0.01;
            assert!(near_low || near_high, "unexpected component mean {mean}");
        }
        // Balanced clusters give roughly balanced weights.
        for &w in model.weights() {
            assert!(w > 0.3 && w < 0.7, "unbalanced weight {w}");
        }
    }

    #[test]
    fn test_fit_rejects_constant_returns() {
        let rows = vec![vec![0.01, 0.02]; 50];
        let series = ReturnSeries::from_rows(vec!["A".to_string(), "B".to_string()], rows);
        let mut rng = StdRng::seed_from_u64(1);
        let err = GaussianMixture::fit(&series, 2, &mut rng).unwrap_err();
        assert!(matches!(err, CycleError::ModelFit(_)));
    }

    #[test]
    fn test_fit_rejects_too_few_rows() {
        let series = ReturnSeries::from_rows(
            vec!["A".to_string()],
            vec![vec![0.01], vec![0.02]],
        );
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            GaussianMixture::fit(&series, 3, &mut rng),
            Err(CycleError::ModelFit(_))
        ));
    }

    #[test]
    fn test_sample_shape_and_finiteness() {
        let series = two_cluster_series(50);
        let mut rng = StdRng::seed_from_u64(7);
        let model = GaussianMixture::fit(&series, 2, &mut rng).unwrap();

        let paths = model.sample(&mut rng, 20, 3).unwrap();
        assert_eq!(paths.n_paths, 20);
        assert_eq!(paths.horizon, 3);
        assert_eq!(paths.n_assets, 2);
        for p in 0..20 {
            for s in 0..3 {
                for a in 0..2 {
                    assert!(paths.at(p, s, a).is_finite());
                }
            }
        }
    }

    #[test]
    fn test_joint_sampling_preserves_correlation_sign() {
        // Both clusters move A and B together, so sampled returns must be
        // strongly positively correlated across assets.
        let series = two_cluster_series(100);
        let mut rng = StdRng::seed_from_u64(3);
        let model = GaussianMixture::fit(&series, 2, &mut rng).unwrap();
        let paths = model.sample(&mut rng, 500, 1).unwrap();

        let n = 500;
        let (mut ma, mut mb) = (0.0, 0.0);
        for p in 0..n {
            ma += paths.at(p, 0, 0);
            mb += paths.at(p, 0, 1);
        }
        ma /= n as f64;
        mb /= n as f64;
        let mut cov = 0.0;
        for p in 0..n {
            cov += (paths.at(p, 0, 0) - ma) * (paths.at(p, 0, 1) - mb);
        }
        assert!(cov > 0.0, "joint draws lost cross-asset correlation");
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let series = two_cluster_series(50);
        let mut rng = StdRng::seed_from_u64(9);
        let model = GaussianMixture::fit(&series, 2, &mut rng).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        model.save(&path).unwrap();
        let restored = GaussianMixture::load(&path).unwrap();

        assert_eq!(restored.n_components(), model.n_components());
        for (a, b) in restored.weights().iter().zip(model.weights()) {
            assert!((a - b).abs() < 1e-15);
        }
        for (a, b) in restored.means().iter().zip(model.means()) {
            assert!((a - b).norm() < 1e-15);
        }
        for (a, b) in restored.covariances().iter().zip(model.covariances()) {
            assert!((a - b).norm() < 1e-15);
        }
    }
}
