//! Constrained mean-variance allocation.
//!
//! Maximizes `mu . w - 0.5 * lambda * w' Sigma w` subject to long-only
//! bounds, a per-name cap, and per-sleeve weight targets. Because the
//! configured sleeve targets sum to 1, the per-sleeve equalities imply the
//! full-portfolio sum-to-one constraint.
//!
//! Solver: projected gradient ascent with a fixed `1/L` step (`L` from a
//! Gershgorin row-sum bound on the covariance). The feasible set decomposes
//! per sleeve into capped simplices `{sum w = t, 0 <= w <= cap}`, each
//! projected exactly by bisection on the simplex shift. The optimum of the
//! strictly convex problem is unique and the solve deterministic;
//! near-degenerate covariance can admit ties, where the converged point is
//! solver-dependent.

use crate::config::SleeveConfig;
use crate::error::{CycleError, CycleResult};
use nalgebra::{DMatrix, DVector};
use std::ops::Range;
use tracing::debug;

const RISK_AVERSION: f64 = 1.0;
const MAX_ITER: usize = 2000;
const STEP_TOL: f64 = 1e-10;
const FEAS_TOL: f64 = 1e-9;

/// Target portfolio weights in sleeve-then-declaration order.
///
/// The ordering is deliberate: the execution reconciler consumes shared cash
/// sequentially, so iteration order is observable behavior.
#[derive(Debug, Clone)]
pub struct TargetWeights {
    entries: Vec<(String, f64)>,
}

impl TargetWeights {
    /// Build from explicit entries; order is preserved as given.
    pub fn from_entries(entries: Vec<(String, f64)>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, f64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn weight(&self, symbol: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, w)| *w)
    }
}

struct SleeveSlice {
    name: String,
    target: f64,
    range: Range<usize>,
}

/// Solves the constrained allocation for a fixed symbol universe.
pub struct Allocator {
    symbols: Vec<String>,
    sleeves: Vec<SleeveSlice>,
    max_weight: f64,
}

impl Allocator {
    /// Build an allocator over the sleeves' symbols in declared order.
    /// Sleeves already filtered to the cycle's surviving symbols.
    pub fn new(sleeves: &[SleeveConfig], max_weight_per_name: f64) -> Self {
        let mut symbols = Vec::new();
        let mut slices = Vec::new();
        for sleeve in sleeves {
            let start = symbols.len();
            symbols.extend(sleeve.symbols.iter().cloned());
            slices.push(SleeveSlice {
                name: sleeve.name.clone(),
                target: sleeve.target,
                range: start..symbols.len(),
            });
        }
        Self {
            symbols,
            sleeves: slices,
            max_weight: max_weight_per_name,
        }
    }

    /// Solve for target weights given per-asset expected returns and the
    /// covariance matrix over the same universe.
    pub fn optimise(
        &self,
        expected_returns: &DVector<f64>,
        covariance: &DMatrix<f64>,
    ) -> CycleResult<TargetWeights> {
        let n = self.symbols.len();
        if expected_returns.len() != n || covariance.nrows() != n || covariance.ncols() != n {
            return Err(CycleError::InfeasibleAllocation(format!(
                "universe has {n} symbols but inputs are {}x{}",
                expected_returns.len(),
                covariance.nrows()
            )));
        }

        self.check_feasible()?;

        // Start feasible: equal weights within each sleeve.
        let mut w = DVector::zeros(n);
        for sleeve in &self.sleeves {
            let count = sleeve.range.len() as f64;
            for i in sleeve.range.clone() {
                w[i] = sleeve.target / count;
            }
        }

        // Fixed step from a Gershgorin bound on the covariance spectrum.
        let lipschitz = RISK_AVERSION
            * (0..n)
                .map(|i| (0..n).map(|j| covariance[(i, j)].abs()).sum::<f64>())
                .fold(0.0, f64::max);
        let step = 1.0 / lipschitz.max(1e-8);

        for iter in 0..MAX_ITER {
            let grad = expected_returns - covariance * &w * RISK_AVERSION;
            let ascent = &w + &grad * step;

            let mut next = DVector::zeros(n);
            for sleeve in &self.sleeves {
                let segment: Vec<f64> = sleeve.range.clone().map(|i| ascent[i]).collect();
                let projected =
                    project_capped_simplex(&segment, sleeve.target, self.max_weight);
                for (offset, value) in projected.into_iter().enumerate() {
                    next[sleeve.range.start + offset] = value;
                }
            }

            let delta = (&next - &w).amax();
            w = next;
            if delta < STEP_TOL {
                debug!(iterations = iter + 1, "Allocation solve converged");
                break;
            }
        }

        self.check_solution(&w)?;

        Ok(TargetWeights {
            entries: self
                .symbols
                .iter()
                .cloned()
                .zip(w.iter().copied())
                .collect(),
        })
    }

    fn check_feasible(&self) -> CycleResult<()> {
        for sleeve in &self.sleeves {
            if sleeve.target < -FEAS_TOL {
                return Err(CycleError::InfeasibleAllocation(format!(
                    "sleeve {} has negative target {}",
                    sleeve.name, sleeve.target
                )));
            }
            if sleeve.range.is_empty() && sleeve.target > FEAS_TOL {
                return Err(CycleError::InfeasibleAllocation(format!(
                    "sleeve {} targets {} with no priced members",
                    sleeve.name, sleeve.target
                )));
            }
            let reachable = self.max_weight * sleeve.range.len() as f64;
            if reachable + FEAS_TOL < sleeve.target {
                return Err(CycleError::InfeasibleAllocation(format!(
                    "sleeve {}: {} members capped at {} cannot reach target {}",
                    sleeve.name,
                    sleeve.range.len(),
                    self.max_weight,
                    sleeve.target
                )));
            }
        }
        Ok(())
    }

    /// A converged solve must conform; anything else is surfaced, never
    /// silently returned.
    fn check_solution(&self, w: &DVector<f64>) -> CycleResult<()> {
        for (i, &wi) in w.iter().enumerate() {
            if wi < -1e-6 || wi > self.max_weight + 1e-6 {
                return Err(CycleError::InfeasibleAllocation(format!(
                    "weight for {} out of bounds: {wi}",
                    self.symbols[i]
                )));
            }
        }
        for sleeve in &self.sleeves {
            let sum: f64 = sleeve.range.clone().map(|i| w[i]).sum();
            if (sum - sleeve.target).abs() > 1e-6 {
                return Err(CycleError::InfeasibleAllocation(format!(
                    "sleeve {} sums to {sum}, target {}",
                    sleeve.name, sleeve.target
                )));
            }
        }
        Ok(())
    }
}

/// Euclidean projection of `v` onto `{w : sum w = target, 0 <= w_i <= cap}`
/// by bisection on the shift `nu` in `w_i = clamp(v_i - nu, 0, cap)`.
/// Caller guarantees `cap * v.len() >= target`.
fn project_capped_simplex(v: &[f64], target: f64, cap: f64) -> Vec<f64> {
    if v.is_empty() {
        return Vec::new();
    }

    let sum_at = |nu: f64| -> f64 { v.iter().map(|&x| (x - nu).clamp(0.0, cap)).sum() };

    let mut lo = v.iter().cloned().fold(f64::INFINITY, f64::min) - cap - 1.0;
    let mut hi = v.iter().cloned().fold(f64::NEG_INFINITY, f64::max) + 1.0;
    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        if sum_at(mid) > target {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    let nu = 0.5 * (lo + hi);
    v.iter().map(|&x| (x - nu).clamp(0.0, cap)).collect()
}
