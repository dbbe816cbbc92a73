//! Price history and return series containers.

use crate::error::CycleError;
use chrono::NaiveDate;
use nalgebra::{DMatrix, DVector};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

/// Dense close-price matrix: one row per trading date, one column per
/// symbol. Missing symbol/date combinations are explicit gaps.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    pub dates: Vec<NaiveDate>,
    pub symbols: Vec<String>,
    /// Row-major (dates x symbols)
    closes: Vec<Option<f64>>,
}

impl PriceHistory {
    pub fn new(dates: Vec<NaiveDate>, symbols: Vec<String>, closes: Vec<Option<f64>>) -> Self {
        debug_assert_eq!(closes.len(), dates.len() * symbols.len());
        Self {
            dates,
            symbols,
            closes,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.dates.len()
    }

    pub fn close(&self, row: usize, col: usize) -> Option<f64> {
        self.closes[row * self.symbols.len() + col]
    }

    /// Most recent available close per symbol, as execution-layer decimals.
    /// Symbols with no close at all are omitted.
    pub fn last_prices(&self) -> Vec<(String, Decimal)> {
        let mut out = Vec::new();
        for (col, symbol) in self.symbols.iter().enumerate() {
            let last = (0..self.n_rows()).rev().find_map(|row| self.close(row, col));
            if let Some(px) = last.and_then(Decimal::from_f64) {
                out.push((symbol.clone(), px));
            }
        }
        out
    }

    /// Compute per-asset log returns.
    ///
    /// Symbols with fewer than `min_rows` usable observations are dropped for
    /// the cycle and reported as recoverable [`CycleError::DataGap`]s. Any
    /// remaining date row that still has a gap in one of the surviving
    /// columns is dropped whole, so the resulting series has no missing
    /// entries.
    pub fn log_returns(&self, min_rows: usize) -> (Option<ReturnSeries>, Vec<CycleError>) {
        let mut gaps = Vec::new();
        let mut kept_cols = Vec::new();

        for (col, symbol) in self.symbols.iter().enumerate() {
            let rows = (0..self.n_rows()).filter(|&r| self.close(r, col).is_some()).count();
            if rows < min_rows.max(2) {
                warn!(%symbol, rows, min_rows, "Dropping symbol for this cycle: insufficient history");
                gaps.push(CycleError::DataGap {
                    symbol: symbol.clone(),
                    rows,
                    min_rows,
                });
            } else {
                kept_cols.push(col);
            }
        }

        if kept_cols.is_empty() {
            return (None, gaps);
        }

        // Keep only rows where every surviving column has a close.
        let full_rows: Vec<usize> = (0..self.n_rows())
            .filter(|&r| kept_cols.iter().all(|&c| self.close(r, c).is_some()))
            .collect();

        if full_rows.len() < 2 {
            return (None, gaps);
        }

        let symbols: Vec<String> = kept_cols.iter().map(|&c| self.symbols[c].clone()).collect();
        let n_rows = full_rows.len() - 1;
        let mut values = Vec::with_capacity(n_rows * kept_cols.len());
        for w in full_rows.windows(2) {
            let (prev, curr) = (w[0], w[1]);
            for &c in &kept_cols {
                // Rows were filtered to have closes in every kept column.
                let p0 = self.close(prev, c).unwrap_or(f64::NAN);
                let p1 = self.close(curr, c).unwrap_or(f64::NAN);
                values.push((p1 / p0).ln());
            }
        }

        (
            Some(ReturnSeries {
                symbols,
                rows: n_rows,
                values,
            }),
            gaps,
        )
    }
}

/// Gap-free matrix of per-date, per-asset log returns in chronological
/// order. Constructed only by [`PriceHistory::log_returns`], which drops
/// incomplete rows, so no entry is NaN.
#[derive(Debug, Clone)]
pub struct ReturnSeries {
    pub symbols: Vec<String>,
    pub rows: usize,
    /// Row-major (dates x assets)
    values: Vec<f64>,
}

impl ReturnSeries {
    pub fn from_rows(symbols: Vec<String>, rows: Vec<Vec<f64>>) -> Self {
        let n_rows = rows.len();
        let values = rows.into_iter().flatten().collect();
        Self {
            symbols,
            rows: n_rows,
            values,
        }
    }

    pub fn n_assets(&self) -> usize {
        self.symbols.len()
    }

    pub fn value(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.n_assets() + col]
    }

    pub fn as_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(self.rows, self.n_assets(), &self.values)
    }

    /// Per-asset mean return.
    pub fn mean(&self) -> DVector<f64> {
        let n = self.n_assets();
        let mut mean = DVector::zeros(n);
        for row in 0..self.rows {
            for col in 0..n {
                mean[col] += self.value(row, col);
            }
        }
        mean / self.rows as f64
    }

    /// Sample covariance matrix (n - 1 denominator).
    pub fn covariance(&self) -> DMatrix<f64> {
        let n = self.n_assets();
        let mean = self.mean();
        let mut cov = DMatrix::zeros(n, n);
        for row in 0..self.rows {
            for i in 0..n {
                let di = self.value(row, i) - mean[i];
                for j in i..n {
                    let dj = self.value(row, j) - mean[j];
                    cov[(i, j)] += di * dj;
                }
            }
        }
        let denom = (self.rows.max(2) - 1) as f64;
        for i in 0..n {
            for j in i..n {
                cov[(i, j)] /= denom;
                cov[(j, i)] = cov[(i, j)];
            }
        }
        cov
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn test_log_returns_drop_gapped_rows() {
        // Three dates, two symbols; B has a gap on day 2.
        let history = PriceHistory::new(
            vec![date(1), date(2), date(3)],
            vec!["A".to_string(), "B".to_string()],
            vec![
                Some(100.0),
                Some(50.0),
                Some(110.0),
                None,
                Some(121.0),
                Some(55.0),
            ],
        );

        let (series, gaps) = history.log_returns(2);
        assert!(gaps.is_empty());
        let series = series.unwrap();
        // Day 2 dropped: single return row from day 1 -> day 3.
        assert_eq!(series.rows, 1);
        assert!((series.value(0, 0) - (121.0f64 / 100.0).ln()).abs() < 1e-12);
        assert!((series.value(0, 1) - (55.0f64 / 50.0).ln()).abs() < 1e-12);
    }

    #[test]
    fn test_sparse_symbol_reported_as_data_gap() {
        let history = PriceHistory::new(
            vec![date(1), date(2), date(3), date(4)],
            vec!["A".to_string(), "B".to_string()],
            vec![
                Some(100.0),
                Some(50.0),
                Some(101.0),
                None,
                Some(102.0),
                None,
                Some(103.0),
                None,
            ],
        );

        let (series, gaps) = history.log_returns(3);
        assert_eq!(gaps.len(), 1);
        assert!(matches!(
            &gaps[0],
            CycleError::DataGap { symbol, .. } if symbol == "B"
        ));
        let series = series.unwrap();
        assert_eq!(series.symbols, vec!["A"]);
        assert_eq!(series.rows, 3);
    }

    #[test]
    fn test_last_prices_skip_trailing_gaps() {
        let history = PriceHistory::new(
            vec![date(1), date(2)],
            vec!["A".to_string(), "B".to_string()],
            vec![Some(100.0), Some(50.0), Some(110.0), None],
        );

        let last = history.last_prices();
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].1, Decimal::from(110));
        assert_eq!(last[1].1, Decimal::from(50));
    }

    #[test]
    fn test_mean_and_covariance() {
        let series = ReturnSeries::from_rows(
            vec!["A".to_string(), "B".to_string()],
            vec![vec![0.01, 0.02], vec![0.03, -0.02], vec![0.02, 0.0]],
        );

        let mean = series.mean();
        assert!((mean[0] - 0.02).abs() < 1e-12);
        assert!((mean[1] - 0.0).abs() < 1e-12);

        let cov = series.covariance();
        // var(A) = ((-0.01)^2 + 0.01^2 + 0) / 2 = 1e-4
        assert!((cov[(0, 0)] - 1e-4).abs() < 1e-12);
        // cov(A,B) = ((-0.01)(0.02) + (0.01)(-0.02) + 0) / 2 = -2e-4
        assert!((cov[(0, 1)] + 2e-4).abs() < 1e-12);
        assert_eq!(cov[(0, 1)], cov[(1, 0)]);
    }
}
