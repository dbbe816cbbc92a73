//! Error taxonomy for a rebalancing cycle.
//!
//! Recoverable per-symbol conditions (`DataGap`, `UnknownPrice`) exclude the
//! affected symbol from the cycle; the rest are fatal to the cycle. Fatal
//! errors never roll back orders already submitted — the trade log is written
//! before each submission so the audit trail stays accurate.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CycleError {
    /// Not enough clean price history to compute returns for a symbol.
    /// Recoverable: the symbol is dropped from the cycle.
    #[error("insufficient price history for {symbol}: {rows} usable rows (need {min_rows})")]
    DataGap {
        symbol: String,
        rows: usize,
        min_rows: usize,
    },

    /// Mixture fit failed to converge or received degenerate input.
    /// Fatal: a stale model is never reused silently.
    #[error("mixture model fit failed: {0}")]
    ModelFit(String),

    /// The optimizer's constraints admit no solution.
    /// Fatal: never falls back to a zero or partial allocation.
    #[error("infeasible allocation: {0}")]
    InfeasibleAllocation(String),

    /// Emergency deleveraging exhausted all sellable holdings with cash
    /// still negative. Buys are halted; already-planned sells stand.
    #[error("emergency deleveraging left cash short by {shortfall}")]
    InsufficientCash { shortfall: Decimal },

    /// A target symbol has no latest price. Recoverable per-symbol.
    #[error("no latest price for {0}")]
    UnknownPrice(String),

    /// Market data or brokerage boundary failure.
    #[error(transparent)]
    Gateway(#[from] anyhow::Error),
}

pub type CycleResult<T> = Result<T, CycleError>;
