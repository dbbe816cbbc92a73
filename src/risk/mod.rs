//! Tail-risk estimation from simulated P&L.

mod var;

pub use var::{portfolio_pnl, VarCalculator};
