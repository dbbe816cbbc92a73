//! Append-only CSV record of every submitted order.

use crate::trader::OrderInstruction;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::info;

const HEADER: &str = "timestamp,symbol,side,qty,price,nav";

/// CSV trade log. Each order is appended and flushed before it is sent to
/// the broker, so the log never misses an order that reached the gateway.
pub struct TradeLog {
    file: File,
}

impl TradeLog {
    /// Open (or create) the log at `path`, writing the header only when the
    /// file is new or empty.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open trade log {}", path.display()))?;

        if needs_header {
            writeln!(file, "{HEADER}").context("Failed to write trade log header")?;
        }

        info!(path = %path.display(), "Trade log ready");
        Ok(Self { file })
    }

    /// Append one order row and flush it to disk.
    pub fn append(&mut self, order: &OrderInstruction, nav: Decimal) -> Result<()> {
        writeln!(
            self.file,
            "{},{},{},{},{},{}",
            order.timestamp.to_rfc3339(),
            order.symbol,
            order.side,
            order.qty,
            order.price.round_dp(2),
            nav.round_dp(2),
        )
        .context("Failed to append trade log row")?;
        self.file.flush().context("Failed to flush trade log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trader::OrderSide;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn order(symbol: &str, side: OrderSide, qty: u64, price: Decimal) -> OrderInstruction {
        OrderInstruction {
            symbol: symbol.to_string(),
            side,
            qty,
            price,
            timestamp: Utc::now(),
            cash_after: dec!(0),
        }
    }

    #[test]
    fn test_header_written_once_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv");

        {
            let mut log = TradeLog::open(&path).unwrap();
            log.append(&order("AAPL", OrderSide::Buy, 3, dec!(187.50)), dec!(10_000))
                .unwrap();
        }
        {
            let mut log = TradeLog::open(&path).unwrap();
            log.append(&order("TLT", OrderSide::Sell, 1, dec!(92.128)), dec!(9_500))
                .unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,symbol,side,qty,price,nav");
        assert!(lines[1].contains(",AAPL,BUY,3,187.50,10000"));
        assert!(lines[2].contains(",TLT,SELL,1,92.13,9500"));
    }

    #[test]
    fn test_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/trades.csv");
        TradeLog::open(&path).unwrap();
        assert!(path.exists());
    }
}
