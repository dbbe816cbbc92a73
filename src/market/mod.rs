//! Historical market data retrieval.

mod alpaca;
mod types;

pub use alpaca::AlpacaDataClient;
pub use types::{PriceHistory, ReturnSeries};

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

/// A provider of dense daily close-price history.
///
/// Implementations return one column per requested symbol with missing
/// symbol/date combinations left as explicit gaps.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn daily_closes(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PriceHistory>;
}
