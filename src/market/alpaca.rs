//! Alpaca Market Data REST client.

use super::types::PriceHistory;
use super::PriceFeed;
use crate::config::{AlpacaConfig, DataConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Client for the Alpaca stock bars endpoint (`/v2/stocks/bars`).
pub struct AlpacaDataClient {
    http: reqwest::Client,
    base_url: String,
    key_id: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: HashMap<String, Vec<Bar>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Bar {
    /// Bar timestamp
    t: DateTime<Utc>,
    /// Close price
    c: f64,
}

impl AlpacaDataClient {
    pub fn new(data: &DataConfig, credentials: &AlpacaConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: data.base_url.clone(),
            key_id: credentials.key_id.clone(),
            secret_key: credentials.secret_key.clone(),
        }
    }

    async fn fetch_bars(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HashMap<String, Vec<Bar>>> {
        let url = format!("{}/v2/stocks/bars", self.base_url);
        let mut all_bars: HashMap<String, Vec<Bar>> = HashMap::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("symbols", symbols.join(",")),
                ("timeframe", "1Day".to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("limit", "10000".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }

            let response = self
                .http
                .get(&url)
                .header("APCA-API-KEY-ID", &self.key_id)
                .header("APCA-API-SECRET-KEY", &self.secret_key)
                .query(&query)
                .send()
                .await
                .context("Bars request failed")?
                .error_for_status()
                .context("Bars request rejected")?;

            let page: BarsResponse = response.json().await.context("Malformed bars response")?;
            for (symbol, bars) in page.bars {
                all_bars.entry(symbol).or_default().extend(bars);
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(symbols = symbols.len(), "Fetched daily bars");
        Ok(all_bars)
    }
}

#[async_trait]
impl PriceFeed for AlpacaDataClient {
    async fn daily_closes(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PriceHistory> {
        let bars = self.fetch_bars(symbols, start, end).await?;

        // Union of trading dates across symbols, chronological.
        let mut dates: BTreeSet<NaiveDate> = BTreeSet::new();
        for series in bars.values() {
            for bar in series {
                dates.insert(bar.t.date_naive());
            }
        }
        let dates: Vec<NaiveDate> = dates.into_iter().collect();
        let date_index: HashMap<NaiveDate, usize> =
            dates.iter().enumerate().map(|(i, d)| (*d, i)).collect();

        let mut closes = vec![None; dates.len() * symbols.len()];
        for (col, symbol) in symbols.iter().enumerate() {
            if let Some(series) = bars.get(symbol) {
                for bar in series {
                    if let Some(&row) = date_index.get(&bar.t.date_naive()) {
                        closes[row * symbols.len() + col] = Some(bar.c);
                    }
                }
            }
        }

        Ok(PriceHistory::new(dates, symbols.to_vec(), closes))
    }
}
