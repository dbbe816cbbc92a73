//! Brokerage account gateway: live Alpaca client and in-memory paper
//! gateway.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use tracing::info;

/// Cash and net asset value of the account. Cash is signed and may be
/// negative.
#[derive(Debug, Clone, Copy)]
pub struct AccountSnapshot {
    pub cash: Decimal,
    pub nav: Decimal,
}

/// A held position.
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub qty: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// A whole-share market order, day time-in-force.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: u64,
}

/// Account state query and order submission.
///
/// Constructed per process and passed into the engine; implementations must
/// tolerate one cycle's sequential call pattern (account, positions, then
/// zero or more submissions).
#[async_trait]
pub trait AccountGateway: Send + Sync {
    async fn account(&self) -> Result<AccountSnapshot>;
    async fn positions(&self) -> Result<Vec<Position>>;
    async fn submit_order(&self, order: &OrderRequest) -> Result<()>;
}

/// REST client for the Alpaca trading API.
pub struct AlpacaTradingClient {
    http: reqwest::Client,
    base_url: String,
    key_id: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    #[serde(with = "rust_decimal::serde::str")]
    cash: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    portfolio_value: Decimal,
}

#[derive(Debug, Deserialize)]
struct PositionResponse {
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    qty: Decimal,
}

#[derive(Debug, Serialize)]
struct NewOrderRequest<'a> {
    symbol: &'a str,
    qty: String,
    side: OrderSide,
    #[serde(rename = "type")]
    order_type: &'static str,
    time_in_force: &'static str,
}

impl AlpacaTradingClient {
    pub fn new(base_url: &str, key_id: &str, secret_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.to_string(),
            key_id: key_id.to_string(),
            secret_key: secret_key.to_string(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{path}", self.base_url))
            .header("APCA-API-KEY-ID", &self.key_id)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
    }
}

#[async_trait]
impl AccountGateway for AlpacaTradingClient {
    async fn account(&self) -> Result<AccountSnapshot> {
        let response: AccountResponse = self
            .get("/v2/account")
            .send()
            .await
            .context("Account request failed")?
            .error_for_status()
            .context("Account request rejected")?
            .json()
            .await
            .context("Malformed account response")?;

        Ok(AccountSnapshot {
            cash: response.cash,
            nav: response.portfolio_value,
        })
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        let response: Vec<PositionResponse> = self
            .get("/v2/positions")
            .send()
            .await
            .context("Positions request failed")?
            .error_for_status()
            .context("Positions request rejected")?
            .json()
            .await
            .context("Malformed positions response")?;

        Ok(response
            .into_iter()
            .map(|p| Position {
                symbol: p.symbol,
                qty: p.qty,
            })
            .collect())
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<()> {
        let body = NewOrderRequest {
            symbol: &order.symbol,
            qty: order.qty.to_string(),
            side: order.side,
            order_type: "market",
            time_in_force: "day",
        };

        self.http
            .post(format!("{}/v2/orders", self.base_url))
            .header("APCA-API-KEY-ID", &self.key_id)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
            .json(&body)
            .send()
            .await
            .context("Order submission failed")?
            .error_for_status()
            .context("Order rejected")?;

        Ok(())
    }
}

#[derive(Debug, Default)]
struct PaperState {
    cash: Decimal,
    positions: HashMap<String, Decimal>,
    prices: HashMap<String, Decimal>,
}

/// In-memory gateway for paper runs and tests: market orders fill
/// instantly at the seeded price.
pub struct PaperGateway {
    state: RwLock<PaperState>,
}

impl PaperGateway {
    pub fn new(cash: Decimal) -> Self {
        Self {
            state: RwLock::new(PaperState {
                cash,
                ..PaperState::default()
            }),
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state.write().await.prices.insert(symbol.to_string(), price);
    }

    pub async fn set_position(&self, symbol: &str, qty: Decimal) {
        self.state.write().await.positions.insert(symbol.to_string(), qty);
    }

    pub async fn cash(&self) -> Decimal {
        self.state.read().await.cash
    }

    pub async fn position(&self, symbol: &str) -> Decimal {
        self.state
            .read()
            .await
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl AccountGateway for PaperGateway {
    async fn account(&self) -> Result<AccountSnapshot> {
        let state = self.state.read().await;
        let holdings_value: Decimal = state
            .positions
            .iter()
            .map(|(symbol, qty)| {
                qty * state.prices.get(symbol).copied().unwrap_or(Decimal::ZERO)
            })
            .sum();
        Ok(AccountSnapshot {
            cash: state.cash,
            nav: state.cash + holdings_value,
        })
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        let state = self.state.read().await;
        Ok(state
            .positions
            .iter()
            .filter(|(_, qty)| **qty != Decimal::ZERO)
            .map(|(symbol, qty)| Position {
                symbol: symbol.clone(),
                qty: *qty,
            })
            .collect())
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<()> {
        let mut state = self.state.write().await;
        let price = state
            .prices
            .get(&order.symbol)
            .copied()
            .with_context(|| format!("No paper price for {}", order.symbol))?;

        let qty = Decimal::from(order.qty);
        let notional = qty * price;
        let (qty_delta, cash_delta) = match order.side {
            OrderSide::Buy => (qty, -notional),
            OrderSide::Sell => (-qty, notional),
        };
        *state
            .positions
            .entry(order.symbol.clone())
            .or_insert(Decimal::ZERO) += qty_delta;
        state.cash += cash_delta;

        info!(
            symbol = %order.symbol,
            side = %order.side,
            qty = order.qty,
            %price,
            "Paper fill"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_paper_fill_moves_cash_and_position() {
        let gateway = PaperGateway::new(dec!(10_000));
        gateway.set_price("AAPL", dec!(100)).await;

        gateway
            .submit_order(&OrderRequest {
                symbol: "AAPL".to_string(),
                side: OrderSide::Buy,
                qty: 10,
            })
            .await
            .unwrap();

        assert_eq!(gateway.cash().await, dec!(9_000));
        assert_eq!(gateway.position("AAPL").await, dec!(10));

        gateway
            .submit_order(&OrderRequest {
                symbol: "AAPL".to_string(),
                side: OrderSide::Sell,
                qty: 4,
            })
            .await
            .unwrap();

        assert_eq!(gateway.cash().await, dec!(9_400));
        assert_eq!(gateway.position("AAPL").await, dec!(6));
    }

    #[tokio::test]
    async fn test_paper_nav_includes_holdings() {
        let gateway = PaperGateway::new(dec!(1_000));
        gateway.set_price("SPY", dec!(500)).await;
        gateway.set_position("SPY", dec!(2)).await;

        let snapshot = gateway.account().await.unwrap();
        assert_eq!(snapshot.cash, dec!(1_000));
        assert_eq!(snapshot.nav, dec!(2_000));
    }

    #[tokio::test]
    async fn test_paper_order_without_price_fails() {
        let gateway = PaperGateway::new(dec!(1_000));
        let result = gateway
            .submit_order(&OrderRequest {
                symbol: "MISSING".to_string(),
                side: OrderSide::Buy,
                qty: 1,
            })
            .await;
        assert!(result.is_err());
    }
}
