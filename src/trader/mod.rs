//! Order execution: gateway clients, the rebalancing reconciler and the
//! trade log.

mod gateway;
mod reconciler;
mod trade_log;

pub use gateway::{
    AccountGateway, AccountSnapshot, AlpacaTradingClient, OrderRequest, OrderSide, PaperGateway,
    Position,
};
pub use reconciler::{
    OrderInstruction, RebalancePlan, Reconciler, SkipReason, SkippedSymbol,
};
pub use trade_log::TradeLog;
