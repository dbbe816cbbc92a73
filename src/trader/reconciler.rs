//! Execution reconciliation: turns target weights plus live account state
//! into a concrete, cash-feasible order sequence.
//!
//! Planning is pure — no IO. Phase A (emergency deleveraging) runs only
//! when cash is negative; Phase B walks the target weights in their
//! declared order, so cash consumed by earlier symbols is visible to later
//! ones. Both phases update an in-memory cash/holdings projection after
//! every order.

use crate::portfolio::TargetWeights;
use crate::trader::{OrderRequest, OrderSide};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, warn};

/// A decided order. Append-only once emitted.
#[derive(Debug, Clone)]
pub struct OrderInstruction {
    pub symbol: String,
    pub side: OrderSide,
    /// Whole shares, always positive
    pub qty: u64,
    /// Reference price the sizing was computed against
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Projected cash balance after this order
    pub cash_after: Decimal,
}

impl OrderInstruction {
    pub fn as_request(&self) -> OrderRequest {
        OrderRequest {
            symbol: self.symbol.clone(),
            side: self.side,
            qty: self.qty,
        }
    }
}

/// Why a target symbol produced no order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No latest price for the symbol
    UnknownPrice,
    /// Exposure delta below the dust threshold
    Dust,
    /// Whole-share rounding (or a cap) left nothing to trade
    ZeroQuantity,
    /// Buys are suspended while projected cash is non-positive
    NoCash,
}

#[derive(Debug, Clone)]
pub struct SkippedSymbol {
    pub symbol: String,
    pub reason: SkipReason,
}

/// The cycle's decided order sequence plus the projected end state.
#[derive(Debug)]
pub struct RebalancePlan {
    pub orders: Vec<OrderInstruction>,
    pub skipped: Vec<SkippedSymbol>,
    /// Set when emergency deleveraging ran out of sellable holdings with
    /// cash still negative.
    pub residual_shortfall: Option<Decimal>,
    pub projected_cash: Decimal,
    pub projected_holdings: HashMap<String, Decimal>,
}

/// Plans cash- and inventory-feasible rebalancing orders.
pub struct Reconciler {
    /// Minimum exposure delta, in currency units, worth trading
    dust_threshold: Decimal,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            dust_threshold: Decimal::ONE,
        }
    }
}

impl Reconciler {
    pub fn new(dust_threshold: Decimal) -> Self {
        Self { dust_threshold }
    }

    /// Produce the ordered rebalancing plan for one cycle.
    ///
    /// `targets` carries its own iteration order; `nav` is the base for
    /// dollar-exposure targets.
    pub fn plan(
        &self,
        targets: &TargetWeights,
        latest_prices: &HashMap<String, Decimal>,
        current_holdings: &HashMap<String, Decimal>,
        cash: Decimal,
        nav: Decimal,
    ) -> RebalancePlan {
        let mut orders = Vec::new();
        let mut skipped = Vec::new();
        let mut cash = cash;
        let mut holdings = current_holdings.clone();

        let residual_shortfall = if cash < Decimal::ZERO {
            self.deleverage(&mut orders, &mut skipped, &mut cash, &mut holdings, latest_prices)
        } else {
            None
        };

        self.rebalance(
            targets,
            latest_prices,
            &mut orders,
            &mut skipped,
            &mut cash,
            &mut holdings,
            nav,
        );

        RebalancePlan {
            orders,
            skipped,
            residual_shortfall,
            projected_cash: cash,
            projected_holdings: holdings,
        }
    }

    /// Phase A: sell largest positions first until cash is restored.
    /// Returns the remaining shortfall if every sellable holding was
    /// exhausted with cash still negative.
    fn deleverage(
        &self,
        orders: &mut Vec<OrderInstruction>,
        skipped: &mut Vec<SkippedSymbol>,
        cash: &mut Decimal,
        holdings: &mut HashMap<String, Decimal>,
        latest_prices: &HashMap<String, Decimal>,
    ) -> Option<Decimal> {
        warn!(%cash, "Negative cash: entering emergency deleveraging");

        // Largest position value first; symbol as tie-break so the order
        // is fully deterministic.
        let mut by_value: Vec<(String, Decimal)> = holdings
            .iter()
            .filter(|(_, qty)| **qty > Decimal::ZERO)
            .map(|(symbol, qty)| {
                let value = latest_prices
                    .get(symbol)
                    .map(|price| qty * price)
                    .unwrap_or(Decimal::ZERO);
                (symbol.clone(), value)
            })
            .collect();
        by_value.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        for (symbol, _) in by_value {
            if *cash >= Decimal::ZERO {
                break;
            }

            let Some(&price) = latest_prices.get(&symbol) else {
                skipped.push(SkippedSymbol {
                    symbol,
                    reason: SkipReason::UnknownPrice,
                });
                continue;
            };
            if price <= Decimal::ZERO {
                skipped.push(SkippedSymbol {
                    symbol,
                    reason: SkipReason::UnknownPrice,
                });
                continue;
            }

            let held = holdings.get(&symbol).copied().unwrap_or(Decimal::ZERO);
            let sellable = held.floor();
            if sellable <= Decimal::ZERO {
                continue;
            }

            let needed = (cash.abs() / price).ceil();
            let qty = sellable.min(needed);
            let Some(qty_shares) = qty.to_u64() else {
                continue;
            };

            *cash += qty * price;
            if let Some(entry) = holdings.get_mut(&symbol) {
                *entry -= qty;
            }
            orders.push(OrderInstruction {
                symbol,
                side: OrderSide::Sell,
                qty: qty_shares,
                price,
                timestamp: Utc::now(),
                cash_after: *cash,
            });
        }

        if *cash < Decimal::ZERO {
            let shortfall = -*cash;
            warn!(%shortfall, "Sellable holdings exhausted with cash still negative");
            Some(shortfall)
        } else {
            None
        }
    }

    /// Phase B: walk the targets in declared order, trading each exposure
    /// delta under the dust, inventory and affordability rules.
    #[allow(clippy::too_many_arguments)]
    fn rebalance(
        &self,
        targets: &TargetWeights,
        latest_prices: &HashMap<String, Decimal>,
        orders: &mut Vec<OrderInstruction>,
        skipped: &mut Vec<SkippedSymbol>,
        cash: &mut Decimal,
        holdings: &mut HashMap<String, Decimal>,
        nav: Decimal,
    ) {
        for (symbol, weight) in targets.iter() {
            let Some(&price) = latest_prices.get(symbol) else {
                debug!(%symbol, "Skipping: no latest price");
                skipped.push(SkippedSymbol {
                    symbol: symbol.clone(),
                    reason: SkipReason::UnknownPrice,
                });
                continue;
            };
            if price <= Decimal::ZERO {
                skipped.push(SkippedSymbol {
                    symbol: symbol.clone(),
                    reason: SkipReason::UnknownPrice,
                });
                continue;
            }

            let held = holdings.get(symbol).copied().unwrap_or(Decimal::ZERO);
            let target_dollar =
                Decimal::from_f64_retain(*weight).unwrap_or(Decimal::ZERO) * nav;
            let delta = target_dollar - held * price;

            if delta.abs() < self.dust_threshold {
                skipped.push(SkippedSymbol {
                    symbol: symbol.clone(),
                    reason: SkipReason::Dust,
                });
                continue;
            }

            let raw_qty = (delta.abs() / price).floor();
            let (side, qty) = if delta > Decimal::ZERO {
                if *cash <= Decimal::ZERO {
                    skipped.push(SkippedSymbol {
                        symbol: symbol.clone(),
                        reason: SkipReason::NoCash,
                    });
                    continue;
                }
                let affordable = (*cash / price).floor();
                (OrderSide::Buy, raw_qty.min(affordable))
            } else {
                (OrderSide::Sell, raw_qty.min(held.floor()))
            };

            let Some(qty_shares) = qty.to_u64().filter(|&q| q > 0) else {
                skipped.push(SkippedSymbol {
                    symbol: symbol.clone(),
                    reason: SkipReason::ZeroQuantity,
                });
                continue;
            };
            let qty = Decimal::from(qty_shares);

            match side {
                OrderSide::Buy => *cash -= qty * price,
                OrderSide::Sell => *cash += qty * price,
            }
            let entry = holdings.entry(symbol.clone()).or_insert(Decimal::ZERO);
            match side {
                OrderSide::Buy => *entry += qty,
                OrderSide::Sell => *entry -= qty,
            }

            orders.push(OrderInstruction {
                symbol: symbol.clone(),
                side,
                qty: qty_shares,
                price,
                timestamp: Utc::now(),
                cash_after: *cash,
            });
        }
    }
}
