//! Cost model and ledger replay.
//!
//! The order table is the source of truth: replaying it in timestamp
//! order reconstructs every position and every realized P&L figure. The
//! stored positions and account are a cached view of the same thing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

use crate::types::{OrderSide, PaperOrder};

const BPS: Decimal = dec!(10000);

/// Basis-point fee and slippage charged on notional at entry and exit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    pub fee_bps: Decimal,
    pub slippage_bps: Decimal,
}

impl CostModel {
    pub fn new(fee_bps: Decimal, slippage_bps: Decimal) -> Self {
        Self { fee_bps, slippage_bps }
    }

    /// (fee, slippage) for a notional amount.
    pub fn costs(&self, notional: Decimal) -> (Decimal, Decimal) {
        (notional * self.fee_bps / BPS, notional * self.slippage_bps / BPS)
    }

    /// Cash consumed per unit of notional on a buy.
    pub fn buy_factor(&self) -> Decimal {
        Decimal::ONE + (self.fee_bps + self.slippage_bps) / BPS
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayPosition {
    pub quantity: i64,
    pub average_cost: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealizedFill {
    pub instrument_id: String,
    pub timestamp: DateTime<Utc>,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerReplay {
    /// Open positions only.
    pub positions: BTreeMap<String, ReplayPosition>,
    pub realized: Vec<RealizedFill>,
    /// Sum of cash deltas over all orders.
    pub net_cash_flow: Decimal,
}

impl LedgerReplay {
    pub fn realized_total(&self) -> Decimal {
        self.realized.iter().map(|r| r.pnl).sum()
    }

    /// Realized P&L of fills with `from <= ts < to`.
    pub fn realized_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Decimal {
        self.realized
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp < to)
            .map(|r| r.pnl)
            .sum()
    }
}

/// Rebuild positions and realized P&L from the order list. Sells beyond
/// the held quantity are clamped to what was held.
pub fn replay(orders: &[PaperOrder]) -> LedgerReplay {
    let mut sorted: Vec<&PaperOrder> = orders.iter().collect();
    sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.order_id.cmp(&b.order_id)));

    let mut out = LedgerReplay::default();
    for o in sorted {
        out.net_cash_flow += o.cash_delta();
        match o.side {
            OrderSide::Buy => {
                let all_in = o.notional() + o.fee + o.slippage;
                let pos = out.positions.entry(o.instrument_id.clone()).or_insert(ReplayPosition {
                    quantity: 0,
                    average_cost: Decimal::ZERO,
                });
                let held = Decimal::from(pos.quantity);
                let qty = Decimal::from(o.quantity);
                if held + qty > Decimal::ZERO {
                    pos.average_cost = (pos.average_cost * held + all_in) / (held + qty);
                }
                pos.quantity += o.quantity;
            }
            OrderSide::Sell => {
                let Some(pos) = out.positions.get_mut(&o.instrument_id) else {
                    continue;
                };
                let qty = o.quantity.min(pos.quantity);
                let proceeds = o.cash_delta() * Decimal::from(qty) / Decimal::from(o.quantity.max(1));
                out.realized.push(RealizedFill {
                    instrument_id: o.instrument_id.clone(),
                    timestamp: o.timestamp,
                    pnl: proceeds - pos.average_cost * Decimal::from(qty),
                });
                pos.quantity -= qty;
                if pos.quantity == 0 {
                    out.positions.remove(&o.instrument_id);
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn order(id: &str, side: OrderSide, qty: i64, price: Decimal, hours: i64) -> PaperOrder {
        let costs = CostModel::new(dec!(1.5), dec!(3.0));
        let (fee, slippage) = costs.costs(price * Decimal::from(qty));
        PaperOrder {
            order_id: id.into(),
            run_id: format!("run-{id}"),
            instrument_id: "AAA".into(),
            side,
            quantity: qty,
            price,
            fee,
            slippage,
            reason: "test".into(),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 6, 1, 0, 0).unwrap() + Duration::hours(hours),
        }
    }

    #[test]
    fn test_costs() {
        let c = CostModel::new(dec!(1.5), dec!(3.0));
        assert_eq!(c.costs(dec!(100000)), (dec!(15), dec!(30)));
        assert_eq!(c.buy_factor(), dec!(1.00045));
    }

    #[test]
    fn test_replay_round_trip_realizes_pnl() {
        let orders = vec![
            order("2", OrderSide::Sell, 10, dec!(110), 2),
            order("1", OrderSide::Buy, 10, dec!(100), 0),
        ];
        let r = replay(&orders);
        assert!(r.positions.is_empty());
        assert_eq!(r.realized.len(), 1);
        // bought 1000.45 all-in, sold 1100 - 0.495 costs
        assert_eq!(r.realized_total(), dec!(1100) - dec!(0.495) - dec!(1000.45));
        assert_eq!(r.net_cash_flow, r.realized_total());
    }

    #[test]
    fn test_replay_partial_and_average_cost() {
        let orders = vec![
            order("1", OrderSide::Buy, 10, dec!(100), 0),
            order("2", OrderSide::Buy, 10, dec!(120), 1),
            order("3", OrderSide::Sell, 5, dec!(130), 2),
        ];
        let r = replay(&orders);
        let pos = &r.positions["AAA"];
        assert_eq!(pos.quantity, 15);
        assert_eq!(pos.average_cost, dec!(110.0495));
    }

    #[test]
    fn test_realized_between_windows() {
        let orders = vec![
            order("1", OrderSide::Buy, 10, dec!(100), 0),
            order("2", OrderSide::Sell, 10, dec!(90), 30),
        ];
        let r = replay(&orders);
        let t0 = orders[0].timestamp;
        assert_eq!(r.realized_between(t0, t0 + Duration::hours(24)), Decimal::ZERO);
        assert!(r.realized_between(t0 + Duration::hours(24), t0 + Duration::hours(48)) < Decimal::ZERO);
    }
}
