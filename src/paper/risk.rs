//! Entry limits and position sizing.
//!
//! Caps on open positions and daily trades, regime-scaled allocation, and
//! the reasons a candidate is passed over. A rejection is an expected
//! filtering outcome; it is logged and the candidate is skipped.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::fmt;

use super::ledger::CostModel;
use crate::types::CoreError;

/// Why a candidate did not trade this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectionReason {
    BelowThreshold { score: f64, threshold: f64 },
    AlreadyHeld,
    ExitedThisCycle,
    PositionCap { open: usize, max: usize },
    TradeCap { today: usize, max: usize },
    InsufficientCash { needed: Decimal, available: Decimal },
    Ledger(String),
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::BelowThreshold { score, threshold } => {
                write!(f, "score {score:.2} below threshold {threshold:.0}")
            }
            RejectionReason::AlreadyHeld => write!(f, "already held"),
            RejectionReason::ExitedThisCycle => write!(f, "exited this cycle"),
            RejectionReason::PositionCap { open, max } => write!(f, "position cap {open}/{max}"),
            RejectionReason::TradeCap { today, max } => write!(f, "daily trade cap {today}/{max}"),
            RejectionReason::InsufficientCash { needed, available } => write!(
                f,
                "insufficient cash: need {}, have {}",
                needed.round_dp(2),
                available.round_dp(2)
            ),
            RejectionReason::Ledger(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<RejectionReason> for CoreError {
    fn from(r: RejectionReason) -> Self {
        CoreError::ConstraintViolation(r.to_string())
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskLimits {
    pub max_positions: usize,
    pub max_trades_per_day: usize,
}

impl RiskLimits {
    /// Position cap after regime scaling: never above the configured cap,
    /// never below one.
    pub fn effective_max_positions(&self, position_scale: f64) -> usize {
        let scaled = (self.max_positions as f64 * position_scale).round().max(1.0) as usize;
        scaled.min(self.max_positions)
    }

    pub fn check_trade(&self, trades_today: usize) -> Result<(), RejectionReason> {
        if trades_today >= self.max_trades_per_day {
            return Err(RejectionReason::TradeCap {
                today: trades_today,
                max: self.max_trades_per_day,
            });
        }
        Ok(())
    }

    pub fn check_entry(
        &self,
        open: usize,
        max_open: usize,
        trades_today: usize,
    ) -> Result<(), RejectionReason> {
        if open >= max_open {
            return Err(RejectionReason::PositionCap { open, max: max_open });
        }
        self.check_trade(trades_today)
    }
}

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// Cash allotted to each new entry this cycle: available cash split over
/// the entries that can still happen, times the regime scale. A scale
/// above one can overcommit; the caller bounds each fill by remaining cash.
pub fn allocation(cash: Decimal, slots: usize, trades_left: usize, position_scale: f64) -> Decimal {
    let ways = slots.min(trades_left);
    if ways == 0 || cash <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let scale = Decimal::from_f64(position_scale.max(0.0)).unwrap_or(Decimal::ONE);
    cash / Decimal::from(ways) * scale
}

/// Whole units affordable with `alloc` at `price`, costs included.
pub fn quantity(alloc: Decimal, price: Decimal, costs: &CostModel) -> i64 {
    if price <= Decimal::ZERO || alloc <= Decimal::ZERO {
        return 0;
    }
    (alloc / (price * costs.buy_factor())).floor().to_i64().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_positions: 3,
            max_trades_per_day: 10,
        }
    }

    #[test]
    fn test_effective_max_positions() {
        assert_eq!(limits().effective_max_positions(1.0), 3);
        assert_eq!(limits().effective_max_positions(0.6), 2);
        assert_eq!(limits().effective_max_positions(1.25), 3);
        assert_eq!(limits().effective_max_positions(0.0), 1);
    }

    #[test]
    fn test_caps() {
        assert!(limits().check_entry(2, 3, 9).is_ok());
        assert_eq!(
            limits().check_entry(3, 3, 0),
            Err(RejectionReason::PositionCap { open: 3, max: 3 })
        );
        assert_eq!(
            limits().check_entry(0, 3, 10),
            Err(RejectionReason::TradeCap { today: 10, max: 10 })
        );
    }

    #[test]
    fn test_sizing() {
        let costs = CostModel::new(dec!(1.5), dec!(3.0));
        let alloc = allocation(dec!(1000000), 3, 10, 1.0);
        assert_eq!(alloc.round_dp(2), dec!(333333.33));
        assert_eq!(quantity(alloc, dec!(100), &costs), 3331);
        assert_eq!(allocation(dec!(1000000), 3, 1, 1.0), dec!(1000000));
        assert_eq!(allocation(dec!(1000000), 2, 10, 0.5), dec!(250000));
        assert_eq!(quantity(dec!(50), dec!(100), &costs), 0);
    }

    #[test]
    fn test_aggressive_scale_sizes_up() {
        let costs = CostModel::new(dec!(1.5), dec!(3.0));
        let neutral = allocation(dec!(1000000), 3, 10, 1.0);
        let aggressive = allocation(dec!(1000000), 3, 10, 1.25);
        assert!(aggressive > neutral);
        assert_eq!(aggressive.round_dp(2), dec!(416666.67));
        assert!(quantity(aggressive, dec!(100), &costs) > quantity(neutral, dec!(100), &costs));
    }

    #[test]
    fn test_rejection_is_constraint_violation() {
        let e: CoreError = RejectionReason::AlreadyHeld.into();
        assert!(matches!(e, CoreError::ConstraintViolation(_)));
        assert!(!e.is_fatal());
    }
}
