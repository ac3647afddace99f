//! Daily regime classification.
//!
//! Reads the recent 1d outcomes and the paper ledger's realized P&L for
//! the day, and labels the next trading day CONSERVATIVE, NEUTRAL or
//! AGGRESSIVE. Too few samples always means NEUTRAL.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use tracing::info;

use super::stats::mean;
use crate::calendar::SessionClock;
use crate::config::RegimeConfig;
use crate::paper::ledger::replay;
use crate::storage::Store;
use crate::types::{CoreResult, Horizon, OrderSide, Regime, RegimeLabel};

/// Upper bound on outcomes read for one classification.
const MAX_REGIME_SAMPLES: usize = 5_000;

#[derive(Debug, Clone, PartialEq)]
pub struct RegimeStats {
    pub sample_count: usize,
    pub win_rate: f64,
    pub avg_return: f64,
    pub day_pnl: Decimal,
}

impl RegimeStats {
    pub fn from_returns(returns: &[f64], day_pnl: Decimal) -> Self {
        let n = returns.len();
        let win_rate = if n == 0 {
            0.0
        } else {
            returns.iter().filter(|r| **r > 0.0).count() as f64 / n as f64
        };
        Self {
            sample_count: n,
            win_rate,
            avg_return: mean(returns).unwrap_or(0.0),
            day_pnl,
        }
    }
}

/// Thresholded label for a set of statistics.
pub fn classify(stats: &RegimeStats, cfg: &RegimeConfig) -> RegimeLabel {
    if stats.sample_count < cfg.min_samples {
        return RegimeLabel::Neutral;
    }
    if stats.win_rate >= cfg.aggressive_win_rate
        && stats.avg_return >= cfg.aggressive_avg_return
        && stats.day_pnl >= Decimal::ZERO
    {
        return RegimeLabel::Aggressive;
    }
    if stats.win_rate <= cfg.conservative_win_rate
        || stats.avg_return <= cfg.conservative_avg_return
        || stats.day_pnl < Decimal::ZERO
    {
        return RegimeLabel::Conservative;
    }
    RegimeLabel::Neutral
}

pub struct RegimeClassifier {
    store: Store,
    config: RegimeConfig,
    clock: SessionClock,
}

impl RegimeClassifier {
    pub fn new(store: Store, config: RegimeConfig, clock: SessionClock) -> Self {
        Self { store, config, clock }
    }

    pub async fn stats(&self, as_of: DateTime<Utc>) -> CoreResult<RegimeStats> {
        let since = as_of - Duration::days(self.config.lookback_days);
        let returns: Vec<f64> = self
            .store
            .outcome_samples(Horizon::D1, since, as_of, MAX_REGIME_SAMPLES)
            .await?
            .into_iter()
            .map(|s| s.realized_return)
            .collect();

        let (from, to) = self.clock.day_bounds(self.clock.local_date(as_of));
        let to = to.min(as_of + Duration::seconds(1));
        let day_pnl = self.day_pnl(from, to).await?;

        Ok(RegimeStats::from_returns(&returns, day_pnl))
    }

    /// Realized P&L of the sells in `[from, to)`. Only instruments sold in
    /// the window are replayed, each up to `to` for its cost basis.
    async fn day_pnl(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<Decimal> {
        let orders = self.store.orders_between(from, to).await?;
        let sold: BTreeSet<&str> = orders
            .iter()
            .filter(|o| o.side == OrderSide::Sell)
            .map(|o| o.instrument_id.as_str())
            .collect();

        let mut pnl = Decimal::ZERO;
        for id in sold {
            let history = self.store.instrument_orders_before(id, to).await?;
            pnl += replay(&history).realized_between(from, to);
        }
        Ok(pnl)
    }

    /// Classify and record the regime for `target`. If one is already
    /// recorded for that day it is kept and returned.
    pub async fn run(&self, as_of: DateTime<Utc>, target: NaiveDate) -> CoreResult<(Regime, bool)> {
        let stats = self.stats(as_of).await?;
        let regime = Regime {
            date: target,
            label: classify(&stats, &self.config),
            sample_count: stats.sample_count,
            win_rate: stats.win_rate,
            avg_return: stats.avg_return,
            day_pnl: stats.day_pnl,
        };
        let inserted = self.store.insert_regime(&regime, as_of).await?;
        if !inserted {
            if let Some(existing) = self.store.regime_on(target).await? {
                info!(%target, label = %existing.label, "Regime already recorded");
                return Ok((existing, false));
            }
        }
        info!(
            %target,
            label = %regime.label,
            samples = regime.sample_count,
            win_rate = format!("{:.1}%", regime.win_rate * 100.0),
            avg_return = format!("{:+.3}%", regime.avg_return * 100.0),
            day_pnl = %regime.day_pnl.round_dp(2),
            "Regime classified"
        );
        Ok((regime, inserted))
    }

    /// Regime in force on `date`: the latest one recorded on or before it,
    /// NEUTRAL when none was ever recorded.
    pub async fn effective(&self, date: NaiveDate) -> CoreResult<RegimeLabel> {
        Ok(self
            .store
            .regime_effective(date)
            .await?
            .map(|r| r.label)
            .unwrap_or(RegimeLabel::Neutral))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
