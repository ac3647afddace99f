//! Paper trading simulator.
//!
//! Turns a run's candidates into simulated orders. Each instrument moves
//! `FLAT -> HELD -> FLAT`: exits are evaluated first, on the held
//! instrument's own trajectory and the overall market state, then new
//! entries are opened for candidates above the regime threshold. Every
//! order is applied to the ledger, position and account as one
//! transaction; a cycle-wide lock serializes the cash checks.

pub mod ledger;
pub mod risk;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::calendar::SessionClock;
use crate::config::{PaperConfig, RegimeConfig};
use crate::engine::enricher::MarketView;
use crate::scoring::features;
use crate::storage::ledger::FillResult;
use crate::storage::Store;
use crate::types::{
    Candidate, CoreError, CoreResult, MarketLabel, MarketState, OrderSide, PaperAccount, PaperOrder,
    PaperPosition, RegimeLabel,
};

use self::ledger::CostModel;
use self::risk::{allocation, quantity, RejectionReason, RiskLimits};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// What the simulator knows about one instrument this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentMark {
    pub price: Decimal,
    pub return_1h: Option<f64>,
    pub drawdown_20: Option<f64>,
}

/// Marks for every freshly priced instrument in the view, held or not.
pub fn marks_from_view(view: &MarketView) -> BTreeMap<String, InstrumentMark> {
    view.instruments
        .iter()
        .filter_map(|d| {
            let price = d.price?;
            Some((
                d.instrument.id.clone(),
                InstrumentMark {
                    price,
                    return_1h: features::return_1h(&d.bars),
                    drawdown_20: features::drawdown_20(&d.bars),
                },
            ))
        })
        .collect()
}

/// Why a held position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrendBreak,
    RiskOffLoser,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop-loss",
            ExitReason::TakeProfit => "take-profit",
            ExitReason::TrendBreak => "trend-break",
            ExitReason::RiskOffLoser => "risk-off loser",
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PaperCycleReport {
    pub entries: Vec<PaperOrder>,
    pub exits: Vec<PaperOrder>,
    pub skipped: Vec<(String, RejectionReason)>,
    pub realized: Decimal,
    pub account: PaperAccount,
    pub open_positions: usize,
    pub threshold: f64,
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct PaperSimulator {
    store: Store,
    config: PaperConfig,
    regimes: RegimeConfig,
    clock: SessionClock,
    costs: CostModel,
    limits: RiskLimits,
    account_lock: Mutex<()>,
}

impl PaperSimulator {
    pub fn new(store: Store, config: PaperConfig, regimes: RegimeConfig, clock: SessionClock) -> Self {
        let costs = CostModel::new(config.fee_bps, config.slippage_bps);
        let limits = RiskLimits {
            max_positions: config.max_positions,
            max_trades_per_day: config.max_trades_per_day,
        };
        Self {
            store,
            config,
            regimes,
            clock,
            costs,
            limits,
            account_lock: Mutex::new(()),
        }
    }

    /// Pure exit rule for one held position.
    pub fn exit_reason(
        &self,
        position: &PaperPosition,
        mark: &InstrumentMark,
        market: &MarketState,
    ) -> Option<ExitReason> {
        if let Some(r) = mark.return_1h {
            if r <= self.config.stop_loss_return_1h {
                return Some(ExitReason::StopLoss);
            }
            if r >= self.config.take_profit_return_1h {
                return Some(ExitReason::TakeProfit);
            }
        }
        if mark.drawdown_20.is_some_and(|d| d < self.config.trend_break_drawdown) {
            return Some(ExitReason::TrendBreak);
        }
        if self.config.exit_losers_on_risk_off
            && market.label == MarketLabel::RiskOff
            && position.unrealized_return(mark.price) < 0.0
        {
            return Some(ExitReason::RiskOffLoser);
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn order(
        &self,
        run_id: &str,
        instrument_id: &str,
        side: OrderSide,
        qty: i64,
        price: Decimal,
        reason: &str,
        now: DateTime<Utc>,
    ) -> PaperOrder {
        let (fee, slippage) = self.costs.costs(price * Decimal::from(qty));
        PaperOrder {
            order_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            instrument_id: instrument_id.to_string(),
            side,
            quantity: qty,
            price,
            fee,
            slippage,
            reason: reason.to_string(),
            timestamp: now,
        }
    }

    async fn trades_today(&self, now: DateTime<Utc>) -> CoreResult<usize> {
        let (from, to) = self.clock.day_bounds(self.clock.local_date(now));
        Ok(self.store.orders_between(from, to).await?.len())
    }

    /// Evaluate exits and entries for one run.
    pub async fn run_cycle(
        &self,
        run_id: &str,
        candidates: &[Candidate],
        regime: RegimeLabel,
        market: &MarketState,
        marks: &BTreeMap<String, InstrumentMark>,
        now: DateTime<Utc>,
    ) -> CoreResult<PaperCycleReport> {
        let _guard = self.account_lock.lock().await;
        let params = self.regimes.params(regime);

        let mut account = self.store.ensure_account(self.config.initial_cash, now).await?;
        let mut trades_today = self.trades_today(now).await?;
        let mut realized = Decimal::ZERO;
        let mut exits = Vec::new();
        let mut exited = BTreeSet::new();

        // -- Exits ---------------------------------------------------------
        for position in self.store.open_positions().await? {
            let Some(mark) = marks.get(&position.instrument_id) else {
                debug!(instrument = %position.instrument_id, "No fresh price, holding");
                continue;
            };
            let Some(reason) = self.exit_reason(&position, mark, market) else {
                continue;
            };
            if let Err(r) = self.limits.check_trade(trades_today) {
                warn!(instrument = %position.instrument_id, reason = %r, "Exit deferred");
                continue;
            }
            let order = self.order(
                run_id,
                &position.instrument_id,
                OrderSide::Sell,
                position.quantity,
                mark.price,
                reason.as_str(),
                now,
            );
            match self.store.apply_fill(&order).await {
                Ok(FillResult::Applied { account: a, realized: pnl }) => {
                    account = a;
                    realized += pnl.unwrap_or(Decimal::ZERO);
                    trades_today += 1;
                    exited.insert(position.instrument_id.clone());
                    info!(order = %order, "Paper exit");
                    exits.push(order);
                }
                Ok(FillResult::Duplicate) => {
                    exited.insert(position.instrument_id.clone());
                    debug!(instrument = %position.instrument_id, "Exit already recorded for this run");
                }
                Err(CoreError::ConstraintViolation(msg)) => {
                    warn!(instrument = %position.instrument_id, reason = %msg, "Exit rejected");
                }
                Err(e) => return Err(e),
            }
        }

        // -- Entries -------------------------------------------------------
        let held: BTreeSet<String> = self
            .store
            .open_positions()
            .await?
            .into_iter()
            .map(|p| p.instrument_id)
            .collect();
        let mut open = held.len();
        let max_open = self.limits.effective_max_positions(params.position_scale);
        let slots = max_open.saturating_sub(open);
        let trades_left = self.config.max_trades_per_day.saturating_sub(trades_today);
        let alloc = allocation(account.cash, slots, trades_left, params.position_scale);

        let mut entries = Vec::new();
        let mut skipped = Vec::new();
        let mut ranked: Vec<&Candidate> = candidates.iter().collect();
        ranked.sort_by_key(|c| c.rank);

        for c in ranked {
            let id = c.instrument_id.clone();
            if c.score < params.threshold {
                skipped.push((
                    id,
                    RejectionReason::BelowThreshold {
                        score: c.score,
                        threshold: params.threshold,
                    },
                ));
                continue;
            }
            if held.contains(&id) || entries.iter().any(|o: &PaperOrder| o.instrument_id == id) {
                skipped.push((id, RejectionReason::AlreadyHeld));
                continue;
            }
            if exited.contains(&id) {
                skipped.push((id, RejectionReason::ExitedThisCycle));
                continue;
            }
            if let Err(r) = self.limits.check_entry(open, max_open, trades_today) {
                skipped.push((id, r));
                continue;
            }
            let price = marks.get(&id).map(|m| m.price).unwrap_or(c.price);
            let qty = quantity(alloc.min(account.cash), price, &self.costs);
            if qty < 1 {
                skipped.push((
                    id,
                    RejectionReason::InsufficientCash {
                        needed: price * self.costs.buy_factor(),
                        available: account.cash,
                    },
                ));
                continue;
            }

            let reason = format!("rank {} score {:.2} ({regime})", c.rank, c.score);
            let order = self.order(run_id, &id, OrderSide::Buy, qty, price, &reason, now);
            match self.store.apply_fill(&order).await {
                Ok(FillResult::Applied { account: a, .. }) => {
                    account = a;
                    open += 1;
                    trades_today += 1;
                    info!(order = %order, "Paper entry");
                    entries.push(order);
                }
                Ok(FillResult::Duplicate) => {
                    skipped.push((id, RejectionReason::Ledger("entry already recorded for this run".into())));
                }
                Err(CoreError::ConstraintViolation(msg)) => {
                    skipped.push((id, RejectionReason::Ledger(msg)));
                }
                Err(e) => return Err(e),
            }
        }

        for (id, reason) in &skipped {
            debug!(instrument = %id, %reason, "Candidate not traded");
        }
        info!(
            run_id,
            %regime,
            entries = entries.len(),
            exits = exits.len(),
            skipped = skipped.len(),
            open,
            cash = %account.cash.round_dp(2),
            "Paper cycle done"
        );

        Ok(PaperCycleReport {
            entries,
            exits,
            skipped,
            realized,
            account,
            open_positions: open,
            threshold: params.threshold,
        })
    }

    /// Re-mark held positions at the latest prices.
    pub async fn mark(
        &self,
        marks: &BTreeMap<String, InstrumentMark>,
        now: DateTime<Utc>,
    ) -> CoreResult<PaperAccount> {
        let _guard = self.account_lock.lock().await;
        self.store.ensure_account(self.config.initial_cash, now).await?;
        let prices: BTreeMap<String, Decimal> = marks.iter().map(|(k, m)| (k.clone(), m.price)).collect();
        self.store.mark_positions(&prices, now).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 6, 2, 0, 0).unwrap()
    }

    fn clock() -> SessionClock {
        SessionClock::new(
            9,
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
        )
        .unwrap()
    }

    fn candidate(id: &str, rank: u32, score: f64, price: Decimal) -> Candidate {
        Candidate {
            run_id: "run-1".into(),
            instrument_id: id.into(),
            name: id.into(),
            rank,
            score,
            price,
            features: BTreeMap::new(),
            contributions: BTreeMap::new(),
            rationale: String::new(),
        }
    }

    fn mark(price: Decimal, r1h: f64) -> InstrumentMark {
        InstrumentMark {
            price,
            return_1h: Some(r1h),
            drawdown_20: Some(-0.01),
        }
    }

    fn marks_for(cands: &[Candidate], r1h: f64) -> BTreeMap<String, InstrumentMark> {
        cands
            .iter()
            .map(|c| (c.instrument_id.clone(), mark(c.price, r1h)))
            .collect()
    }

    async fn simulator(config: PaperConfig) -> (Store, PaperSimulator) {
        let store = Store::in_memory().await.unwrap();
        let sim = PaperSimulator::new(store.clone(), config, RegimeConfig::default(), clock());
        (store, sim)
    }

    #[tokio::test]
    async fn test_entries_respect_threshold_and_cap() {
        let (store, sim) = simulator(PaperConfig::default()).await;
        let cands = vec![
            candidate("A", 1, 70.0, dec!(100)),
            candidate("B", 2, 60.0, dec!(50)),
            candidate("C", 3, 56.0, dec!(20)),
            candidate("D", 4, 54.0, dec!(10)),
        ];
        let marks = marks_for(&cands, 0.01);

        let report = sim
            .run_cycle("run-1", &cands, RegimeLabel::Neutral, &MarketState::neutral(), &marks, now())
            .await
            .unwrap();
        assert_eq!(report.entries.len(), 3);
        assert!(report
            .skipped
            .iter()
            .any(|(id, r)| id == "D" && matches!(r, RejectionReason::BelowThreshold { .. })));
        assert_eq!(store.open_positions().await.unwrap().len(), 3);
        assert!(report.account.cash >= Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_conservative_regime_shrinks_book() {
        let (_, sim) = simulator(PaperConfig::default()).await;
        let cands = vec![
            candidate("A", 1, 80.0, dec!(100)),
            candidate("B", 2, 75.0, dec!(100)),
            candidate("C", 3, 70.0, dec!(100)),
        ];
        let marks = marks_for(&cands, 0.01);
        let report = sim
            .run_cycle("run-1", &cands, RegimeLabel::Conservative, &MarketState::neutral(), &marks, now())
            .await
            .unwrap();
        // 3 × 0.6 rounds to 2
        assert_eq!(report.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_aggressive_regime_buys_larger_positions() {
        let cands = vec![candidate("A", 1, 80.0, dec!(100))];
        let marks: BTreeMap<_, _> = [("A".to_string(), mark(dec!(100), 0.01))].into();
        let mut sizes = Vec::new();
        for regime in [RegimeLabel::Neutral, RegimeLabel::Aggressive] {
            let (_, sim) = simulator(PaperConfig::default()).await;
            let report = sim
                .run_cycle("run-1", &cands, regime, &MarketState::neutral(), &marks, now())
                .await
                .unwrap();
            assert_eq!(report.entries.len(), 1);
            sizes.push(report.entries[0].quantity);
        }
        assert!(sizes[1] > sizes[0], "aggressive {} vs neutral {}", sizes[1], sizes[0]);
    }

    #[tokio::test]
    async fn test_stop_loss_exit_runs_before_entries() {
        let (store, sim) = simulator(PaperConfig::default()).await;
        let first = vec![candidate("A", 1, 70.0, dec!(100))];
        let marks: BTreeMap<_, _> = [("A".to_string(), mark(dec!(100), 0.01))].into();
        sim.run_cycle("run-1", &first, RegimeLabel::Neutral, &MarketState::neutral(), &marks, now())
            .await
            .unwrap();

        let crash: BTreeMap<_, _> = [("A".to_string(), mark(dec!(95), -0.05))].into();
        let later = now() + chrono::Duration::hours(1);
        let report = sim
            .run_cycle("run-2", &first, RegimeLabel::Neutral, &MarketState::neutral(), &crash, later)
            .await
            .unwrap();
        assert_eq!(report.exits.len(), 1);
        assert_eq!(report.exits[0].reason, "stop-loss");
        assert!(report.realized < Decimal::ZERO);
        assert!(report.entries.is_empty());
        assert!(store.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_risk_off_closes_losers_only() {
        let (_, sim) = simulator(PaperConfig::default()).await;
        let market = MarketState {
            label: MarketLabel::RiskOff,
            ..MarketState::neutral()
        };
        let pos = PaperPosition {
            instrument_id: "A".into(),
            quantity: 10,
            average_cost: dec!(100),
            opened_at: now(),
            last_price: dec!(100),
        };
        assert_eq!(
            sim.exit_reason(&pos, &mark(dec!(99), 0.0), &market),
            Some(ExitReason::RiskOffLoser)
        );
        assert_eq!(sim.exit_reason(&pos, &mark(dec!(101), 0.0), &market), None);
        assert_eq!(sim.exit_reason(&pos, &mark(dec!(99), 0.0), &MarketState::neutral()), None);
    }

    #[tokio::test]
    async fn test_daily_trade_cap() {
        let config = PaperConfig {
            max_trades_per_day: 2,
            max_positions: 5,
            ..PaperConfig::default()
        };
        let (_, sim) = simulator(config).await;
        let cands: Vec<Candidate> = (1..=4).map(|i| candidate(&format!("I{i}"), i, 80.0, dec!(10))).collect();
        let marks = marks_for(&cands, 0.0);
        let report = sim
            .run_cycle("run-1", &cands, RegimeLabel::Neutral, &MarketState::neutral(), &marks, now())
            .await
            .unwrap();
        assert_eq!(report.entries.len(), 2);
        assert!(report
            .skipped
            .iter()
            .any(|(_, r)| matches!(r, RejectionReason::TradeCap { .. })));
    }

    #[tokio::test]
    async fn test_rerun_of_same_run_is_absorbed() {
        let (store, sim) = simulator(PaperConfig::default()).await;
        let cands = vec![candidate("A", 1, 70.0, dec!(100))];
        let marks: BTreeMap<_, _> = [("A".to_string(), mark(dec!(100), 0.0))].into();
        sim.run_cycle("run-1", &cands, RegimeLabel::Neutral, &MarketState::neutral(), &marks, now())
            .await
            .unwrap();
        let again = sim
            .run_cycle("run-1", &cands, RegimeLabel::Neutral, &MarketState::neutral(), &marks, now())
            .await
            .unwrap();
        assert!(again.entries.is_empty());
        assert_eq!(store.all_orders().await.unwrap().len(), 1);
    }
}
