//! Shared types for FlowScout.
//!
//! These types form the data model used across all modules: market
//! observations, runs and their candidates, tracked outcomes, the
//! versioned weight log, regimes, and the paper-trading ledger.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// A tradeable instrument in the scanned universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: String,
    pub name: String,
    /// Sector label used for breadth/rotation features.
    #[serde(default)]
    pub sector: Option<String>,
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sector {
            Some(s) => write!(f, "{} ({}) [{}]", self.name, self.id, s),
            None => write!(f, "{} ({})", self.name, self.id),
        }
    }
}

/// One OHLCV bar. Statistics are computed in `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Traded value of the bar (close × volume).
    pub fn turnover(&self) -> f64 {
        self.close * self.volume
    }

    /// A flat bar built from a stored price snapshot.
    pub fn from_snapshot(snapshot: &PriceSnapshot) -> Self {
        let px = snapshot.price_f64();
        Self {
            ts: snapshot.observed_at,
            open: px,
            high: px,
            low: px,
            close: px,
            volume: snapshot.volume,
        }
    }
}

/// A per-cycle price/volume observation. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub instrument_id: String,
    pub observed_at: DateTime<Utc>,
    pub price: Decimal,
    pub volume: f64,
}

impl PriceSnapshot {
    pub fn price_f64(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.price.to_f64().unwrap_or(0.0)
    }
}

/// Broad market classification used by exits and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketLabel {
    RiskOn,
    Neutral,
    Volatile,
    RiskOff,
}

impl fmt::Display for MarketLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketLabel::RiskOn => write!(f, "risk-on"),
            MarketLabel::Neutral => write!(f, "neutral"),
            MarketLabel::Volatile => write!(f, "volatile"),
            MarketLabel::RiskOff => write!(f, "risk-off"),
        }
    }
}

/// Market-wide state derived from the index series and universe breadth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    pub label: MarketLabel,
    /// 0 (calm) to 100 (stressed).
    pub risk_score: f64,
    /// Share of the universe with a positive last return.
    pub breadth: f64,
    pub index_ret_1d: Option<f64>,
    pub index_ret_5d: Option<f64>,
    pub index_vol_20: Option<f64>,
}

impl MarketState {
    pub fn neutral() -> Self {
        Self {
            label: MarketLabel::Neutral,
            risk_score: 50.0,
            breadth: 0.5,
            index_ret_1d: None,
            index_ret_5d: None,
            index_vol_20: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Runs and candidates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(CoreError::Config(format!("unknown run status '{other}'"))),
        }
    }
}

/// One scheduled scan cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub cycle_ts: DateTime<Utc>,
    pub status: RunStatus,
    /// Number of instruments scored in this cycle.
    pub universe_size: usize,
}

/// An instrument selected and scored in a given run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub run_id: String,
    pub instrument_id: String,
    pub name: String,
    /// 1-based rank within the run.
    pub rank: u32,
    pub score: f64,
    /// Reference price at the cycle timestamp.
    pub price: Decimal,
    /// Raw feature values (after neutral substitution).
    pub features: BTreeMap<String, f64>,
    /// Per-feature score contribution (weight × normalised value × 100).
    pub contributions: BTreeMap<String, f64>,
    pub rationale: String,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} ({}) score {:.2} @ {}",
            self.rank, self.name, self.instrument_id, self.score, self.price
        )
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Forward window over which a candidate's performance is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Horizon {
    H1,
    H4,
    D1,
}

impl Horizon {
    pub const ALL: [Horizon; 3] = [Horizon::H1, Horizon::H4, Horizon::D1];

    pub fn duration(&self) -> Duration {
        match self {
            Horizon::H1 => Duration::hours(1),
            Horizon::H4 => Duration::hours(4),
            Horizon::D1 => Duration::days(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Horizon::H1 => "1h",
            Horizon::H4 => "4h",
            Horizon::D1 => "1d",
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Horizon {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(Horizon::H1),
            "4h" => Ok(Horizon::H4),
            "1d" => Ok(Horizon::D1),
            other => Err(CoreError::Config(format!("unknown horizon '{other}'"))),
        }
    }
}

/// Realized forward return of a candidate at a fixed horizon. Written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub run_id: String,
    pub instrument_id: String,
    pub horizon: Horizon,
    pub cycle_ts: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub exit_observed_at: DateTime<Utc>,
    pub realized_return: f64,
}

// ---------------------------------------------------------------------------
// Weights and regimes
// ---------------------------------------------------------------------------

/// One version of the scoring weights. Versions are appended, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSet {
    pub version: i64,
    pub effective_from: NaiveDate,
    pub weights: BTreeMap<String, f64>,
    pub note: String,
}

impl WeightSet {
    pub fn weight(&self, feature: &str) -> f64 {
        self.weights.get(feature).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.weights.values().sum()
    }
}

/// Daily risk posture driving entry aggressiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegimeLabel {
    Conservative,
    Neutral,
    Aggressive,
}

impl fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegimeLabel::Conservative => write!(f, "CONSERVATIVE"),
            RegimeLabel::Neutral => write!(f, "NEUTRAL"),
            RegimeLabel::Aggressive => write!(f, "AGGRESSIVE"),
        }
    }
}

impl FromStr for RegimeLabel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CONSERVATIVE" => Ok(RegimeLabel::Conservative),
            "NEUTRAL" => Ok(RegimeLabel::Neutral),
            "AGGRESSIVE" => Ok(RegimeLabel::Aggressive),
            other => Err(CoreError::Config(format!("unknown regime '{other}'"))),
        }
    }
}

/// The regime recorded for one trading day, with the statistics behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regime {
    pub date: NaiveDate,
    pub label: RegimeLabel,
    pub sample_count: usize,
    pub win_rate: f64,
    pub avg_return: f64,
    pub day_pnl: Decimal,
}

// ---------------------------------------------------------------------------
// Paper trading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
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

impl FromStr for OrderSide {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(CoreError::Config(format!("unknown order side '{other}'"))),
        }
    }
}

/// Single simulated account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperAccount {
    pub cash: Decimal,
    pub nav: Decimal,
    pub realized_pnl: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Open simulated holding. Exists only while quantity > 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperPosition {
    pub instrument_id: String,
    pub quantity: i64,
    /// All-in cost per unit, fees and slippage included.
    pub average_cost: Decimal,
    pub opened_at: DateTime<Utc>,
    pub last_price: Decimal,
}

impl PaperPosition {
    pub fn market_value(&self) -> Decimal {
        self.last_price * Decimal::from(self.quantity)
    }

    /// Unrealized return against the all-in cost.
    pub fn unrealized_return(&self, price: Decimal) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        if self.average_cost <= Decimal::ZERO {
            return 0.0;
        }
        ((price - self.average_cost) / self.average_cost)
            .to_f64()
            .unwrap_or(0.0)
    }
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperOrder {
    pub order_id: String,
    pub run_id: String,
    pub instrument_id: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: Decimal,
    pub fee: Decimal,
    pub slippage: Decimal,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl PaperOrder {
    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }

    /// Signed cash effect: negative for buys, positive for sells.
    pub fn cash_delta(&self) -> Decimal {
        match self.side {
            OrderSide::Buy => -(self.notional() + self.fee + self.slippage),
            OrderSide::Sell => self.notional() - self.fee - self.slippage,
        }
    }
}

impl fmt::Display for PaperOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} x{} @ {} (fee {}, slip {}) [{}]",
            self.side,
            self.instrument_id,
            self.quantity,
            self.price,
            self.fee.round_dp(2),
            self.slippage.round_dp(2),
            self.reason
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error taxonomy. Only universe-level data loss and persistence or
/// configuration failures abort a cycle.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Outside trading window: {0}")]
    SchedulingSkip(String),

    #[error("Cycle already run for boundary {0}")]
    AlreadyRun(String),

    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Provider timed out after {after_ms}ms: {what}")]
    ProviderTimeout { what: String, after_ms: u64 },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Weight delta for {feature} clamped: proposed {proposed:+.4}, cap {cap:.4}")]
    AdaptationBoundsExceeded {
        feature: String,
        proposed: f64,
        cap: f64,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialisation error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Whether the error aborts the current cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::DataUnavailable(_)
                | CoreError::Storage(_)
                | CoreError::Serde(_)
                | CoreError::Config(_)
        )
    }

    /// Expected no-ops that are reported at info level.
    pub fn is_noop(&self) -> bool {
        matches!(self, CoreError::SchedulingSkip(_) | CoreError::AlreadyRun(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_horizon_roundtrip_and_duration() {
        for h in Horizon::ALL {
            assert_eq!(h.as_str().parse::<Horizon>().unwrap(), h);
        }
        assert_eq!(Horizon::H4.duration(), Duration::hours(4));
        assert_eq!(Horizon::D1.duration(), Duration::hours(24));
        assert!("2d".parse::<Horizon>().is_err());
    }

    #[test]
    fn test_regime_label_parse_case_insensitive() {
        assert_eq!("neutral".parse::<RegimeLabel>().unwrap(), RegimeLabel::Neutral);
        assert_eq!("AGGRESSIVE".parse::<RegimeLabel>().unwrap(), RegimeLabel::Aggressive);
        assert_eq!(RegimeLabel::Conservative.to_string(), "CONSERVATIVE");
    }

    #[test]
    fn test_order_cash_delta() {
        let mut order = PaperOrder {
            order_id: "o1".into(),
            run_id: "r1".into(),
            instrument_id: "AAA".into(),
            side: OrderSide::Buy,
            quantity: 10,
            price: dec!(100),
            fee: dec!(0.15),
            slippage: dec!(0.30),
            reason: "entry".into(),
            timestamp: Utc::now(),
        };
        assert_eq!(order.cash_delta(), dec!(-1000.45));
        order.side = OrderSide::Sell;
        assert_eq!(order.cash_delta(), dec!(999.55));
    }

    #[test]
    fn test_position_unrealized_return() {
        let pos = PaperPosition {
            instrument_id: "AAA".into(),
            quantity: 5,
            average_cost: dec!(100),
            opened_at: Utc::now(),
            last_price: dec!(110),
        };
        assert!((pos.unrealized_return(dec!(110)) - 0.10).abs() < 1e-12);
        assert_eq!(pos.market_value(), dec!(550));
    }

    #[test]
    fn test_error_fatality() {
        assert!(CoreError::DataUnavailable("universe".into()).is_fatal());
        assert!(!CoreError::ProviderTimeout { what: "flow".into(), after_ms: 5000 }.is_fatal());
        assert!(!CoreError::ConstraintViolation("cash".into()).is_fatal());
        assert!(CoreError::AlreadyRun("2026-01-05T01:00:00Z".into()).is_noop());
        assert!(!CoreError::AdaptationBoundsExceeded {
            feature: "rs_5".into(),
            proposed: 0.05,
            cap: 0.03
        }
        .is_fatal());
    }
}
