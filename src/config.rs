//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section has defaults, so a partial file is valid. Secrets (bot token,
//! LLM API key) are referenced by env-var name in the config and resolved
//! at runtime.

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;

use crate::types::RegimeLabel;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub schedule: ScheduleConfig,
    pub scan: ScanConfig,
    pub provider: ProviderConfig,
    pub paper: PaperConfig,
    pub regime: RegimeConfig,
    pub adaptation: AdaptationConfig,
    pub lab: LabConfig,
    pub coordinator: CoordinatorConfig,
    pub status: StatusConfig,
    pub alerts: AlertsConfig,
    pub explainer: ExplainerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// SQLite database file.
    pub db_path: String,
    /// Market-local offset from UTC, in hours.
    pub utc_offset_hours: i32,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "FLOWSCOUT".to_string(),
            db_path: "flowscout.db".to_string(),
            utc_offset_hours: 9,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Session open, local "HH:MM".
    pub session_start: String,
    /// Session close, local "HH:MM" (inclusive).
    pub session_end: String,
    pub holidays: Vec<NaiveDate>,
    /// Daemon tick period.
    pub tick_secs: u64,
    /// Local "HH:MM" after which the nightly batch may run.
    pub nightly_at: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            session_start: "09:00".to_string(),
            session_end: "15:30".to_string(),
            holidays: Vec::new(),
            tick_secs: 60,
            nightly_at: "18:00".to_string(),
        }
    }
}

impl ScheduleConfig {
    pub fn session_window(&self) -> Result<(NaiveTime, NaiveTime)> {
        Ok((parse_hhmm(&self.session_start)?, parse_hhmm(&self.session_end)?))
    }

    pub fn nightly_time(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.nightly_at)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScanConfig {
    pub top_n: usize,
    /// Minimum latest-bar turnover (price × volume) to be a candidate.
    pub min_turnover: f64,
    pub max_abs_return_1h: f64,
    /// Bars of history requested per instrument.
    pub history_bars: usize,
    /// Bar length in minutes.
    pub bar_minutes: i64,
    /// Concurrent provider requests during enrichment.
    pub concurrency: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            top_n: 5,
            min_turnover: 1_000_000_000.0,
            max_abs_return_1h: 0.20,
            history_bars: 80,
            bar_minutes: 60,
            concurrency: 8,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProviderConfig {
    /// Directory of JSON fixtures for the replay provider.
    pub replay_dir: String,
    /// Bound on every provider call.
    pub timeout_secs: u64,
    /// NewsAPI key env var; headlines come from the replay dir when unset.
    pub news_api_key_env: Option<String>,
    pub news_query: String,
    /// Known high-impact dates (policy meetings, index rebalances).
    pub event_dates: Vec<NaiveDate>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            replay_dir: "data/replay".to_string(),
            timeout_secs: 10,
            news_api_key_env: None,
            news_query: "stock market".to_string(),
            event_dates: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PaperConfig {
    pub enabled: bool,
    pub initial_cash: Decimal,
    pub max_positions: usize,
    pub max_trades_per_day: usize,
    pub fee_bps: Decimal,
    pub slippage_bps: Decimal,
    /// Exit when the 1-bar return falls to or below this.
    pub stop_loss_return_1h: f64,
    /// Exit when the 1-bar return rises to or above this.
    pub take_profit_return_1h: f64,
    /// Exit when the 20-bar drawdown falls below this.
    pub trend_break_drawdown: f64,
    /// Close losing positions when the market state is risk-off.
    pub exit_losers_on_risk_off: bool,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_cash: dec!(1000000),
            max_positions: 3,
            max_trades_per_day: 10,
            fee_bps: dec!(1.5),
            slippage_bps: dec!(3.0),
            stop_loss_return_1h: -0.035,
            take_profit_return_1h: 0.06,
            trend_break_drawdown: -0.09,
            exit_losers_on_risk_off: true,
        }
    }
}

/// Entry threshold and sizing scale applied under a regime.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct RegimeParams {
    pub threshold: f64,
    pub position_scale: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegimeConfig {
    pub lookback_days: i64,
    pub min_samples: usize,
    pub aggressive_win_rate: f64,
    pub aggressive_avg_return: f64,
    pub conservative_win_rate: f64,
    pub conservative_avg_return: f64,
    pub conservative: RegimeParams,
    pub neutral: RegimeParams,
    pub aggressive: RegimeParams,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            lookback_days: 7,
            min_samples: 20,
            aggressive_win_rate: 0.58,
            aggressive_avg_return: 0.002,
            conservative_win_rate: 0.45,
            conservative_avg_return: -0.0015,
            conservative: RegimeParams { threshold: 62.0, position_scale: 0.6 },
            neutral: RegimeParams { threshold: 55.0, position_scale: 1.0 },
            aggressive: RegimeParams { threshold: 50.0, position_scale: 1.25 },
        }
    }
}

impl RegimeConfig {
    pub fn params(&self, label: RegimeLabel) -> RegimeParams {
        match label {
            RegimeLabel::Conservative => self.conservative,
            RegimeLabel::Neutral => self.neutral,
            RegimeLabel::Aggressive => self.aggressive,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AdaptationConfig {
    /// Maximum absolute per-feature weight change per night.
    pub daily_cap: f64,
    pub learning_rate: f64,
    /// Distinct days with 1d outcomes required before tuning.
    pub warmup_days: usize,
    pub min_samples: usize,
    pub min_feature_samples: usize,
    pub min_unique_values: usize,
    pub winsor_lower: f64,
    pub winsor_upper: f64,
    pub max_samples: usize,
    pub lookback_days: i64,
    /// Quintile return spread that maps to a full-strength signal.
    pub spread_scale: f64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            daily_cap: 0.03,
            learning_rate: 0.012,
            warmup_days: 14,
            min_samples: 60,
            min_feature_samples: 30,
            min_unique_values: 5,
            winsor_lower: 0.03,
            winsor_upper: 0.97,
            max_samples: 400,
            lookback_days: 30,
            spread_scale: 0.05,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LabConfig {
    pub thresholds: Vec<f64>,
    pub max_holdings: Vec<usize>,
    pub min_runs: usize,
    pub lookback_days: i64,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            thresholds: vec![48.0, 52.0, 55.0, 58.0, 62.0],
            max_holdings: vec![1, 2, 3, 4],
            min_runs: 25,
            lookback_days: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Liveness age after which the process is considered stalled.
    pub stale_after_secs: i64,
    /// A running marker older than this may be taken over.
    pub takeover_after_secs: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 130 * 60,
            takeover_after_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { enabled: false, port: 8088 }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AlertsConfig {
    pub telegram_bot_token_env: Option<String>,
    pub telegram_chat_id_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExplainerConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Only the top candidates of each run are explained.
    pub explain_top: usize,
}

impl Default for ExplainerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            model: "anthropic/claude-sonnet-4".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            max_tokens: 300,
            timeout_secs: 15,
            explain_top: 3,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Parse and validate configuration text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scan.top_n == 0 {
            bail!("scan.top_n must be at least 1");
        }
        if self.scan.concurrency == 0 {
            bail!("scan.concurrency must be at least 1");
        }
        if self.scan.bar_minutes <= 0 {
            bail!("scan.bar_minutes must be positive");
        }
        let (start, end) = self.schedule.session_window()?;
        if start >= end {
            bail!("schedule.session_start must be before session_end");
        }
        self.schedule.nightly_time()?;
        if !(-14..=14).contains(&self.app.utc_offset_hours) {
            bail!("app.utc_offset_hours out of range");
        }
        if self.adaptation.daily_cap < 0.0 || self.adaptation.learning_rate < 0.0 {
            bail!("adaptation.daily_cap and learning_rate must be non-negative");
        }
        if self.adaptation.winsor_lower >= self.adaptation.winsor_upper {
            bail!("adaptation winsor bounds are inverted");
        }
        if self.paper.initial_cash <= Decimal::ZERO {
            bail!("paper.initial_cash must be positive");
        }
        if self.paper.max_positions == 0 || self.paper.max_trades_per_day == 0 {
            bail!("paper caps must be at least 1");
        }
        if self.paper.fee_bps < Decimal::ZERO || self.paper.slippage_bps < Decimal::ZERO {
            bail!("paper fee/slippage must be non-negative");
        }
        if self.lab.thresholds.is_empty() || self.lab.max_holdings.is_empty() {
            bail!("lab grid must not be empty");
        }
        if self.lab.max_holdings.contains(&0) {
            bail!("lab.max_holdings entries must be at least 1");
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").with_context(|| format!("Invalid HH:MM time: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config() {
        // Requires config.toml in the working directory; tolerated when absent.
        let result = AppConfig::load("config.toml");
        if let Ok(cfg) = result {
            assert!(cfg.scan.top_n > 0);
            assert!(cfg.adaptation.daily_cap > 0.0);
            assert!(cfg.paper.initial_cash > Decimal::ZERO);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = AppConfig::parse("").unwrap();
        assert_eq!(cfg.scan.top_n, 5);
        assert_eq!(cfg.paper.max_positions, 3);
        assert_eq!(cfg.paper.initial_cash, dec!(1000000));
        assert_eq!(cfg.regime.neutral.threshold, 55.0);
        assert_eq!(cfg.lab.thresholds.len() * cfg.lab.max_holdings.len(), 20);
        assert_eq!(cfg.coordinator.stale_after_secs, 7800);
    }

    #[test]
    fn test_partial_section_overrides() {
        let cfg = AppConfig::parse(
            r#"
            [paper]
            max_positions = 5
            fee_bps = 2.0

            [schedule]
            holidays = ["2026-01-01", "2026-02-17"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.paper.max_positions, 5);
        assert_eq!(cfg.paper.fee_bps, dec!(2));
        assert_eq!(cfg.paper.max_trades_per_day, 10);
        assert_eq!(cfg.schedule.holidays.len(), 2);
    }

    #[test]
    fn test_regime_params_lookup() {
        let cfg = RegimeConfig::default();
        assert_eq!(cfg.params(RegimeLabel::Conservative).threshold, 62.0);
        assert_eq!(cfg.params(RegimeLabel::Aggressive).position_scale, 1.25);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(AppConfig::parse("[scan]\ntop_n = 0").is_err());
        assert!(AppConfig::parse("[schedule]\nsession_start = \"16:00\"\nsession_end = \"09:00\"").is_err());
        assert!(AppConfig::parse("[schedule]\nsession_start = \"9am\"").is_err());
        assert!(AppConfig::parse("[lab]\nthresholds = []").is_err());
        assert!(AppConfig::parse("[adaptation]\ndaily_cap = -0.1").is_err());
    }
}
