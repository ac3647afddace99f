//! Shared fixtures for the integration tests: a deterministic replay
//! provider with three steadily rising names and one thinly traded one,
//! and an engine wired to an in-memory store.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use flowscout::calendar::WeekdayCalendar;
use flowscout::config::AppConfig;
use flowscout::data::memory::MemoryProvider;
use flowscout::engine::{Collaborators, Engine};
use flowscout::storage::Store;
use flowscout::types::{Bar, Instrument};

/// First bar of every series.
pub fn series_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

/// Tuesday 2026-01-06 at `hour`:00 local (UTC+9), inside the session for
/// hours 9..=15.
pub fn local_hour(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 6, 0, 0, 0).unwrap() + Duration::hours(hour as i64 - 9)
}

pub fn rising_bars(base: f64, drift: f64, volume: f64) -> Vec<Bar> {
    (0..=192)
        .map(|i| {
            let close = base * (1.0 + drift).powi(i);
            Bar {
                ts: series_start() + Duration::hours(i as i64),
                open: close / (1.0 + drift),
                high: close * 1.003,
                low: close * 0.997,
                close,
                volume,
            }
        })
        .collect()
}

fn instrument(id: &str, name: &str) -> Instrument {
    Instrument {
        id: id.to_string(),
        name: name.to_string(),
        sector: Some("tech".to_string()),
    }
}

/// Three liquid risers plus one instrument below the turnover floor.
pub fn provider() -> MemoryProvider {
    MemoryProvider::new("fixture")
        .with_instrument(instrument("AAA", "Alpha"), rising_bars(100.0, 0.003, 10_000.0))
        .with_instrument(instrument("BBB", "Bravo"), rising_bars(50.0, 0.002, 20_000.0))
        .with_instrument(instrument("CCC", "Charlie"), rising_bars(20.0, 0.001, 50_000.0))
        .with_instrument(instrument("THN", "Thin"), rising_bars(10.0, 0.004, 1.0))
        .with_index(rising_bars(2500.0, 0.0005, 1_000_000.0))
        .with_flow("AAA", 0.8)
        .with_flow("BBB", 0.5)
        .with_buzz("AAA", 0.6)
}

/// Defaults with a low turnover floor, three candidates and a paper
/// entry threshold every candidate clears.
pub fn config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.app.utc_offset_hours = 9;
    cfg.scan.top_n = 3;
    cfg.scan.min_turnover = 10_000.0;
    cfg.paper.max_positions = 3;
    cfg.regime.conservative.threshold = 0.0;
    cfg.regime.neutral.threshold = 0.0;
    cfg.regime.aggressive.threshold = 0.0;
    cfg
}

pub fn engine_with(store: Store, provider: MemoryProvider, cfg: AppConfig) -> Engine {
    let calendar = Arc::new(WeekdayCalendar::new(cfg.schedule.holidays.clone()));
    let collaborators = Collaborators::new(Arc::new(provider), calendar);
    Engine::new(cfg, store, collaborators).unwrap()
}

pub async fn engine() -> (Store, Engine) {
    let store = Store::in_memory().await.unwrap();
    let engine = engine_with(store.clone(), provider(), config());
    (store, engine)
}
