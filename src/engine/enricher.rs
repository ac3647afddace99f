//! Cycle data collection.
//!
//! Gathers everything one scan cycle needs from the market data provider:
//! the universe, recent bars per instrument, the flow and buzz side
//! inputs, the index series and the event-risk headline score. Each call
//! is bounded by a timeout. A missing or late input degrades that one
//! value to neutral and is logged; only an unavailable universe aborts
//! the cycle.
//!
//! Observed prices are appended to the snapshot table so outcomes can be
//! measured later, and so bars can be rebuilt from history when the
//! provider drops an instrument.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::calendar::SessionClock;
use crate::config::ScanConfig;
use crate::data::news::{score_event_risk, EventRisk};
use crate::data::{HeadlineSource, MarketDataProvider};
use crate::storage::Store;
use crate::types::{Bar, CoreError, CoreResult, Instrument, PriceSnapshot};

/// Daily index history requested for the market-state classifier.
const INDEX_LOOKBACK_DAYS: i64 = 40;

/// Headline window for event risk.
const HEADLINE_LOOKBACK_HOURS: i64 = 24;

// ---------------------------------------------------------------------------
// Collected view
// ---------------------------------------------------------------------------

/// Where an instrument's bars came from this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarSource {
    Provider,
    /// Rebuilt from stored snapshots after a provider failure.
    SnapshotHistory,
    Missing,
}

/// Everything collected for one instrument.
#[derive(Debug, Clone)]
pub struct InstrumentData {
    pub instrument: Instrument,
    pub bars: Vec<Bar>,
    pub source: BarSource,
    pub flow: Option<f64>,
    pub buzz: Option<f64>,
    /// Reference price at the cycle timestamp; `None` when no fresh bar
    /// was observed this cycle.
    pub price: Option<Decimal>,
}

impl InstrumentData {
    pub fn last_bar(&self) -> Option<&Bar> {
        self.bars.last()
    }
}

/// The market as observed at one cycle boundary.
#[derive(Debug, Clone)]
pub struct MarketView {
    pub as_of: DateTime<Utc>,
    pub instruments: Vec<InstrumentData>,
    pub index_bars: Vec<Bar>,
    /// `None` when no headline source answered.
    pub event_risk: Option<EventRisk>,
    /// Human-readable notes on every input that fell back to neutral.
    pub degraded: Vec<String>,
}

impl MarketView {
    /// Share of instruments whose last bar closed up.
    pub fn breadth(&self) -> f64 {
        let returns: Vec<f64> = self
            .instruments
            .iter()
            .filter_map(|d| crate::scoring::features::return_1h(&d.bars))
            .collect();
        if returns.is_empty() {
            return 0.5;
        }
        returns.iter().filter(|r| **r > 0.0).count() as f64 / returns.len() as f64
    }

    pub fn priced(&self) -> usize {
        self.instruments.iter().filter(|d| d.price.is_some()).count()
    }
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

/// Run `fut` with a deadline; expiry becomes `ProviderTimeout`.
pub async fn bounded<T, F>(what: &str, limit: Duration, fut: F) -> CoreResult<T>
where
    F: Future<Output = CoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::ProviderTimeout {
            what: what.to_string(),
            after_ms: limit.as_millis() as u64,
        }),
    }
}

// ---------------------------------------------------------------------------
// Enricher
// ---------------------------------------------------------------------------

pub struct Enricher {
    provider: Arc<dyn MarketDataProvider>,
    headlines: Option<Arc<dyn HeadlineSource>>,
    store: Store,
    clock: SessionClock,
    scan: ScanConfig,
    event_dates: Vec<chrono::NaiveDate>,
    timeout: Duration,
}

impl Enricher {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        headlines: Option<Arc<dyn HeadlineSource>>,
        store: Store,
        clock: SessionClock,
        scan: ScanConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            headlines,
            store,
            clock,
            scan,
            event_dates: Vec::new(),
            timeout,
        }
    }

    pub fn with_event_dates(mut self, dates: Vec<chrono::NaiveDate>) -> Self {
        self.event_dates = dates;
        self
    }

    /// Collect the market view at `as_of` and persist this cycle's price
    /// snapshots.
    pub async fn collect(&self, as_of: DateTime<Utc>) -> CoreResult<MarketView> {
        let universe = match bounded("universe", self.timeout, self.provider.universe()).await {
            Ok(u) => u,
            Err(CoreError::ProviderTimeout { what, after_ms }) => {
                return Err(CoreError::DataUnavailable(format!("{what} timed out after {after_ms}ms")));
            }
            Err(e) => return Err(e),
        };
        if universe.is_empty() {
            return Err(CoreError::DataUnavailable(format!(
                "{}: empty universe",
                self.provider.name()
            )));
        }
        info!(
            provider = self.provider.name(),
            instruments = universe.len(),
            %as_of,
            "Collecting market data"
        );

        let instruments: Vec<(InstrumentData, Vec<String>)> = stream::iter(universe)
            .map(|instrument| self.collect_one(instrument, as_of))
            .buffered(self.scan.concurrency.max(1))
            .collect()
            .await;

        let mut degraded = Vec::new();
        let mut data = Vec::with_capacity(instruments.len());
        for (d, notes) in instruments {
            degraded.extend(notes);
            data.push(d);
        }

        let index_from = as_of - ChronoDuration::days(INDEX_LOOKBACK_DAYS);
        let index_call = self.provider.index_bars(index_from, as_of);
        let index_bars = match bounded("index", self.timeout, index_call).await {
            Ok(bars) => bars,
            Err(e) => {
                warn!(error = %e, "Index data unavailable, classifying from breadth");
                degraded.push(format!("index: {e}"));
                Vec::new()
            }
        };

        let event_risk = self.event_risk(as_of, &mut degraded).await;

        let view = MarketView {
            as_of,
            instruments: data,
            index_bars,
            event_risk,
            degraded,
        };
        let written = self.persist_snapshots(&view).await?;

        info!(
            instruments = view.instruments.len(),
            priced = view.priced(),
            snapshots = written,
            degraded = view.degraded.len(),
            "Market data collected"
        );
        Ok(view)
    }

    async fn collect_one(
        &self,
        instrument: Instrument,
        as_of: DateTime<Utc>,
    ) -> (InstrumentData, Vec<String>) {
        let id = instrument.id.clone();
        let mut notes = Vec::new();
        let window = ChronoDuration::minutes(self.scan.bar_minutes * self.scan.history_bars as i64);
        let from = as_of - window;

        let bars_label = format!("bars {id}");
        let bars_call = self.provider.bars(&id, from, as_of);
        let (bars, source) = match bounded(&bars_label, self.timeout, bars_call).await {
            Ok(bars) if !bars.is_empty() => (bars, BarSource::Provider),
            Ok(_) => {
                notes.push(format!("{id}: no bars"));
                self.fallback_bars(&id, from, as_of).await
            }
            Err(e) => {
                warn!(instrument = %id, error = %e, "Bars unavailable, using stored snapshots");
                notes.push(format!("{id}: {e}"));
                self.fallback_bars(&id, from, as_of).await
            }
        };

        let (flow_label, buzz_label) = (format!("flow {id}"), format!("buzz {id}"));
        let (flow, buzz) = tokio::join!(
            bounded(&flow_label, self.timeout, self.provider.investor_flow(&id, as_of)),
            bounded(&buzz_label, self.timeout, self.provider.buzz(&id, as_of)),
        );
        let flow = flow.unwrap_or_else(|e| {
            warn!(instrument = %id, error = %e, "Flow unavailable, neutral");
            notes.push(format!("{id}: {e}"));
            None
        });
        let buzz = buzz.unwrap_or_else(|e| {
            warn!(instrument = %id, error = %e, "Buzz unavailable, neutral");
            notes.push(format!("{id}: {e}"));
            None
        });

        let price = match source {
            BarSource::Provider => self.fresh_price(&bars, as_of),
            _ => None,
        };

        (
            InstrumentData {
                instrument,
                bars,
                source,
                flow,
                buzz,
                price,
            },
            notes,
        )
    }

    async fn fallback_bars(&self, id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> (Vec<Bar>, BarSource) {
        match self.store.snapshot_history(id, from, to).await {
            Ok(snaps) if !snaps.is_empty() => {
                debug!(instrument = id, count = snaps.len(), "Rebuilt bars from snapshots");
                (snaps.iter().map(Bar::from_snapshot).collect(), BarSource::SnapshotHistory)
            }
            Ok(_) => (Vec::new(), BarSource::Missing),
            Err(e) => {
                warn!(instrument = id, error = %e, "Snapshot history unreadable");
                (Vec::new(), BarSource::Missing)
            }
        }
    }

    /// Close of the last bar, provided it was observed less than one bar
    /// interval before `as_of`.
    fn fresh_price(&self, bars: &[Bar], as_of: DateTime<Utc>) -> Option<Decimal> {
        let last = bars.last()?;
        let max_age = ChronoDuration::minutes(self.scan.bar_minutes.max(1));
        if last.ts > as_of || as_of - last.ts >= max_age || last.close <= 0.0 {
            return None;
        }
        Decimal::from_f64(last.close).map(|d| d.round_dp(4))
    }

    async fn event_risk(&self, as_of: DateTime<Utc>, degraded: &mut Vec<String>) -> Option<EventRisk> {
        let source = self.headlines.as_ref()?;
        let since = as_of - ChronoDuration::hours(HEADLINE_LOOKBACK_HOURS);
        match bounded("headlines", self.timeout, source.headlines(since, as_of)).await {
            Ok(headlines) => {
                let risk = score_event_risk(&headlines, &self.event_dates, self.clock.local_date(as_of));
                debug!(score = risk.score, headlines = risk.headline_count, "Event risk scored");
                Some(risk)
            }
            Err(e) => {
                warn!(error = %e, "Headlines unavailable, event risk neutral");
                degraded.push(format!("headlines: {e}"));
                None
            }
        }
    }

    async fn persist_snapshots(&self, view: &MarketView) -> CoreResult<u64> {
        let snapshots: Vec<PriceSnapshot> = view
            .instruments
            .iter()
            .filter_map(|d| {
                let price = d.price?;
                // stamped when the bar was observed, never at the cycle
                let bar = d.last_bar()?;
                Some(PriceSnapshot {
                    instrument_id: d.instrument.id.clone(),
                    observed_at: bar.ts,
                    price,
                    volume: bar.volume,
                })
            })
            .collect();
        self.store.insert_snapshots(&snapshots).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
