//! In-memory market data provider.
//!
//! Holds a complete data set and only ever reveals what was observable at
//! the requested time, so replaying a recorded session through it is
//! equivalent to running live. Used by the replay loader and by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::{Headline, HeadlineSource, MarketDataProvider};
use crate::types::{Bar, CoreError, CoreResult, Instrument};

#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    name: String,
    universe: Vec<Instrument>,
    bars: HashMap<String, Vec<Bar>>,
    index: Vec<Bar>,
    flow: HashMap<String, f64>,
    buzz: HashMap<String, f64>,
    headlines: Vec<Headline>,
    universe_down: bool,
    unavailable: HashSet<String>,
    side_input_delay: Option<Duration>,
}

impl MemoryProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_instrument(mut self, instrument: Instrument, mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.ts);
        self.bars.insert(instrument.id.clone(), bars);
        self.universe.push(instrument);
        self
    }

    pub fn with_index(mut self, mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.ts);
        self.index = bars;
        self
    }

    pub fn with_flow(mut self, instrument_id: &str, value: f64) -> Self {
        self.flow.insert(instrument_id.to_string(), value);
        self
    }

    pub fn with_buzz(mut self, instrument_id: &str, value: f64) -> Self {
        self.buzz.insert(instrument_id.to_string(), value);
        self
    }

    pub fn with_headlines(mut self, headlines: Vec<Headline>) -> Self {
        self.headlines = headlines;
        self
    }

    /// Make `universe()` fail, as when the vendor is down.
    pub fn with_universe_down(mut self) -> Self {
        self.universe_down = true;
        self
    }

    /// Make bar requests for one instrument fail.
    pub fn with_unavailable(mut self, instrument_id: &str) -> Self {
        self.unavailable.insert(instrument_id.to_string());
        self
    }

    /// Delay flow and buzz answers, to exercise caller timeouts.
    pub fn with_side_input_delay(mut self, delay: Duration) -> Self {
        self.side_input_delay = Some(delay);
        self
    }

    pub fn instrument_count(&self) -> usize {
        self.universe.len()
    }

    async fn side_input_pause(&self) {
        if let Some(d) = self.side_input_delay {
            tokio::time::sleep(d).await;
        }
    }
}

fn in_range(bars: &[Bar], from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Bar> {
    bars.iter()
        .filter(|b| b.ts >= from && b.ts <= to)
        .cloned()
        .collect()
}

#[async_trait]
impl MarketDataProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn universe(&self) -> CoreResult<Vec<Instrument>> {
        if self.universe_down {
            return Err(CoreError::DataUnavailable(format!("{}: universe unavailable", self.name)));
        }
        Ok(self.universe.clone())
    }

    async fn bars(
        &self,
        instrument_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<Bar>> {
        if self.unavailable.contains(instrument_id) {
            return Err(CoreError::DataUnavailable(format!("{}: no bars for {instrument_id}", self.name)));
        }
        match self.bars.get(instrument_id) {
            Some(series) => Ok(in_range(series, from, to)),
            None => Err(CoreError::DataUnavailable(format!(
                "{}: unknown instrument {instrument_id}",
                self.name
            ))),
        }
    }

    async fn investor_flow(&self, instrument_id: &str, _as_of: DateTime<Utc>) -> CoreResult<Option<f64>> {
        self.side_input_pause().await;
        Ok(self.flow.get(instrument_id).copied())
    }

    async fn buzz(&self, instrument_id: &str, _as_of: DateTime<Utc>) -> CoreResult<Option<f64>> {
        self.side_input_pause().await;
        Ok(self.buzz.get(instrument_id).copied())
    }

    async fn index_bars(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<Vec<Bar>> {
        Ok(in_range(&self.index, from, to))
    }
}

#[async_trait]
impl HeadlineSource for MemoryProvider {
    async fn headlines(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> CoreResult<Vec<Headline>> {
        Ok(self
            .headlines
            .iter()
            .filter(|h| h.published_at >= since && h.published_at <= until)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn bar(h: i64, close: f64) -> Bar {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap();
        Bar {
            ts: t0 + ChronoDuration::hours(h),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    fn instrument(id: &str) -> Instrument {
        Instrument {
            id: id.into(),
            name: id.into(),
            sector: None,
        }
    }

    #[tokio::test]
    async fn test_bars_never_leak_future() {
        let bars = vec![bar(2, 3.0), bar(0, 1.0), bar(1, 2.0)];
        let p = MemoryProvider::new("mem").with_instrument(instrument("AAA"), bars);
        let t0 = bar(0, 0.0).ts;
        let got = p.bars("AAA", t0, t0 + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].close, 2.0);
    }

    #[tokio::test]
    async fn test_outages() {
        let p = MemoryProvider::new("mem")
            .with_instrument(instrument("AAA"), vec![bar(0, 1.0)])
            .with_unavailable("AAA");
        let t0 = bar(0, 0.0).ts;
        assert!(matches!(p.bars("AAA", t0, t0).await, Err(CoreError::DataUnavailable(_))));
        assert!(p.universe().await.is_ok());

        let down = MemoryProvider::new("mem").with_universe_down();
        assert!(matches!(down.universe().await, Err(CoreError::DataUnavailable(_))));
    }

    #[tokio::test]
    async fn test_side_inputs() {
        let p = MemoryProvider::new("mem").with_flow("AAA", 0.3);
        let now = Utc::now();
        assert_eq!(p.investor_flow("AAA", now).await.unwrap(), Some(0.3));
        assert_eq!(p.buzz("AAA", now).await.unwrap(), None);
    }
}
