//! Market data collaborators.
//!
//! Defines the provider seams the core consumes: `MarketDataProvider` for
//! prices, volumes and side inputs, and `HeadlineSource` for event-risk
//! headlines. Every provider normalises to the same `Bar` schema, so a
//! swap changes data quality, never scoring semantics.

pub mod market_index;
pub mod memory;
pub mod news;
pub mod replay;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Bar, CoreResult, Instrument};

/// Abstraction over a market data vendor.
///
/// Implementations fail with `DataUnavailable` when the vendor cannot
/// answer; timeouts are applied by the caller.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Human-readable provider name for logs.
    fn name(&self) -> &str;

    /// The full instrument universe.
    async fn universe(&self) -> CoreResult<Vec<Instrument>>;

    /// Bars with `from <= ts <= to`, oldest first.
    async fn bars(
        &self,
        instrument_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<Bar>>;

    /// Net investor flow in [-1, 1] as of `as_of`, if known.
    async fn investor_flow(&self, instrument_id: &str, as_of: DateTime<Utc>) -> CoreResult<Option<f64>>;

    /// Attention/buzz score in [0, 1] as of `as_of`, if known.
    async fn buzz(&self, instrument_id: &str, as_of: DateTime<Utc>) -> CoreResult<Option<f64>>;

    /// Daily bars of the broad market index with `from <= ts <= to`.
    async fn index_bars(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> CoreResult<Vec<Bar>>;
}

/// A news headline with its publication time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headline {
    pub published_at: DateTime<Utc>,
    pub title: String,
}

/// Source of market headlines for event-risk scoring.
#[async_trait]
pub trait HeadlineSource: Send + Sync {
    async fn headlines(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> CoreResult<Vec<Headline>>;
}
