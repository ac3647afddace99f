//! Event-risk scoring from market headlines.
//!
//! The core only consumes the numeric risk score (0 calm – 100 stressed);
//! headline text never reaches scoring directly. Headlines come from any
//! `HeadlineSource`: NewsAPI when a key is configured, otherwise the
//! replay fixtures.
//!
//! API: `https://newsapi.org/v2/everything`
//! Auth: API key via `apiKey` query param.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use tracing::debug;

use super::{Headline, HeadlineSource};
use crate::types::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Keyword scoring
// ---------------------------------------------------------------------------

const NEGATIVE_TERMS: &[&str] = &[
    "crash", "plunge", "selloff", "sell-off", "slump", "tumble", "recession",
    "default", "downgrade", "war", "sanction", "tariff", "probe", "fraud",
    "halt", "bankrupt", "layoff", "inflation", "hike", "warning", "fear",
];

const POSITIVE_TERMS: &[&str] = &[
    "rally", "surge", "record", "beat", "upgrade", "rebound", "soar",
    "stimulus", "cut", "approval", "deal", "growth", "inflow", "recovery",
];

/// Numeric event risk for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRisk {
    /// 0 (calm) to 100 (stressed); 50 is neutral.
    pub score: f64,
    pub headline_count: usize,
    pub negative: usize,
    pub positive: usize,
    pub events_today: usize,
}

impl EventRisk {
    pub fn neutral() -> Self {
        Self {
            score: 50.0,
            headline_count: 0,
            negative: 0,
            positive: 0,
            events_today: 0,
        }
    }
}

fn matches_any(text: &str, terms: &[&str]) -> bool {
    terms.iter().any(|t| text.contains(t))
}

/// Score headlines plus scheduled high-impact events falling on `today`.
pub fn score_event_risk(headlines: &[Headline], event_dates: &[NaiveDate], today: NaiveDate) -> EventRisk {
    let events_today = event_dates.iter().filter(|d| **d == today).count();
    let mut negative = 0;
    let mut positive = 0;
    for h in headlines {
        let lower = h.title.to_lowercase();
        if matches_any(&lower, NEGATIVE_TERMS) {
            negative += 1;
        }
        if matches_any(&lower, POSITIVE_TERMS) {
            positive += 1;
        }
    }

    let tone = if headlines.is_empty() {
        0.0
    } else {
        35.0 * (negative as f64 - positive as f64) / headlines.len() as f64
    };
    let score = (50.0 + tone + 8.0 * events_today as f64).clamp(0.0, 100.0);

    EventRisk {
        score,
        headline_count: headlines.len(),
        negative,
        positive,
        events_today,
    }
}

// ---------------------------------------------------------------------------
// NewsAPI source
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NewsApiResponse {
    #[serde(default)]
    articles: Vec<NewsArticle>,
}

#[derive(Debug, Deserialize)]
struct NewsArticle {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "publishedAt")]
    published_at: Option<DateTime<Utc>>,
}

pub struct NewsApiSource {
    http: Client,
    api_key: Secret<String>,
    query: String,
}

impl NewsApiSource {
    pub fn new(api_key: Secret<String>, query: &str, timeout_secs: u64) -> CoreResult<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .user_agent("FlowScout/0.1.0")
            .build()
            .map_err(|e| CoreError::Config(format!("failed to build news HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key,
            query: query.to_string(),
        })
    }
}

#[async_trait]
impl HeadlineSource for NewsApiSource {
    async fn headlines(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> CoreResult<Vec<Headline>> {
        let url = format!(
            "https://newsapi.org/v2/everything?q={}&from={}&sortBy=publishedAt&pageSize=50&language=en&apiKey={}",
            urlencoding::encode(&self.query),
            urlencoding::encode(&since.to_rfc3339()),
            self.api_key.expose_secret()
        );

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::DataUnavailable(format!("newsapi request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(CoreError::DataUnavailable(format!("newsapi returned {}", resp.status())));
        }
        let body: NewsApiResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::DataUnavailable(format!("newsapi parse failed: {e}")))?;

        let headlines: Vec<Headline> = body
            .articles
            .into_iter()
            .filter_map(|a| match (a.title, a.published_at) {
                (Some(title), Some(ts)) if ts <= until => Some(Headline { published_at: ts, title }),
                _ => None,
            })
            .collect();
        debug!(count = headlines.len(), "Headlines fetched");
        Ok(headlines)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn h(title: &str) -> Headline {
        Headline {
            published_at: Utc::now(),
            title: title.into(),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    #[test]
    fn test_no_headlines_is_neutral() {
        let r = score_event_risk(&[], &[], day(5));
        assert_eq!(r.score, 50.0);
        assert_eq!(r, EventRisk::neutral());
    }

    #[test]
    fn test_negative_tone_raises_risk() {
        let r = score_event_risk(
            &[h("Stocks plunge as recession fears grow"), h("Chipmaker downgrade")],
            &[],
            day(5),
        );
        assert_eq!(r.negative, 2);
        assert!((r.score - 85.0).abs() < 1e-9);
    }

    #[test]
    fn test_positive_tone_lowers_risk() {
        let r = score_event_risk(&[h("Markets rally to record"), h("Quiet session")], &[], day(5));
        assert_eq!(r.positive, 1);
        assert!((r.score - 32.5).abs() < 1e-9);
    }

    #[test]
    fn test_scheduled_event_adds_risk() {
        let r = score_event_risk(&[], &[day(5), day(6)], day(5));
        assert_eq!(r.events_today, 1);
        assert_eq!(r.score, 58.0);
    }

    #[test]
    fn test_score_is_clamped() {
        let many: Vec<Headline> = (0..5).map(|_| h("crash")).collect();
        let r = score_event_risk(&many, &[day(5), day(5), day(5)], day(5));
        assert_eq!(r.score, 100.0);
    }

    #[test]
    fn test_newsapi_source_builds() {
        let src = NewsApiSource::new(Secret::new("key".into()), "kospi", 5);
        assert!(src.is_ok());
    }
}
