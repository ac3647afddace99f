//! Optional candidate commentary from an LLM.
//!
//! Explanations are additive: they are attached to reports only, never
//! read back by scoring or trading, and every call is timeout-bounded so
//! a slow model cannot stall a cycle.

pub mod openrouter;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::Candidate;

/// Free-text commentary for one candidate's feature map.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Explainer: Send + Sync {
    async fn explain(&self, candidate: &Candidate) -> Result<String>;

    /// Model identifier string.
    fn model_name(&self) -> String;
}

/// Explain the first `top` candidates, each within `timeout`. Failures and
/// timeouts are logged and leave that candidate without commentary.
pub async fn explain_candidates(
    explainer: &dyn Explainer,
    candidates: &[Candidate],
    top: usize,
    timeout: Duration,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for c in candidates.iter().take(top) {
        match tokio::time::timeout(timeout, explainer.explain(c)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                debug!(instrument = %c.instrument_id, model = %explainer.model_name(), "Candidate explained");
                out.insert(c.instrument_id.clone(), text);
            }
            Ok(Ok(_)) => debug!(instrument = %c.instrument_id, "Empty explanation"),
            Ok(Err(e)) => warn!(instrument = %c.instrument_id, error = %e, "Explanation failed"),
            Err(_) => warn!(
                instrument = %c.instrument_id,
                timeout_ms = timeout.as_millis() as u64,
                "Explanation timed out"
            ),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candidate(id: &str, rank: u32) -> Candidate {
        Candidate {
            run_id: "r1".into(),
            instrument_id: id.into(),
            name: id.into(),
            rank,
            score: 60.0,
            price: dec!(10),
            features: BTreeMap::new(),
            contributions: BTreeMap::new(),
            rationale: String::new(),
        }
    }

    #[tokio::test]
    async fn test_only_top_candidates_are_explained() {
        let mut mock = MockExplainer::new();
        mock.expect_explain()
            .times(2)
            .returning(|c| Ok(format!("{} looks active", c.instrument_id)));
        mock.expect_model_name().returning(|| "test-model".to_string());
        let cands = vec![candidate("AAA", 1), candidate("BBB", 2), candidate("CCC", 3)];
        let out = explain_candidates(&mock, &cands, 2, Duration::from_secs(1)).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out["AAA"], "AAA looks active");
        assert!(!out.contains_key("CCC"));
    }

    #[tokio::test]
    async fn test_failures_are_dropped() {
        let mut mock = MockExplainer::new();
        mock.expect_explain()
            .returning(|c| {
                if c.rank == 1 {
                    Err(anyhow::anyhow!("rate limited"))
                } else {
                    Ok("fine".to_string())
                }
            });
        mock.expect_model_name().returning(|| "test-model".to_string());
        let cands = vec![candidate("AAA", 1), candidate("BBB", 2)];
        let out = explain_candidates(&mock, &cands, 3, Duration::from_secs(1)).await;
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["BBB"]);
    }
}
