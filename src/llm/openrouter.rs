//! OpenRouter chat-completions client.
//!
//! Any OpenAI-compatible endpoint works; OpenRouter gives access to many
//! model providers behind one API key. Retries rate limits and server
//! errors with exponential backoff.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::{debug, warn};

use super::Explainer;
use crate::config::ExplainerConfig;
use crate::types::Candidate;

/// Maximum retries on rate limit / server errors.
const MAX_RETRIES: u32 = 2;

/// Base delay for exponential backoff (ms).
const BASE_BACKOFF_MS: u64 = 500;

const SYSTEM_PROMPT: &str = "You are a concise equity market analyst. Given one stock's \
scanner features and score contributions, explain in two sentences why it may attract \
short-term capital inflow and name the main risk. Do not give advice or price targets.";

// ---------------------------------------------------------------------------
// API types (OpenAI-compatible)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u32,
}

/// User message for one candidate: rank, score, then each feature with its
/// contribution, largest contribution first.
pub fn build_prompt(candidate: &Candidate) -> String {
    let mut msg = format!(
        "{} ({}) rank {} score {:.2} price {}\n",
        candidate.name, candidate.instrument_id, candidate.rank, candidate.score, candidate.price
    );
    let mut rows: Vec<(&String, f64, f64)> = candidate
        .features
        .iter()
        .map(|(name, value)| (name, *value, candidate.contributions.get(name).copied().unwrap_or(0.0)))
        .collect();
    rows.sort_by(|a, b| b.2.total_cmp(&a.2).then_with(|| a.0.cmp(b.0)));
    for (name, value, contribution) in rows {
        let _ = writeln!(msg, "- {name}: {value:.4} (+{contribution:.1})");
    }
    msg
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OpenRouterClient {
    http: Client,
    api_key: Secret<String>,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl OpenRouterClient {
    pub fn new(api_key: Secret<String>, config: &ExplainerConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build OpenRouter HTTP client")?;

        Ok(Self {
            http,
            api_key,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    async fn call(&self, user_message: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_message.to_string(),
                },
            ],
        };

        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, "Retrying OpenRouter call");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let resp = self
                .http
                .post(&self.base_url)
                .bearer_auth(self.api_key.expose_secret())
                .header("X-Title", "FlowScout")
                .json(&request)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: ChatResponse = response
                            .json()
                            .await
                            .context("Failed to parse OpenRouter response")?;
                        let tokens = body.usage.map(|u| u.total_tokens).unwrap_or(0);
                        debug!(model = %self.model, tokens, "OpenRouter call complete");
                        return Ok(body
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.message)
                            .map(|m| m.content)
                            .unwrap_or_default());
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(status = %status, attempt, error = %error_text, "Retryable OpenRouter error");
                        last_error = Some(format!("HTTP {status}: {error_text}"));
                        continue;
                    }
                    anyhow::bail!("OpenRouter API error {status}: {error_text}");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "OpenRouter request failed");
                    last_error = Some(format!("Request error: {e}"));
                }
            }
        }

        anyhow::bail!(
            "OpenRouter failed after {} retries: {}",
            MAX_RETRIES,
            last_error.unwrap_or_default()
        )
    }
}

#[async_trait]
impl Explainer for OpenRouterClient {
    async fn explain(&self, candidate: &Candidate) -> Result<String> {
        let text = self
            .call(&build_prompt(candidate))
            .await
            .with_context(|| format!("explaining {}", candidate.instrument_id))?;
        Ok(text.trim().to_string())
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    #[test]
    fn test_client_uses_config() {
        let cfg = ExplainerConfig {
            model: "openai/gpt-4o-mini".into(),
            max_tokens: 120,
            ..ExplainerConfig::default()
        };
        let client = OpenRouterClient::new(Secret::new("key".into()), &cfg).unwrap();
        assert_eq!(client.model_name(), "openai/gpt-4o-mini");
        assert_eq!(client.max_tokens, 120);
        assert!(client.base_url.starts_with("https://openrouter.ai"));
    }

    #[test]
    fn test_prompt_orders_by_contribution() {
        let mut features = BTreeMap::new();
        features.insert("rs_5".to_string(), 0.041);
        features.insert("money_value_surge".to_string(), 2.5);
        let mut contributions = BTreeMap::new();
        contributions.insert("rs_5".to_string(), 4.0);
        contributions.insert("money_value_surge".to_string(), 12.0);
        let c = Candidate {
            run_id: "r".into(),
            instrument_id: "005930".into(),
            name: "Samsung".into(),
            rank: 1,
            score: 63.5,
            price: dec!(71000),
            features,
            contributions,
            rationale: String::new(),
        };
        let prompt = build_prompt(&c);
        assert!(prompt.starts_with("Samsung (005930) rank 1 score 63.50"));
        let surge = prompt.find("money_value_surge").unwrap();
        let rs = prompt.find("rs_5").unwrap();
        assert!(surge < rs);
        assert!(prompt.contains("- rs_5: 0.0410 (+4.0)"));
    }
}
