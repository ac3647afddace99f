//! Notification channel.
//!
//! Reports leave the process through a `Notifier`. Delivery is
//! fire-and-forget: `deliver` bounds the send with a timeout and logs any
//! failure, so a dead chat channel never blocks or rolls back a cycle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Telegram rejects messages above this many characters.
const TELEGRAM_MAX_CHARS: usize = 4096;

/// Destination for a pre-formatted report.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `text` to `destination` (a chat id, channel name, ...).
    async fn send(&self, destination: &str, text: &str) -> Result<()>;
}

/// Send and forget. Returns whether the message went out.
pub async fn deliver(notifier: &dyn Notifier, destination: &str, text: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, notifier.send(destination, text)).await {
        Ok(Ok(())) => {
            debug!(destination, chars = text.len(), "Notification delivered");
            true
        }
        Ok(Err(e)) => {
            warn!(destination, error = %e, "Notification failed");
            false
        }
        Err(_) => {
            warn!(destination, timeout_ms = timeout.as_millis() as u64, "Notification timed out");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Log notifier
// ---------------------------------------------------------------------------

/// Writes reports to the log. Used when no chat channel is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, destination: &str, text: &str) -> Result<()> {
        info!(destination, "\n{text}");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Telegram
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

pub struct TelegramNotifier {
    http: Client,
    bot_token: Secret<String>,
}

impl TelegramNotifier {
    pub fn new(bot_token: Secret<String>, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("FlowScout/0.1.0")
            .build()
            .context("Failed to build Telegram HTTP client")?;
        Ok(Self { http, bot_token })
    }
}

/// Split on line boundaries into chunks of at most `max` characters. A
/// single overlong line is hard-split.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        let mut line: Vec<char> = line.chars().collect();
        while line.len() > max {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let rest = line.split_off(max);
            chunks.push(line.into_iter().collect());
            line = rest;
        }
        let needed = line.len() + usize::from(!current.is_empty());
        if current.chars().count() + needed > max {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.extend(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, destination: &str, text: &str) -> Result<()> {
        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.bot_token.expose_secret()
        );
        for chunk in split_message(text, TELEGRAM_MAX_CHARS) {
            let resp = self
                .http
                .post(&url)
                .json(&SendMessage {
                    chat_id: destination,
                    text: &chunk,
                    disable_web_page_preview: true,
                })
                .send()
                .await
                .context("Telegram request failed")?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("Telegram returned {status}: {body}");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_swallows_failure() {
        let mut mock = MockNotifier::new();
        mock.expect_send()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("chat is down")));
        assert!(!deliver(&mock, "ops", "hello", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_deliver_passes_destination_and_text() {
        let mut mock = MockNotifier::new();
        mock.expect_send()
            .withf(|dest, text| dest == "ops" && text == "report")
            .times(1)
            .returning(|_, _| Ok(()));
        assert!(deliver(&mock, "ops", "report", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        assert!(deliver(&LogNotifier, "log", "line one\nline two", Duration::from_secs(1)).await);
    }

    #[test]
    fn test_split_message() {
        assert_eq!(split_message("a\nb\nc", 3), vec!["a\nb".to_string(), "c".to_string()]);
        assert_eq!(split_message("abcdefg", 3), vec!["abc", "def", "g"]);
        assert_eq!(split_message("short", 4096), vec!["short".to_string()]);
        assert!(split_message("", 10).is_empty());
    }
}
