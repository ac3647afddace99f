//! Replay provider: loads a recorded market session from JSON files.
//!
//! Directory layout:
//!
//! ```text
//! universe.json      [Instrument]
//! bars/<id>.json     [Bar]
//! index.json         [Bar]            (optional)
//! flow.json          {id: f64}        (optional)
//! buzz.json          {id: f64}        (optional)
//! headlines.json     [Headline]       (optional)
//! ```

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::memory::MemoryProvider;
use super::Headline;
use crate::types::{Bar, CoreError, CoreResult, Instrument};

async fn read_json<T: DeserializeOwned>(path: &Path) -> CoreResult<T> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CoreError::DataUnavailable(format!("{}: {e}", path.display())))?;
    Ok(serde_json::from_str(&text)?)
}

async fn read_optional<T: DeserializeOwned + Default>(path: &Path) -> CoreResult<T> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        read_json(path).await
    } else {
        debug!(path = %path.display(), "Optional replay file absent");
        Ok(T::default())
    }
}

/// Load a replay directory into an in-memory provider.
///
/// A missing `universe.json` is `DataUnavailable`; an instrument without a
/// bar file stays in the universe and simply has no bars.
pub async fn load_replay(dir: &str) -> CoreResult<MemoryProvider> {
    let root = PathBuf::from(dir);
    let universe: Vec<Instrument> = read_json(&root.join("universe.json")).await?;

    let mut provider = MemoryProvider::new(&format!("replay:{dir}"));
    let mut missing = 0usize;
    for instrument in universe {
        let path = root.join("bars").join(format!("{}.json", instrument.id));
        let bars: Vec<Bar> = match read_json(&path).await {
            Ok(b) => b,
            Err(CoreError::DataUnavailable(msg)) => {
                warn!(instrument = %instrument.id, reason = %msg, "No bar file in replay");
                missing += 1;
                let id = instrument.id.clone();
                provider = provider.with_instrument(instrument, Vec::new()).with_unavailable(&id);
                continue;
            }
            Err(e) => return Err(e),
        };
        provider = provider.with_instrument(instrument, bars);
    }

    let index: Vec<Bar> = read_optional(&root.join("index.json")).await?;
    let flow: HashMap<String, f64> = read_optional(&root.join("flow.json")).await?;
    let buzz: HashMap<String, f64> = read_optional(&root.join("buzz.json")).await?;
    let headlines: Vec<Headline> = read_optional(&root.join("headlines.json")).await?;

    provider = provider.with_index(index).with_headlines(headlines);
    for (id, v) in flow {
        provider = provider.with_flow(&id, v);
    }
    for (id, v) in buzz {
        provider = provider.with_buzz(&id, v);
    }

    info!(
        dir,
        instruments = provider.instrument_count(),
        missing_bars = missing,
        "Replay data loaded"
    );
    Ok(provider)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
