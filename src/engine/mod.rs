//! Core engine: the hourly scan cycle and the nightly adaptation batch.
//!
//! `Engine` owns one instance of every stage, wired to a shared store and
//! the external collaborators. `hourly` and `nightly` hold the two
//! pipelines; both claim their boundary through the run coordinator first,
//! so overlapping invocations are absorbed.

pub mod coordinator;
pub mod enricher;
pub mod hourly;
pub mod nightly;
pub mod report;
pub mod scanner;
pub mod tracker;

use std::sync::Arc;
use std::time::Duration;

use crate::adapt::regime::RegimeClassifier;
use crate::adapt::tuner::WeightTuner;
use crate::backtest::StrategyLab;
use crate::calendar::{SessionClock, TradingCalendar};
use crate::config::AppConfig;
use crate::data::{HeadlineSource, MarketDataProvider};
use crate::llm::Explainer;
use crate::notify::{LogNotifier, Notifier};
use crate::paper::PaperSimulator;
use crate::storage::Store;
use crate::types::{CoreError, CoreResult};

use self::coordinator::RunCoordinator;
use self::enricher::Enricher;
use self::scanner::CandidateSelector;
use self::tracker::OutcomeTracker;

/// Bound on one notification send.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// External collaborators the engine consumes.
pub struct Collaborators {
    pub provider: Arc<dyn MarketDataProvider>,
    pub headlines: Option<Arc<dyn HeadlineSource>>,
    pub calendar: Arc<dyn TradingCalendar>,
    pub notifier: Arc<dyn Notifier>,
    /// Where reports are sent (chat id for Telegram).
    pub destination: String,
    pub explainer: Option<Arc<dyn Explainer>>,
}

impl Collaborators {
    /// Provider and calendar only; reports go to the log.
    pub fn new(provider: Arc<dyn MarketDataProvider>, calendar: Arc<dyn TradingCalendar>) -> Self {
        Self {
            provider,
            headlines: None,
            calendar,
            notifier: Arc::new(LogNotifier),
            destination: "log".to_string(),
            explainer: None,
        }
    }
}

pub struct Engine {
    config: AppConfig,
    store: Store,
    clock: SessionClock,
    calendar: Arc<dyn TradingCalendar>,
    notifier: Arc<dyn Notifier>,
    destination: String,
    explainer: Option<Arc<dyn Explainer>>,
    coordinator: RunCoordinator,
    enricher: Enricher,
    selector: CandidateSelector,
    tracker: OutcomeTracker,
    simulator: PaperSimulator,
    classifier: RegimeClassifier,
    tuner: WeightTuner,
    lab: StrategyLab,
}

impl Engine {
    pub fn new(config: AppConfig, store: Store, collaborators: Collaborators) -> CoreResult<Self> {
        let (start, end) = config
            .schedule
            .session_window()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        let clock = SessionClock::new(config.app.utc_offset_hours, start, end)?;
        let Collaborators {
            provider,
            headlines,
            calendar,
            notifier,
            destination,
            explainer,
        } = collaborators;

        let enricher = Enricher::new(
            provider,
            headlines,
            store.clone(),
            clock.clone(),
            config.scan.clone(),
            Duration::from_secs(config.provider.timeout_secs),
        )
        .with_event_dates(config.provider.event_dates.clone());

        Ok(Self {
            coordinator: RunCoordinator::new(
                store.clone(),
                config.coordinator.takeover_after_secs,
                config.coordinator.stale_after_secs,
            ),
            enricher,
            selector: CandidateSelector::new(config.scan.clone(), clock.clone(), calendar.clone()),
            tracker: OutcomeTracker::new(store.clone()),
            simulator: PaperSimulator::new(
                store.clone(),
                config.paper.clone(),
                config.regime.clone(),
                clock.clone(),
            ),
            classifier: RegimeClassifier::new(store.clone(), config.regime.clone(), clock.clone()),
            tuner: WeightTuner::new(store.clone(), config.adaptation.clone(), clock.clone()),
            lab: StrategyLab::new(store.clone(), config.lab.clone()),
            config,
            store,
            clock,
            calendar,
            notifier,
            destination,
            explainer,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn clock(&self) -> &SessionClock {
        &self.clock
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &RunCoordinator {
        &self.coordinator
    }

    async fn notify(&self, text: &str) {
        crate::notify::deliver(self.notifier.as_ref(), &self.destination, text, NOTIFY_TIMEOUT).await;
    }
}
