//! FlowScout entry point.
//!
//! `flowscout <hourly|nightly|lab|liveness|daemon> [--config PATH]`
//!
//! The one-shot commands are meant for an external timer and watchdog;
//! `daemon` drives both schedules itself and serves the status API.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use secrecy::Secret;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use flowscout::calendar::{TradingCalendar, WeekdayCalendar};
use flowscout::config::AppConfig;
use flowscout::data::news::NewsApiSource;
use flowscout::data::replay::load_replay;
use flowscout::data::{HeadlineSource, MarketDataProvider};
use flowscout::engine::{Collaborators, Engine};
use flowscout::llm::openrouter::OpenRouterClient;
use flowscout::llm::Explainer;
use flowscout::notify::TelegramNotifier;
use flowscout::status::routes::StatusState;
use flowscout::status::spawn_status_server;
use flowscout::storage::Store;
use flowscout::types::{CoreError, CoreResult};

const USAGE: &str = "usage: flowscout <hourly|nightly|lab|liveness|daemon> [--config PATH]";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Hourly,
    Nightly,
    Lab,
    Liveness,
    Daemon,
}

fn parse_args(args: &[String]) -> Result<(Command, String)> {
    let mut command = None;
    let mut config = "config.toml".to_string();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config = it.next().context("--config needs a path")?.clone();
            }
            "hourly" => command = Some(Command::Hourly),
            "nightly" => command = Some(Command::Nightly),
            "lab" => command = Some(Command::Lab),
            "liveness" => command = Some(Command::Liveness),
            "daemon" => command = Some(Command::Daemon),
            other => bail!("unknown argument '{other}'\n{USAGE}"),
        }
    }
    match command {
        Some(c) => Ok((c, config)),
        None => bail!("{USAGE}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, config_path) = parse_args(&args)?;
    let cfg = AppConfig::load(&config_path)?;
    info!(name = %cfg.app.name, ?command, config = %config_path, "FlowScout starting");

    let store = Store::connect(&cfg.app.db_path)
        .await
        .with_context(|| format!("Failed to open database {}", cfg.app.db_path))?;
    let calendar: Arc<dyn TradingCalendar> = Arc::new(WeekdayCalendar::new(cfg.schedule.holidays.clone()));
    let collaborators = build_collaborators(&cfg, calendar.clone()).await?;
    let engine = Engine::new(cfg.clone(), store.clone(), collaborators)?;

    match command {
        Command::Hourly => {
            finish(engine.run_hourly(Utc::now()).await.map(|_| ()))?;
        }
        Command::Nightly => {
            finish(engine.run_nightly(Utc::now()).await.map(|_| ()))?;
        }
        Command::Lab => {
            let report = engine.run_lab(Utc::now()).await?;
            println!(
                "{:>9} {:>8} {:>6} {:>9} {:>6} {:>8} {:>10}",
                "threshold", "holdings", "trades", "avg", "win", "sharpe", "objective"
            );
            for row in &report.rows {
                println!(
                    "{:>9.0} {:>8} {:>6} {:>8.3}% {:>5.1}% {:>8.2} {:>10}",
                    row.threshold,
                    row.max_holdings,
                    row.trades,
                    row.avg_return * 100.0,
                    row.win_rate * 100.0,
                    row.sharpe,
                    row.objective.map(|o| format!("{o:.4}")).unwrap_or_else(|| "-".into())
                );
            }
            if report.rows.is_empty() {
                println!("{:?} ({} runs)", report.status, report.runs);
            }
        }
        Command::Liveness => {
            let liveness = engine.coordinator().liveness(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&liveness)?);
            if liveness.stale {
                std::process::exit(1);
            }
        }
        Command::Daemon => {
            if cfg.status.enabled {
                let state = Arc::new(StatusState {
                    store: store.clone(),
                    coordinator: engine.coordinator().clone(),
                    clock: engine.clock().clone(),
                });
                spawn_status_server(state, cfg.status.port).await?;
            }
            run_daemon(&engine, &cfg, calendar.as_ref()).await?;
        }
    }

    Ok(())
}

/// Expected no-ops exit cleanly; anything else is an error exit.
fn finish(result: CoreResult<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_noop() => {
            info!(reason = %e, "Nothing to do");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn build_collaborators(cfg: &AppConfig, calendar: Arc<dyn TradingCalendar>) -> Result<Collaborators> {
    let replay = Arc::new(load_replay(&cfg.provider.replay_dir).await?);
    let provider: Arc<dyn MarketDataProvider> = replay.clone();
    let mut collaborators = Collaborators::new(provider, calendar);

    collaborators.headlines = match cfg.provider.news_api_key_env.as_deref() {
        Some(env) => match AppConfig::resolve_env(env) {
            Ok(key) => Some(Arc::new(NewsApiSource::new(
                Secret::new(key),
                &cfg.provider.news_query,
                cfg.provider.timeout_secs,
            )?) as Arc<dyn HeadlineSource>),
            Err(e) => {
                warn!(error = %e, "News API key missing, using replay headlines");
                Some(replay.clone() as Arc<dyn HeadlineSource>)
            }
        },
        None => Some(replay as Arc<dyn HeadlineSource>),
    };

    if let (Some(token_env), Some(chat_env)) = (
        cfg.alerts.telegram_bot_token_env.as_deref(),
        cfg.alerts.telegram_chat_id_env.as_deref(),
    ) {
        match (AppConfig::resolve_env(token_env), AppConfig::resolve_env(chat_env)) {
            (Ok(token), Ok(chat_id)) => {
                collaborators.notifier = Arc::new(TelegramNotifier::new(Secret::new(token), 10)?);
                collaborators.destination = chat_id;
                info!("Telegram notifications enabled");
            }
            _ => warn!("Telegram env vars not set, reports go to the log"),
        }
    }

    if cfg.explainer.enabled {
        match AppConfig::resolve_env(&cfg.explainer.api_key_env) {
            Ok(key) => {
                let client = OpenRouterClient::new(Secret::new(key), &cfg.explainer)?;
                info!(model = %client.model_name(), "Candidate explanations enabled");
                collaborators.explainer = Some(Arc::new(client) as Arc<dyn Explainer>);
            }
            Err(e) => warn!(error = %e, "Explainer enabled but no API key, continuing without"),
        }
    }

    Ok(collaborators)
}

/// Tick until Ctrl-C: an hourly cycle whenever a new boundary is inside
/// the session, and the nightly batch once per trading day after the
/// configured local time. Failed cycles are logged and retried on the
/// next boundary.
async fn run_daemon(engine: &Engine, cfg: &AppConfig, calendar: &dyn TradingCalendar) -> Result<()> {
    let nightly_at = cfg.schedule.nightly_time()?;
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.schedule.tick_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(tick_secs = cfg.schedule.tick_secs, "Entering daemon loop. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Utc::now();
                log_outcome("hourly", engine.run_hourly(now).await.map(|_| ()));

                let local = engine.clock().local(now);
                if calendar.is_trading_day(local.date_naive()) && local.time() >= nightly_at {
                    log_outcome("nightly", engine.run_nightly(now).await.map(|_| ()));
                }
                if let Err(e) = engine.coordinator().heartbeat("daemon", now, "tick").await {
                    error!(error = %e, "Heartbeat failed");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    info!("FlowScout shut down cleanly.");
    Ok(())
}

fn log_outcome(what: &str, result: CoreResult<()>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_noop() => info!(what, reason = %e, "Skipped"),
        Err(CoreError::DataUnavailable(msg)) => {
            warn!(what, reason = %msg, "Data unavailable, retrying next boundary")
        }
        Err(e) => error!(what, error = %e, "Cycle failed"),
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("flowscout=info"));

    if std::env::var("FLOWSCOUT_LOG_JSON").is_ok() {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
