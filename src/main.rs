mod classifier;
mod detectors;
mod engine;
mod error;
mod execution;
mod gate;
mod history;
mod ingest;
mod learning;
mod lifecycle;
mod notify;
mod oracle;
mod outcome_log;
mod scheduler;
mod types;

use crate::detectors::{DetectorBank, DetectorSettings};
use crate::engine::{Engine, EngineSettings};
use crate::execution::{HttpExecutor, OrderExecutor, PaperExecutor};
use crate::ingest::{HttpIngestor, MarketSnapshotIngestor, TimeframeTick};
use crate::learning::{LearningLoop, LearningSettings, WinRatePolicy};
use crate::notify::{NoopNotifier, Notifier, WebhookNotifier};
use crate::oracle::HttpOracle;
use crate::outcome_log::{CycleAudit, OutcomeLog, SnapshotJournal};
use crate::types::ThresholdConfig;
use anyhow::Context;
use config::Config;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Deserialize)]
struct AppSettings {
    app: AppConfig,
    trading: TradingConfig,
    endpoints: EndpointConfig,
    thresholds: ThresholdConfig,
    #[serde(default)]
    detectors: DetectorSettings,
    learning: LearningConfig,
}

#[derive(Debug, Deserialize)]
struct AppConfig {
    #[serde(default = "default_mode")]
    mode: String,
    symbol: String,
    data_dir: PathBuf,
}

fn default_mode() -> String {
    "paper".to_string()
}

#[derive(Debug, Deserialize)]
struct TradingConfig {
    timeframes: Vec<String>,
    position_size: Decimal,
    poll_interval_secs: u64,
    oracle_timeout_secs: u64,
    min_oracle_spacing_secs: i64,
    choppiness_lookback: usize,
    max_close_retries: u32,
}

#[derive(Debug, Deserialize)]
struct EndpointConfig {
    feed_url: String,
    oracle_url: String,
    exchange_url: String,
    webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LearningConfig {
    interval_secs: u64,
    lookback_secs: i64,
    min_samples: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("🚀 ribbon engine starting...");

    let settings = Config::builder()
        .add_source(config::File::with_name("config"))
        .build()?;
    let conf: AppSettings = settings.try_deserialize()?;
    conf.thresholds
        .validate()
        .map_err(crate::error::EngineError::ConfigCorruption)?;
    info!(
        "settings loaded: {} on {:?}, mode={}",
        conf.app.symbol, conf.trading.timeframes, conf.app.mode
    );

    // Durable logs. Outcomes and journal feed the learning loop; the
    // cycle audit is diagnostics only.
    let data_dir = &conf.app.data_dir;
    let outcomes = Arc::new(OutcomeLog::open(data_dir.join("outcomes.jsonl"))?);
    let journal = Arc::new(SnapshotJournal::open(data_dir.join("journal.jsonl"))?);
    let audit = Arc::new(CycleAudit::open(data_dir.join("cycles.jsonl"))?);

    // Collaborators per mode.
    let executor: Arc<dyn OrderExecutor> = if conf.app.mode == "live" {
        let api_key = std::env::var("EXCHANGE_API_KEY")
            .context("EXCHANGE_API_KEY must be set for live mode")?;
        let api_secret = std::env::var("EXCHANGE_API_SECRET")
            .context("EXCHANGE_API_SECRET must be set for live mode")?;
        Arc::new(HttpExecutor::new(
            conf.endpoints.exchange_url.clone(),
            api_key,
            api_secret,
            conf.app.symbol.clone(),
        ))
    } else {
        info!("📝 paper mode: orders will be simulated");
        Arc::new(PaperExecutor::new())
    };

    let notifier: Arc<dyn Notifier> = match &conf.endpoints.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(NoopNotifier),
    };

    let oracle = Arc::new(HttpOracle::new(conf.endpoints.oracle_url.clone()));
    let ingestor: Arc<dyn MarketSnapshotIngestor> = Arc::new(HttpIngestor::new(
        conf.endpoints.feed_url.clone(),
        conf.app.symbol.clone(),
    ));

    // Threshold config: seeded from file, replaced only by the
    // learning loop through the watch channel.
    let (config_tx, config_rx) = watch::channel(conf.thresholds.clone());

    let learning = LearningLoop::new(
        Arc::clone(&outcomes),
        Arc::clone(&journal),
        Box::new(WinRatePolicy::default()),
        config_tx,
        LearningSettings {
            interval_secs: conf.learning.interval_secs,
            lookback_secs: conf.learning.lookback_secs,
            min_samples: conf.learning.min_samples,
            ..LearningSettings::default()
        },
    );
    tokio::spawn(learning.run());

    // Ingestion fans into one bounded channel; the engine drains it.
    let (tick_tx, tick_rx) = mpsc::channel::<TimeframeTick>(64);
    for timeframe in &conf.trading.timeframes {
        tokio::spawn(ingest::run_polling_task(
            Arc::clone(&ingestor),
            timeframe.clone(),
            Duration::from_secs(conf.trading.poll_interval_secs),
            tick_tx.clone(),
        ));
    }
    drop(tick_tx);

    let engine_settings = EngineSettings {
        timeframes: conf.trading.timeframes.clone(),
        position_size: conf.trading.position_size,
        oracle_timeout_secs: conf.trading.oracle_timeout_secs,
        min_oracle_spacing_secs: conf.trading.min_oracle_spacing_secs,
        choppiness_lookback: conf.trading.choppiness_lookback,
        max_close_retries: conf.trading.max_close_retries,
        ..EngineSettings::default()
    };
    let engine = Engine::new(
        engine_settings,
        DetectorBank::new(conf.detectors),
        config_rx,
        oracle,
        executor,
        notifier,
        outcomes,
        journal,
        audit,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_task = tokio::spawn(engine.run(tick_rx, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        error!("engine task ended abnormally: {}", e);
    }

    info!("👋 ribbon engine stopped");
    Ok(())
}
