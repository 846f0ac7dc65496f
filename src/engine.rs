// =============================================================================
// DECISION ENGINE
// Single task that owns the histories, the scheduler, and the trade
// lifecycle. Ingestion tasks feed it through a bounded channel; the
// oracle call happens here, timeout-bounded, so ingestion never waits
// on it. Clock is the snapshot timestamp, not wall time.
// =============================================================================

use crate::classifier::light_count;
use crate::detectors::DetectorBank;
use crate::error::EngineError;
use crate::execution::OrderExecutor;
use crate::gate::{self, GateDecision, GateStats, TimeframeView};
use crate::history::TimeframeHistory;
use crate::ingest::TimeframeTick;
use crate::lifecycle::{EntryIntent, TradeLifecycle, TradeState};
use crate::notify::{send_event, Notifier, NotifyEvent};
use crate::oracle::{recommend_bounded, DecisionOracle, OracleRequest, TimeframeContext};
use crate::outcome_log::{CycleAudit, OutcomeLog, SnapshotJournal};
use crate::scheduler::Scheduler;
use crate::types::{
    Color, CycleRecord, Direction, Recommendation, Signal, ThresholdConfig,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub struct EngineSettings {
    pub timeframes: Vec<String>,
    pub position_size: Decimal,
    pub oracle_timeout_secs: u64,
    pub min_oracle_spacing_secs: i64,
    pub choppiness_lookback: usize,
    pub max_close_retries: u32,
    /// Log gate statistics every N evaluations.
    pub stats_log_every: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timeframes: vec!["5m".to_string(), "1h".to_string()],
            position_size: Decimal::ONE,
            oracle_timeout_secs: 30,
            min_oracle_spacing_secs: 60,
            choppiness_lookback: 20,
            max_close_retries: 3,
            stats_log_every: 20,
        }
    }
}

pub struct Engine {
    settings: EngineSettings,
    histories: HashMap<String, TimeframeHistory>,
    scheduler: Scheduler,
    lifecycle: TradeLifecycle,
    detectors: DetectorBank,
    gate_stats: GateStats,
    config_rx: watch::Receiver<ThresholdConfig>,
    oracle: Arc<dyn DecisionOracle>,
    executor: Arc<dyn OrderExecutor>,
    notifier: Arc<dyn Notifier>,
    outcomes: Arc<OutcomeLog>,
    journal: Arc<SnapshotJournal>,
    audit: Arc<CycleAudit>,
    /// Set on unrecoverable execution failure; blocks new entries but
    /// keeps exit handling alive for an already-open position.
    suspended: bool,
    close_alert_sent: bool,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: EngineSettings,
        detectors: DetectorBank,
        config_rx: watch::Receiver<ThresholdConfig>,
        oracle: Arc<dyn DecisionOracle>,
        executor: Arc<dyn OrderExecutor>,
        notifier: Arc<dyn Notifier>,
        outcomes: Arc<OutcomeLog>,
        journal: Arc<SnapshotJournal>,
        audit: Arc<CycleAudit>,
    ) -> Self {
        let histories = settings
            .timeframes
            .iter()
            .map(|tf| (tf.clone(), TimeframeHistory::new(tf.clone())))
            .collect();
        let scheduler = Scheduler::new(&settings.timeframes, settings.min_oracle_spacing_secs);
        let lifecycle = TradeLifecycle::new(settings.max_close_retries);
        Self {
            settings,
            histories,
            scheduler,
            lifecycle,
            detectors,
            gate_stats: GateStats::default(),
            config_rx,
            oracle,
            executor,
            notifier,
            outcomes,
            journal,
            audit,
            suspended: false,
            close_alert_sent: false,
        }
    }

    /// Consume ticks until the channel closes or shutdown flips.
    pub async fn run(
        mut self,
        mut ticks: mpsc::Receiver<TimeframeTick>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("🚀 decision engine running on {:?}", self.settings.timeframes);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown requested, engine stopping");
                    break;
                }
                tick = ticks.recv() => match tick {
                    Some(tick) => self.handle_tick(tick).await,
                    None => {
                        warn!("tick channel closed, engine stopping");
                        break;
                    }
                },
            }
        }
    }

    pub async fn handle_tick(&mut self, tick: TimeframeTick) {
        let now = tick.snapshot.timestamp;
        let price = tick.snapshot.price;
        self.executor.mark_price(price);

        if let Err(e) = self.journal.append(&tick.timeframe, &tick.snapshot) {
            warn!("journal append failed: {:#}", e);
        }

        match self.histories.get_mut(&tick.timeframe) {
            Some(history) => {
                history.push(tick.snapshot);
            }
            None => {
                warn!("tick for untracked timeframe {}", tick.timeframe);
                return;
            }
        }

        // Exits are checked on every tick; entries only at candle
        // boundaries.
        self.handle_position(price, now).await;

        if self.lifecycle.is_idle() && !self.suspended {
            self.evaluate_entry(price, now).await;
        }
    }

    // =========================================================================
    // EXIT PATH
    // =========================================================================

    async fn handle_position(&mut self, price: Decimal, now: DateTime<Utc>) {
        let config = self.config_rx.borrow().clone();

        if let TradeState::Open { .. } = self.lifecycle.state() {
            if let Some(direction) = self.lifecycle.position().map(|p| p.direction) {
                let reversed = self.ribbon_reversed_against(direction);
                if let Some(reason) =
                    self.lifecycle
                        .check_exit(price, reversed, now, config.max_hold_secs)
                {
                    info!("📤 exit triggered: {}", reason);
                    if let Err(e) = self.lifecycle.begin_exit(reason) {
                        error!("exit transition refused: {:?}", e);
                    }
                }
            }
        }

        if let TradeState::ExitPending { .. } = self.lifecycle.state() {
            self.try_close(now).await;
        }
    }

    async fn try_close(&mut self, now: DateTime<Utc>) {
        let position = match self.lifecycle.position() {
            Some(p) => p.clone(),
            None => return,
        };
        match self
            .executor
            .close(position.id, position.direction, self.settings.position_size)
            .await
        {
            Ok(fill) => {
                // Lifecycle timing runs on the snapshot clock; the
                // fill timestamp is informational only.
                match self.lifecycle.confirm_close(fill.price, now) {
                    Ok(record) => {
                        info!(
                            "✅ position {} closed: {} pnl={} ({})",
                            record.position_id, record.direction, record.pnl, record.exit_reason
                        );
                        if let Err(e) = self.outcomes.append(&record) {
                            error!("outcome append failed: {:#}", e);
                        }
                        self.scheduler.arm_cooldown(record.closed_at);
                        self.close_alert_sent = false;
                        send_event(
                            &self.notifier,
                            NotifyEvent::PositionClosed {
                                position_id: record.position_id,
                                exit_reason: record.exit_reason,
                                pnl: record.pnl,
                            },
                        );
                    }
                    Err(e) => error!("close confirmation refused: {:?}", e),
                }
            }
            Err(e) => {
                if e.is_unrecoverable() {
                    self.suspend(now, &e);
                }
                let exhausted = self.lifecycle.record_close_failure();
                warn!("⚠️ close attempt failed: {}", e);
                if exhausted && !self.close_alert_sent {
                    self.close_alert_sent = true;
                    error!("❌ close retries exhausted for {}", position.id);
                    send_event(
                        &self.notifier,
                        NotifyEvent::CloseRetriesExhausted {
                            position_id: position.id,
                            attempts: self.settings.max_close_retries,
                        },
                    );
                }
            }
        }
    }

    // =========================================================================
    // ENTRY PATH
    // =========================================================================

    async fn evaluate_entry(&mut self, price: Decimal, now: DateTime<Utc>) {
        let config = self.config_rx.borrow().clone();

        if let Err(hold) = self.scheduler.permits_evaluation(now, config.cooldown_secs) {
            debug!("entry evaluation held: {:?}", hold);
            return;
        }

        let signals = self.collect_signals();
        let views = self.build_views();
        let contexts = self.build_contexts(price, &views);

        // The oracle consultation counts against spacing even when it
        // fails; a flapping oracle must not be hammered every tick.
        self.scheduler.mark_evaluated(now);

        let request = OracleRequest {
            contexts,
            active_signals: signals.clone(),
            thresholds: config.clone(),
            position_state: "idle".to_string(),
        };
        let recommendation = match recommend_bounded(
            self.oracle.as_ref(),
            &request,
            self.settings.oracle_timeout_secs,
        )
        .await
        {
            Ok(rec) => rec,
            Err(e) => {
                // Fail safe: a silent or garbled oracle never becomes
                // an entry.
                warn!("🔮 oracle unavailable, no entry this cycle: {}", e);
                self.record_cycle(now, false, format!("oracle: {}", e), 0.0, &signals);
                return;
            }
        };

        let adjusted = self.adjust_confidence(&recommendation, &signals, &config);
        let choppiness = self.max_choppiness();
        let cooldown = self.scheduler.cooldown_remaining_secs(now, config.cooldown_secs);

        let decision = gate::evaluate(&adjusted, &signals, &views, &config, choppiness, cooldown);
        self.gate_stats.record(&decision);
        if self.gate_stats.evaluations % self.settings.stats_log_every == 0 {
            info!(
                "📊 gate stats: {} evals, {:.1}% accepted",
                self.gate_stats.evaluations,
                self.gate_stats.accept_rate()
            );
        }

        match decision {
            GateDecision::Accept => {
                self.record_cycle(now, true, "accepted".to_string(), adjusted.confidence, &signals);
                self.open_position(&adjusted, &signals, price, now, &config).await;
            }
            GateDecision::Reject(reason) => {
                debug!("gate rejected: {}", reason);
                self.record_cycle(now, false, reason.to_string(), adjusted.confidence, &signals);
            }
        }
    }

    async fn open_position(
        &mut self,
        rec: &Recommendation,
        signals: &[Signal],
        price: Decimal,
        now: DateTime<Utc>,
        config: &ThresholdConfig,
    ) {
        let intent = EntryIntent {
            direction: rec.direction,
            stop_loss: rec.stop_loss,
            take_profit: rec.take_profit,
            confidence: rec.confidence,
            signal_kind: signals
                .iter()
                .filter(|s| s.direction == rec.direction)
                .min_by_key(|s| s.kind.priority())
                .map(|s| s.kind),
        };
        if let Err(e) = self.lifecycle.begin_entry(intent) {
            error!("entry transition refused: {:?}", e);
            return;
        }

        match self
            .executor
            .open(rec.direction, self.settings.position_size, price)
            .await
        {
            Ok(fill) => match self.lifecycle.confirm_open(fill.price, now, config.min_hold_secs) {
                Ok(position) => {
                    info!(
                        "📥 position {} opened: {} @ {} (sl {}, tp {})",
                        position.id,
                        position.direction,
                        position.entry_price,
                        position.stop_loss,
                        position.take_profit
                    );
                    let event = NotifyEvent::PositionOpened {
                        position_id: position.id,
                        direction: position.direction,
                        entry_price: position.entry_price,
                    };
                    send_event(&self.notifier, event);
                }
                Err(e) => error!("open confirmation refused: {:?}", e),
            },
            Err(e) => {
                // No trade occurred; back to idle without arming the
                // cooldown.
                warn!("⚠️ entry order failed: {}", e);
                if let Err(te) = self.lifecycle.fail_entry() {
                    error!("entry failure transition refused: {:?}", te);
                }
                send_event(
                    &self.notifier,
                    NotifyEvent::EntryFailed {
                        direction: rec.direction,
                        error: e.to_string(),
                    },
                );
                if e.is_unrecoverable() {
                    self.suspend(now, &e);
                }
            }
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn collect_signals(&self) -> Vec<Signal> {
        self.settings
            .timeframes
            .iter()
            .filter_map(|tf| self.histories.get(tf))
            .filter_map(|h| self.detectors.evaluate(h))
            .collect()
    }

    fn build_views(&self) -> Vec<TimeframeView> {
        self.histories
            .values()
            .filter_map(|h| {
                let classification = h.latest_classification()?;
                let snapshot = h.latest()?;
                Some(TimeframeView {
                    timeframe: h.timeframe.clone(),
                    classification,
                    light_bullish: light_count(snapshot, Color::Bullish),
                    light_bearish: light_count(snapshot, Color::Bearish),
                })
            })
            .collect()
    }

    fn build_contexts(&self, price: Decimal, views: &[TimeframeView]) -> Vec<TimeframeContext> {
        views
            .iter()
            .map(|v| TimeframeContext {
                timeframe: v.timeframe.clone(),
                classification: v.classification,
                price,
                light_bullish: v.light_bullish,
                light_bearish: v.light_bearish,
            })
            .collect()
    }

    /// Detector boost and learned direction bias folded into the
    /// oracle's confidence, clamped to [0, 1].
    fn adjust_confidence(
        &self,
        rec: &Recommendation,
        signals: &[Signal],
        config: &ThresholdConfig,
    ) -> Recommendation {
        let boost: f64 = signals
            .iter()
            .filter(|s| s.direction == rec.direction)
            .map(|s| s.confidence_boost)
            .fold(0.0, f64::max);
        let bias = match rec.direction {
            Direction::Long => config.direction_bias,
            Direction::Short => -config.direction_bias,
        } * 0.05;
        let mut adjusted = rec.clone();
        adjusted.confidence = (rec.confidence + boost + bias).clamp(0.0, 1.0);
        adjusted
    }

    fn max_choppiness(&self) -> u32 {
        self.histories
            .values()
            .map(|h| h.choppiness_flips(self.settings.choppiness_lookback))
            .max()
            .unwrap_or(0)
    }

    /// Full reversal against the held direction: some timeframe is
    /// fully dominant the other way and none still leans with the
    /// position.
    fn ribbon_reversed_against(&self, direction: Direction) -> bool {
        let states: Vec<_> = self
            .histories
            .values()
            .filter_map(|h| h.latest_classification())
            .map(|c| c.state)
            .collect();
        let opposite = direction.opposite();
        states.iter().any(|s| s.dominant_direction() == Some(opposite))
            && !states.iter().any(|s| s.leans(direction))
    }

    fn record_cycle(
        &self,
        now: DateTime<Utc>,
        accepted: bool,
        reason: String,
        confidence: f64,
        signals: &[Signal],
    ) {
        let record = CycleRecord {
            evaluated_at: now,
            accepted,
            reason,
            confidence,
            signal_kind: signals.iter().min_by_key(|s| s.kind.priority()).map(|s| s.kind),
        };
        if let Err(e) = self.audit.append(&record) {
            warn!("cycle audit append failed: {:#}", e);
        }
    }

    fn suspend(&mut self, now: DateTime<Utc>, cause: &EngineError) {
        if self.suspended {
            return;
        }
        self.suspended = true;
        error!("🛑 engine suspended: {}", cause);
        send_event(
            &self.notifier,
            NotifyEvent::EngineSuspended {
                reason: cause.to_string(),
                at: now,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::DetectorSettings;
    use crate::execution::{Fill, PaperExecutor};
    use crate::notify::NoopNotifier;
    use crate::types::{ExitReason, IndicatorReading, Intensity, Snapshot};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn snapshot(secs: i64, price: i64, color: Color) -> Snapshot {
        Snapshot {
            timestamp: t(secs),
            price: Decimal::from(price),
            readings: vec![
                IndicatorReading {
                    color,
                    intensity: Intensity::Normal,
                    value: Decimal::from(price),
                };
                6
            ],
        }
    }

    fn tick(tf: &str, secs: i64, price: i64, color: Color) -> TimeframeTick {
        TimeframeTick {
            timeframe: tf.to_string(),
            snapshot: snapshot(secs, price, color),
        }
    }

    struct FixedOracle {
        rec: Option<Recommendation>,
        calls: AtomicU32,
    }

    impl FixedOracle {
        fn recommending(direction: Direction, confidence: f64) -> Self {
            Self {
                rec: Some(Recommendation {
                    direction,
                    entry_recommended: true,
                    confidence,
                    stop_loss: Decimal::from(95),
                    take_profit: Decimal::from(110),
                    reasoning: String::new(),
                }),
                calls: AtomicU32::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                rec: None,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DecisionOracle for FixedOracle {
        async fn recommend(
            &self,
            _request: &OracleRequest,
        ) -> Result<Recommendation, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.rec {
                Some(rec) => Ok(rec.clone()),
                None => Err(EngineError::OracleMalformed("boom".to_string())),
            }
        }
    }

    struct RevokedExecutor;

    #[async_trait]
    impl OrderExecutor for RevokedExecutor {
        async fn open(
            &self,
            _direction: Direction,
            _size: Decimal,
            _price: Decimal,
        ) -> Result<Fill, EngineError> {
            Err(EngineError::ExecutionUnrecoverable("401".to_string()))
        }

        async fn close(
            &self,
            _position_id: uuid::Uuid,
            _direction: Direction,
            _size: Decimal,
        ) -> Result<Fill, EngineError> {
            Err(EngineError::ExecutionUnrecoverable("401".to_string()))
        }
    }

    fn engine_with(
        dir: &tempfile::TempDir,
        oracle: Arc<dyn DecisionOracle>,
        executor: Arc<dyn OrderExecutor>,
    ) -> Engine {
        let (_tx, rx) = watch::channel(ThresholdConfig::default());
        let settings = EngineSettings {
            timeframes: vec!["5m".to_string(), "1h".to_string()],
            ..EngineSettings::default()
        };
        Engine::new(
            settings,
            DetectorBank::new(DetectorSettings::default()),
            rx,
            oracle,
            executor,
            Arc::new(NoopNotifier),
            Arc::new(OutcomeLog::open(dir.path().join("outcomes.jsonl")).unwrap()),
            Arc::new(SnapshotJournal::open(dir.path().join("journal.jsonl")).unwrap()),
            Arc::new(CycleAudit::open(dir.path().join("cycles.jsonl")).unwrap()),
        )
    }

    #[tokio::test]
    async fn aligned_market_opens_a_position() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = Arc::new(FixedOracle::recommending(Direction::Long, 0.9));
        let mut engine = engine_with(&dir, oracle, Arc::new(PaperExecutor::new()));

        engine.handle_tick(tick("1h", 0, 100, Color::Bullish)).await;

        assert_eq!(engine.lifecycle.state().name(), "open");
        let pos = engine.lifecycle.position().unwrap();
        assert_eq!(pos.direction, Direction::Long);
        assert_eq!(pos.entry_price, Decimal::from(100));
    }

    #[tokio::test]
    async fn oracle_failure_resolves_to_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = Arc::new(FixedOracle::failing());
        let mut engine = engine_with(&dir, oracle.clone(), Arc::new(PaperExecutor::new()));

        engine.handle_tick(tick("5m", 0, 100, Color::Bullish)).await;

        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.lifecycle.state().name(), "idle");
    }

    #[tokio::test]
    async fn stop_loss_tick_closes_and_logs_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = Arc::new(FixedOracle::recommending(Direction::Long, 0.9));
        let mut engine = engine_with(&dir, oracle, Arc::new(PaperExecutor::new()));

        engine.handle_tick(tick("5m", 0, 100, Color::Bullish)).await;
        assert_eq!(engine.lifecycle.state().name(), "open");

        // Price through the stop: close fires on the same tick.
        engine.handle_tick(tick("5m", 60, 94, Color::Bullish)).await;
        assert_eq!(engine.lifecycle.state().name(), "idle");

        let outcomes = engine.outcomes.read_all().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].exit_reason, ExitReason::StopLoss);
        assert_eq!(outcomes[0].pnl, Decimal::from(-6));
    }

    #[tokio::test]
    async fn cooldown_after_close_blocks_reentry() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = Arc::new(FixedOracle::recommending(Direction::Long, 0.9));
        let mut engine = engine_with(&dir, oracle.clone(), Arc::new(PaperExecutor::new()));

        engine.handle_tick(tick("5m", 0, 100, Color::Bullish)).await;
        engine.handle_tick(tick("5m", 60, 94, Color::Bullish)).await;
        assert_eq!(engine.lifecycle.state().name(), "idle");
        let calls_after_close = oracle.calls.load(Ordering::SeqCst);

        // Fresh candle 10 minutes later, but inside the 1800s cooldown:
        // the oracle must not even be consulted.
        engine.handle_tick(tick("5m", 660, 100, Color::Bullish)).await;
        assert_eq!(oracle.calls.load(Ordering::SeqCst), calls_after_close);
        assert_eq!(engine.lifecycle.state().name(), "idle");
    }

    #[tokio::test]
    async fn unrecoverable_entry_failure_suspends_engine() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = Arc::new(FixedOracle::recommending(Direction::Long, 0.9));
        let mut engine = engine_with(&dir, oracle.clone(), Arc::new(RevokedExecutor));

        engine.handle_tick(tick("5m", 0, 100, Color::Bullish)).await;
        assert_eq!(engine.lifecycle.state().name(), "idle");
        assert!(engine.suspended);

        // Next boundary: suspended engines stop evaluating entirely.
        let calls = oracle.calls.load(Ordering::SeqCst);
        engine.handle_tick(tick("5m", 300, 100, Color::Bullish)).await;
        assert_eq!(oracle.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn reversal_exit_waits_for_min_hold() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = Arc::new(FixedOracle::recommending(Direction::Long, 0.9));
        let mut engine = engine_with(&dir, oracle, Arc::new(PaperExecutor::new()));

        engine.handle_tick(tick("5m", 0, 100, Color::Bullish)).await;
        engine.handle_tick(tick("1h", 1, 100, Color::Bullish)).await;
        assert_eq!(engine.lifecycle.state().name(), "open");

        // Full reversal on both timeframes, 2 minutes in: suppressed.
        engine.handle_tick(tick("5m", 120, 100, Color::Bearish)).await;
        engine.handle_tick(tick("1h", 121, 100, Color::Bearish)).await;
        assert_eq!(engine.lifecycle.state().name(), "open");

        // Same reversal past the 900s deadline: exits.
        engine.handle_tick(tick("5m", 920, 100, Color::Bearish)).await;
        assert_eq!(engine.lifecycle.state().name(), "idle");
        let outcomes = engine.outcomes.read_all().unwrap();
        assert_eq!(outcomes[0].exit_reason, ExitReason::RibbonReversal);
    }
}
