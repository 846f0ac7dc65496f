// =============================================================================
// RETROSPECTIVE LEARNING LOOP
// Out-of-band batch process: reads the durable outcome log and snapshot
// journal over a lookback window, compares realized performance against
// hindsight replay, and publishes a new ThresholdConfig via a single
// atomic swap. Never touches the live decision path or the in-memory
// position.
// =============================================================================

use crate::outcome_log::{JournalEntry, OutcomeLog, SnapshotJournal};
use crate::classifier::classify;
use crate::types::{Direction, ExitReason, OutcomeRecord, SignalKind, ThresholdConfig};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

// =============================================================================
// PERFORMANCE AGGREGATION
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct BucketStats {
    pub trades: usize,
    pub wins: usize,
    pub gross_win: Decimal,
    pub gross_loss: Decimal,
}

impl BucketStats {
    fn record(&mut self, outcome: &OutcomeRecord) {
        self.trades += 1;
        if outcome.is_win() {
            self.wins += 1;
            self.gross_win += outcome.pnl;
        } else {
            self.gross_loss += outcome.pnl.abs();
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64
        }
    }

    pub fn avg_win(&self) -> Decimal {
        if self.wins == 0 {
            Decimal::ZERO
        } else {
            self.gross_win / Decimal::from(self.wins as i64)
        }
    }

    pub fn avg_loss(&self) -> Decimal {
        let losses = self.trades - self.wins;
        if losses == 0 {
            Decimal::ZERO
        } else {
            self.gross_loss / Decimal::from(losses as i64)
        }
    }
}

/// Realized performance over the lookback window, sliced the ways the
/// adjustment policy cares about.
#[derive(Debug, Clone, Default)]
pub struct PerformanceReport {
    pub overall: BucketStats,
    pub by_kind: HashMap<Option<SignalKind>, BucketStats>,
    pub by_direction: HashMap<Direction, BucketStats>,
    pub by_exit: HashMap<ExitReason, BucketStats>,
}

impl PerformanceReport {
    pub fn from_outcomes(outcomes: &[OutcomeRecord]) -> Self {
        let mut report = Self::default();
        for o in outcomes {
            report.overall.record(o);
            report.by_kind.entry(o.signal_kind_at_entry).or_default().record(o);
            report.by_direction.entry(o.direction).or_default().record(o);
            report.by_exit.entry(o.exit_reason).or_default().record(o);
        }
        report
    }

    fn direction_win_rate(&self, dir: Direction) -> Option<f64> {
        self.by_direction.get(&dir).map(BucketStats::win_rate)
    }
}

// =============================================================================
// HINDSIGHT REPLAY
// =============================================================================

/// A trade reconstructed with perfect foresight from journaled prices.
/// Used only for retrospective comparison, never executed.
#[derive(Debug, Clone)]
pub struct HindsightTrade {
    pub direction: Direction,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub duration_secs: i64,
}

/// Zigzag sweep over the journaled price path: every swing whose
/// amplitude exceeds `min_move_pct` becomes one hindsight trade in the
/// swing's direction.
pub fn hindsight_trades(entries: &[JournalEntry], min_move_pct: f64) -> Vec<HindsightTrade> {
    let mut trades = Vec::new();
    let mut points = entries
        .iter()
        .map(|e| (e.snapshot.timestamp, e.snapshot.price));
    let first = match points.next() {
        Some(p) => p,
        None => return trades,
    };

    let exceeds = |from: Decimal, to: Decimal| -> bool {
        let from_f = from.to_f64().unwrap_or(0.0);
        if from_f == 0.0 {
            return false;
        }
        let to_f = to.to_f64().unwrap_or(0.0);
        ((to_f - from_f) / from_f).abs() >= min_move_pct
    };

    let mut pivot = first;
    let mut extreme = first;
    // None until the first move large enough to establish a leg.
    let mut rising: Option<bool> = None;

    let mut emit = |pivot: (DateTime<Utc>, Decimal), extreme: (DateTime<Utc>, Decimal)| {
        let up = extreme.1 > pivot.1;
        trades.push(HindsightTrade {
            direction: if up { Direction::Long } else { Direction::Short },
            entry_price: pivot.1,
            exit_price: extreme.1,
            pnl: (extreme.1 - pivot.1).abs(),
            duration_secs: extreme.0.signed_duration_since(pivot.0).num_seconds(),
        });
    };

    for point in points {
        match rising {
            None => {
                if exceeds(pivot.1, point.1) {
                    rising = Some(point.1 > pivot.1);
                    extreme = point;
                }
            }
            Some(up) => {
                let extended = if up {
                    point.1 > extreme.1
                } else {
                    point.1 < extreme.1
                };
                if extended {
                    extreme = point;
                } else if exceeds(extreme.1, point.1) {
                    emit(pivot, extreme);
                    pivot = extreme;
                    extreme = point;
                    rising = Some(!up);
                }
            }
        }
    }
    if rising.is_some() && exceeds(pivot.1, extreme.1) {
        emit(pivot, extreme);
    }
    trades
}

// =============================================================================
// HOLD-DURATION SWEEP
// =============================================================================

/// Fixed-target simulation: from every journal point whose ribbon has a
/// dominant direction, enter that direction and exit at target, stop,
/// or hold expiry. Returns the candidate hold duration with the best
/// average pnl fraction, if any simulated trade completed.
pub fn sweep_hold_durations(
    entries: &[JournalEntry],
    candidates: &[i64],
    target_pct: f64,
    stop_pct: f64,
) -> Option<(i64, f64)> {
    let mut best: Option<(i64, f64)> = None;

    for &hold_secs in candidates {
        let mut total = 0.0;
        let mut count = 0usize;

        for (i, entry) in entries.iter().enumerate() {
            let direction = match classify(&entry.snapshot).state.dominant_direction() {
                Some(d) => d,
                None => continue,
            };
            let entry_price = match entry.snapshot.price.to_f64() {
                Some(p) if p > 0.0 => p,
                _ => continue,
            };
            let deadline = entry.snapshot.timestamp + Duration::seconds(hold_secs);

            let mut result = None;
            for later in &entries[i + 1..] {
                let price = match later.snapshot.price.to_f64() {
                    Some(p) => p,
                    None => continue,
                };
                let change = match direction {
                    Direction::Long => (price - entry_price) / entry_price,
                    Direction::Short => (entry_price - price) / entry_price,
                };
                if change >= target_pct {
                    result = Some(target_pct);
                    break;
                }
                if change <= -stop_pct {
                    result = Some(-stop_pct);
                    break;
                }
                if later.snapshot.timestamp >= deadline {
                    result = Some(change);
                    break;
                }
            }
            if let Some(pnl) = result {
                total += pnl;
                count += 1;
            }
        }

        if count > 0 {
            let avg = total / count as f64;
            if best.map_or(true, |(_, b)| avg > b) {
                best = Some((hold_secs, avg));
            }
        }
    }
    best
}

// =============================================================================
// ADJUSTMENT POLICY
// =============================================================================

/// Everything a policy may look at when deriving a candidate config.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub performance: PerformanceReport,
    pub hindsight: Vec<HindsightTrade>,
    pub best_hold: Option<(i64, f64)>,
}

/// The threshold-adjustment rule is deliberately pluggable: derive a
/// candidate from the report. Versioning, validation, and the swap are
/// handled by the loop, never by the policy.
pub trait ThresholdPolicy: Send + Sync {
    fn derive(&self, current: &ThresholdConfig, report: &AnalysisReport) -> ThresholdConfig;
}

/// Default policy: nudge thresholds by fixed steps based on win-rate
/// comparisons. No claim of optimality; each adjustment is reversible
/// by the next cycle.
pub struct WinRatePolicy {
    pub confidence_step: f64,
    pub confidence_floor: f64,
    pub confidence_ceiling: f64,
    pub low_win_rate: f64,
    pub high_win_rate: f64,
}

impl Default for WinRatePolicy {
    fn default() -> Self {
        Self {
            confidence_step: 0.05,
            confidence_floor: 0.50,
            confidence_ceiling: 0.90,
            low_win_rate: 0.45,
            high_win_rate: 0.60,
        }
    }
}

impl ThresholdPolicy for WinRatePolicy {
    fn derive(&self, current: &ThresholdConfig, report: &AnalysisReport) -> ThresholdConfig {
        let mut next = current.clone();
        let perf = &report.performance;

        // Losing gate: demand more confidence. Winning gate: relax a
        // notch so the filter does not starve itself.
        let win_rate = perf.overall.win_rate();
        if win_rate < self.low_win_rate {
            next.min_confidence =
                (next.min_confidence + self.confidence_step).min(self.confidence_ceiling);
        } else if win_rate > self.high_win_rate {
            next.min_confidence =
                (next.min_confidence - self.confidence_step).max(self.confidence_floor);
        }

        // Lean toward whichever direction actually performed better,
        // moving halfway toward the observed delta each cycle.
        if let (Some(long_wr), Some(short_wr)) = (
            perf.direction_win_rate(Direction::Long),
            perf.direction_win_rate(Direction::Short),
        ) {
            let target = (long_wr - short_wr).clamp(-1.0, 1.0);
            next.direction_bias = ((next.direction_bias + target) / 2.0).clamp(-1.0, 1.0);
        }

        // Pull the minimum hold halfway toward the best simulated hold,
        // keeping it strictly inside (0, max_hold).
        if let Some((best_hold, _)) = report.best_hold {
            let target = best_hold.clamp(60, next.max_hold_secs - 60);
            next.min_hold_secs = (next.min_hold_secs + target) / 2;
        }

        // A hindsight set far larger than the realized trade count
        // means the gate is starving; relax confidence a notch, but
        // never while the realized trades themselves are losing.
        if win_rate >= self.low_win_rate
            && report.hindsight.len() >= 8
            && report.hindsight.len() >= perf.overall.trades * 4
        {
            next.min_confidence =
                (next.min_confidence - self.confidence_step).max(self.confidence_floor);
        }

        // Frequent reversal exits that lost money suggest the gate let
        // choppy conditions through; tighten the flip budget.
        if let Some(reversals) = perf.by_exit.get(&ExitReason::RibbonReversal) {
            if reversals.trades >= 3 && reversals.win_rate() < 0.35 {
                next.max_choppiness_flips = next.max_choppiness_flips.saturating_sub(1).max(1);
            }
        }

        next
    }
}

// =============================================================================
// THE LOOP
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum LearningStatus {
    Updated { version: u64 },
    InsufficientData { samples: usize, required: usize },
    RejectedCandidate { reason: String },
}

pub struct LearningSettings {
    pub interval_secs: u64,
    pub lookback_secs: i64,
    pub min_samples: usize,
    pub hindsight_min_move_pct: f64,
    pub sweep_hold_candidates: Vec<i64>,
    pub sweep_target_pct: f64,
    pub sweep_stop_pct: f64,
}

impl Default for LearningSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            lookback_secs: 7 * 86_400,
            min_samples: 10,
            hindsight_min_move_pct: 0.004,
            sweep_hold_candidates: vec![900, 1_800, 3_600, 7_200, 14_400],
            sweep_target_pct: 0.01,
            sweep_stop_pct: 0.005,
        }
    }
}

pub struct LearningLoop {
    outcomes: Arc<OutcomeLog>,
    journal: Arc<SnapshotJournal>,
    policy: Box<dyn ThresholdPolicy>,
    config_tx: watch::Sender<ThresholdConfig>,
    settings: LearningSettings,
}

impl LearningLoop {
    pub fn new(
        outcomes: Arc<OutcomeLog>,
        journal: Arc<SnapshotJournal>,
        policy: Box<dyn ThresholdPolicy>,
        config_tx: watch::Sender<ThresholdConfig>,
        settings: LearningSettings,
    ) -> Self {
        Self {
            outcomes,
            journal,
            policy,
            config_tx,
            settings,
        }
    }

    /// One learning cycle against the logs as of `now`.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<LearningStatus> {
        let cutoff = now - Duration::seconds(self.settings.lookback_secs);

        let outcomes: Vec<OutcomeRecord> = self
            .outcomes
            .read_all()?
            .into_iter()
            .filter(|o| o.closed_at >= cutoff)
            .collect();

        if outcomes.len() < self.settings.min_samples {
            return Ok(LearningStatus::InsufficientData {
                samples: outcomes.len(),
                required: self.settings.min_samples,
            });
        }

        let journal: Vec<JournalEntry> = self
            .journal
            .read_all()?
            .into_iter()
            .filter(|e| e.snapshot.timestamp >= cutoff)
            .collect();

        let report = AnalysisReport {
            performance: PerformanceReport::from_outcomes(&outcomes),
            hindsight: hindsight_trades(&journal, self.settings.hindsight_min_move_pct),
            best_hold: sweep_hold_durations(
                &journal,
                &self.settings.sweep_hold_candidates,
                self.settings.sweep_target_pct,
                self.settings.sweep_stop_pct,
            ),
        };
        info!(
            "📈 lookback: {} trades, {:.1}% win rate, avg win {}, avg loss {}, {} hindsight swings",
            report.performance.overall.trades,
            report.performance.overall.win_rate() * 100.0,
            report.performance.overall.avg_win(),
            report.performance.overall.avg_loss(),
            report.hindsight.len()
        );

        let current = self.config_tx.borrow().clone();
        let mut candidate = self.policy.derive(&current, &report);
        candidate.version = current.version + 1;

        if let Err(reason) = candidate.validate() {
            return Ok(LearningStatus::RejectedCandidate { reason });
        }

        let version = candidate.version;
        self.config_tx.send_replace(candidate);
        Ok(LearningStatus::Updated { version })
    }

    /// Periodic driver. Runs forever; every cycle reads only durable
    /// logs, so failures here cannot stall the decision path.
    pub async fn run(self) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.settings.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_once(Utc::now()) {
                Ok(LearningStatus::Updated { version }) => {
                    info!("🧠 published threshold config v{}", version);
                }
                Ok(LearningStatus::InsufficientData { samples, required }) => {
                    info!(
                        "🧠 learning skipped: insufficient data ({}/{} samples)",
                        samples, required
                    );
                }
                Ok(LearningStatus::RejectedCandidate { reason }) => {
                    warn!("🧠 candidate config rejected, keeping previous: {}", reason);
                }
                Err(e) => error!("learning cycle failed: {:#}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Color, IndicatorReading, Intensity, Snapshot};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn outcome(pnl: i64, direction: Direction, closed_at: DateTime<Utc>) -> OutcomeRecord {
        OutcomeRecord {
            position_id: Uuid::new_v4(),
            direction,
            entry_price: Decimal::from(100),
            exit_price: Decimal::from(100 + pnl),
            pnl: Decimal::from(pnl),
            duration_secs: 1_000,
            exit_reason: if pnl > 0 {
                ExitReason::TakeProfit
            } else {
                ExitReason::StopLoss
            },
            signal_kind_at_entry: Some(SignalKind::DarkTransition),
            confidence_at_entry: 0.7,
            closed_at,
        }
    }

    fn journal_point(secs: i64, price: i64, color: Color) -> JournalEntry {
        JournalEntry {
            timeframe: "5m".to_string(),
            snapshot: Snapshot {
                timestamp: t(secs),
                price: Decimal::from(price),
                readings: vec![
                    IndicatorReading {
                        color,
                        intensity: Intensity::Normal,
                        value: Decimal::from(price),
                    };
                    4
                ],
            },
        }
    }

    fn loop_with(
        dir: &tempfile::TempDir,
        min_samples: usize,
    ) -> (LearningLoop, watch::Receiver<ThresholdConfig>) {
        let outcomes = Arc::new(OutcomeLog::open(dir.path().join("outcomes.jsonl")).unwrap());
        let journal = Arc::new(SnapshotJournal::open(dir.path().join("journal.jsonl")).unwrap());
        let (tx, rx) = watch::channel(ThresholdConfig::default());
        let settings = LearningSettings {
            min_samples,
            ..LearningSettings::default()
        };
        let lp = LearningLoop::new(
            outcomes,
            journal,
            Box::new(WinRatePolicy::default()),
            tx,
            settings,
        );
        (lp, rx)
    }

    /// Below the minimum sample count the config must stay untouched
    /// and an insufficient-data status come back.
    #[test]
    fn insufficient_samples_leave_config_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let (lp, rx) = loop_with(&dir, 10);
        lp.outcomes.append(&outcome(5, Direction::Long, t(100))).unwrap();
        lp.outcomes.append(&outcome(-3, Direction::Short, t(200))).unwrap();

        let status = lp.run_once(t(1_000)).unwrap();
        assert_eq!(
            status,
            LearningStatus::InsufficientData {
                samples: 2,
                required: 10
            }
        );
        assert_eq!(*rx.borrow(), ThresholdConfig::default());
    }

    #[test]
    fn enough_samples_publish_bumped_version() {
        let dir = tempfile::tempdir().unwrap();
        let (lp, rx) = loop_with(&dir, 4);
        for i in 0..6 {
            lp.outcomes.append(&outcome(5, Direction::Long, t(i * 100))).unwrap();
        }

        let status = lp.run_once(t(10_000)).unwrap();
        assert_eq!(status, LearningStatus::Updated { version: 1 });
        assert_eq!(rx.borrow().version, 1);
    }

    #[test]
    fn invalid_candidate_is_rejected_and_previous_retained() {
        struct BrokenPolicy;
        impl ThresholdPolicy for BrokenPolicy {
            fn derive(&self, current: &ThresholdConfig, _: &AnalysisReport) -> ThresholdConfig {
                ThresholdConfig {
                    min_confidence: 5.0,
                    ..current.clone()
                }
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let outcomes = Arc::new(OutcomeLog::open(dir.path().join("o.jsonl")).unwrap());
        let journal = Arc::new(SnapshotJournal::open(dir.path().join("j.jsonl")).unwrap());
        let (tx, rx) = watch::channel(ThresholdConfig::default());
        let lp = LearningLoop::new(
            outcomes,
            journal,
            Box::new(BrokenPolicy),
            tx,
            LearningSettings {
                min_samples: 1,
                ..LearningSettings::default()
            },
        );
        lp.outcomes.append(&outcome(5, Direction::Long, t(0))).unwrap();

        let status = lp.run_once(t(100)).unwrap();
        assert!(matches!(status, LearningStatus::RejectedCandidate { .. }));
        assert_eq!(rx.borrow().version, 0);
    }

    #[test]
    fn win_rate_policy_tightens_on_losses() {
        let losses: Vec<_> = (0..10).map(|i| outcome(-2, Direction::Long, t(i))).collect();
        let report = AnalysisReport {
            performance: PerformanceReport::from_outcomes(&losses),
            hindsight: Vec::new(),
            best_hold: None,
        };
        let current = ThresholdConfig::default();
        let next = WinRatePolicy::default().derive(&current, &report);
        assert!(next.min_confidence > current.min_confidence);
    }

    #[test]
    fn win_rate_policy_relaxes_on_wins() {
        let wins: Vec<_> = (0..10).map(|i| outcome(3, Direction::Long, t(i))).collect();
        let report = AnalysisReport {
            performance: PerformanceReport::from_outcomes(&wins),
            hindsight: Vec::new(),
            best_hold: None,
        };
        let current = ThresholdConfig::default();
        let next = WinRatePolicy::default().derive(&current, &report);
        assert!(next.min_confidence < current.min_confidence);
    }

    #[test]
    fn direction_bias_follows_better_side() {
        let mut outcomes: Vec<_> = (0..5).map(|i| outcome(4, Direction::Long, t(i))).collect();
        outcomes.extend((0..5).map(|i| outcome(-4, Direction::Short, t(100 + i))));
        let report = AnalysisReport {
            performance: PerformanceReport::from_outcomes(&outcomes),
            hindsight: Vec::new(),
            best_hold: None,
        };
        let next = WinRatePolicy::default().derive(&ThresholdConfig::default(), &report);
        assert!(next.direction_bias > 0.0);
    }

    #[test]
    fn hindsight_replay_finds_both_swing_legs() {
        // Up from 100 to 110, back down to 100: one long, one short.
        let mut entries = Vec::new();
        for i in 0..=10 {
            entries.push(journal_point(i * 60, 100 + i, Color::Bullish));
        }
        for i in 1..=10 {
            entries.push(journal_point(600 + i * 60, 110 - i, Color::Bearish));
        }
        let trades = hindsight_trades(&entries, 0.01);
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].direction, Direction::Long);
        assert_eq!(trades[0].pnl, Decimal::from(10));
        assert_eq!(trades[1].direction, Direction::Short);
    }

    #[test]
    fn hindsight_replay_ignores_sub_threshold_noise() {
        let entries: Vec<_> = (0..20)
            .map(|i| journal_point(i * 60, 100, Color::Bullish))
            .collect();
        assert!(hindsight_trades(&entries, 0.01).is_empty());
    }

    #[test]
    fn hold_sweep_prefers_duration_that_reaches_target() {
        // Steady climb: +1 every 10 minutes from 1000. The 0.01 target
        // needs ~10 points, reachable well within the longer holds.
        let entries: Vec<_> = (0..40)
            .map(|i| journal_point(i * 600, 1_000 + i, Color::Bullish))
            .collect();
        let best = sweep_hold_durations(&entries, &[900, 14_400], 0.01, 0.005);
        let (hold, avg) = best.unwrap();
        assert_eq!(hold, 14_400);
        assert!(avg > 0.0);
    }

    #[test]
    fn performance_report_slices_by_kind_and_direction() {
        let outcomes = vec![
            outcome(5, Direction::Long, t(0)),
            outcome(-2, Direction::Long, t(1)),
            outcome(3, Direction::Short, t(2)),
        ];
        let report = PerformanceReport::from_outcomes(&outcomes);
        assert_eq!(report.overall.trades, 3);
        assert_eq!(report.by_direction[&Direction::Long].trades, 2);
        assert!((report.by_direction[&Direction::Long].win_rate() - 0.5).abs() < 1e-9);
        assert_eq!(
            report.by_kind[&Some(SignalKind::DarkTransition)].trades,
            3
        );
        assert_eq!(report.overall.avg_win(), Decimal::from(4));
    }
}
