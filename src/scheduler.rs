// =============================================================================
// CANDLE-BOUNDARY & COOLDOWN SCHEDULER
// Gates when the quality gate may even be consulted: a fresh candle
// boundary on at least one timeframe, cooldown elapsed, and a minimum
// spacing between oracle calls. Raw ingestion ticks alone never
// trigger an evaluation.
// =============================================================================

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Candle width for a timeframe label, in seconds.
pub fn candle_duration_secs(timeframe: &str) -> i64 {
    match timeframe {
        "1m" => 60,
        "3m" => 180,
        "5m" => 300,
        "15m" => 900,
        "30m" => 1_800,
        "1h" => 3_600,
        "2h" => 7_200,
        "4h" => 14_400,
        "6h" => 21_600,
        "12h" => 43_200,
        "1d" => 86_400,
        _ => 3_600,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    NoNewCandle,
    Cooldown { remaining_secs: i64 },
    OracleSpacing { remaining_secs: i64 },
}

pub struct Scheduler {
    /// Last evaluated candle bucket per timeframe.
    last_buckets: HashMap<String, i64>,
    /// Armed at Closed -> Idle, not at open.
    last_close: Option<DateTime<Utc>>,
    last_oracle_call: Option<DateTime<Utc>>,
    min_oracle_spacing_secs: i64,
}

impl Scheduler {
    pub fn new(timeframes: &[String], min_oracle_spacing_secs: i64) -> Self {
        Self {
            last_buckets: timeframes.iter().map(|tf| (tf.clone(), i64::MIN)).collect(),
            last_close: None,
            last_oracle_call: None,
            min_oracle_spacing_secs,
        }
    }

    fn bucket(timeframe: &str, now: DateTime<Utc>) -> i64 {
        let dur = candle_duration_secs(timeframe);
        now.timestamp().div_euclid(dur)
    }

    /// True if at least one tracked timeframe has crossed a candle
    /// boundary since the last evaluation.
    pub fn boundary_advanced(&self, now: DateTime<Utc>) -> bool {
        self.last_buckets
            .iter()
            .any(|(tf, &last)| Self::bucket(tf, now) > last)
    }

    pub fn cooldown_remaining_secs(&self, now: DateTime<Utc>, cooldown_secs: i64) -> i64 {
        match self.last_close {
            Some(closed_at) => {
                let elapsed = now.signed_duration_since(closed_at).num_seconds();
                (cooldown_secs - elapsed).max(0)
            }
            None => 0,
        }
    }

    fn oracle_spacing_remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        match self.last_oracle_call {
            Some(at) => {
                let elapsed = now.signed_duration_since(at).num_seconds();
                (self.min_oracle_spacing_secs - elapsed).max(0)
            }
            None => 0,
        }
    }

    /// Whether a new entry evaluation is permitted right now.
    pub fn permits_evaluation(
        &self,
        now: DateTime<Utc>,
        cooldown_secs: i64,
    ) -> Result<(), HoldReason> {
        if !self.boundary_advanced(now) {
            return Err(HoldReason::NoNewCandle);
        }
        let cooldown = self.cooldown_remaining_secs(now, cooldown_secs);
        if cooldown > 0 {
            return Err(HoldReason::Cooldown {
                remaining_secs: cooldown,
            });
        }
        let spacing = self.oracle_spacing_remaining_secs(now);
        if spacing > 0 {
            return Err(HoldReason::OracleSpacing {
                remaining_secs: spacing,
            });
        }
        Ok(())
    }

    /// Record that an evaluation (oracle consultation) ran at `now`.
    pub fn mark_evaluated(&mut self, now: DateTime<Utc>) {
        for (tf, last) in self.last_buckets.iter_mut() {
            *last = Self::bucket(tf, now);
        }
        self.last_oracle_call = Some(now);
    }

    /// Re-arm the cooldown timer. Called on Closed -> Idle only; a
    /// failed entry never arms it.
    pub fn arm_cooldown(&mut self, closed_at: DateTime<Utc>) {
        self.last_close = Some(closed_at);
    }
}
