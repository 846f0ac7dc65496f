// =============================================================================
// SIGNAL DETECTOR BANK
// Early-reversal (dark transition) and liquidity-grab (wick rejection)
// detectors over the rolling snapshot history. At most one signal per
// timeframe per cycle; dark transitions outrank wick rejections.
// =============================================================================

use crate::history::TimeframeHistory;
use crate::types::{Color, Direction, EntryStrengthTier, Signal, SignalKind, Snapshot};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

/// Static detector tuning, loaded from file config (not learned).
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorSettings {
    /// Fixed confidence increment for dark-transition signals.
    pub dark_transition_boost: f64,
    /// Confidence increment for wick rejections; liquidity-grab
    /// reversals are treated as higher conviction.
    pub wick_rejection_boost: f64,
    /// Envelope deviation band for a valid wick, as fractions of the
    /// envelope edge (e.g. 0.002 = 0.2%). Below min is noise, above
    /// max is a real breakout rather than a grab.
    pub wick_min_deviation: f64,
    pub wick_max_deviation: f64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            dark_transition_boost: 0.05,
            wick_rejection_boost: 0.10,
            wick_min_deviation: 0.002,
            wick_max_deviation: 0.010,
        }
    }
}

pub struct DetectorBank {
    settings: DetectorSettings,
}

impl DetectorBank {
    pub fn new(settings: DetectorSettings) -> Self {
        Self { settings }
    }

    /// Run both detectors for one timeframe and surface the winner.
    /// Signals are ephemeral: nothing is retained across cycles.
    pub fn evaluate(&self, history: &TimeframeHistory) -> Option<Signal> {
        let mut candidates: Vec<Signal> = Vec::with_capacity(2);
        if let Some(sig) = self.detect_dark_transition(history) {
            candidates.push(sig);
        }
        if let Some(sig) = self.detect_wick_rejection(history) {
            candidates.push(sig);
        }
        candidates.into_iter().min_by_key(|s| s.kind.priority())
    }

    /// The fastest-reacting indicator (first in ribbon order) flipping
    /// toward Neutral, the opposite color, or Dark intensity while the
    /// overall ribbon still reflects the prior trend.
    fn detect_dark_transition(&self, history: &TimeframeHistory) -> Option<Signal> {
        let current = history.latest()?;
        let previous = history.nth_back(1)?;

        let prev_class = history.classification_nth_back(1)?;
        let curr_class = history.latest_classification()?;

        let trend = prev_class.state.leaning_direction()?;
        if prev_class.tier == EntryStrengthTier::None {
            return None;
        }
        // The fast indicator must be leading: the rest of the ribbon
        // still leans with the old trend.
        if curr_class.state.leaning_direction() != Some(trend) {
            return None;
        }

        let fast_prev = previous.readings.first()?;
        let fast_curr = current.readings.first()?;

        let trend_color = match trend {
            Direction::Long => Color::Bullish,
            Direction::Short => Color::Bearish,
        };
        if fast_prev.color != trend_color {
            return None;
        }

        let color_flipped = fast_curr.color != trend_color;
        let darkened = fast_curr.intensity == crate::types::Intensity::Dark
            && fast_prev.intensity != crate::types::Intensity::Dark;
        if !color_flipped && !darkened {
            return None;
        }

        Some(Signal {
            kind: SignalKind::DarkTransition,
            direction: trend.opposite(),
            confidence_boost: self.settings.dark_transition_boost,
            timeframe: history.timeframe.clone(),
            produced_at: Utc::now(),
        })
    }

    /// Price pierced the indicator envelope by a bounded percentage on
    /// the previous tick and has now pulled back inside the noise
    /// band: a failed liquidity grab. Confirmed one tick late by
    /// construction.
    fn detect_wick_rejection(&self, history: &TimeframeHistory) -> Option<Signal> {
        let current = history.latest()?;
        let previous = history.nth_back(1)?;

        let wick_dev = envelope_deviation(previous)?;
        let side = if wick_dev > 0.0 {
            Direction::Short // excursion above, reversal is short
        } else {
            Direction::Long
        };
        let wick_mag = wick_dev.abs();
        if wick_mag < self.settings.wick_min_deviation
            || wick_mag > self.settings.wick_max_deviation
        {
            return None;
        }

        // Recovery: current price is back inside the noise band and
        // closer to the envelope than the wick tick was.
        let now_dev = envelope_deviation(current).unwrap_or(0.0);
        if now_dev.abs() >= self.settings.wick_min_deviation || now_dev.abs() >= wick_mag {
            return None;
        }

        // Ribbon must not be strongly committed against the reversal.
        let curr_class = history.latest_classification()?;
        let strongly_against = curr_class.tier == EntryStrengthTier::Strong
            && curr_class.state.dominant_direction() == Some(side.opposite());
        if strongly_against {
            return None;
        }

        Some(Signal {
            kind: SignalKind::WickRejection,
            direction: side,
            confidence_boost: self.settings.wick_rejection_boost,
            timeframe: history.timeframe.clone(),
            produced_at: Utc::now(),
        })
    }
}

/// Signed fractional deviation of price beyond the reading envelope.
/// Positive above the max, negative below the min, zero inside.
fn envelope_deviation(snapshot: &Snapshot) -> Option<f64> {
    let (lo, hi) = snapshot.envelope()?;
    let price = snapshot.price;
    let dev = if price > hi && hi > Decimal::ZERO {
        (price - hi) / hi
    } else if price < lo && lo > Decimal::ZERO {
        -((lo - price) / lo)
    } else {
        Decimal::ZERO
    };
    dev.to_f64()
}
