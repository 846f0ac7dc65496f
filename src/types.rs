use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// =============================================================================
// INDICATOR RIBBON TYPES
// =============================================================================

/// Directional color of a single ribbon indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Color {
    Bullish,
    Bearish,
    Neutral,
}

/// Intensity of a single ribbon indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intensity {
    Light,
    Dark,
    Normal,
}

/// One indicator reading inside the ribbon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorReading {
    pub color: Color,
    pub intensity: Intensity,
    pub value: Decimal,
}

/// One observed state of the ribbon on a timeframe. Immutable once created;
/// readings are kept in their on-screen order (fastest indicator first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub readings: Vec<IndicatorReading>,
}

impl Snapshot {
    /// Min/max of all reading values (the indicator envelope).
    /// None for an empty ribbon.
    pub fn envelope(&self) -> Option<(Decimal, Decimal)> {
        let mut iter = self.readings.iter().map(|r| r.value);
        let first = iter.next()?;
        let (mut lo, mut hi) = (first, first);
        for v in iter {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        Some((lo, hi))
    }
}

// =============================================================================
// CLASSIFIED STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RibbonState {
    AllBullish,
    MixedBullish,
    Mixed,
    MixedBearish,
    AllBearish,
}

impl RibbonState {
    /// Direction of full (Strong-tier) dominance. None for transitional
    /// or balanced states.
    pub fn dominant_direction(&self) -> Option<Direction> {
        match self {
            RibbonState::AllBullish => Some(Direction::Long),
            RibbonState::AllBearish => Some(Direction::Short),
            _ => None,
        }
    }

    /// Direction this state leans toward, dominant or transitional.
    pub fn leaning_direction(&self) -> Option<Direction> {
        match self {
            RibbonState::AllBullish | RibbonState::MixedBullish => Some(Direction::Long),
            RibbonState::AllBearish | RibbonState::MixedBearish => Some(Direction::Short),
            RibbonState::Mixed => None,
        }
    }

    pub fn leans(&self, dir: Direction) -> bool {
        self.leaning_direction() == Some(dir)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStrengthTier {
    Building,
    Strong,
    None,
}

/// Classifier output for one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub state: RibbonState,
    pub tier: EntryStrengthTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

// =============================================================================
// DETECTOR SIGNALS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    DarkTransition,
    WickRejection,
}

impl SignalKind {
    /// Priority when both detectors fire in the same cycle; lower wins.
    pub fn priority(&self) -> u8 {
        match self {
            SignalKind::DarkTransition => 0,
            SignalKind::WickRejection => 1,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::DarkTransition => write!(f, "dark_transition"),
            SignalKind::WickRejection => write!(f, "wick_rejection"),
        }
    }
}

/// A candidate entry signal. Valid only for the cycle that produced it;
/// signals are never carried across cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub direction: Direction,
    pub confidence_boost: f64,
    pub timeframe: String,
    pub produced_at: DateTime<Utc>,
}

// =============================================================================
// ORACLE RECOMMENDATION
// =============================================================================

/// What the decision oracle proposed for the current cycle. Consumed
/// immediately by the quality gate, never retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub direction: Direction,
    pub entry_recommended: bool,
    /// Normalized confidence in [0, 1].
    pub confidence: f64,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    #[serde(default)]
    pub reasoning: String,
}

// =============================================================================
// THRESHOLD CONFIG (learned, atomically swapped)
// =============================================================================

/// Live decision thresholds. Versioned and immutable once published;
/// only the learning loop replaces it, via a single atomic swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default)]
    pub version: u64,
    pub min_confidence: f64,
    /// Same-direction Light-intensity count that lets the gate accept
    /// before any timeframe reaches full dominance.
    pub override_light_count: usize,
    pub max_choppiness_flips: u32,
    pub min_hold_secs: i64,
    pub max_hold_secs: i64,
    pub cooldown_secs: i64,
    /// Learned long/short lean in [-1, 1]; positive favors longs.
    pub direction_bias: f64,
}

impl ThresholdConfig {
    /// Internal-consistency check. Any candidate failing this is
    /// rejected and the previous config retained.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(format!("min_confidence {} out of [0,1]", self.min_confidence));
        }
        if self.override_light_count == 0 {
            return Err("override_light_count must be >= 1".to_string());
        }
        if self.min_hold_secs <= 0 {
            return Err(format!("min_hold_secs {} must be > 0", self.min_hold_secs));
        }
        if self.max_hold_secs <= self.min_hold_secs {
            return Err(format!(
                "max_hold_secs {} must exceed min_hold_secs {}",
                self.max_hold_secs, self.min_hold_secs
            ));
        }
        if self.cooldown_secs <= 0 {
            return Err(format!("cooldown_secs {} must be > 0", self.cooldown_secs));
        }
        if !(-1.0..=1.0).contains(&self.direction_bias) {
            return Err(format!("direction_bias {} out of [-1,1]", self.direction_bias));
        }
        Ok(())
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            version: 0,
            min_confidence: 0.65,
            override_light_count: 3,
            max_choppiness_flips: 4,
            min_hold_secs: 900,
            max_hold_secs: 14_400,
            cooldown_secs: 1_800,
            direction_bias: 0.0,
        }
    }
}

// =============================================================================
// POSITION & OUTCOME
// =============================================================================

/// The single live position. At most one exists in a non-terminal
/// lifecycle state at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub opened_at: DateTime<Utc>,
    pub min_hold_deadline: DateTime<Utc>,
}

impl Position {
    pub fn pnl(&self, exit_price: Decimal) -> Decimal {
        match self.direction {
            Direction::Long => exit_price - self.entry_price,
            Direction::Short => self.entry_price - exit_price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    RibbonReversal,
    MaxHold,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop_loss"),
            ExitReason::TakeProfit => write!(f, "take_profit"),
            ExitReason::RibbonReversal => write!(f, "ribbon_reversal"),
            ExitReason::MaxHold => write!(f, "max_hold"),
        }
    }
}

/// Archived result of one closed trade. Append-only; the sole input to
/// the learning loop besides the raw snapshot journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub position_id: Uuid,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub duration_secs: i64,
    pub exit_reason: ExitReason,
    pub signal_kind_at_entry: Option<SignalKind>,
    pub confidence_at_entry: f64,
    pub closed_at: DateTime<Utc>,
}

impl OutcomeRecord {
    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }
}

/// Audit record for one evaluated entry cycle, accepted or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub evaluated_at: DateTime<Utc>,
    pub accepted: bool,
    pub reason: String,
    pub confidence: f64,
    pub signal_kind: Option<SignalKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_config_default_is_valid() {
        assert!(ThresholdConfig::default().validate().is_ok());
    }

    #[test]
    fn threshold_config_rejects_bad_confidence() {
        let cfg = ThresholdConfig {
            min_confidence: 1.2,
            ..ThresholdConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn threshold_config_rejects_inverted_holds() {
        let cfg = ThresholdConfig {
            min_hold_secs: 3600,
            max_hold_secs: 900,
            ..ThresholdConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn envelope_spans_all_readings() {
        use rust_decimal::prelude::FromPrimitive;
        let snap = Snapshot {
            timestamp: Utc::now(),
            price: Decimal::from(100),
            readings: vec![
                IndicatorReading {
                    color: Color::Bullish,
                    intensity: Intensity::Normal,
                    value: Decimal::from_f64(99.0).unwrap(),
                },
                IndicatorReading {
                    color: Color::Bullish,
                    intensity: Intensity::Normal,
                    value: Decimal::from_f64(101.5).unwrap(),
                },
                IndicatorReading {
                    color: Color::Bearish,
                    intensity: Intensity::Dark,
                    value: Decimal::from_f64(100.2).unwrap(),
                },
            ],
        };
        let (lo, hi) = snap.envelope().unwrap();
        assert_eq!(lo, Decimal::from_f64(99.0).unwrap());
        assert_eq!(hi, Decimal::from_f64(101.5).unwrap());
    }

    #[test]
    fn position_pnl_respects_direction() {
        let pos = Position {
            id: Uuid::new_v4(),
            direction: Direction::Short,
            entry_price: Decimal::from(100),
            stop_loss: Decimal::from(102),
            take_profit: Decimal::from(95),
            opened_at: Utc::now(),
            min_hold_deadline: Utc::now(),
        };
        assert_eq!(pos.pnl(Decimal::from(95)), Decimal::from(5));
        assert_eq!(pos.pnl(Decimal::from(103)), Decimal::from(-3));
    }
}
