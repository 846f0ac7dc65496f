// =============================================================================
// QUALITY GATE
// The acceptance policy combining oracle recommendation, detector
// output, and live thresholds into a single accept/reject decision.
// =============================================================================

use crate::types::{
    Classification, Direction, EntryStrengthTier, Recommendation, Signal, ThresholdConfig,
};
use serde::Serialize;
use std::fmt;

/// Per-timeframe evidence the gate reasons over: the latest known
/// classification plus same-direction Light-intensity counts.
#[derive(Debug, Clone)]
pub struct TimeframeView {
    pub timeframe: String,
    pub classification: Classification,
    pub light_bullish: usize,
    pub light_bearish: usize,
}

impl TimeframeView {
    fn light_count(&self, dir: Direction) -> usize {
        match dir {
            Direction::Long => self.light_bullish,
            Direction::Short => self.light_bearish,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Accept,
    Reject(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    NotRecommended,
    LowConfidence,
    OppositeDominance,
    Choppy,
    CooldownActive,
    NoAlignment,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::NotRecommended => "oracle did not recommend entry",
            RejectReason::LowConfidence => "confidence below threshold",
            RejectReason::OppositeDominance => "timeframes fully opposed",
            RejectReason::Choppy => "too many state flips in window",
            RejectReason::CooldownActive => "cooldown active",
            RejectReason::NoAlignment => "no dominant or light-override alignment",
        };
        write!(f, "{}", s)
    }
}

/// Running counters per gate outcome, logged periodically so a dead
/// gate (everything rejected for the same reason) is visible.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GateStats {
    pub evaluations: u32,
    pub accepted: u32,
    pub not_recommended: u32,
    pub low_confidence: u32,
    pub opposite_dominance: u32,
    pub choppy: u32,
    pub cooldown_active: u32,
    pub no_alignment: u32,
}

impl GateStats {
    pub fn record(&mut self, decision: &GateDecision) {
        self.evaluations += 1;
        match decision {
            GateDecision::Accept => self.accepted += 1,
            GateDecision::Reject(reason) => match reason {
                RejectReason::NotRecommended => self.not_recommended += 1,
                RejectReason::LowConfidence => self.low_confidence += 1,
                RejectReason::OppositeDominance => self.opposite_dominance += 1,
                RejectReason::Choppy => self.choppy += 1,
                RejectReason::CooldownActive => self.cooldown_active += 1,
                RejectReason::NoAlignment => self.no_alignment += 1,
            },
        }
    }

    pub fn accept_rate(&self) -> f64 {
        if self.evaluations == 0 {
            0.0
        } else {
            self.accepted as f64 / self.evaluations as f64 * 100.0
        }
    }
}

/// Evaluate one entry cycle. Rejection rules run in order; the
/// acceptance condition is only reached once none of them fired.
///
/// The gate never requires Strong (85%) dominance as a hard
/// precondition: a Building-tier timeframe is enough, and the
/// Light-intensity override accepts even earlier. Requiring full
/// ribbon completion meant entering after most of the move was done.
pub fn evaluate(
    recommendation: &Recommendation,
    _signals: &[Signal],
    views: &[TimeframeView],
    thresholds: &ThresholdConfig,
    choppiness_flips: u32,
    cooldown_remaining_secs: i64,
) -> GateDecision {
    if !recommendation.entry_recommended {
        return GateDecision::Reject(RejectReason::NotRecommended);
    }

    if recommendation.confidence < thresholds.min_confidence {
        return GateDecision::Reject(RejectReason::LowConfidence);
    }

    // Hard conflict: one timeframe fully bullish-dominant, another
    // fully bearish-dominant. No confidence level overrides this.
    let has_long = views
        .iter()
        .any(|v| v.classification.state.dominant_direction() == Some(Direction::Long));
    let has_short = views
        .iter()
        .any(|v| v.classification.state.dominant_direction() == Some(Direction::Short));
    if has_long && has_short {
        return GateDecision::Reject(RejectReason::OppositeDominance);
    }

    if choppiness_flips > thresholds.max_choppiness_flips {
        return GateDecision::Reject(RejectReason::Choppy);
    }

    if cooldown_remaining_secs > 0 {
        return GateDecision::Reject(RejectReason::CooldownActive);
    }

    let dir = recommendation.direction;

    let dominant_aligned = views.iter().any(|v| {
        v.classification.state.leans(dir)
            && matches!(
                v.classification.tier,
                EntryStrengthTier::Building | EntryStrengthTier::Strong
            )
    });

    let light_override = views
        .iter()
        .any(|v| v.light_count(dir) >= thresholds.override_light_count);

    if dominant_aligned || light_override {
        GateDecision::Accept
    } else {
        GateDecision::Reject(RejectReason::NoAlignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RibbonState;
    use rust_decimal::Decimal;

    fn rec(direction: Direction, confidence: f64) -> Recommendation {
        Recommendation {
            direction,
            entry_recommended: true,
            confidence,
            stop_loss: Decimal::from(99),
            take_profit: Decimal::from(103),
            reasoning: String::new(),
        }
    }

    fn view(state: RibbonState, tier: EntryStrengthTier) -> TimeframeView {
        TimeframeView {
            timeframe: "1m".to_string(),
            classification: Classification { state, tier },
            light_bullish: 0,
            light_bearish: 0,
        }
    }

    fn thresholds() -> ThresholdConfig {
        ThresholdConfig::default()
    }

    #[test]
    fn rejects_when_not_recommended() {
        let mut r = rec(Direction::Long, 0.9);
        r.entry_recommended = false;
        let views = [view(RibbonState::AllBullish, EntryStrengthTier::Strong)];
        let d = evaluate(&r, &[], &views, &thresholds(), 0, 0);
        assert_eq!(d, GateDecision::Reject(RejectReason::NotRecommended));
    }

    #[test]
    fn rejects_below_min_confidence() {
        let r = rec(Direction::Long, 0.5);
        let views = [view(RibbonState::AllBullish, EntryStrengthTier::Strong)];
        let d = evaluate(&r, &[], &views, &thresholds(), 0, 0);
        assert_eq!(d, GateDecision::Reject(RejectReason::LowConfidence));
    }

    /// Opposite dominance rejects independent of confidence.
    #[test]
    fn rejects_fully_opposed_timeframes() {
        let r = rec(Direction::Long, 1.0);
        let views = [
            view(RibbonState::AllBullish, EntryStrengthTier::Strong),
            view(RibbonState::AllBearish, EntryStrengthTier::Strong),
        ];
        let d = evaluate(&r, &[], &views, &thresholds(), 0, 0);
        assert_eq!(d, GateDecision::Reject(RejectReason::OppositeDominance));
    }

    #[test]
    fn rejects_choppy_market() {
        let r = rec(Direction::Long, 0.9);
        let views = [view(RibbonState::MixedBullish, EntryStrengthTier::Building)];
        let cfg = thresholds();
        let d = evaluate(&r, &[], &views, &cfg, cfg.max_choppiness_flips + 1, 0);
        assert_eq!(d, GateDecision::Reject(RejectReason::Choppy));
    }

    #[test]
    fn rejects_during_cooldown() {
        let r = rec(Direction::Long, 0.9);
        let views = [view(RibbonState::AllBullish, EntryStrengthTier::Strong)];
        let d = evaluate(&r, &[], &views, &thresholds(), 0, 600);
        assert_eq!(d, GateDecision::Reject(RejectReason::CooldownActive));
    }

    #[test]
    fn accepts_building_tier_without_strong() {
        let r = rec(Direction::Long, 0.9);
        let views = [
            view(RibbonState::MixedBullish, EntryStrengthTier::Building),
            view(RibbonState::Mixed, EntryStrengthTier::None),
        ];
        let d = evaluate(&r, &[], &views, &thresholds(), 0, 0);
        assert_eq!(d, GateDecision::Accept);
    }

    /// The light-intensity override accepts even when no timeframe has
    /// any dominance tier at all.
    #[test]
    fn accepts_on_light_override() {
        let r = rec(Direction::Long, 0.9);
        let mut v = view(RibbonState::Mixed, EntryStrengthTier::None);
        v.light_bullish = thresholds().override_light_count;
        let views = [v];
        let d = evaluate(&r, &[], &views, &thresholds(), 0, 0);
        assert_eq!(d, GateDecision::Accept);
    }

    #[test]
    fn light_override_is_direction_specific() {
        let r = rec(Direction::Short, 0.9);
        let mut v = view(RibbonState::Mixed, EntryStrengthTier::None);
        v.light_bullish = 10; // wrong direction
        let views = [v];
        let d = evaluate(&r, &[], &views, &thresholds(), 0, 0);
        assert_eq!(d, GateDecision::Reject(RejectReason::NoAlignment));
    }

    #[test]
    fn rejects_no_alignment() {
        let r = rec(Direction::Long, 0.9);
        let views = [
            view(RibbonState::Mixed, EntryStrengthTier::None),
            view(RibbonState::MixedBearish, EntryStrengthTier::Building),
        ];
        let d = evaluate(&r, &[], &views, &thresholds(), 0, 0);
        assert_eq!(d, GateDecision::Reject(RejectReason::NoAlignment));
    }

    #[test]
    fn stats_track_outcomes() {
        let mut stats = GateStats::default();
        stats.record(&GateDecision::Accept);
        stats.record(&GateDecision::Reject(RejectReason::CooldownActive));
        stats.record(&GateDecision::Reject(RejectReason::CooldownActive));
        assert_eq!(stats.evaluations, 3);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.cooldown_active, 2);
        assert!((stats.accept_rate() - 33.333).abs() < 0.1);
    }
}
