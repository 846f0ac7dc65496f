// =============================================================================
// RIBBON STATE CLASSIFIER
// One snapshot in, one discrete state + entry-strength tier out.
// =============================================================================

use crate::types::{Classification, Color, EntryStrengthTier, RibbonState, Snapshot};

/// Dominant fraction at which a side is considered dominant (Building).
const BUILDING_FRACTION: f64 = 0.5;
/// Dominant fraction at which the tier upgrades to Strong.
const STRONG_FRACTION: f64 = 0.85;

/// Classify one snapshot. Pure and stateless: the same snapshot always
/// yields the same classification. Neutral readings are excluded from
/// the denominator; an all-neutral (or empty) ribbon is Mixed with no
/// entry strength. Strong dominance maps to the All* states,
/// transitional (Building) dominance to the Mixed* leaning states.
/// Ties break toward the bullish side so an upward sweep turns
/// Building exactly when the bullish fraction reaches 0.5.
pub fn classify(snapshot: &Snapshot) -> Classification {
    let bullish = snapshot
        .readings
        .iter()
        .filter(|r| r.color == Color::Bullish)
        .count();
    let bearish = snapshot
        .readings
        .iter()
        .filter(|r| r.color == Color::Bearish)
        .count();

    let denom = bullish + bearish;
    if denom == 0 {
        return Classification {
            state: RibbonState::Mixed,
            tier: EntryStrengthTier::None,
        };
    }

    let bullish_fraction = bullish as f64 / denom as f64;
    let (bullish_side, fraction) = if bullish >= bearish {
        (true, bullish_fraction)
    } else {
        (false, 1.0 - bullish_fraction)
    };

    // The winning fraction is always >= 0.5 under the denominator rule,
    // so the Mixed arm only covers a future rule change.
    let (state, tier) = if fraction >= STRONG_FRACTION {
        let state = if bullish_side {
            RibbonState::AllBullish
        } else {
            RibbonState::AllBearish
        };
        (state, EntryStrengthTier::Strong)
    } else if fraction >= BUILDING_FRACTION {
        let state = if bullish_side {
            RibbonState::MixedBullish
        } else {
            RibbonState::MixedBearish
        };
        (state, EntryStrengthTier::Building)
    } else {
        (RibbonState::Mixed, EntryStrengthTier::None)
    };

    Classification { state, tier }
}

/// Count of same-direction Light-intensity readings, used by the
/// quality gate's dominance override.
pub fn light_count(snapshot: &Snapshot, color: Color) -> usize {
    snapshot
        .readings
        .iter()
        .filter(|r| r.color == color && r.intensity == crate::types::Intensity::Light)
        .count()
}
