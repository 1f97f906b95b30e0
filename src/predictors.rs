//! Decision-tree and symbolic-regression predictors (spec §4.6).
//!
//! These are pure functions of the captured timing state. They are meant to
//! be generated from offline training data and compiled in; per the spec's
//! design note they are "not to be hand-edited" in a shipping build. The
//! thresholds below are placeholder-but-plausible stand-ins for the trained
//! coefficients (this crate carries no training pipeline), wired through
//! the exact feature set and clamping behavior the spec describes so that
//! a generated model can be dropped in without touching any call site.

use crate::event::MS_MAX_DUR;
use crate::keycode::ModMask;
use crate::timing::PthSnapshot;

/// Clamped bounds for a predicted minimum-overlap-for-hold (spec §6).
pub const PTH_MS_MIN_OVERLAP: u16 = 39;
pub const PTH_MS_MAX_OVERLAP: u16 = 232;

/// Safe division: returns the numerator unchanged when the denominator is
/// zero, rather than dividing by zero or returning infinity/NaN (spec
/// §4.6 "a closed-form symbolic-regression expression using a 'safe
/// division'").
pub fn safe_div(numerator: f32, denominator: f32) -> f32 {
    if denominator == 0.0 {
        numerator
    } else {
        numerator / denominator
    }
}

/// Feature set available to the probability-style predictors: the frozen
/// PTH-press snapshot plus whatever additional durations are known at the
/// point the predictor is consulted.
#[derive(Debug, Clone, Copy)]
pub struct PredictorFeatures {
    pub snapshot: PthSnapshot,
    pub pth_press_to_second_press_dur: u16,
    pub current_overlap_dur: u16,
}

/// Applies the per-key hold-difficulty `factor` (spec §4.6) to a
/// probability output: harder-to-hold keys need more evidence before the
/// engine will commit to hold.
pub fn apply_factor_to_probability(probability: f32, factor: f32) -> f32 {
    (probability * factor).clamp(0.0, 1.0)
}

/// Applies `factor` to a predicted overlap-for-hold, per spec:
/// `overlap * (2 - factor)`. A same-side second key reduces `factor` by
/// 0.10 *before* this transform is applied (handled by the caller, since
/// only the caller knows whether the second key is same-side).
pub fn apply_factor_to_overlap(overlap_ms: u16, factor: f32) -> u16 {
    let scaled = (overlap_ms as f32) * (2.0 - factor);
    scaled.round().clamp(0.0, MS_MAX_DUR as f32) as u16
}

fn clamp_overlap(ms: f32) -> u16 {
    ms.round().clamp(PTH_MS_MIN_OVERLAP as f32, PTH_MS_MAX_OVERLAP as f32) as u16
}

/// Predicts the minimum simultaneous-down duration ("overlap") that would
/// switch a same-side-ambiguous or non-same-side second key's decision to
/// hold. Closed-form symbolic-regression style expression over the PTH
/// press snapshot (spec §4.6).
pub fn predict_min_overlap_for_hold(snapshot: &PthSnapshot) -> u16 {
    let base = safe_div(
        snapshot.overlap_w_avg as f32 * 1.35 + snapshot.press_to_press_w_avg as f32 * 0.20,
        1.0,
    );
    let adj = (snapshot.prev_press_to_pth_press_dur as f32
        - snapshot.prev_prev_press_to_prev_press_dur as f32)
        .abs()
        * 0.05;
    clamp_overlap(base + adj)
}

/// CART-style decision tree (depth <= 7) deciding the third-press
/// predictor: given the PTH press snapshot and the second/third press
/// timings, returns a probability in `[0, 1]` where `> 0.5` means hold.
pub fn predict_third_press_hold_probability(
    snapshot: &PthSnapshot,
    pth_press_to_second_press_dur: u16,
    pth_second_press_to_third_press_dur: u16,
) -> f32 {
    // Node 1: a fast roll of three keys (short gaps throughout) is almost
    // always a tap-intent roll.
    if pth_press_to_second_press_dur < 60 && pth_second_press_to_third_press_dur < 60 {
        return 0.05;
    }
    // Node 2: long overlap history on this finger strongly predicts hold.
    if snapshot.overlap_w_avg > PTH_MS_MAX_OVERLAP {
        return 0.95;
    }
    // Node 3: slow typist baseline (long weighted press-to-press) plus a
    // lingering third press both favor hold.
    if snapshot.press_to_press_w_avg > 300 {
        if pth_second_press_to_third_press_dur > 150 {
            return 0.85;
        }
        return 0.6;
    }
    // Node 4: everything else defaults to a mild tap lean, nudged by how
    // close the overlap came to the historical min-overlap-for-hold.
    let min_overlap = predict_min_overlap_for_hold(snapshot) as f32;
    let closeness = safe_div(pth_press_to_second_press_dur as f32, min_overlap);
    (0.35 + closeness * 0.1).clamp(0.0, 1.0)
}

/// Decision tree for the PTH's own release while the second key is still
/// down (i.e. the second key was never released before the PTH).
pub fn predict_pth_release_after_second_press(
    snapshot: &PthSnapshot,
    pth_press_to_second_press_dur: u16,
    current_overlap_dur: u16,
) -> f32 {
    if current_overlap_dur >= PTH_MS_MAX_OVERLAP {
        return 0.97;
    }
    let min_overlap = predict_min_overlap_for_hold(snapshot);
    if current_overlap_dur >= min_overlap {
        return 0.8;
    }
    if pth_press_to_second_press_dur < 40 {
        return 0.1;
    }
    0.4
}

/// Decision tree for the PTH's own release after the second key has
/// *already* been released (both keys up, PTH still down).
pub fn predict_pth_release_after_second_release(
    snapshot: &PthSnapshot,
    pth_press_to_second_press_dur: u16,
    second_key_own_duration: u16,
) -> f32 {
    let min_overlap = predict_min_overlap_for_hold(snapshot);
    if second_key_own_duration >= min_overlap {
        return 0.75;
    }
    if pth_press_to_second_press_dur < 40 && second_key_own_duration < 60 {
        return 0.05;
    }
    0.3
}

/// Inputs to the fast-streak-tap predictors (spec §4.6).
#[derive(Debug, Clone, Copy)]
pub struct StreakFeatures {
    pub previous_pth_was_hold: bool,
    pub pth_is_streak_eligible: bool,
    pub previous_key_is_streak_eligible: bool,
    pub non_shift_mods_active: bool,
    pub prev_press_to_pth_press_dur: u16,
}

/// Default fast-streak-tap predictor: fires (predicts an immediate tap
/// without waiting for a second key) when the previous PTH wasn't a hold,
/// both keys are "streak eligible", no non-Shift modifier is active, and
/// the previous press preceded this one by less than 125ms.
pub fn fast_streak_tap_default(f: &StreakFeatures) -> bool {
    !f.previous_pth_was_hold
        && f.pth_is_streak_eligible
        && f.previous_key_is_streak_eligible
        && !f.non_shift_mods_active
        && f.prev_press_to_pth_press_dur < 125
}

/// Conservative variant: same conditions, tighter timing window. Offered
/// as an alternative for configurations that found the default trigger
/// overeager on their typing data.
pub fn fast_streak_tap_conservative(f: &StreakFeatures) -> bool {
    !f.previous_pth_was_hold
        && f.pth_is_streak_eligible
        && f.previous_key_is_streak_eligible
        && !f.non_shift_mods_active
        && f.prev_press_to_pth_press_dur < 80
}

/// A basic ASCII-ish "streak eligible" classifier: letters, space, and
/// common punctuation, as referenced by spec §4.6. Keyboards with a
/// richer keycode type should supply their own predicate instead via
/// policy; this is the default used when none is configured.
pub fn is_ascii_streak_eligible(c: char) -> bool {
    c.is_ascii_alphabetic() || c == ' ' || matches!(c, ',' | '.' | '\'' | '-' | '/' | ';')
}

/// `true` if any modifier other than Shift is active, for the fast-streak
/// eligibility check.
pub fn has_non_shift_mod(mods: ModMask) -> bool {
    mods.difference(ModMask::SHIFT).bits() != 0
}
