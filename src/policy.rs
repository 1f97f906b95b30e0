//! Configuration surface (spec §6).
//!
//! The C original dispatches through a set of weakly-bound functions a
//! keymap can override at link time. We model that the way
//! `kanata-keyberon` models its own customization point —
//! `HoldTapConfig::Custom(&'a dyn Fn(...))` — as a bundle of borrowed
//! closures supplied at construction, each with a concrete default that
//! matches the spec's documented default behavior.

use crate::event::Position;
use crate::keycode::{ModMask, TapHoldKind};
use crate::predictors::{self, StreakFeatures};
use crate::side::Side;
use crate::error::ConfigError;
use crate::timing::PthSnapshot;

/// Outcome of the forced-choice timeout (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedChoice {
    Tap,
    Hold,
}

type HoldInstantlyFn<'a, K> = dyn Fn(&TapHoldKind<K>, bool, ModMask) -> bool + 'a;
type SameSidePolicyFn<'a> = dyn Fn(bool) -> bool + 'a;
type ForcedChoiceFn<'a> = dyn Fn(bool) -> Option<ForcedChoice> + 'a;
type NeutralizeModsFn<'a> = dyn Fn(ModMask) -> bool + 'a;
type SameSideHoldFn<'a> = dyn Fn(Side, ModMask) -> bool + 'a;
type PredictionFactorFn<'a> = dyn Fn(Side) -> f32 + 'a;
type MinOverlapFn<'a> = dyn Fn(&PthSnapshot) -> u16 + 'a;
type ThreeArgPredictorFn<'a> = dyn Fn(&PthSnapshot, u16, u16) -> f32 + 'a;
type StreakFn<'a> = dyn Fn(&StreakFeatures) -> bool + 'a;
type StreakEligibleFn<'a, K> = dyn Fn(K) -> bool + 'a;
type TappingTermFn<'a> = dyn Fn(Position) -> Option<u16> + 'a;

fn default_forced_choice_after_timeout(has_second_key: bool) -> Option<ForcedChoice> {
    // Spec §4.8: hold if no second key has arrived yet, else leave the
    // decision to whatever predictor next fires rather than guessing.
    if has_second_key {
        None
    } else {
        Some(ForcedChoice::Hold)
    }
}

fn default_same_side_policy(_second_is_tap_hold_on_current_layer: bool) -> bool {
    !_second_is_tap_hold_on_current_layer
}

fn default_should_register_as_hold_when_same_side(_side: Side, _mods: ModMask) -> bool {
    true
}

fn default_prediction_factor_for_hold(side: Side) -> f32 {
    side.hold_difficulty_factor()
}

/// Default `streak_eligible`: conservative `false` for every keycode, since
/// this crate is generic over the caller's keycode type and cannot itself
/// know which codes are "letters, space, common punctuation" (spec §4.6).
/// Callers wanting fast-streak-tap to actually fire must supply a real
/// classifier via [`PthConfig::with_streak_eligible`] — e.g.
/// [`predictors::is_ascii_streak_eligible`] when `K = char`.
fn default_streak_eligible<K>(_keycode: K) -> bool {
    false
}

/// Default `tapping_term_for`: no position has a per-key override, so guard
/// 3 (spec §4.1) never yields and every tap-hold key runs through PTH.
fn default_tapping_term_for(_position: Position) -> Option<u16> {
    None
}

/// Bundles every override hook and tunable constant spec §6 names.
///
/// Construct with [`PthConfig::new`], then override individual hooks with
/// the `with_*` builder methods before handing the config to
/// [`crate::engine::PthEngine::new`].
pub struct PthConfig<'a, K> {
    pub min_overlap_ms: u16,
    pub max_overlap_ms: u16,
    /// `PTH_MS_MIN_OVERLAP` / `PTH_MS_MAX_OVERLAP` defaults (spec §6).
    pub forced_choice_timeout_ms: i32,
    /// Keycode registered (then immediately unregistered) to neutralize an
    /// instant-held modifier-only combination (spec §6
    /// "INSTANT_MOD_TAP_SUPPRESSION_KEY").
    pub neutralization_key: K,
    pub reset_immediately_when_tap_chosen: bool,
    pub fast_streak_tap_enable: bool,
    pub fast_streak_tap_reset_immediately: bool,

    pub(crate) streak_eligible: &'a StreakEligibleFn<'a, K>,

    pub(crate) should_hold_instantly: &'a HoldInstantlyFn<'a, K>,
    pub(crate) second_should_hold_instantly: &'a HoldInstantlyFn<'a, K>,
    pub(crate) should_choose_tap_same_side_press: &'a SameSidePolicyFn<'a>,
    pub(crate) should_choose_tap_same_side_release: &'a SameSidePolicyFn<'a>,
    pub(crate) get_timeout_forced_choice: &'a ForcedChoiceFn<'a>,
    pub(crate) should_neutralize_mods: &'a NeutralizeModsFn<'a>,
    pub(crate) should_register_as_hold_when_same_side: &'a SameSideHoldFn<'a>,
    pub(crate) prediction_factor_for_hold: &'a PredictionFactorFn<'a>,
    pub(crate) min_overlap_predictor: &'a MinOverlapFn<'a>,
    pub(crate) third_press_predictor: &'a ThreeArgPredictorFn<'a>,
    pub(crate) release_after_second_press_predictor: &'a ThreeArgPredictorFn<'a>,
    pub(crate) release_after_second_release_predictor: &'a ThreeArgPredictorFn<'a>,
    pub(crate) fast_streak_predictor: &'a StreakFn<'a>,
    /// Per-key tapping-term override (spec §4.1 guard 3): `Some(nonzero)`
    /// means this position opts out of PTH and falls back to legacy
    /// fixed-timeout handling entirely.
    pub(crate) tapping_term_for: &'a TappingTermFn<'a>,
}

impl<'a, K: Copy> PthConfig<'a, K> {
    /// Builds a config with every hook set to its spec-documented default,
    /// validating the overlap window (spec §7 construction-time checks).
    pub fn new(neutralization_key: K) -> Result<Self, ConfigError> {
        Self::with_overlap_window(
            neutralization_key,
            predictors::PTH_MS_MIN_OVERLAP,
            predictors::PTH_MS_MAX_OVERLAP,
        )
    }

    pub fn with_overlap_window(
        neutralization_key: K,
        min_overlap_ms: u16,
        max_overlap_ms: u16,
    ) -> Result<Self, ConfigError> {
        if min_overlap_ms > max_overlap_ms {
            return Err(ConfigError::InvertedOverlapWindow {
                min: min_overlap_ms,
                max: max_overlap_ms,
            });
        }
        Ok(PthConfig {
            min_overlap_ms,
            max_overlap_ms,
            forced_choice_timeout_ms: 700,
            neutralization_key,
            reset_immediately_when_tap_chosen: true,
            fast_streak_tap_enable: true,
            fast_streak_tap_reset_immediately: false,
            streak_eligible: &default_streak_eligible,
            should_hold_instantly: &crate::instant_hold::default_should_hold_instantly,
            second_should_hold_instantly: &crate::instant_hold::default_second_should_hold_instantly,
            should_choose_tap_same_side_press: &default_same_side_policy,
            should_choose_tap_same_side_release: &default_same_side_policy,
            get_timeout_forced_choice: &default_forced_choice_after_timeout,
            should_neutralize_mods: &crate::instant_hold::default_should_neutralize_mods,
            should_register_as_hold_when_same_side: &default_should_register_as_hold_when_same_side,
            prediction_factor_for_hold: &default_prediction_factor_for_hold,
            min_overlap_predictor: &predictors::predict_min_overlap_for_hold,
            third_press_predictor: &predictors::predict_third_press_hold_probability,
            release_after_second_press_predictor: &predictors::predict_pth_release_after_second_press,
            release_after_second_release_predictor: &predictors::predict_pth_release_after_second_release,
            fast_streak_predictor: &predictors::fast_streak_tap_default,
            tapping_term_for: &default_tapping_term_for,
        })
    }

    pub fn with_should_hold_instantly(mut self, f: &'a HoldInstantlyFn<'a, K>) -> Self {
        self.should_hold_instantly = f;
        self
    }

    pub fn with_second_should_hold_instantly(mut self, f: &'a HoldInstantlyFn<'a, K>) -> Self {
        self.second_should_hold_instantly = f;
        self
    }

    pub fn with_forced_choice_timeout_ms(mut self, ms: i32) -> Self {
        self.forced_choice_timeout_ms = ms;
        self
    }

    pub fn with_fast_streak_predictor(mut self, f: &'a StreakFn<'a>) -> Self {
        self.fast_streak_predictor = f;
        self
    }

    /// Supplies the classifier fast-streak-tap needs to tell "letters,
    /// space, common punctuation" apart from everything else (spec §4.6);
    /// the default always returns `false`, so the feature stays dormant
    /// until a caller wires in real classification.
    pub fn with_streak_eligible(mut self, f: &'a StreakEligibleFn<'a, K>) -> Self {
        self.streak_eligible = f;
        self
    }

    /// Overrides the per-key tapping-term lookup used by guard 3 (spec
    /// §4.1): return `Some(nonzero)` for a position that should bypass PTH
    /// and run the legacy fixed-timeout logic instead.
    pub fn with_tapping_term_for(mut self, f: &'a TappingTermFn<'a>) -> Self {
        self.tapping_term_for = f;
        self
    }

    /// Overrides the third-press hold-probability predictor (spec §4.1
    /// "From `SecondPressed`, on third press").
    pub fn with_third_press_predictor(mut self, f: &'a ThreeArgPredictorFn<'a>) -> Self {
        self.third_press_predictor = f;
        self
    }

    pub(crate) fn should_hold_instantly(
        &self,
        kind: &TapHoldKind<K>,
        caps_word_on: bool,
        active_mods: ModMask,
    ) -> bool {
        (self.should_hold_instantly)(kind, caps_word_on, active_mods)
    }

    pub(crate) fn second_should_hold_instantly(
        &self,
        kind: &TapHoldKind<K>,
        caps_word_on: bool,
        active_mods: ModMask,
    ) -> bool {
        (self.second_should_hold_instantly)(kind, caps_word_on, active_mods)
    }

    pub(crate) fn should_choose_tap_same_side_press(
        &self,
        second_is_tap_hold_on_current_layer: bool,
    ) -> bool {
        (self.should_choose_tap_same_side_press)(second_is_tap_hold_on_current_layer)
    }

    pub(crate) fn should_choose_tap_same_side_release(
        &self,
        second_is_tap_hold_on_current_layer: bool,
    ) -> bool {
        (self.should_choose_tap_same_side_release)(second_is_tap_hold_on_current_layer)
    }

    pub(crate) fn forced_choice_after_timeout(&self, has_second_key: bool) -> Option<ForcedChoice> {
        (self.get_timeout_forced_choice)(has_second_key)
    }

    pub(crate) fn should_neutralize_mods(&self, mods: ModMask) -> bool {
        (self.should_neutralize_mods)(mods)
    }

    pub(crate) fn should_register_as_hold_when_same_side(&self, side: Side, mods: ModMask) -> bool {
        (self.should_register_as_hold_when_same_side)(side, mods)
    }

    pub(crate) fn prediction_factor_for_hold(&self, side: Side) -> f32 {
        (self.prediction_factor_for_hold)(side)
    }

    pub(crate) fn predict_min_overlap_for_hold(&self, snapshot: &PthSnapshot) -> u16 {
        (self.min_overlap_predictor)(snapshot).clamp(self.min_overlap_ms, self.max_overlap_ms)
    }

    pub(crate) fn predict_third_press_hold_probability(
        &self,
        snapshot: &PthSnapshot,
        a: u16,
        b: u16,
    ) -> f32 {
        (self.third_press_predictor)(snapshot, a, b)
    }

    pub(crate) fn predict_pth_release_after_second_press(
        &self,
        snapshot: &PthSnapshot,
        a: u16,
        b: u16,
    ) -> f32 {
        (self.release_after_second_press_predictor)(snapshot, a, b)
    }

    pub(crate) fn predict_pth_release_after_second_release(
        &self,
        snapshot: &PthSnapshot,
        a: u16,
        b: u16,
    ) -> f32 {
        (self.release_after_second_release_predictor)(snapshot, a, b)
    }

    pub(crate) fn fast_streak_tap(&self, features: &StreakFeatures) -> bool {
        self.fast_streak_tap_enable && (self.fast_streak_predictor)(features)
    }

    pub(crate) fn streak_eligible(&self, keycode: K) -> bool {
        (self.streak_eligible)(keycode)
    }

    pub(crate) fn tapping_term_for(&self, position: Position) -> Option<u16> {
        (self.tapping_term_for)(position)
    }
}
