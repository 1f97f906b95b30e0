//! Instant-hold policy defaults (spec §4.4).
//!
//! The provisional-commit/rollback mechanics themselves live on
//! [`crate::engine::PthEngine`] (they need direct access to the HID sink and
//! the active PTH record); this module holds the pure default predicates
//! spec §6 lists as override hooks, plus the neutralization decision.

use crate::keycode::{ModMask, TapHoldKind};

/// Default `should_hold_instantly` (spec §4.1): disabled while caps-word is
/// on, and disabled for a `ModTap` whose modifier(s) are already active
/// (releasing it would spuriously report the modifier's release to the
/// host).
pub fn default_should_hold_instantly<K>(
    kind: &TapHoldKind<K>,
    caps_word_on: bool,
    active_mods: ModMask,
) -> bool {
    if caps_word_on {
        return false;
    }
    !kind.would_duplicate_active_mod(active_mods)
}

/// Default `second_should_hold_instantly`: same rule, applied to the second
/// key when it is itself tap-hold.
pub fn default_second_should_hold_instantly<K>(
    kind: &TapHoldKind<K>,
    caps_word_on: bool,
    active_mods: ModMask,
) -> bool {
    default_should_hold_instantly(kind, caps_word_on, active_mods)
}

/// Default `should_neutralize_mods`: neutralize an instant-held modifier
/// set unless it contains Ctrl or Shift (those two are safe to leave
/// lone-pressed on essentially every host; other lone modifiers, notably
/// GUI/Alt, trigger OS-level side effects like opening a start menu).
pub fn default_should_neutralize_mods(mods: ModMask) -> bool {
    !(mods.has_ctrl() || mods.has_shift())
}
