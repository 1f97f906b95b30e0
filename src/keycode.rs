//! Keycode classification (spec §3 "Keycode classification").
//!
//! The engine is generic over the host's own keycode type `K` (a basic,
//! non-tap-hold code such as a USB HID usage or a firmware-internal keycode
//! enum) so that this crate stays independent of any one firmware's keycode
//! table, the same way `kanata-keyberon`'s `Layout<C, R, L, T>` is generic
//! over a custom action payload `T`.

use bitflags::bitflags;

bitflags! {
    /// The 8-bit active-modifier mask (spec §6 "Modifier state"), also used
    /// as the payload of `ModTap`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModMask: u8 {
        const LCTRL  = 0b0000_0001;
        const LSHIFT = 0b0000_0010;
        const LALT   = 0b0000_0100;
        const LGUI   = 0b0000_1000;
        const RCTRL  = 0b0001_0000;
        const RSHIFT = 0b0010_0000;
        const RALT   = 0b0100_0000;
        const RGUI   = 0b1000_0000;
    }
}

impl ModMask {
    pub const CTRL: ModMask = ModMask::LCTRL.union(ModMask::RCTRL);
    pub const SHIFT: ModMask = ModMask::LSHIFT.union(ModMask::RSHIFT);
    pub const GUI: ModMask = ModMask::LGUI.union(ModMask::RGUI);

    pub fn has_ctrl(self) -> bool {
        self.intersects(Self::CTRL)
    }

    pub fn has_shift(self) -> bool {
        self.intersects(Self::SHIFT)
    }

    pub fn has_gui(self) -> bool {
        self.intersects(Self::GUI)
    }
}

/// The tap-hold sub-kinds PTH handles (spec §3). Everything else
/// (`Basic`, `TapDance`, `Other`) passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapHoldKind<K> {
    /// Hold activates `mods`; tap emits `tap`.
    ModTap {
        mods: ModMask,
        tap: K,
        /// A basic keycode registered instead of the hold action when this
        /// key is the *second* key of an active PTH and gets instant-held
        /// alongside it (spec §6 "code to be registered instead when hold
        /// is chosen"). `None` means register nothing extra.
        alt_tap_code: Option<K>,
    },
    /// Hold activates `layer`; tap emits `tap`.
    LayerTap {
        layer: usize,
        tap: K,
        alt_tap_code: Option<K>,
    },
    /// Non-toggle swap-hands-while-held.
    SwapHandsTapHold { tap: K, alt_tap_code: Option<K> },
}

impl<K: Copy> TapHoldKind<K> {
    /// The keycode this kind emits for a tap decision.
    pub fn tap_keycode(&self) -> K {
        match *self {
            TapHoldKind::ModTap { tap, .. } => tap,
            TapHoldKind::LayerTap { tap, .. } => tap,
            TapHoldKind::SwapHandsTapHold { tap, .. } => tap,
        }
    }

    /// The alternate keycode to register instead of the hold action, if
    /// this key's keymap entry carries one (spec §6, §9 open question on
    /// combining it with `LayerTap`).
    pub fn alt_tap_code(&self) -> Option<K> {
        match *self {
            TapHoldKind::ModTap { alt_tap_code, .. } => alt_tap_code,
            TapHoldKind::LayerTap { alt_tap_code, .. } => alt_tap_code,
            TapHoldKind::SwapHandsTapHold { alt_tap_code, .. } => alt_tap_code,
        }
    }

    /// `true` for `ModTap(mods)` where `mods` is already active in
    /// `active_mods` (spec §4.1: instant-hold is disallowed for such keys,
    /// since releasing them would spuriously report the modifier's release
    /// to the host).
    pub fn would_duplicate_active_mod(&self, active_mods: ModMask) -> bool {
        match *self {
            TapHoldKind::ModTap { mods, .. } => active_mods.intersects(mods),
            _ => false,
        }
    }
}

/// The classification of a keycode resolved at the current layer (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeycodeClass<K> {
    /// A plain keycode with no tap/hold ambiguity.
    Basic(K),
    /// A tap-hold keycode: handled by PTH.
    TapHold(TapHoldKind<K>),
    /// A tap-dance key: not managed by PTH, passes through.
    TapDance,
    /// Anything else PTH does not recognize (combos, programmatic keys,
    /// the "magic alt-tab" module, etc).
    Other,
}

impl<K> KeycodeClass<K> {
    pub fn is_tap_hold(&self) -> bool {
        matches!(self, KeycodeClass::TapHold(_))
    }

    pub fn as_tap_hold(&self) -> Option<&TapHoldKind<K>> {
        match self {
            KeycodeClass::TapHold(kind) => Some(kind),
            _ => None,
        }
    }
}

/// Sentinel action on a layer, returned by a layer-tap's new layer when no
/// real action is bound there (spec §4.1 "From `Pressed`, on second press").
///
/// Firmwares express this as `KC_NO`/`Action::NoOp`; we keep it as an
/// explicit predicate the keymap-lookup collaborator can answer rather than
/// threading a third generic parameter through every signature.
pub fn is_noop_sentinel<K: PartialEq>(candidate: &KeycodeClass<K>) -> bool {
    matches!(candidate, KeycodeClass::Other)
}
