//! The predictive tap-hold state machine (spec §4.1, §4.8, §5).
//!
//! `PthEngine` is the single entry point a firmware's key-scan loop drives:
//! every matrix event goes through [`PthEngine::process_record`], and every
//! scan-loop tick (whether or not a key changed) goes through
//! [`PthEngine::tick`]. Both close over a caller-supplied [`HidSink`] and a
//! small set of external-collaborator traits (keymap lookup, layer query,
//! modifier state) the same way `kanata-keyberon`'s `Layout` takes its
//! `CustomEvent` sink as a parameter rather than owning one, since the real
//! transport lives outside this crate (spec §1).

use crate::event::{dur, Event, Position};
use crate::hid::HidSink;
use crate::keycode::{is_noop_sentinel, KeycodeClass, ModMask, TapHoldKind};
use crate::policy::{ForcedChoice, PthConfig};
use crate::predictors::{
    apply_factor_to_overlap, apply_factor_to_probability, has_non_shift_mod, StreakFeatures,
};
use crate::release_cache::{ReleaseCache, ReleasePhase};
use crate::side::{is_same_side, Side, SideResolver};
use crate::tap_release::TapReleaseSet;
use crate::timing::{PthSnapshot, TimingTracker};

/// Resolves the keycode class bound to a position on an explicit layer
/// (spec §6 "Keymap lookup": `keycode_at(layer, row, col) -> keycode`). The
/// layer parameter is required, not optional: commit-tap step 2 and
/// commit-hold step 4 both re-resolve a cached position on a layer other
/// than whichever one is active when the re-resolution happens.
pub trait KeymapLookup<K> {
    fn keycode_at(&self, layer: usize, position: Position) -> KeycodeClass<K>;
}

/// Queries which layer is active for a given position (spec §6 "Layer
/// query": `current_layer_for(position) -> layer_index`, spec §7 "Keycode
/// resolved on unexpected layer").
pub trait LayerQuery {
    fn current_layer_for(&self, position: Position) -> usize;
}

/// Reads the live modifier mask and caps-word state, and maps a single
/// modifier bit to the keycode the host expects registered for it (spec §6
/// "Modifier state").
pub trait ModifierState<K> {
    fn active_mods(&self) -> ModMask;
    fn caps_word_on(&self) -> bool;
    fn keycode_for_mod(&self, bit: ModMask) -> K;
}

fn mod_keycodes<K, M: ModifierState<K> + ?Sized>(
    mods: ModMask,
    resolver: &M,
) -> heapless::Vec<K, 8> {
    let mut out = heapless::Vec::new();
    for bit in mods.iter() {
        let _ = out.push(resolver.keycode_for_mod(bit));
    }
    out
}

/// Registers the hold action for a tap-hold kind: either its `alt_tap_code`
/// composite keycode, or the modifiers it holds (layer/hand-swap activation
/// is a caller-side effect, nothing to emit over HID) — spec §4.1 commit-hold
/// step 1.
fn register_hold_action<K: Copy, M: ModifierState<K>, H: HidSink<K>>(
    kind: &TapHoldKind<K>,
    mods: &M,
    hid: &mut H,
) {
    if let Some(alt) = kind.alt_tap_code() {
        hid.register(alt);
        return;
    }
    if let TapHoldKind::ModTap { mods: held, .. } = kind {
        for m in mod_keycodes(*held, mods) {
            hid.register(m);
        }
    }
}

/// The symmetric rollback of [`register_hold_action`] (spec §4.4).
fn unregister_hold_action<K: Copy, M: ModifierState<K>, H: HidSink<K>>(
    kind: &TapHoldKind<K>,
    mods: &M,
    hid: &mut H,
) {
    if let Some(alt) = kind.alt_tap_code() {
        hid.unregister(alt);
        return;
    }
    if let TapHoldKind::ModTap { mods: held, .. } = kind {
        for m in mod_keycodes(*held, mods) {
            hid.unregister(m);
        }
    }
}

/// The engine's current decision state for the lone active PTH, if any
/// (spec §4.1's five named states).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Pressed,
    SecondPressed,
    DecidedTap,
    DecidedHold,
}

/// Bookkeeping for an instant-hold's provisional register, rolled back if
/// the later decision disagrees (spec §4.4).
#[derive(Debug, Clone, Copy, Default)]
struct InstantHoldState {
    pth_registered: bool,
}

/// The lone tap-hold key currently being decided.
#[derive(Debug, Clone, Copy)]
struct ActivePth<K> {
    position: Position,
    kind: TapHoldKind<K>,
    press_time: u16,
    side: Side,
    snapshot: PthSnapshot,
    instant: InstantHoldState,
    /// The layer active at the PTH's own press, captured so a `LayerTap`
    /// that gets instant-held can have the second key's keycode re-resolved
    /// against the layer that was active *before* the hold provisionally
    /// switched it (spec §3 "layer_before_instant_lt", spec §4.1 commit-tap
    /// step 2).
    layer_before_instant: usize,
}

/// The second key pressed while a PTH decision is pending.
#[derive(Debug, Clone, Copy)]
struct SecondKey<K> {
    position: Position,
    class: KeycodeClass<K>,
    press_time: u16,
    same_side: bool,
    /// Set once the second was provisionally registered as hold (spec §4.1
    /// "second-instant-hold policy"); rolled back if the eventual decision
    /// disagrees.
    instant_held: bool,
    /// Set once the second has physically released while still pending
    /// (spec §4.1 "mark `second_to_be_released`").
    to_be_released: bool,
    release_time: Option<u16>,
    /// The minimum-overlap-for-hold prediction taken when the second key
    /// arrived, consulted by housekeeping (spec §4.8 point 2). `None` when
    /// the second is same-side and not itself tap-hold, since that case is
    /// resolved by the same-side press/release policy instead of overlap.
    predicted_min_overlap: Option<u16>,
}

/// Owns the per-engine state the spec calls out as module-scoped (spec §3):
/// the active decision, the rolling timing tracker, the release-reorder
/// cache, and the tap-release set. One instance per keyboard half/side, the
/// way `kanata-keyberon`'s `Layout` is one instance per keyboard.
pub struct PthEngine<'a, K> {
    config: PthConfig<'a, K>,
    timing: TimingTracker<K>,
    release_cache: ReleaseCache<K>,
    tap_release: TapReleaseSet<K>,

    status: Status,
    active: Option<ActivePth<K>>,
    second: Option<SecondKey<K>>,

    /// Most recent PTH's own decision, consulted by the fast-streak
    /// predictor (spec §4.6 "previous PTH was hold").
    previous_pth_was_hold: bool,

    /// Guards against re-entrant calls into `process_record` while a
    /// commit sequence is itself injecting synthetic events into the HID
    /// sink (spec §5 "single-threaded, reentrancy-flag-based").
    in_commit: bool,
}

impl<'a, K: Copy + PartialEq + core::fmt::Debug> PthEngine<'a, K> {
    pub fn new(config: PthConfig<'a, K>) -> Self {
        PthEngine {
            config,
            timing: TimingTracker::new(),
            release_cache: ReleaseCache::new(),
            tap_release: TapReleaseSet::new(),
            status: Status::Idle,
            active: None,
            second: None,
            previous_pth_was_hold: false,
            in_commit: false,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// The position and keycode kind of the PTH currently under decision,
    /// if any. Exposed so a caller whose PTH is a `LayerTap` can drive its
    /// own layer push/pop off this engine's transitions (spec §1: the
    /// keymap/layer lookup service is an external collaborator this crate
    /// never owns, so it emits no HID action for a layer activation
    /// itself — spec §5 "PTH itself triggers [layer changes] only via the
    /// standard register/unregister of layer-tap keys" means *through the
    /// caller's own handling of that same event*, observed here via
    /// `status()`/`active_kind()` rather than a dedicated callback).
    pub fn active_kind(&self) -> Option<TapHoldKind<K>> {
        self.active.map(|a| a.kind)
    }

    pub fn active_position(&self) -> Option<Position> {
        self.active.map(|a| a.position)
    }

    /// Processes one matrix event. Returns `true` to let downstream key
    /// processing continue as usual (pass-through), `false` when this event
    /// has been fully handled (or deferred) by PTH and must not be
    /// forwarded to the normal keymap dispatch (spec §4.1, §6).
    pub fn process_record<S, L, M, H>(
        &mut self,
        event: Event,
        sides: &S,
        layers: &L,
        mods: &M,
        hid: &mut H,
    ) -> bool
    where
        S: SideResolver,
        L: KeymapLookup<K> + LayerQuery,
        M: ModifierState<K>,
        H: HidSink<K>,
    {
        if self.in_commit {
            // A commit sequence is injecting synthetic events; anything
            // arriving from the matrix mid-commit is the caller's to queue,
            // not re-entered here (spec §5).
            return true;
        }

        // Guard 3 (spec §4.1): a non-zero per-key tapping term means this
        // position opted out of PTH entirely, in favor of the legacy
        // fixed-timeout logic.
        if self
            .config
            .tapping_term_for(event.position)
            .map_or(false, |term| term != 0)
        {
            return true;
        }

        let entry_status = self.status;

        if !event.pressed {
            // Guard 4 (spec §4.1): a position previously committed as tap
            // that is still physically down unregisters-as-tap on release.
            // If we're mid-decision for a *different* PTH, the release must
            // still respect ordering against that pending decision, so it is
            // captured into the release cache (tagged by whichever phase
            // we're currently in) instead of emitted immediately.
            if let Some(keycode) = self.tap_release.get(event.position) {
                if matches!(self.status, Status::Pressed | Status::SecondPressed) {
                    let phase = if self.status == Status::SecondPressed {
                        ReleasePhase::AfterSecond
                    } else {
                        ReleasePhase::BeforeSecond
                    };
                    if self.release_cache.push(event, keycode, phase) {
                        self.tap_release.remove(event.position);
                    } else {
                        // Capacity exhaustion (spec §7): degrade to direct
                        // processing instead of caching.
                        log::warn!("release cache full, unregistering tap-release position directly");
                        self.tap_release.remove(event.position);
                        hid.unregister(keycode);
                    }
                } else {
                    self.tap_release.remove(event.position);
                    hid.unregister(keycode);
                }
                self.timing.on_press(event.time_ms, None);
                self.timing.on_release(event.time_ms);
                return false;
            }
        }

        let layer = layers.current_layer_for(event.position);
        let class = layers.keycode_at(layer, event.position);

        if event.pressed {
            self.timing.on_press(event.time_ms, class_keycode(&class));
        }

        let pass_through = match self.status {
            Status::Idle => self.on_idle(event, &class, sides, layers, mods, hid),
            Status::Pressed => self.on_pressed(event, &class, sides, layers, mods, hid),
            Status::SecondPressed => {
                self.on_second_pressed(event, &class, sides, layers, mods, hid)
            }
            Status::DecidedTap | Status::DecidedHold => {
                self.on_decided(event, &class, sides, mods, hid)
            }
        };

        if !event.pressed {
            self.timing.on_release(event.time_ms);
        }

        log::debug!(
            "process_record: {:?} -> {:?} (position={:?} pressed={} time_ms={} pass_through={})",
            entry_status,
            self.status,
            event.position,
            event.pressed,
            event.time_ms,
            pass_through
        );

        pass_through
    }

    fn on_idle<S, L, M, H>(
        &mut self,
        event: Event,
        class: &KeycodeClass<K>,
        sides: &S,
        layers: &L,
        mods: &M,
        hid: &mut H,
    ) -> bool
    where
        S: SideResolver,
        L: LayerQuery,
        M: ModifierState<K>,
        H: HidSink<K>,
    {
        if !event.pressed {
            return true;
        }
        let kind = match class.as_tap_hold() {
            Some(kind) => *kind,
            None => return true,
        };

        let side = sides.side_of(event.position);
        let snapshot = self.timing.pth_press_snapshot(event.time_ms, 0);
        let layer_before_instant = layers.current_layer_for(event.position);

        let mut active = ActivePth {
            position: event.position,
            kind,
            press_time: event.time_ms,
            side,
            snapshot,
            instant: InstantHoldState::default(),
            layer_before_instant,
        };

        if self.config.forced_choice_timeout_ms <= 0 {
            // Spec §4.1/§4.8: a timeout of exactly 0 forces the choice right
            // on press instead of waiting for a second key.
            self.active = Some(active);
            self.status = Status::Pressed;
            match self.config.forced_choice_after_timeout(false) {
                Some(ForcedChoice::Hold) | None => self.commit_hold(mods, hid),
                Some(ForcedChoice::Tap) => self.commit_tap(false, mods, hid),
            }
            return false;
        }

        // Spec §4.1: "Else if fast-streak prediction is enabled and fires,
        // commit tap (optionally resetting immediately)." Checked before
        // instant-hold, using whatever the previous PTH decided and the
        // previous/current keycodes' streak eligibility.
        if self.fast_streak_tap_fires(&kind, mods) {
            self.emit_fast_streak_tap(kind, active.position, hid);
            return false;
        }

        // alt_tap_code gates out instant-hold (spec §4.1 "enabled iff
        // alt_tap_code == None AND the policy predicate returns true").
        if kind.alt_tap_code().is_none()
            && self
                .config
                .should_hold_instantly(&kind, mods.caps_word_on(), mods.active_mods())
        {
            register_hold_action(&kind, mods, hid);
            active.instant.pth_registered = true;
        }

        self.active = Some(active);
        self.status = Status::Pressed;
        false
    }

    /// Evaluates the fast-streak-tap predictor for a freshly pressed PTH
    /// (spec §4.6): fires when the previous PTH wasn't a hold, both the
    /// PTH's own tap keycode and the previously pressed keycode are
    /// "streak eligible" per [`PthConfig::with_streak_eligible`], no
    /// non-Shift modifier is active, and the previous press preceded this
    /// one closely enough.
    fn fast_streak_tap_fires<M: ModifierState<K>>(&self, kind: &TapHoldKind<K>, mods: &M) -> bool {
        let prev_eligible = self
            .timing
            .prev_press_keycode
            .map(|k| self.config.streak_eligible(k))
            .unwrap_or(false);
        let features = StreakFeatures {
            previous_pth_was_hold: self.previous_pth_was_hold,
            pth_is_streak_eligible: self.config.streak_eligible(kind.tap_keycode()),
            previous_key_is_streak_eligible: prev_eligible,
            non_shift_mods_active: has_non_shift_mod(mods.active_mods()),
            prev_press_to_pth_press_dur: self.timing.cur_press_to_press_dur,
        };
        self.config.fast_streak_tap(&features)
    }

    /// Emits the fast-streak-tap decision directly: the PTH never enters
    /// `Pressed` at all, matching the spec's "decide on press, skip
    /// waiting for a second key entirely" framing. `FAST_STREAK_TAP_RESET_IMMEDIATELY`
    /// picks between unregistering right away or deferring to the
    /// eventual physical release via the tap-release set, the same choice
    /// `RESET_IMMEDIATELY_WHEN_TAP_CHOSEN` makes for the ordinary commit-tap
    /// path.
    fn emit_fast_streak_tap<H: HidSink<K>>(
        &mut self,
        kind: TapHoldKind<K>,
        position: Position,
        hid: &mut H,
    ) {
        let tap_keycode = kind.tap_keycode();
        hid.register(tap_keycode);
        if self.config.fast_streak_tap_reset_immediately {
            hid.send_and_wait(1);
            hid.unregister(tap_keycode);
        } else if !self.tap_release.insert(position, tap_keycode) {
            log::warn!("tap-release set full, unregistering fast-streak tap directly");
            hid.send_and_wait(1);
            hid.unregister(tap_keycode);
        }
        self.previous_pth_was_hold = false;
    }

    fn on_pressed<S, L, M, H>(
        &mut self,
        event: Event,
        class: &KeycodeClass<K>,
        sides: &S,
        layers: &L,
        mods: &M,
        hid: &mut H,
    ) -> bool
    where
        S: SideResolver,
        L: KeymapLookup<K>,
        M: ModifierState<K>,
        H: HidSink<K>,
    {
        let active = match self.active {
            Some(a) => a,
            None => return true,
        };

        if event.position == active.position {
            if !event.pressed {
                // The PTH released before any second key arrived: a pure
                // tap (spec §4.1 scenario S1).
                self.commit_tap(true, mods, hid);
            }
            return false;
        }

        if !event.pressed {
            // A release of something other than the active PTH, with no
            // second key yet: cache it, there is nothing to reorder
            // against until a second key shows up.
            if let Some(keycode) = class_keycode(class) {
                if !self.release_cache.push(event, keycode, ReleasePhase::BeforeSecond) {
                    log::warn!("release cache full, unregistering directly");
                    hid.unregister(keycode);
                }
                return false;
            }
            return true;
        }

        // This is the second press.
        let side = sides.side_of(event.position);
        let same_side = is_same_side(active.side, side);
        let second_is_tap_hold = class.is_tap_hold();

        // Spec §4.1: "If PTH was held-instantly AND activated a layer AND
        // the second keycode (on the new layer) is the no-op sentinel,
        // commit tap." Checked first, before the overlap prediction and
        // same-side policies below.
        if active.instant.pth_registered
            && matches!(active.kind, TapHoldKind::LayerTap { .. })
            && is_noop_sentinel(class)
        {
            self.second = Some(SecondKey {
                position: event.position,
                class: *class,
                press_time: event.time_ms,
                same_side,
                instant_held: false,
                to_be_released: false,
                release_time: None,
                predicted_min_overlap: None,
            });
            self.status = Status::SecondPressed;
            self.commit_tap_reresolving(layers, false, mods, hid);
            return false;
        }

        let predicted_min_overlap = if second_is_tap_hold || !same_side {
            let base = self.config.predict_min_overlap_for_hold(&active.snapshot);
            let mut factor = self.config.prediction_factor_for_hold(active.side);
            if same_side {
                // Spec §4.6: "same-side second keys reduce the factor by
                // 0.10 before this transform."
                factor -= 0.10;
            }
            let scaled = apply_factor_to_overlap(base, factor);
            Some(scaled.clamp(self.config.min_overlap_ms, self.config.max_overlap_ms))
        } else {
            None
        };

        if same_side && self.config.should_choose_tap_same_side_press(second_is_tap_hold) {
            self.second = Some(SecondKey {
                position: event.position,
                class: *class,
                press_time: event.time_ms,
                same_side,
                instant_held: false,
                to_be_released: false,
                release_time: None,
                predicted_min_overlap: None,
            });
            self.status = Status::SecondPressed;
            self.commit_tap_reresolving(layers, false, mods, hid);
            return false;
        }

        let mut second = SecondKey {
            position: event.position,
            class: *class,
            press_time: event.time_ms,
            same_side,
            instant_held: false,
            to_be_released: false,
            release_time: None,
            predicted_min_overlap,
        };

        if let Some(kind) = class.as_tap_hold() {
            if kind.alt_tap_code().is_none()
                && self
                    .config
                    .second_should_hold_instantly(kind, mods.caps_word_on(), mods.active_mods())
            {
                register_hold_action(kind, mods, hid);
                second.instant_held = true;
            }
        }

        self.second = Some(second);
        self.status = Status::SecondPressed;
        false
    }

    fn on_second_pressed<S, L, M, H>(
        &mut self,
        event: Event,
        class: &KeycodeClass<K>,
        sides: &S,
        layers: &L,
        mods: &M,
        hid: &mut H,
    ) -> bool
    where
        S: SideResolver,
        L: KeymapLookup<K>,
        M: ModifierState<K>,
        H: HidSink<K>,
    {
        let active = match self.active {
            Some(a) => a,
            None => return true,
        };
        let second = match self.second {
            Some(s) => s,
            None => return true,
        };

        if event.position == active.position {
            if !event.pressed {
                self.decide_on_pth_release(event.time_ms, layers, mods, hid);
            }
            return false;
        }

        if event.position == second.position {
            if !event.pressed {
                self.decide_on_second_release(event.time_ms, layers, mods, hid);
            }
            return false;
        }

        if event.pressed {
            // A third key pressed while the decision is still pending
            // (spec §4.1 "From SecondPressed, on third press").
            let p = self.config.predict_third_press_hold_probability(
                &active.snapshot,
                dur(second.press_time, active.press_time),
                dur(event.time_ms, second.press_time),
            );
            let factor = self.config.prediction_factor_for_hold(active.side);
            let p = apply_factor_to_probability(p, factor);
            let hold_chosen = p > 0.5;
            let pth_side = active.side;
            if hold_chosen {
                self.commit_hold_reresolving(layers, mods, hid);
            } else {
                self.commit_tap_reresolving(layers, false, mods, hid);
            }

            // Spec §4.1: the PTH+second decision above does not register the
            // third key itself. "Register the third: as hold if hold was
            // chosen AND third is same-side tap-hold AND same-side-hold
            // policy approves, otherwise add to tap-release set and register
            // as tap (for tap-hold thirds) or simply forward the event
            // (non-tap-hold third)."
            return match class.as_tap_hold() {
                Some(kind) => {
                    let side = sides.side_of(event.position);
                    let register_as_hold = hold_chosen
                        && is_same_side(pth_side, side)
                        && self
                            .config
                            .should_register_as_hold_when_same_side(pth_side, mods.active_mods());
                    if register_as_hold {
                        register_hold_action(kind, mods, hid);
                    } else {
                        let tap_keycode = kind.tap_keycode();
                        hid.register(tap_keycode);
                        if !self.tap_release.insert(event.position, tap_keycode) {
                            log::warn!(
                                "tap-release set full, registering third tap-hold key as tap directly"
                            );
                            hid.send_and_wait(1);
                            hid.unregister(tap_keycode);
                        }
                    }
                    false
                }
                None => true,
            };
        }

        // A release of neither the PTH nor the second key, while still
        // pending: cache it for replay once the decision commits.
        if let Some(keycode) = class_keycode(class) {
            if !self.release_cache.push(event, keycode, ReleasePhase::AfterSecond) {
                log::warn!("release cache full, unregistering directly");
                hid.unregister(keycode);
            }
            return false;
        }
        true
    }

    fn decide_on_pth_release<L: KeymapLookup<K>, M: ModifierState<K>, H: HidSink<K>>(
        &mut self,
        now: u16,
        layers: &L,
        mods: &M,
        hid: &mut H,
    ) {
        let active = match self.active {
            Some(a) => a,
            None => return,
        };
        let second = match self.second {
            Some(s) => s,
            None => {
                self.commit_tap_reresolving(layers, true, mods, hid);
                return;
            }
        };

        if second.same_side {
            // Spec §4.1: "if second is same-side we commit tap
            // deterministically (policy default)."
            self.commit_tap_reresolving(layers, true, mods, hid);
            return;
        }

        let p = if second.to_be_released {
            let second_own_duration = dur(second.release_time.unwrap_or(now), second.press_time);
            self.config.predict_pth_release_after_second_release(
                &active.snapshot,
                dur(second.press_time, active.press_time),
                second_own_duration,
            )
        } else {
            let overlap = dur(now, active.press_time);
            self.config.predict_pth_release_after_second_press(
                &active.snapshot,
                dur(second.press_time, active.press_time),
                overlap,
            )
        };
        let factor = self.config.prediction_factor_for_hold(active.side);
        let p = apply_factor_to_probability(p, factor);
        if p > 0.5 {
            self.commit_hold_reresolving(layers, mods, hid);
        } else {
            self.commit_tap_reresolving(layers, true, mods, hid);
        }
    }

    fn decide_on_second_release<L: KeymapLookup<K>, M: ModifierState<K>, H: HidSink<K>>(
        &mut self,
        now: u16,
        layers: &L,
        mods: &M,
        hid: &mut H,
    ) {
        let second_is_tap_hold = match self.second {
            Some(s) => s.class.is_tap_hold(),
            None => return,
        };
        let same_side = match self.second.as_mut() {
            Some(s) => {
                s.to_be_released = true;
                s.release_time = Some(now);
                s.same_side
            }
            None => return,
        };

        // Spec §4.1: only a same-side release, approved by policy, decides
        // immediately; otherwise the release is merely recorded and the
        // decision awaits the PTH's own release or a third press.
        if same_side && self.config.should_choose_tap_same_side_release(second_is_tap_hold) {
            self.commit_tap_reresolving(layers, false, mods, hid);
        }
    }

    fn on_decided<S, M, H>(
        &mut self,
        event: Event,
        class: &KeycodeClass<K>,
        sides: &S,
        mods: &M,
        hid: &mut H,
    ) -> bool
    where
        S: SideResolver,
        M: ModifierState<K>,
        H: HidSink<K>,
    {
        let active = match self.active {
            Some(a) => a,
            None => return true,
        };
        if event.position == active.position {
            if !event.pressed {
                if self.status == Status::DecidedHold {
                    unregister_hold_action(&active.kind, mods, hid);
                }
                self.reset_to_idle();
            }
            return false;
        }

        if !event.pressed {
            return true;
        }

        // spec §4.1 "From `DecidedTap`"/"From `DecidedHold`": a *different*
        // tap-hold key pressed while this PTH's decision already stands.
        let kind = match class.as_tap_hold() {
            Some(kind) => *kind,
            None => return true,
        };

        let register_as_hold = self.status == Status::DecidedHold && {
            let side = sides.side_of(event.position);
            is_same_side(active.side, side)
                && self
                    .config
                    .should_register_as_hold_when_same_side(active.side, mods.active_mods())
        };

        if register_as_hold {
            register_hold_action(&kind, mods, hid);
        } else {
            let tap_keycode = kind.tap_keycode();
            hid.register(tap_keycode);
            if !self.tap_release.insert(event.position, tap_keycode) {
                log::warn!("tap-release set full, registering tap-hold key as tap directly");
                hid.send_and_wait(1);
                hid.unregister(tap_keycode);
            }
        }
        false
    }

    /// [`Self::commit_tap`], but first re-resolves the cached second's
    /// keycode if the PTH was instant-held as a `LayerTap` (spec §4.1
    /// commit-tap step 2: "re-resolve the cached second keycode on the
    /// pre-layer").
    fn commit_tap_reresolving<L: KeymapLookup<K>, M: ModifierState<K>, H: HidSink<K>>(
        &mut self,
        layers: &L,
        pth_already_released: bool,
        mods: &M,
        hid: &mut H,
    ) {
        if let (Some(active), Some(second)) = (self.active, self.second.as_mut()) {
            if active.instant.pth_registered {
                if let TapHoldKind::LayerTap { .. } = active.kind {
                    second.class = layers.keycode_at(active.layer_before_instant, second.position);
                }
            }
        }
        self.commit_tap_direct(pth_already_released, mods, hid);
    }

    /// [`Self::commit_hold`], but first re-resolves the cached second's
    /// keycode against the PTH's own hold layer when the PTH is a
    /// `LayerTap` committed as hold without having been instant-held (spec
    /// §4.1 commit-hold step 4: "re-resolve the second's keycode on the
    /// PTH's hold layer ... because it was captured under the wrong
    /// layer").
    fn commit_hold_reresolving<L: KeymapLookup<K>, M: ModifierState<K>, H: HidSink<K>>(
        &mut self,
        layers: &L,
        mods: &M,
        hid: &mut H,
    ) {
        if let (Some(active), Some(second)) = (self.active, self.second.as_mut()) {
            if !active.instant.pth_registered && !second.instant_held {
                if let TapHoldKind::LayerTap { layer, .. } = active.kind {
                    second.class = layers.keycode_at(layer, second.position);
                }
            }
        }
        self.commit_hold(mods, hid);
    }

    /// Commits the pending PTH as a tap (spec §4.1 commit-tap sequence).
    ///
    /// `pth_already_released` is true when this commit is itself triggered
    /// by the PTH's own physical release (spec §4.1 "if it is the PTH's own
    /// release, commit tap, wait a short guard, emit unregister"): the
    /// tap-release set must never be used there, since no future release of
    /// this position will ever arrive to drain it. For every other trigger
    /// the PTH is still physically down, and `reset_immediately_when_tap_chosen`
    /// picks between unregistering right away or deferring to the eventual
    /// physical release via the tap-release set.
    fn commit_tap_direct<M: ModifierState<K>, H: HidSink<K>>(
        &mut self,
        pth_already_released: bool,
        mods: &M,
        hid: &mut H,
    ) {
        self.in_commit = true;
        log::debug!(
            "commit_tap: position={:?} pth_already_released={}",
            self.active.map(|a| a.position),
            pth_already_released
        );

        if let Some(active) = self.active {
            if active.instant.pth_registered {
                // Spec §4.1 commit-tap step 1: the instant-held modifier is
                // about to be rolled back to a bare tap, which the host would
                // otherwise read as a lone-modifier press-then-release.
                // Neutralize it first, before unregistering the hold.
                if let TapHoldKind::ModTap { mods: held, .. } = active.kind {
                    if self.config.should_neutralize_mods(held) {
                        hid.tap_code16(self.config.neutralization_key);
                    }
                }
                unregister_hold_action(&active.kind, mods, hid);
            }
            let tap_keycode = active.kind.tap_keycode();
            hid.register(tap_keycode);
            if pth_already_released || self.config.reset_immediately_when_tap_chosen {
                hid.send_and_wait(1);
                hid.unregister(tap_keycode);
            } else if self.tap_release.insert(active.position, tap_keycode) {
                // recorded, will unregister-as-tap on physical release
            } else {
                log::warn!("tap-release set full, unregistering PTH tap directly");
                hid.send_and_wait(1);
                hid.unregister(tap_keycode);
            }
            self.previous_pth_was_hold = false;
        }

        self.flush_cached_releases(hid, ReleasePhase::BeforeSecond);

        if let Some(second) = self.second {
            self.commit_second_as_tap(&second, mods, hid);
        }

        self.flush_cached_releases(hid, ReleasePhase::AfterSecond);
        self.status = Status::DecidedTap;
        self.reset_to_idle();
        self.in_commit = false;
    }

    /// Public entry point kept for the existing commit-tap call sites that
    /// have no [`KeymapLookup`] in scope (the PTH's own physical release
    /// with no second key ever having been seen, the tick-driven forced
    /// choice path, and so on) — delegates straight to
    /// [`Self::commit_tap_direct`], since there is no second-key keycode to
    /// re-resolve when no layer-tap re-resolution site applies.
    fn commit_tap<M: ModifierState<K>, H: HidSink<K>>(
        &mut self,
        pth_already_released: bool,
        mods: &M,
        hid: &mut H,
    ) {
        self.commit_tap_direct(pth_already_released, mods, hid);
    }

    /// Commits the pending PTH as a hold (spec §4.1 commit-hold sequence).
    fn commit_hold<M: ModifierState<K>, H: HidSink<K>>(&mut self, mods: &M, hid: &mut H) {
        self.in_commit = true;
        log::debug!(
            "commit_hold: position={:?}",
            self.active.map(|a| a.position)
        );

        if let Some(active) = self.active {
            if !active.instant.pth_registered {
                register_hold_action(&active.kind, mods, hid);
            }
            self.previous_pth_was_hold = true;
        }
        let active_side = self.active.map(|a| a.side);

        self.flush_cached_releases(hid, ReleasePhase::BeforeSecond);

        if let Some(second) = self.second {
            match second.class.as_tap_hold() {
                Some(kind) => {
                    let register_as_hold = second.same_side
                        && active_side
                            .map(|s| self.config.should_register_as_hold_when_same_side(s, mods.active_mods()))
                            .unwrap_or(false);
                    if register_as_hold {
                        if !second.instant_held {
                            register_hold_action(kind, mods, hid);
                        }
                    } else {
                        if second.instant_held {
                            unregister_hold_action(kind, mods, hid);
                        }
                        self.commit_second_as_tap(&second, mods, hid);
                    }
                }
                None => {
                    if let Some(k) = class_keycode(&second.class) {
                        hid.register(k);
                        if second.to_be_released {
                            hid.send_and_wait(1);
                            hid.unregister(k);
                        }
                    }
                }
            }
        }

        self.flush_cached_releases(hid, ReleasePhase::AfterSecond);
        self.status = Status::DecidedHold;
        self.second = None;
        self.in_commit = false;
    }

    /// Shared tail of committing the second key as tap, whether the overall
    /// PTH decision was tap or (same-side-disapproved) hold.
    fn commit_second_as_tap<M: ModifierState<K>, H: HidSink<K>>(
        &mut self,
        second: &SecondKey<K>,
        mods: &M,
        hid: &mut H,
    ) {
        match second.class.as_tap_hold() {
            Some(kind) => {
                if second.instant_held {
                    unregister_hold_action(kind, mods, hid);
                }
                let tap_keycode = kind.tap_keycode();
                hid.register(tap_keycode);
                if second.to_be_released {
                    hid.send_and_wait(1);
                    hid.unregister(tap_keycode);
                } else if !self.tap_release.insert(second.position, tap_keycode) {
                    log::warn!("tap-release set full, unregistering second tap directly");
                    hid.send_and_wait(1);
                    hid.unregister(tap_keycode);
                }
            }
            None => {
                if let Some(k) = class_keycode(&second.class) {
                    hid.register(k);
                    if second.to_be_released {
                        hid.send_and_wait(1);
                        hid.unregister(k);
                    }
                }
            }
        }
    }

    fn flush_cached_releases<H: HidSink<K>>(&mut self, hid: &mut H, phase: ReleasePhase) {
        let cached = self.release_cache.drain_phase(phase);
        if !cached.is_empty() {
            hid.send_and_wait(1);
        }
        for entry in cached.iter() {
            hid.unregister(entry.keycode);
        }
    }

    fn reset_to_idle(&mut self) {
        self.status = Status::Idle;
        self.active = None;
        self.second = None;
    }

    /// Housekeeping tick (spec §4.8): saturates long-running timers, fires
    /// the overlap-reached-while-pending hold, and fires the forced-choice
    /// timeout while a decision is still pending.
    pub fn tick<L, M, H>(&mut self, now: u16, layers: &L, mods: &M, hid: &mut H)
    where
        L: KeymapLookup<K>,
        M: ModifierState<K>,
        H: HidSink<K>,
    {
        if self.in_commit {
            return;
        }
        self.timing.update_exceeded_flags(now);

        let (status, press_time) = match self.active {
            Some(active) => (self.status, active.press_time),
            None => return,
        };
        if !matches!(status, Status::Pressed | Status::SecondPressed) {
            return;
        }

        if status == Status::SecondPressed {
            if let Some(second) = self.second {
                if let Some(min_overlap) = second.predicted_min_overlap {
                    if dur(now, second.press_time) >= min_overlap {
                        log::debug!(
                            "tick: min-overlap-for-hold reached at {}ms, forcing hold",
                            now
                        );
                        self.commit_hold_reresolving(layers, mods, hid);
                        return;
                    }
                }
            }
        }

        if self.config.forced_choice_timeout_ms < 0 {
            return;
        }
        let elapsed = dur(now, press_time) as i32;
        if elapsed < self.config.forced_choice_timeout_ms {
            return;
        }
        let has_second_key = matches!(status, Status::SecondPressed);
        log::debug!(
            "tick: forced-choice timeout elapsed={} at {}ms, has_second_key={}",
            elapsed,
            now,
            has_second_key
        );
        match self.config.forced_choice_after_timeout(has_second_key) {
            Some(ForcedChoice::Hold) => self.commit_hold_reresolving(layers, mods, hid),
            Some(ForcedChoice::Tap) => self.commit_tap_reresolving(layers, false, mods, hid),
            None => {}
        }
    }
}

fn class_keycode<K: Copy>(class: &KeycodeClass<K>) -> Option<K> {
    match class {
        KeycodeClass::Basic(k) => Some(*k),
        KeycodeClass::TapHold(kind) => Some(kind.tap_keycode()),
        KeycodeClass::TapDance | KeycodeClass::Other => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hid::RecordingSink;
    use crate::side::{SideAtom, SideLayout};

    /// `'C'`/`'c'` stand in for `Ctrl` register/unregister, `'a'` for a tap
    /// of the letter A, matching the spec's own literal scenario notation
    /// closely enough to eyeball the recorded trace directly.
    fn ctrl_a() -> TapHoldKind<char> {
        TapHoldKind::ModTap {
            mods: ModMask::LCTRL,
            tap: 'a',
            alt_tap_code: None,
        }
    }

    struct FixedLayer<'a> {
        table: &'a [((u8, u16), KeycodeClass<char>)],
        alt_table: &'a [((u8, u16), KeycodeClass<char>)],
        alt_layer: usize,
    }

    impl<'a> FixedLayer<'a> {
        fn new(table: &'a [((u8, u16), KeycodeClass<char>)]) -> Self {
            FixedLayer {
                table,
                alt_table: &[],
                alt_layer: 0,
            }
        }

        fn with_layer(
            table: &'a [((u8, u16), KeycodeClass<char>)],
            alt_layer: usize,
            alt_table: &'a [((u8, u16), KeycodeClass<char>)],
        ) -> Self {
            FixedLayer {
                table,
                alt_table,
                alt_layer,
            }
        }
    }

    impl<'a> KeymapLookup<char> for FixedLayer<'a> {
        fn keycode_at(&self, layer: usize, position: Position) -> KeycodeClass<char> {
            let table = if layer == self.alt_layer && !self.alt_table.is_empty() {
                self.alt_table
            } else {
                self.table
            };
            table
                .iter()
                .find(|(p, _)| *p == position)
                .map(|(_, c)| *c)
                .unwrap_or(KeycodeClass::Other)
        }
    }

    impl<'a> LayerQuery for FixedLayer<'a> {
        fn current_layer_for(&self, _position: Position) -> usize {
            0
        }
    }

    struct NoMods;
    impl ModifierState<char> for NoMods {
        fn active_mods(&self) -> ModMask {
            ModMask::empty()
        }
        fn caps_word_on(&self) -> bool {
            false
        }
        fn keycode_for_mod(&self, bit: ModMask) -> char {
            if bit.has_ctrl() {
                'C'
            } else if bit.has_shift() {
                'S'
            } else {
                '?'
            }
        }
    }

    struct ShiftActive;
    impl ModifierState<char> for ShiftActive {
        fn active_mods(&self) -> ModMask {
            ModMask::LSHIFT
        }
        fn caps_word_on(&self) -> bool {
            false
        }
        fn keycode_for_mod(&self, bit: ModMask) -> char {
            if bit.has_ctrl() {
                'C'
            } else if bit.has_shift() {
                'S'
            } else {
                '?'
            }
        }
    }

    const PTH_POS: (u8, u16) = (0, 0);
    const SECOND_POS: (u8, u16) = (0, 1);
    const THIRD_POS: (u8, u16) = (0, 2);

    fn left() -> Side {
        Side::new(SideAtom::Left, SideAtom::Left, 0)
    }
    fn right() -> Side {
        Side::new(SideAtom::Right, SideAtom::Right, 0)
    }

    fn engine_ctrl_a<'a>(cfg: PthConfig<'a, char>) -> PthEngine<'a, char> {
        PthEngine::new(cfg)
    }

    /// S1 — pure tap: no other key pressed during the PTH's lifetime.
    #[test]
    fn s1_pure_tap() {
        let cfg = PthConfig::new('\0').unwrap().with_should_hold_instantly(&|_, _, _| false);
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[(PTH_POS, KeycodeClass::TapHold(ctrl_a()))]);
        let rows: &[&[Side]] = &[&[left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        let a = engine.process_record(Event::press(PTH_POS, 100), &sides, &layers, &mods, &mut hid);
        let b = engine.process_record(Event::release(PTH_POS, 180), &sides, &layers, &mods, &mut hid);
        // Both events are fully handled by PTH: neither should pass through
        // to ordinary keymap dispatch (spec §4.1/§6 polarity).
        assert!(!a);
        assert!(!b);

        assert_eq!(
            &hid.actions[..],
            &[
                crate::hid::HidAction::Register('a'),
                crate::hid::HidAction::Wait(1),
                crate::hid::HidAction::Unregister('a'),
            ]
        );
    }

    /// An ordinary, non-tap-hold key event with no active PTH must pass
    /// through untouched (spec §6 "returns true to let downstream
    /// processing continue").
    #[test]
    fn ordinary_key_passes_through_when_idle() {
        let cfg = PthConfig::new('\0').unwrap();
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[(PTH_POS, KeycodeClass::Basic('x'))]);
        let rows: &[&[Side]] = &[&[left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        let consumed =
            engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        assert!(consumed, "ordinary key press must pass through");
        assert!(hid.actions.is_empty());
    }

    /// spec §4.1 guard 3: a non-zero per-key tapping term yields to the
    /// legacy fixed-timeout logic entirely, even for a tap-hold keycode.
    #[test]
    fn nonzero_tapping_term_yields_to_legacy_logic() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_tapping_term_for(&|pos| if pos == PTH_POS { Some(200) } else { None });
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[(PTH_POS, KeycodeClass::TapHold(ctrl_a()))]);
        let rows: &[&[Side]] = &[&[left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        let consumed =
            engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        assert!(consumed, "a configured per-key tapping term must pass through");
        assert_eq!(engine.status(), Status::Idle);
        assert!(hid.actions.is_empty());
    }

    /// A zero tapping term is the "no override" value and must not yield.
    #[test]
    fn zero_tapping_term_does_not_yield() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false)
            .with_tapping_term_for(&|_| Some(0));
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[(PTH_POS, KeycodeClass::TapHold(ctrl_a()))]);
        let rows: &[&[Side]] = &[&[left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        let consumed =
            engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        assert!(!consumed);
        assert_eq!(engine.status(), Status::Pressed);
    }

    /// S2 — hold via opposite overlap: a long-held opposite-side key pushes
    /// the elapsed overlap past the predicted min-overlap-for-hold while
    /// still pending, so housekeeping commits hold.
    #[test]
    fn s2_hold_via_opposite_overlap() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false);
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[
            (PTH_POS, KeycodeClass::TapHold(ctrl_a())),
            (SECOND_POS, KeycodeClass::Basic('o')),
        ]);
        let rows: &[&[Side]] = &[&[left(), right()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        engine.process_record(Event::press(SECOND_POS, 50), &sides, &layers, &mods, &mut hid);
        assert_eq!(engine.status(), Status::SecondPressed);

        // Tick past the predicted min overlap (clamped to >= 39ms) without
        // releasing the second key: housekeeping must force the decision to
        // hold per spec §4.8 point 2 / property 3.
        engine.tick(300, &layers, &mods, &mut hid);
        assert_eq!(engine.status(), Status::DecidedHold);
        assert_eq!(
            &hid.actions[..],
            &[
                crate::hid::HidAction::Register('C'),
                crate::hid::HidAction::Register('o'),
            ]
        );

        // The second key's own release is ordinary pass-through once a
        // decision has committed; only the PTH's own release unregisters
        // the hold.
        engine.process_record(Event::release(SECOND_POS, 400), &sides, &layers, &mods, &mut hid);
        engine.process_record(Event::release(PTH_POS, 450), &sides, &layers, &mods, &mut hid);
        assert_eq!(engine.status(), Status::Idle);
        assert_eq!(hid.actions.last(), Some(&crate::hid::HidAction::Unregister('C')));
    }

    /// S3 — same-side roll is tap: a fast same-hand key decides tap
    /// immediately on its own press (default same-side-press policy).
    #[test]
    fn s3_same_side_roll_is_tap() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false);
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[
            (PTH_POS, KeycodeClass::TapHold(ctrl_a())),
            (SECOND_POS, KeycodeClass::Basic('s')),
        ]);
        let rows: &[&[Side]] = &[&[left(), left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        engine.process_record(Event::press(SECOND_POS, 30), &sides, &layers, &mods, &mut hid);
        // Same-side press policy decides tap immediately.
        assert_eq!(engine.status(), Status::Idle);
        engine.process_record(Event::release(SECOND_POS, 90), &sides, &layers, &mods, &mut hid);

        let regs: heapless::Vec<char, 8> = hid.registers().collect();
        assert_eq!(&regs[..], &['a', 's']);
    }

    /// S4 — Shift released between PTH press and decision must still
    /// uppercase the eventual tap (ordering preservation through a deferred
    /// decision, property 4).
    #[test]
    fn s4_shift_wrap_preserves_uppercase() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false);
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[
            (PTH_POS, KeycodeClass::TapHold(ctrl_a())),
            ((1, 0), KeycodeClass::Basic('S')),
        ]);
        let rows: &[&[Side]] = &[&[left()]];
        let sides = SideLayout::new(rows);
        let mods = ShiftActive;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        // Shift's own register already happened via normal processing
        // before this sequence starts; only its release passes through PTH
        // (position (1, 0) stands in for Shift's physical key).
        engine.process_record(Event::press(PTH_POS, 40), &sides, &layers, &mods, &mut hid);
        engine.process_record(Event::release((1, 0), 60), &sides, &layers, &mods, &mut hid);
        engine.process_record(Event::release(PTH_POS, 120), &sides, &layers, &mods, &mut hid);

        // The Shift release is cached (BeforeSecond) and only flushes once
        // the tap commits, after the 'a' register — preserving uppercase
        // semantics despite the physical release/press race.
        assert_eq!(hid.actions[0], crate::hid::HidAction::Register('a'));
        let shift_unregister_idx = hid
            .actions
            .iter()
            .position(|a| *a == crate::hid::HidAction::Unregister('S'))
            .unwrap();
        let a_register_idx = hid
            .actions
            .iter()
            .position(|a| *a == crate::hid::HidAction::Register('a'))
            .unwrap();
        assert!(a_register_idx < shift_unregister_idx);
    }

    /// S5 — forced hold on timeout: default forced-choice policy holds when
    /// no second key has arrived by the timeout.
    #[test]
    fn s5_forced_hold_on_timeout() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false);
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[(PTH_POS, KeycodeClass::TapHold(ctrl_a()))]);
        let rows: &[&[Side]] = &[&[left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        engine.tick(750, &layers, &mods, &mut hid);
        assert_eq!(engine.status(), Status::DecidedHold);
        assert!(hid.registers().any(|k| k == 'C'));

        engine.process_record(Event::release(PTH_POS, 900), &sides, &layers, &mods, &mut hid);
        assert_eq!(engine.status(), Status::Idle);
        assert_eq!(hid.actions.last(), Some(&crate::hid::HidAction::Unregister('C')));
    }

    /// Property 1 generalized: lone-tap invariance regardless of hold
    /// duration, bounded by the forced-choice policy (covered by not
    /// reaching the timeout here).
    #[test]
    fn lone_tap_invariance_regardless_of_duration() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false);
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[(PTH_POS, KeycodeClass::TapHold(ctrl_a()))]);
        let rows: &[&[Side]] = &[&[left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        engine.tick(500, &layers, &mods, &mut hid); // below 700ms default timeout
        engine.process_record(Event::release(PTH_POS, 650), &sides, &layers, &mods, &mut hid);

        let regs: heapless::Vec<char, 8> = hid.registers().collect();
        assert_eq!(&regs[..], &['a']);
    }

    /// Property 5 — instant-hold rollback is idempotent: net HID effect of
    /// an instant-held-then-tap decision equals a non-instant-hold tap.
    #[test]
    fn instant_hold_rollback_nets_out_to_plain_tap() {
        let cfg = PthConfig::new('\0').unwrap(); // default: instant hold on
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[(PTH_POS, KeycodeClass::TapHold(ctrl_a()))]);
        let rows: &[&[Side]] = &[&[left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        // Instant hold registered Ctrl immediately.
        assert!(hid.registers().any(|k| k == 'C'));
        engine.process_record(Event::release(PTH_POS, 45), &sides, &layers, &mods, &mut hid);

        let net_registers: heapless::Vec<char, 8> = hid.registers().filter(|&k| k != 'C').collect();
        assert_eq!(&net_registers[..], &['a']);
        // Ctrl's provisional register was matched by an unregister before
        // the real tap register (rollback-before-register ordering).
        let ctrl_unregister_idx = hid
            .actions
            .iter()
            .position(|a| *a == crate::hid::HidAction::Unregister('C'))
            .unwrap();
        let tap_register_idx = hid
            .actions
            .iter()
            .position(|a| *a == crate::hid::HidAction::Register('a'))
            .unwrap();
        assert!(ctrl_unregister_idx < tap_register_idx);
    }

    /// Property 8 — a synthetic event re-entering `process_record` mid
    /// commit must not be processed as a fresh state transition.
    #[test]
    fn reentrant_call_mid_commit_is_rejected() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false);
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[(PTH_POS, KeycodeClass::TapHold(ctrl_a()))]);
        let rows: &[&[Side]] = &[&[left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        engine.in_commit = true;
        let pass_through =
            engine.process_record(Event::press(THIRD_POS, 10), &sides, &layers, &mods, &mut hid);
        assert!(pass_through, "a re-entrant event must pass through untouched");
        assert_eq!(engine.status(), Status::Pressed);
    }

    /// Property 7 — capacity bounds: caching more than 8 releases before a
    /// decision degrades to direct processing instead of panicking or
    /// corrupting state.
    #[test]
    fn release_cache_overflow_degrades_gracefully() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false);
        let mut engine = engine_ctrl_a(cfg);
        let mut table: heapless::Vec<((u8, u16), KeycodeClass<char>), 16> = heapless::Vec::new();
        let _ = table.push((PTH_POS, KeycodeClass::TapHold(ctrl_a())));
        for i in 1..=9u16 {
            let _ = table.push(((0, i), KeycodeClass::Basic('x')));
        }
        let layers = FixedLayer::new(&table);
        let rows: &[&[Side]] = &[&[left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        for i in 1..=9u16 {
            engine.process_record(Event::press((0, i), (i * 2) as u16), &sides, &layers, &mods, &mut hid);
            engine.process_record(
                Event::release((0, i), (i * 2 + 1) as u16),
                &sides,
                &layers,
                &mods,
                &mut hid,
            );
        }
        // 9 cached releases exceed the 8-slot cache; the 9th must have been
        // unregistered directly rather than silently dropped.
        assert!(hid.actions.iter().any(|a| *a == crate::hid::HidAction::Unregister('x')));
    }

    /// Spec §4.1 "From `Pressed`, on second press": when the PTH was
    /// held-instantly and activated a layer, a second keycode that resolves
    /// to the no-op sentinel on that new layer commits tap immediately.
    #[test]
    fn noop_sentinel_on_instant_held_layer_commits_tap() {
        let layer_tap: TapHoldKind<char> = TapHoldKind::LayerTap {
            layer: 1,
            tap: 'a',
            alt_tap_code: None,
        };
        // Default `should_hold_instantly` fires for any non-ModTap kind, so
        // the PTH is instant-held on press without needing an override.
        let cfg = PthConfig::new('\0').unwrap();
        let mut engine = PthEngine::new(cfg);
        let layers = FixedLayer::new(&[(PTH_POS, KeycodeClass::TapHold(layer_tap))]);
        let rows: &[&[Side]] = &[&[left(), left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        // SECOND_POS is absent from the keymap table, so `FixedLayer`
        // resolves it to `KeycodeClass::Other` — standing in for "no action
        // bound on the newly activated layer".
        engine.process_record(Event::press(SECOND_POS, 10), &sides, &layers, &mods, &mut hid);

        assert_eq!(engine.status(), Status::Idle);
        assert_eq!(
            &hid.actions[..],
            &[
                crate::hid::HidAction::Register('a'),
                crate::hid::HidAction::Wait(1),
                crate::hid::HidAction::Unregister('a'),
            ]
        );
    }

    /// Spec §4.1 "Else if fast-streak prediction is enabled and fires,
    /// commit tap": a quick same-eligibility roll decides tap on press,
    /// without ever entering `Pressed`.
    #[test]
    fn fast_streak_tap_fires_on_press() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_streak_eligible(&crate::predictors::is_ascii_streak_eligible);
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[
            (PTH_POS, KeycodeClass::TapHold(ctrl_a())),
            (THIRD_POS, KeycodeClass::Basic('x')),
        ]);
        let rows: &[&[Side]] = &[&[left(), left(), left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        // An ordinary letter just before the PTH, within the streak window.
        engine.process_record(Event::press(THIRD_POS, 0), &sides, &layers, &mods, &mut hid);
        engine.process_record(Event::press(PTH_POS, 50), &sides, &layers, &mods, &mut hid);

        assert_eq!(engine.status(), Status::Idle);
        assert_eq!(&hid.actions[..], &[crate::hid::HidAction::Register('a')]);

        // Deferred to the eventual physical release via the tap-release set
        // (fast_streak_tap_reset_immediately defaults to false).
        engine.process_record(Event::release(PTH_POS, 200), &sides, &layers, &mods, &mut hid);
        assert_eq!(hid.actions.last(), Some(&crate::hid::HidAction::Unregister('a')));
    }

    /// spec §4.1 "From `DecidedTap`: subsequent tap-hold presses are
    /// immediately tap".
    #[test]
    fn decided_tap_subsequent_tap_hold_press_is_immediate_tap() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false)
            .with_fast_streak_predictor(&|_| false);
        let mut engine = engine_ctrl_a(cfg);
        let other: TapHoldKind<char> = TapHoldKind::ModTap {
            mods: ModMask::LALT,
            tap: 'b',
            alt_tap_code: None,
        };
        let layers = FixedLayer::new(&[
            (PTH_POS, KeycodeClass::TapHold(ctrl_a())),
            (SECOND_POS, KeycodeClass::TapHold(other)),
        ]);
        let rows: &[&[Side]] = &[&[left(), left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        engine.process_record(Event::release(PTH_POS, 10), &sides, &layers, &mods, &mut hid);
        assert_eq!(engine.status(), Status::DecidedTap);
        hid.actions.clear();

        let pass_through =
            engine.process_record(Event::press(SECOND_POS, 20), &sides, &layers, &mods, &mut hid);
        assert!(!pass_through);
        assert_eq!(&hid.actions[..], &[crate::hid::HidAction::Register('b')]);

        let pass_through =
            engine.process_record(Event::release(SECOND_POS, 40), &sides, &layers, &mods, &mut hid);
        assert!(!pass_through);
        assert_eq!(hid.actions.last(), Some(&crate::hid::HidAction::Unregister('b')));
    }

    /// spec §4.1 "From `DecidedHold`: subsequent tap-hold presses are hold
    /// if same-side ... else tap".
    #[test]
    fn decided_hold_same_side_press_registers_hold() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false);
        let mut engine = engine_ctrl_a(cfg);
        let other: TapHoldKind<char> = TapHoldKind::ModTap {
            mods: ModMask::LALT,
            tap: 'b',
            alt_tap_code: None,
        };
        let layers = FixedLayer::new(&[
            (PTH_POS, KeycodeClass::TapHold(ctrl_a())),
            (SECOND_POS, KeycodeClass::TapHold(other)),
        ]);
        let rows: &[&[Side]] = &[&[left(), left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        engine.tick(750, &layers, &mods, &mut hid);
        assert_eq!(engine.status(), Status::DecidedHold);
        hid.actions.clear();

        let pass_through =
            engine.process_record(Event::press(SECOND_POS, 760), &sides, &layers, &mods, &mut hid);
        assert!(!pass_through);
        assert_eq!(&hid.actions[..], &[crate::hid::HidAction::Register('A')]);
    }

    /// Same as above but opposite-side: spec says "else tap".
    #[test]
    fn decided_hold_opposite_side_press_is_tap() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false);
        let mut engine = engine_ctrl_a(cfg);
        let other: TapHoldKind<char> = TapHoldKind::ModTap {
            mods: ModMask::LALT,
            tap: 'b',
            alt_tap_code: None,
        };
        let layers = FixedLayer::new(&[
            (PTH_POS, KeycodeClass::TapHold(ctrl_a())),
            (SECOND_POS, KeycodeClass::TapHold(other)),
        ]);
        let rows: &[&[Side]] = &[&[left(), right()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        engine.tick(750, &layers, &mods, &mut hid);
        assert_eq!(engine.status(), Status::DecidedHold);
        hid.actions.clear();

        let pass_through =
            engine.process_record(Event::press(SECOND_POS, 760), &sides, &layers, &mods, &mut hid);
        assert!(!pass_through);
        assert_eq!(&hid.actions[..], &[crate::hid::HidAction::Register('b')]);
    }

    /// spec §4.1 commit-hold step 4: a `LayerTap` PTH committed as hold
    /// re-resolves the second's keycode on the PTH's hold layer, because it
    /// was captured while still on the pre-switch layer.
    #[test]
    fn layer_tap_hold_reresolves_second_on_hold_layer() {
        let layer_tap: TapHoldKind<char> = TapHoldKind::LayerTap {
            layer: 1,
            tap: 'a',
            alt_tap_code: None,
        };
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|kind, _, _| {
                // Disable instant-hold so commit-hold step 4's "was not
                // held-instantly" branch is exercised.
                !matches!(kind, TapHoldKind::LayerTap { .. })
            });
        let mut engine = PthEngine::new(cfg);
        let layers = FixedLayer::with_layer(
            &[
                (PTH_POS, KeycodeClass::TapHold(layer_tap)),
                (SECOND_POS, KeycodeClass::Basic('q')),
            ],
            1,
            &[(SECOND_POS, KeycodeClass::Basic('Q'))],
        );
        let rows: &[&[Side]] = &[&[left(), right()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        engine.process_record(Event::press(SECOND_POS, 50), &sides, &layers, &mods, &mut hid);
        // Opposite side, basic key: push the overlap past the predicted
        // min-overlap-for-hold via housekeeping.
        engine.tick(400, &layers, &mods, &mut hid);
        assert_eq!(engine.status(), Status::DecidedHold);

        // The second was captured as 'q' (layer 0) but must be re-resolved
        // to 'Q' (layer 1, the layer-tap's hold layer) before registering.
        assert!(hid.registers().any(|k| k == 'Q'));
        assert!(!hid.registers().any(|k| k == 'q'));
    }

    fn shift_t() -> TapHoldKind<char> {
        TapHoldKind::ModTap {
            mods: ModMask::LSHIFT,
            tap: 't',
            alt_tap_code: None,
        }
    }

    /// spec §4.1 "From `SecondPressed`, on third press": the PTH+second
    /// decision commits, and the third key — if it is itself tap-hold and
    /// same-side — is registered as hold by PTH directly, not handed back
    /// to a fresh PTH decision.
    #[test]
    fn third_press_same_side_tap_hold_registers_as_hold() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false)
            .with_third_press_predictor(&|_, _, _| 1.0);
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[
            (PTH_POS, KeycodeClass::TapHold(ctrl_a())),
            (SECOND_POS, KeycodeClass::Basic('x')),
            (THIRD_POS, KeycodeClass::TapHold(shift_t())),
        ]);
        // PTH and third share a side; second is opposite so it doesn't
        // itself decide tap on arrival.
        let rows: &[&[Side]] = &[&[left(), right(), left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        engine.process_record(Event::press(SECOND_POS, 10), &sides, &layers, &mods, &mut hid);
        assert_eq!(engine.status(), Status::SecondPressed);

        let pass_through =
            engine.process_record(Event::press(THIRD_POS, 20), &sides, &layers, &mods, &mut hid);
        assert!(!pass_through);
        assert_eq!(engine.status(), Status::DecidedHold);
        // PTH's own hold ('C'), the non-tap-hold second ('x'), and the
        // same-side tap-hold third registered as hold ('S' for Shift).
        assert_eq!(hid.actions.last(), Some(&crate::hid::HidAction::Register('S')));
        assert!(hid.registers().eq(['C', 'x', 'S']));
    }

    /// Same as above, but the third key is on the opposite side: it must be
    /// added to the tap-release set and registered as tap instead.
    #[test]
    fn third_press_opposite_side_tap_hold_registers_as_tap() {
        let cfg = PthConfig::new('\0')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false)
            .with_third_press_predictor(&|_, _, _| 1.0);
        let mut engine = engine_ctrl_a(cfg);
        let layers = FixedLayer::new(&[
            (PTH_POS, KeycodeClass::TapHold(ctrl_a())),
            (SECOND_POS, KeycodeClass::Basic('x')),
            (THIRD_POS, KeycodeClass::TapHold(shift_t())),
        ]);
        let rows: &[&[Side]] = &[&[left(), right(), right()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        engine.process_record(Event::press(SECOND_POS, 10), &sides, &layers, &mods, &mut hid);
        let pass_through =
            engine.process_record(Event::press(THIRD_POS, 20), &sides, &layers, &mods, &mut hid);
        assert!(!pass_through);
        assert_eq!(hid.actions.last(), Some(&crate::hid::HidAction::Register('t')));

        // Released later, it must unregister-as-tap via the tap-release set
        // rather than a hold unregister.
        engine.process_record(Event::release(THIRD_POS, 30), &sides, &layers, &mods, &mut hid);
        assert_eq!(hid.actions.last(), Some(&crate::hid::HidAction::Unregister('t')));
    }

    /// spec §4.1 commit-tap step 1: an instant-held modifier rolled back to
    /// a bare tap must be neutralized first, so the host doesn't read the
    /// register/unregister pair as a lone-modifier press. Ctrl/Shift are
    /// exempted by the default policy, so Alt is used to observe it (spec
    /// §8 S6 "optional F23 tap if policy").
    #[test]
    fn commit_tap_neutralizes_instant_held_non_ctrl_shift_mod() {
        let alt_b: TapHoldKind<char> = TapHoldKind::ModTap {
            mods: ModMask::LALT,
            tap: 'b',
            alt_tap_code: None,
        };
        let cfg = PthConfig::new('N').unwrap();
        let mut engine = PthEngine::new(cfg);
        let layers = FixedLayer::new(&[(PTH_POS, KeycodeClass::TapHold(alt_b))]);
        let rows: &[&[Side]] = &[&[left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        // Instant hold registered Alt immediately (NoMods maps it to '?').
        assert!(hid.registers().any(|k| k == '?'));
        hid.actions.clear();

        engine.process_record(Event::release(PTH_POS, 45), &sides, &layers, &mods, &mut hid);

        let neutralize_register_idx = hid
            .actions
            .iter()
            .position(|a| *a == crate::hid::HidAction::Register('N'))
            .expect("neutralization tap must be emitted");
        let neutralize_unregister_idx = hid
            .actions
            .iter()
            .position(|a| *a == crate::hid::HidAction::Unregister('N'))
            .unwrap();
        let mod_unregister_idx = hid
            .actions
            .iter()
            .position(|a| *a == crate::hid::HidAction::Unregister('?'))
            .unwrap();
        assert!(neutralize_register_idx < mod_unregister_idx);
        assert!(neutralize_unregister_idx < mod_unregister_idx);
    }

    /// A genuine sustained hold (no rollback to tap) must never neutralize
    /// the modifier it just registered — only the tap-rollback path does.
    #[test]
    fn commit_hold_does_not_neutralize_mods() {
        let alt_b: TapHoldKind<char> = TapHoldKind::ModTap {
            mods: ModMask::LALT,
            tap: 'b',
            alt_tap_code: None,
        };
        let cfg = PthConfig::new('N')
            .unwrap()
            .with_should_hold_instantly(&|_, _, _| false);
        let mut engine = PthEngine::new(cfg);
        let layers = FixedLayer::new(&[(PTH_POS, KeycodeClass::TapHold(alt_b))]);
        let rows: &[&[Side]] = &[&[left()]];
        let sides = SideLayout::new(rows);
        let mods = NoMods;
        let mut hid: RecordingSink<char> = RecordingSink::new();

        engine.process_record(Event::press(PTH_POS, 0), &sides, &layers, &mods, &mut hid);
        engine.tick(750, &layers, &mods, &mut hid);
        assert_eq!(engine.status(), Status::DecidedHold);

        assert!(!hid.actions.iter().any(|a| *a == crate::hid::HidAction::Register('N')));
    }
}
