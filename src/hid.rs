//! HID sink (spec §6 "HID sink (egress)").
//!
//! The actual report transport is an external collaborator (spec §1); this
//! crate only needs somewhere to send `register`/`unregister` calls. The
//! trait below mirrors the method names `kanata`'s own `oskbd::KbdOut`
//! uses (`press_key`/`release_key`) plus the `tap_code16` convenience and
//! the `send_and_wait` guard primitive spec §6 calls for.

/// A single HID action emitted by the engine, recorded for tests via
/// [`RecordingSink`] the same way `kanata`'s `oskbd::simulated::KbdOut`
/// records presses instead of touching a real device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidAction<K> {
    Register(K),
    Unregister(K),
    /// A guard wait enforced between a register/unregister pair so the host
    /// accepts the event (spec §5 "short busy waits").
    Wait(u16),
}

/// Registers/unregisters basic and composite keycodes, and provides the
/// guard-wait primitive the dispatcher needs when flushing a deferred
/// commit.
pub trait HidSink<K> {
    fn register(&mut self, keycode: K);
    fn unregister(&mut self, keycode: K);

    /// Convenience: register then immediately unregister.
    fn tap_code16(&mut self, keycode: K) {
        self.register(keycode);
        self.unregister(keycode);
    }

    /// A short busy-wait enforcing a minimum duration between a register
    /// and the following unregister so the host doesn't coalesce them into
    /// nothing (spec §5, §4.1 commit sequences' "guard wait").
    fn send_and_wait(&mut self, _duration_ms: u16) {}
}

/// A `Vec`-backed [`HidSink`] that records every action instead of talking
/// to hardware, for driving the engine from tests.
#[derive(Debug, Default)]
pub struct RecordingSink<K> {
    pub actions: heapless::Vec<HidAction<K>, 64>,
}

impl<K: Copy> RecordingSink<K> {
    pub fn new() -> Self {
        RecordingSink {
            actions: heapless::Vec::new(),
        }
    }

    pub fn registers(&self) -> impl Iterator<Item = K> + '_ {
        self.actions.iter().filter_map(|a| match a {
            HidAction::Register(k) => Some(*k),
            _ => None,
        })
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }
}

impl<K: Copy> HidSink<K> for RecordingSink<K> {
    fn register(&mut self, keycode: K) {
        let _ = self.actions.push(HidAction::Register(keycode));
    }

    fn unregister(&mut self, keycode: K) {
        let _ = self.actions.push(HidAction::Unregister(keycode));
    }

    fn send_and_wait(&mut self, duration_ms: u16) {
        let _ = self.actions.push(HidAction::Wait(duration_ms));
    }
}
