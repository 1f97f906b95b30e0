//! Release-reorder cache (spec §3 "Release cache", §4.3).
//!
//! A fixed-capacity-8 array of deferred releases, tagged by whether they
//! occurred before or after the second key's press, flushed in insertion
//! order at commit time. Each entry carries the keycode that was actually
//! registered at press time alongside the bare position, since by the time
//! the cache is flushed the keymap may resolve that position to something
//! else (spec §7 "Keycode resolved on unexpected layer"). Slot allocation
//! uses a `used` bitmask and `trailing_zeros` for O(1) allocation, the same
//! bitmask-indexed-fixed-array idiom `kanata-keyberon`'s `layout.rs` uses
//! for its `states` / `stacked` buffers (there via `heapless`/`arraydeque`;
//! here spelled out explicitly because the spec calls out the bitmask+CTZ
//! allocation scheme by name).

use crate::event::{Event, Position};

pub const CACHE_CAPACITY: usize = 8;

/// Which side of the second-key press a cached release occurred on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePhase {
    BeforeSecond,
    AfterSecond,
}

#[derive(Debug, Clone, Copy)]
struct Slot<K> {
    event: Event,
    keycode: K,
    phase: ReleasePhase,
}

/// A cached release ready to be replayed against the host.
#[derive(Debug, Clone, Copy)]
pub struct CachedRelease<K> {
    pub event: Event,
    pub keycode: K,
}

/// A fixed-capacity, insertion-ordered cache of deferred releases.
pub struct ReleaseCache<K> {
    slots: [Option<Slot<K>>; CACHE_CAPACITY],
    /// Bit `i` set means `slots[i]` is occupied.
    used: u8,
    /// Monotonically increasing insertion counter, stored per occupied slot
    /// via `order[i]`, to flush in insertion order even though allocation
    /// picks the lowest free bit rather than the next sequential one.
    order: [u32; CACHE_CAPACITY],
    next_order: u32,
}

impl<K: Copy> Default for ReleaseCache<K> {
    fn default() -> Self {
        ReleaseCache {
            slots: [None; CACHE_CAPACITY],
            used: 0,
            order: [0; CACHE_CAPACITY],
            next_order: 0,
        }
    }
}

impl<K: Copy> ReleaseCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == (1u8 << CACHE_CAPACITY) - 1
    }

    pub fn len(&self) -> usize {
        self.used.count_ones() as usize
    }

    /// Attempts to cache `event`/`keycode` under `phase`. Returns `false`
    /// (spec §7 "Capacity exhaustion") if the cache is full, in which case
    /// the caller must process the event directly instead.
    #[must_use]
    pub fn push(&mut self, event: Event, keycode: K, phase: ReleasePhase) -> bool {
        let free = !self.used & ((1u8 << CACHE_CAPACITY) - 1);
        if free == 0 {
            return false;
        }
        let idx = free.trailing_zeros() as usize;
        self.slots[idx] = Some(Slot {
            event,
            keycode,
            phase,
        });
        self.order[idx] = self.next_order;
        self.next_order = self.next_order.wrapping_add(1);
        self.used |= 1 << idx;
        true
    }

    /// Drains every slot tagged `phase`, in original insertion order, and
    /// clears them.
    pub fn drain_phase(
        &mut self,
        phase: ReleasePhase,
    ) -> heapless::Vec<CachedRelease<K>, CACHE_CAPACITY> {
        let mut indices: heapless::Vec<usize, CACHE_CAPACITY> = heapless::Vec::new();
        for i in 0..CACHE_CAPACITY {
            if self.used & (1 << i) != 0 {
                if let Some(slot) = self.slots[i] {
                    if slot.phase == phase {
                        let _ = indices.push(i);
                    }
                }
            }
        }
        indices.sort_unstable_by_key(|&i| self.order[i]);

        let mut out = heapless::Vec::new();
        for i in indices {
            if let Some(slot) = self.slots[i].take() {
                let _ = out.push(CachedRelease {
                    event: slot.event,
                    keycode: slot.keycode,
                });
            }
            self.used &= !(1 << i);
        }
        out
    }

    /// Removes every cached event for `position` without emitting it (used
    /// when a position's originating press is being committed out-of-band
    /// and the cached release no longer applies). Not used in the default
    /// flow but kept available for consumer policies that need it.
    pub fn evict(&mut self, position: Position) {
        for i in 0..CACHE_CAPACITY {
            if self.used & (1 << i) != 0 {
                if matches!(self.slots[i], Some(slot) if slot.event.position == position) {
                    self.slots[i] = None;
                    self.used &= !(1 << i);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots = [None; CACHE_CAPACITY];
        self.used = 0;
    }
}
