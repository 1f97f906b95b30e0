//! Rolling timing statistics (spec §3 "Rolling timing state", §4.2).

use crate::event::{dur, MS_MAX_DUR};

/// The timing snapshot captured the instant a PTH key is pressed (spec §3
/// "Snapshot captured at PTH press"). Frozen for the lifetime of that PTH's
/// decision and handed to the predictors (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PthSnapshot {
    pub prev_prev_press_to_prev_press_dur: u16,
    pub prev_press_to_pth_press_dur: u16,
    pub prev_prev_overlap_dur: u16,
    pub prev_overlap_dur: u16,
    pub press_to_press_w_avg: u16,
    pub overlap_w_avg: u16,
    pub key_release_before_pth_to_pth_press_dur: u16,
}

/// `e^1 / (e^0 + e^1)` and `e^0 / (e^0 + e^1)`: a two-term softmax over
/// index, i.e. the newer sample gets roughly 73% of the weight.
const WEIGHT_OLDER: f32 = 0.2689;
const WEIGHT_NEWER: f32 = 0.7311;

/// Weighted average of an older and a newer duration sample. A `None`
/// older sample (the spec's "negative older sample") degenerates to the
/// newer sample alone — there simply isn't enough history yet.
pub fn weighted_avg(older: Option<u16>, newer: u16) -> u16 {
    match older {
        Some(o) => ((o as f32) * WEIGHT_OLDER + (newer as f32) * WEIGHT_NEWER).round() as u16,
        None => newer,
    }
}

/// Maintains the rolling press-to-press and overlap durations that are
/// updated on *every* key event, independent of whether a PTH decision is
/// in progress (spec §4.1 guard 4, §4.2).
#[derive(Debug, Clone)]
pub struct TimingTracker<K> {
    pub down_count: u8,

    pub press_to_press_timer: u16,
    pub cur_press_to_press_dur: u16,
    pub prev_press_to_press_dur: u16,

    pub overlap_timer: u16,
    pub cur_overlap_dur: u16,
    pub prev_overlap_dur: u16,

    pub release_timer: u16,

    pub prev_press_keycode: Option<K>,
    pub cur_press_keycode: Option<K>,

    press_to_press_exceeded: bool,
    overlap_exceeded: bool,
    /// `down_count` observed the instant the overlap timer was last
    /// (re)started; used by [`TimingTracker::pth_press_snapshot`] to decide
    /// whether an extra key already in flight should zero the older overlap
    /// sample out (spec §4.2's "downshifted ... an additional key in flight
    /// zeroes out the older sample").
    down_count_at_overlap_start: u8,
}

impl<K> Default for TimingTracker<K> {
    fn default() -> Self {
        TimingTracker {
            down_count: 0,
            press_to_press_timer: 0,
            cur_press_to_press_dur: 0,
            prev_press_to_press_dur: 0,
            overlap_timer: 0,
            cur_overlap_dur: 0,
            prev_overlap_dur: 0,
            release_timer: 0,
            prev_press_keycode: None,
            cur_press_keycode: None,
            press_to_press_exceeded: false,
            overlap_exceeded: false,
            down_count_at_overlap_start: 0,
        }
    }
}

impl<K: Copy> TimingTracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates rolling state for a press at `now`. Returns the
    /// `prev_press_to_pth_press_dur` i.e. the freshly computed
    /// press-to-press duration, for convenience at call sites that need it
    /// immediately (e.g. taking a PTH snapshot).
    pub fn on_press(&mut self, now: u16, keycode: Option<K>) -> u16 {
        let ptp = if self.press_to_press_exceeded {
            MS_MAX_DUR
        } else {
            dur(now, self.press_to_press_timer)
        };
        self.prev_press_to_press_dur = self.cur_press_to_press_dur;
        self.cur_press_to_press_dur = ptp;
        self.press_to_press_timer = now;
        self.press_to_press_exceeded = false;

        self.prev_press_keycode = self.cur_press_keycode.take();
        self.cur_press_keycode = keycode;

        self.down_count = self.down_count.saturating_add(1);
        if self.down_count == 2 {
            self.overlap_timer = now;
            self.overlap_exceeded = false;
            self.down_count_at_overlap_start = self.down_count;
        }
        ptp
    }

    /// Updates rolling state for a release at `now`. Returns the captured
    /// overlap duration if `down_count >= 2` when the release arrived
    /// (spec: "overlap timer is meaningful only while down_count >= 2").
    pub fn on_release(&mut self, now: u16) -> Option<u16> {
        let captured = if self.down_count >= 2 {
            let ov = if self.overlap_exceeded {
                MS_MAX_DUR
            } else {
                dur(now, self.overlap_timer)
            };
            self.prev_overlap_dur = self.cur_overlap_dur;
            self.cur_overlap_dur = ov;
            Some(ov)
        } else {
            None
        };
        self.down_count = self.down_count.saturating_sub(1);
        self.overlap_timer = now;
        self.overlap_exceeded = false;
        self.down_count_at_overlap_start = self.down_count;
        self.release_timer = now;
        captured
    }

    /// Marks timers that have crossed [`MS_MAX_DUR`] since they last
    /// restarted as permanently saturated, per housekeeping (spec §4.8,
    /// §7 "Timer saturation").
    pub fn update_exceeded_flags(&mut self, now: u16) {
        if dur(now, self.press_to_press_timer) >= MS_MAX_DUR {
            self.press_to_press_exceeded = true;
        }
        if dur(now, self.overlap_timer) >= MS_MAX_DUR {
            self.overlap_exceeded = true;
        }
    }

    /// Takes the derived snapshot fields that only exist at a PTH press
    /// (spec §3 "Snapshot captured at PTH press", §4.2 last sentence).
    ///
    /// Must be called immediately after [`Self::on_press`] for the PTH's own
    /// press, so that `cur_press_to_press_dur` already reflects this press.
    pub fn pth_press_snapshot(
        &self,
        now: u16,
        key_release_before_pth_to_pth_press_dur: u16,
    ) -> PthSnapshot {
        let prev_overlap_dur = if self.down_count_at_overlap_start > 2 {
            // An extra key was already in flight when the overlap timer
            // last restarted: the "older" overlap sample predates that
            // extra key and is no longer representative, so it is zeroed
            // rather than reused.
            0
        } else if self.overlap_exceeded {
            MS_MAX_DUR
        } else {
            dur(now, self.overlap_timer)
        };

        PthSnapshot {
            prev_prev_press_to_prev_press_dur: self.prev_press_to_press_dur,
            prev_press_to_pth_press_dur: self.cur_press_to_press_dur,
            prev_prev_overlap_dur: self.prev_overlap_dur,
            prev_overlap_dur,
            press_to_press_w_avg: weighted_avg(
                Some(self.prev_press_to_press_dur),
                self.cur_press_to_press_dur,
            ),
            overlap_w_avg: weighted_avg(Some(self.prev_overlap_dur), prev_overlap_dur),
            key_release_before_pth_to_pth_press_dur,
        }
    }
}
