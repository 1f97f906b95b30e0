//! Predictive tap-hold (PTH) decision engine core.
//!
//! This crate is the state machine described by the PTH design: it ingests
//! key press/release events with their timestamps and hand/side assignment,
//! tracks rolling timing statistics, and decides whether a tap-hold key was
//! tapped or held, consulting data-driven predictors only when the
//! surrounding context doesn't already decide. The HID report transport, the
//! matrix scan, and the keymap/layer lookup are external collaborators
//! (traits) supplied by the caller; this crate owns none of them.
//!
//! Module order mirrors the dependency order leaves-first: side/layout
//! resolution has no dependents below it, the state machine (`engine`) sits
//! on top of everything else.

pub mod error;
pub mod event;
pub mod keycode;
pub mod side;
pub mod timing;
pub mod release_cache;
pub mod tap_release;
pub mod instant_hold;
pub mod predictors;
pub mod hid;
pub mod policy;
pub mod engine;

pub use engine::{KeymapLookup, LayerQuery, ModifierState, PthEngine, Status};
pub use error::ConfigError;
pub use event::{dur, Event, Position, MS_MAX_DUR};
pub use hid::{HidAction, HidSink, RecordingSink};
pub use keycode::{KeycodeClass, ModMask, TapHoldKind};
pub use policy::{ForcedChoice, PthConfig};
pub use side::{Side, SideAtom, SideCallback, SideLayout, SideResolver};
