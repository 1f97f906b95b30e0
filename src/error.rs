//! Construction-time configuration errors.
//!
//! The hot path has no recoverable errors (spec §7): capacity exhaustion
//! degrades silently with a log line, and timer saturation/wraparound are
//! handled by clamping, not by a `Result`. What *is* worth validating with a
//! real error type is the one-time assembly of a [`crate::policy::PthConfig`],
//! the same way `kanata-parser` validates a loaded config with
//! `thiserror`-derived errors before handing it to the runtime.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "min overlap ({min}) must be less than or equal to max overlap ({max})"
    )]
    InvertedOverlapWindow { min: u16, max: u16 },

    #[error("side layout row {row} has {actual} columns, expected {expected}")]
    SideLayoutRowLenMismatch {
        row: usize,
        expected: usize,
        actual: usize,
    },
}
