//! Side / layout resolver (spec §3 "Side encoding", §4.5).

use crate::error::ConfigError;
use crate::event::Position;

/// One of the four roles a key can play relative to another key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SideAtom {
    Left = 0b00,
    Right = 0b01,
    Opposite = 0b10,
    Same = 0b11,
}

impl SideAtom {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => SideAtom::Left,
            0b01 => SideAtom::Right,
            0b10 => SideAtom::Opposite,
            _ => SideAtom::Same,
        }
    }
}

/// The 8-bit side descriptor for a physical key (spec §3 "Side encoding").
///
/// Bit layout: bits 2-3 = role-as-PTH atom, bits 0-1 = role-as-other atom,
/// bits 4-7 = opaque user bits (hold-difficulty multiplier + consumer
/// extensions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Side(pub u8);

impl Side {
    pub const fn new(as_pth: SideAtom, as_other: SideAtom, user_bits: u8) -> Self {
        Side(((user_bits & 0x0F) << 4) | ((as_pth as u8) << 2) | (as_other as u8))
    }

    pub fn atom_as_pth(self) -> SideAtom {
        SideAtom::from_bits(self.0 >> 2)
    }

    pub fn atom_as_other(self) -> SideAtom {
        SideAtom::from_bits(self.0)
    }

    pub fn user_bits(self) -> u8 {
        (self.0 >> 4) & 0x0F
    }

    /// Decodes the hold-difficulty multiplier from the low two user bits:
    /// `0 => 1.0` (no key-specific adjustment), `1 (5H) => 0.95`,
    /// `2 (10H) => 0.90`, `3 (15H) => 0.85`. Higher user bits are reserved
    /// for consumer extension and ignored here.
    pub fn hold_difficulty_factor(self) -> f32 {
        match self.user_bits() & 0b11 {
            0 => 1.0,
            1 => 0.95,
            2 => 0.90,
            _ => 0.85,
        }
    }
}

/// `(pth_atom << 2) | other_atom` truth table for same-side resolution
/// (spec §3, §4.5): a key's role *as the other key* takes priority, then
/// the PTH's own role, then absolute-atom equality.
pub fn is_same_side(pth: Side, other: Side) -> bool {
    let pth_atom = pth.atom_as_pth();
    let other_atom = other.atom_as_other();
    match other_atom {
        SideAtom::Opposite => false,
        SideAtom::Same => true,
        _ => match pth_atom {
            SideAtom::Opposite => false,
            SideAtom::Same => true,
            _ => pth_atom == other_atom,
        },
    }
}

/// Resolves the [`Side`] descriptor for a physical position.
///
/// Two implementations mirror spec §4.5's "two resolution paths": a static
/// `row x col` table, or a caller-supplied callback (the "weakly-bound
/// function that consumers may override" from the C source, modeled here as
/// a trait object rather than runtime symbol patching, per the §9 redesign
/// note).
pub trait SideResolver {
    fn side_of(&self, position: Position) -> Side;
}

/// A static `[row][col]` side table.
pub struct SideLayout<'a> {
    rows: &'a [&'a [Side]],
}

impl<'a> SideLayout<'a> {
    /// Wraps `rows` as-is. Ragged rows are tolerated: an out-of-bounds
    /// lookup simply falls back to `Same`/`Same`, so this never fails. Use
    /// [`SideLayout::validated`] at config-assembly time to catch a ragged
    /// table early instead.
    pub fn new(rows: &'a [&'a [Side]]) -> Self {
        SideLayout { rows }
    }

    /// As [`SideLayout::new`], but rejects a ragged table (spec §7
    /// construction-time checks): every row must have the same column
    /// count as the first, matching the physical matrix's fixed column
    /// count.
    pub fn validated(rows: &'a [&'a [Side]]) -> Result<Self, ConfigError> {
        if let Some(expected) = rows.first().map(|r| r.len()) {
            for (row, cols) in rows.iter().enumerate() {
                if cols.len() != expected {
                    return Err(ConfigError::SideLayoutRowLenMismatch {
                        row,
                        expected,
                        actual: cols.len(),
                    });
                }
            }
        }
        Ok(SideLayout { rows })
    }
}

impl<'a> SideResolver for SideLayout<'a> {
    fn side_of(&self, (row, col): Position) -> Side {
        self.rows
            .get(row as usize)
            .and_then(|r| r.get(col as usize))
            .copied()
            .unwrap_or(Side::new(SideAtom::Same, SideAtom::Same, 0))
    }
}

/// A caller-supplied side callback, for consumers whose side assignment
/// can't be expressed as a flat table (e.g. it depends on runtime state).
pub struct SideCallback<'a> {
    f: &'a dyn Fn(Position) -> Side,
}

impl<'a> SideCallback<'a> {
    pub fn new(f: &'a dyn Fn(Position) -> Side) -> Self {
        SideCallback { f }
    }
}

impl<'a> SideResolver for SideCallback<'a> {
    fn side_of(&self, position: Position) -> Side {
        (self.f)(position)
    }
}
