// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Masks of optics module-select lines.

use serde::Deserialize;
use serde::Serialize;

// One bit per module-select line. The controller exposes two 32-bit registers,
// so 64 lines in total.
type MaskType = u64;

/// A bitmask of module-select lines, with bit `n` set if line `n` is asserted.
///
/// The hardware registers are active-low; use [`ModselMask::to_registers`] and
/// [`ModselMask::from_registers`] to convert to and from the register images.
#[derive(Clone, Copy, Default, Deserialize, Eq, PartialEq, Serialize)]
#[repr(transparent)]
pub struct ModselMask(pub MaskType);

impl core::fmt::Debug for ModselMask {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "ModselMask(0x{:0x})", self.0)
    }
}

/// Attempt to address a module-select line that does not exist.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(any(test, feature = "std"), derive(thiserror::Error))]
pub struct InvalidModsel(pub u8);

impl core::fmt::Display for InvalidModsel {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Invalid module-select line: {}", self.0)
    }
}

impl ModselMask {
    pub const MAX_INDEX: u8 = (core::mem::size_of::<MaskType>() * 8) as _;

    /// The number of lines carried by each mask register.
    pub const LINES_PER_REGISTER: u8 = 32;

    /// Return true if the line is asserted. If the index is out of range, an
    /// error is returned.
    pub fn is_set(&self, index: u8) -> Result<bool, InvalidModsel> {
        if index >= Self::MAX_INDEX {
            Err(InvalidModsel(index))
        } else {
            Ok((self.0 & (1 << index)) != 0)
        }
    }

    /// A mask with exactly one line asserted.
    pub const fn single(index: u8) -> Result<Self, InvalidModsel> {
        if index >= Self::MAX_INDEX {
            Err(InvalidModsel(index))
        } else {
            Ok(Self(1 << index))
        }
    }

    /// A mask with no lines asserted.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Return the number of asserted lines.
    pub const fn count(&self) -> usize {
        self.0.count_ones() as _
    }

    /// Return true if no line is asserted.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Return the indices of the asserted lines.
    pub fn to_indices(&self) -> impl Iterator<Item = u8> + '_ {
        (0..Self::MAX_INDEX).filter(|i| self.0 & (1 << i) != 0)
    }

    /// Return the active-low register images, low register first.
    ///
    /// A deasserted line reads as `1`, so an empty mask is `[!0, !0]`.
    pub const fn to_registers(&self) -> [u32; 2] {
        [!(self.0 as u32), !((self.0 >> 32) as u32)]
    }

    /// Build a mask from the active-low register images.
    pub const fn from_registers(lo: u32, hi: u32) -> Self {
        Self(((!hi as u64) << 32) | (!lo as u64))
    }

    /// Return which register (0 for low, 1 for high) carries a line, and the
    /// bit within it.
    pub const fn register_for(index: u8) -> Result<(usize, u8), InvalidModsel> {
        if index >= Self::MAX_INDEX {
            Err(InvalidModsel(index))
        } else {
            Ok((
                (index / Self::LINES_PER_REGISTER) as usize,
                index % Self::LINES_PER_REGISTER,
            ))
        }
    }
}
