// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![cfg_attr(all(not(test), not(feature = "std")), no_std)]

//! Wire formats shared between the switch FPGA driver and its user-space
//! clients.
//!
//! This covers the fixed-layout `lubde_ioctl_t` image used to reach the
//! back-door bus (BDB) engine, the ioctl command numbers, BDB transfer widths,
//! and the module-select masks used by the custom I2C mux.

pub mod ioctl;
pub mod modsel;

pub use ioctl::Cmd;
pub use ioctl::DeviceFlags;
pub use ioctl::LubdeIoctl;
pub use modsel::InvalidModsel;
pub use modsel::ModselMask;

use serde::Deserialize;
use serde::Serialize;

/// The number of back-door bus slots addressable by the control FPGA.
pub const NUM_HW_SLOTS: u8 = 32;

/// An error decoding a message or one of its fields.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(any(test, feature = "std"), derive(thiserror::Error))]
pub enum Error {
    /// A BDB transfer width other than 1, 2, 4 or 8 bytes.
    InvalidWidth(u32),

    /// An ioctl command number this interface does not implement.
    InvalidCommand(u32),

    /// A frame shorter than a command word plus a `lubde_ioctl_t`.
    FrameTooShort(usize),

    /// A hardware slot outside of `0..NUM_HW_SLOTS`.
    InvalidSlot(u32),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Error::InvalidWidth(w) => write!(f, "Invalid BDB transfer width: {w}"),
            Error::InvalidCommand(c) => write!(f, "Invalid ioctl command: 0x{c:08x}"),
            Error::FrameTooShort(n) => write!(f, "Frame too short: {n} bytes"),
            Error::InvalidSlot(s) => write!(f, "Invalid hardware slot: {s}"),
        }
    }
}

/// The width of a single BDB register access.
///
/// Reads support exactly these widths. Writes additionally support blocks
/// whose length is a multiple of 8, which are issued as a sequence of
/// [`Width::Eight`] stores. Accesses must be naturally aligned.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[cfg_attr(feature = "std", derive(clap::ValueEnum))]
#[repr(u8)]
pub enum Width {
    #[cfg_attr(feature = "std", value(name = "1"))]
    One = 1,
    #[cfg_attr(feature = "std", value(name = "2"))]
    Two = 2,
    #[cfg_attr(feature = "std", value(name = "4"))]
    Four = 4,
    #[cfg_attr(feature = "std", value(name = "8"))]
    Eight = 8,
}

impl Width {
    /// Return the width in bytes.
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Return a mask covering the low `self.bytes()` bytes of a `u64`.
    pub const fn mask(self) -> u64 {
        match self {
            Width::Eight => u64::MAX,
            w => (1u64 << (8 * w as u32)) - 1,
        }
    }

    /// Construct a width from a byte count.
    pub const fn from_bytes(n: u32) -> Result<Self, Error> {
        match n {
            1 => Ok(Width::One),
            2 => Ok(Width::Two),
            4 => Ok(Width::Four),
            8 => Ok(Width::Eight),
            other => Err(Error::InvalidWidth(other)),
        }
    }
}
