// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to hardware register blocks.
//!
//! The FPGA's register space is big-endian. [`RegisterBlock`] exposes raw
//! accesses, which return whatever the bus presents in host memory order,
//! and the `*_be` helpers on top of them, which are the only place byte-order
//! conversion happens. The engines use only the `*_be` helpers.

use nokia_fpga_messages::Width;
use std::time::Duration;

/// A block of hardware registers, addressed by byte offset.
///
/// Accesses are single bus operations of exactly the requested width, and are
/// never merged, split or reordered with respect to one another. Offsets must
/// be naturally aligned; implementations panic on an unaligned access.
pub trait RegisterBlock: Send + Sync {
    /// Return the size of the block in bytes.
    fn size(&self) -> usize;

    fn read8(&self, offset: usize) -> u8;
    fn read16(&self, offset: usize) -> u16;
    fn read32(&self, offset: usize) -> u32;
    fn read64(&self, offset: usize) -> u64;

    fn write8(&self, offset: usize, value: u8);
    fn write16(&self, offset: usize, value: u16);
    fn write32(&self, offset: usize, value: u32);
    fn write64(&self, offset: usize, value: u64);

    fn read_be16(&self, offset: usize) -> u16 {
        u16::from_be(self.read16(offset))
    }

    fn read_be32(&self, offset: usize) -> u32 {
        u32::from_be(self.read32(offset))
    }

    fn read_be64(&self, offset: usize) -> u64 {
        u64::from_be(self.read64(offset))
    }

    fn write_be16(&self, offset: usize, value: u16) {
        self.write16(offset, value.to_be())
    }

    fn write_be32(&self, offset: usize, value: u32) {
        self.write32(offset, value.to_be())
    }

    fn write_be64(&self, offset: usize, value: u64) {
        self.write64(offset, value.to_be())
    }

    /// Read a big-endian value of the provided width, zero-extended.
    fn read_be(&self, offset: usize, width: Width) -> u64 {
        match width {
            Width::One => u64::from(self.read8(offset)),
            Width::Two => u64::from(self.read_be16(offset)),
            Width::Four => u64::from(self.read_be32(offset)),
            Width::Eight => self.read_be64(offset),
        }
    }

    /// Write the low `width` bytes of `value`, big-endian.
    fn write_be(&self, offset: usize, width: Width, value: u64) {
        match width {
            Width::One => self.write8(offset, value as u8),
            Width::Two => self.write_be16(offset, value as u16),
            Width::Four => self.write_be32(offset, value as u32),
            Width::Eight => self.write_be64(offset, value),
        }
    }
}

/// A source of delays between register polls.
pub trait Delay: Send + Sync {
    fn delay(&self, duration: Duration);
}

/// A [`Delay`] that puts the calling thread to sleep.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Read a value until `done` accepts it, up to `iterations` reads, delaying
/// `interval` between reads. There is no delay after the last read.
///
/// Returns `Ok` with the accepted value, or `Err` with the last value read if
/// the bound was reached.
pub fn poll<T>(
    delay: &dyn Delay,
    interval: Duration,
    iterations: u32,
    mut read: impl FnMut() -> T,
    done: impl Fn(&T) -> bool,
) -> Result<T, T> {
    let mut value = read();
    for _ in 1..iterations {
        if done(&value) {
            return Ok(value);
        }
        delay.delay(interval);
        value = read();
    }
    if done(&value) {
        Ok(value)
    } else {
        Err(value)
    }
}
