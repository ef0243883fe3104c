// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory-mapped register blocks.
//!
//! The FPGA is a PCI function; its BARs are mapped from the sysfs resource
//! files, e.g. `/sys/bus/pci/devices/0000:05:00.0/resource0`.

use crate::regs::RegisterBlock;
use crate::Error;
use nix::libc::off_t;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use std::ffi::c_void;
use std::fs::File;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::path::Path;
use std::ptr::NonNull;

/// A region of a register resource mapped into this process.
#[derive(Debug)]
pub struct MmioRegion {
    base: NonNull<c_void>,
    len: usize,
    _file: File,
}

// Safety: The mapping is owned by this object for its whole life and all
// accesses through it are volatile, so it can be used from any thread.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Map `len` bytes of `path`, starting at `offset`.
    ///
    /// `offset` must be page-aligned.
    pub fn open(path: impl AsRef<Path>, offset: usize, len: usize) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let length =
            NonZeroUsize::new(len).ok_or(Error::InvalidArgument("empty register region"))?;
        let offset = off_t::try_from(offset)
            .map_err(|_| Error::InvalidArgument("register region offset out of range"))?;
        // Safety: We map a fresh shared region chosen by the kernel, which
        // cannot alias any Rust object, and unmap it only on drop.
        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                offset,
            )?
        };
        Ok(Self {
            base,
            len,
            _file: file,
        })
    }

    // Return a pointer to a `T` at `offset`.
    //
    // Panics if the access falls outside of the mapping or is not naturally
    // aligned. A register access is a single bus cycle, so it is never split
    // into narrower ones.
    fn ptr<T>(&self, offset: usize) -> *mut T {
        let width = core::mem::size_of::<T>();
        assert!(
            offset.checked_add(width).is_some_and(|end| end <= self.len),
            "register access at 0x{offset:x} (width {width}) outside of 0x{:x}-byte region",
            self.len,
        );
        assert!(
            offset % width == 0,
            "unaligned register access at 0x{offset:x} (width {width})",
        );
        // Safety: Bounds checked above. The mapping is page-aligned, so an
        // aligned offset gives an aligned pointer.
        unsafe { self.base.as_ptr().cast::<u8>().add(offset).cast() }
    }

    fn read<T: Copy>(&self, offset: usize) -> T {
        let ptr = self.ptr::<T>(offset);
        // Safety: `ptr` is in bounds and aligned for `T`.
        unsafe { ptr.read_volatile() }
    }

    fn write<T: Copy>(&self, offset: usize, value: T) {
        let ptr = self.ptr::<T>(offset);
        // Safety: As in `read`.
        unsafe { ptr.write_volatile(value) }
    }
}

impl Drop for MmioRegion {
    fn drop(&mut self) {
        // Safety: `base` and `len` describe the mapping created in `open`,
        // which nothing else references once we are being dropped.
        let _ = unsafe { munmap(self.base, self.len) };
    }
}

impl RegisterBlock for MmioRegion {
    fn size(&self) -> usize {
        self.len
    }

    fn read8(&self, offset: usize) -> u8 {
        self.read(offset)
    }

    fn read16(&self, offset: usize) -> u16 {
        self.read(offset)
    }

    fn read32(&self, offset: usize) -> u32 {
        self.read(offset)
    }

    fn read64(&self, offset: usize) -> u64 {
        self.read(offset)
    }

    fn write8(&self, offset: usize, value: u8) {
        self.write(offset, value)
    }

    fn write16(&self, offset: usize, value: u16) {
        self.write(offset, value)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.write(offset, value)
    }

    fn write64(&self, offset: usize, value: u64) {
        self.write(offset, value)
    }
}
