// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to the iProc (PAXB) address space of a switch ASIC over the BDB.
//!
//! The ASIC exposes iProc space to the BDB through 4 KiB sub-windows. Some
//! pages are hard-routed to a fixed sub-window; any other page is reached by
//! pointing the IMAP sub-window at it first.

use crate::bdb::Bdb;
use crate::regs::RegisterBlock;
use crate::Error;
use nokia_fpga_messages::Width;
use slog::trace;
use slog::Logger;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Pages of iProc space that are hard-routed to [`FIXED_WINDOW`].
pub const FIXED_PAGES: &[u32] = &[0x1023_1000];

/// The BDB address of the hard-routed sub-window.
pub const FIXED_WINDOW: u32 = 0x6000;

/// The BDB address of the IMAP sub-window.
pub const IMAP_WINDOW: u32 = 0x7000;

/// The BDB address of the IMAP sub-window's page-select register.
pub const IMAP_SELECT: u32 = 0x2c1c;

/// Marks the page written to [`IMAP_SELECT`] as valid.
pub const IMAP_VALID: u32 = 1;

pub const PAGE_MASK: u32 = 0xfff;

/// The iProc accessor of one FPGA's BDB.
pub struct Iproc<R, W> {
    log: Logger,
    bdb: Arc<Bdb<R, W>>,
    // Guards the IMAP page selection. Always taken before the BDB lock.
    lock: Mutex<()>,
}

impl<R: RegisterBlock, W: RegisterBlock> Iproc<R, W> {
    pub fn new(log: &Logger, bdb: Arc<Bdb<R, W>>) -> Self {
        Self {
            log: log.new(slog::o!("engine" => "iproc")),
            bdb,
            lock: Mutex::new(()),
        }
    }

    pub fn bdb(&self) -> &Arc<Bdb<R, W>> {
        &self.bdb
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Map `address` into BDB space. The caller holds the iProc lock until it
    // has used the result.
    fn map_locked(&self, _guard: &MutexGuard<'_, ()>, slot: u8, address: u32) -> Result<u32, Error> {
        let page = address & !PAGE_MASK;
        let offset = address & PAGE_MASK;
        if FIXED_PAGES.contains(&page) {
            return Ok(FIXED_WINDOW + offset);
        }
        self.bdb
            .write_word(slot, IMAP_SELECT, Width::Four, u64::from(page | IMAP_VALID))?;
        // Read back to push the posted write out before using the window.
        let _ = self.bdb.read(slot, IMAP_SELECT, Width::Four)?;
        trace!(
            self.log,
            "selected IMAP page";
            "slot" => slot,
            "page" => format!("0x{page:08x}"),
        );
        Ok(IMAP_WINDOW + offset)
    }

    /// Map an iProc address into BDB space, selecting its page if needed.
    ///
    /// The mapping is only good until the next iProc access.
    pub fn map_addr(&self, slot: u8, address: u32) -> Result<u32, Error> {
        let guard = self.lock();
        self.map_locked(&guard, slot, address)
    }

    /// Read a 32-bit iProc register.
    pub fn read(&self, slot: u8, address: u32) -> Result<u32, Error> {
        let guard = self.lock();
        let mapped = self.map_locked(&guard, slot, address)?;
        let value = self.bdb.read(slot, mapped, Width::Four)?;
        Ok(value as u32)
    }

    /// Write a 32-bit iProc register.
    pub fn write(&self, slot: u8, address: u32, value: u32) -> Result<(), Error> {
        let guard = self.lock();
        let mapped = self.map_locked(&guard, slot, address)?;
        self.bdb.write_word(slot, mapped, Width::Four, u64::from(value))
    }
}
