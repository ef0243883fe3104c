// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The back-door bus (BDB) transaction engine.
//!
//! The BDB reaches the registers of switch ASICs on remote slots through a
//! window of the FPGA's address space. A transaction is set up by programming
//! the control register with the target slot and the high bits of the remote
//! address, then accessing the window at the low bits.
//!
//! Reads are posted: a dummy read of the window starts the remote read, the
//! control register's `POSTED_READ_DONE` bit reports completion, and the value
//! is then read from the posted-read result register. Writes are fire and
//! forget, paced only by the depth of the remote write FIFO.
//!
//! There is a single hardware channel, so all transactions are serialized by
//! one lock. The protocol steps are methods of [`Transaction`], which can only
//! be obtained by taking that lock.

use crate::config::BdbConfig;
use crate::regs::poll;
use crate::regs::Delay;
use crate::regs::RegisterBlock;
use crate::Error;
use nokia_fpga_messages::Width;
use nokia_fpga_messages::NUM_HW_SLOTS;
use serde::Serialize;
use slog::error;
use slog::trace;
use slog::warn;
use slog::Logger;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// Offsets of the BDB control block, and the geometry of the window.
pub mod regs {
    /// Control register, see [`super::Ctrl`].
    pub const CTRL: usize = 0x00;

    /// Bit `n` is set while a card is present in hardware slot `n`.
    pub const CARD_PRESENT: usize = 0x04;

    /// Live status. Bits 31:24 hold the depth of the remote write FIFO.
    pub const STATUS: usize = 0x08;

    /// Result of the last posted read, indexed by the low two bits of the
    /// remote address.
    pub const POSTED_READ_DATA: usize = 0x10;
    pub const POSTED_READ_DATA_SIZE: usize = 0x10;

    /// Size of the control block.
    pub const BLOCK_SIZE: usize = 0x20;

    /// Size of the window. Remote address bits 26:0 index the window.
    pub const WINDOW_SIZE: usize = 1 << 27;
    pub const WINDOW_MASK: u32 = (1 << 27) - 1;

    pub const FIFO_DEPTH_SHIFT: u32 = 24;
}

bitflags::bitflags! {
    /// Bits of the BDB control register.
    ///
    /// Bits 4:0 carry the target slot and bits 12:8 carry remote address bits
    /// 31:27; see [`Ctrl::program`].
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Ctrl: u32 {
        const ENABLE           = 1 << 31;
        const POSTED_READ      = 1 << 30;
        const POSTED_READ_DONE = 1 << 29;
        const _ = !0;
    }
}

impl Ctrl {
    pub const SLOT_MASK: u32 = 0x1f;
    pub const ADDR_HI_SHIFT: u32 = 8;
    pub const ADDR_HI_MASK: u32 = 0x1f;

    /// Return the control value that targets `address` on `slot`.
    pub fn program(slot: u8, address: u32, posted: bool) -> Self {
        let mut ctrl = Ctrl::ENABLE;
        if posted {
            ctrl |= Ctrl::POSTED_READ;
        }
        ctrl | Ctrl::from_bits_retain(
            (u32::from(slot) & Self::SLOT_MASK)
                | (((address >> 27) & Self::ADDR_HI_MASK) << Self::ADDR_HI_SHIFT),
        )
    }

    /// Return the slot field.
    pub const fn slot(self) -> u8 {
        (self.bits() & Self::SLOT_MASK) as u8
    }

    /// Return the remote address bits 31:27 carried in the control register.
    pub const fn address_high(self) -> u32 {
        (self.bits() >> Self::ADDR_HI_SHIFT) & Self::ADDR_HI_MASK
    }
}

/// Counters of BDB activity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct BdbStats {
    pub reads: u64,
    pub writes: u64,
    /// Stale posted-read results drained before a transaction.
    pub flushes: u64,
    pub read_timeouts: u64,
    /// Status reads that found the write FIFO too full.
    pub fifo_waits: u64,
}

#[derive(Debug, Default)]
struct BdbState {
    stats: BdbStats,
}

/// The BDB engine of one FPGA.
///
/// `R` is the control block and `W` the window.
pub struct Bdb<R, W> {
    log: Logger,
    config: BdbConfig,
    delay: Arc<dyn Delay>,
    regs: R,
    window: W,
    lock: Mutex<BdbState>,
    timeouts: AtomicU32,
}

/// A BDB transaction in progress.
///
/// This holds the BDB lock for its whole life.
pub struct Transaction<'a, R, W> {
    bdb: &'a Bdb<R, W>,
    state: MutexGuard<'a, BdbState>,
}

impl<R: RegisterBlock, W: RegisterBlock> Transaction<'_, R, W> {
    fn ctrl(&self) -> Ctrl {
        Ctrl::from_bits_retain(self.bdb.regs.read_be32(regs::CTRL))
    }

    /// Discard the result of any earlier posted read.
    pub fn flush(&mut self) {
        if self.ctrl().contains(Ctrl::POSTED_READ_DONE) {
            let _ = self.bdb.regs.read_be32(regs::POSTED_READ_DATA);
            self.state.stats.flushes += 1;
        }
    }

    /// Target `address` on `slot`.
    pub fn program(&mut self, slot: u8, address: u32, posted: bool) {
        let ctrl = Ctrl::program(slot, address, posted);
        self.bdb.regs.write_be32(regs::CTRL, ctrl.bits());
    }

    /// Write zero to the control register, disabling the window.
    pub fn disable(&mut self) {
        self.bdb.regs.write_be32(regs::CTRL, 0);
    }

    /// Issue a posted read of the programmed target, returning the value read
    /// or, on timeout, the last control value seen.
    pub fn posted_read(&mut self, address: u32, width: Width) -> Result<u64, Ctrl> {
        let offset = (address & regs::WINDOW_MASK) as usize;
        let _ = self.bdb.window.read_be(offset, width);

        let config = &self.bdb.config;
        let block = &self.bdb.regs;
        poll(
            &*self.bdb.delay,
            config.poll_interval,
            config.poll_iterations,
            || Ctrl::from_bits_retain(block.read_be32(regs::CTRL)),
            |ctrl| ctrl.contains(Ctrl::POSTED_READ_DONE),
        )?;

        let lane = (address & 3) as usize;
        self.state.stats.reads += 1;
        Ok(block.read_be(regs::POSTED_READ_DATA + lane, width))
    }

    /// Wait for the remote write FIFO to have room for a `width`-byte write.
    pub fn wait_for_fifo(&mut self, width: usize) -> Result<(), Error> {
        let limit = u32::from(self.bdb.config.fifo_depth_limit);
        let threshold = (limit + 8).saturating_sub(width.min(8) as u32);
        let mut spins = 0;
        loop {
            let depth = self.bdb.regs.read_be32(regs::STATUS) >> regs::FIFO_DEPTH_SHIFT;
            if depth < threshold {
                return Ok(());
            }
            self.state.stats.fifo_waits += 1;
            spins += 1;
            if let Some(max) = self.bdb.config.fifo_spin_limit {
                if spins >= max {
                    warn!(
                        self.bdb.log,
                        "BDB write FIFO did not drain";
                        "depth" => depth,
                        "spins" => spins,
                    );
                    return Err(Error::Timeout);
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Store `data` through the window at the programmed target.
    ///
    /// `data` is either 1, 2, 4 or 8 bytes, or a multiple of 8 bytes written
    /// in 8-byte strides.
    pub fn store(&mut self, address: u32, data: &[u8]) {
        let offset = (address & regs::WINDOW_MASK) as usize;
        let window = &self.bdb.window;
        match Width::from_bytes(data.len() as u32) {
            Ok(width) => {
                let mut bytes = [0; 8];
                bytes[8 - data.len()..].copy_from_slice(data);
                window.write_be(offset, width, u64::from_be_bytes(bytes));
            }
            Err(_) => {
                for (i, chunk) in data.chunks_exact(8).enumerate() {
                    let mut bytes = [0; 8];
                    bytes.copy_from_slice(chunk);
                    window.write_be64(offset + i * 8, u64::from_be_bytes(bytes));
                }
            }
        }
        self.state.stats.writes += 1;
    }
}

impl<R: RegisterBlock, W: RegisterBlock> Bdb<R, W> {
    /// Create an engine over a control block and window.
    pub fn new(
        log: &Logger,
        config: &BdbConfig,
        delay: Arc<dyn Delay>,
        regs: R,
        window: W,
    ) -> Result<Self, Error> {
        if regs.size() < regs::BLOCK_SIZE {
            return Err(Error::InvalidArgument("BDB control block is too small"));
        }
        if window.size() < regs::WINDOW_SIZE {
            return Err(Error::InvalidArgument("BDB window is too small"));
        }
        Ok(Self {
            log: log.new(slog::o!("engine" => "bdb")),
            config: config.clone(),
            delay,
            regs,
            window,
            lock: Mutex::new(BdbState::default()),
            timeouts: AtomicU32::new(0),
        })
    }

    /// Take the BDB lock, starting a transaction.
    pub fn lock(&self) -> Transaction<'_, R, W> {
        Transaction {
            bdb: self,
            state: self.lock.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Return the bitmap of hardware slots with a card present.
    pub fn present_mask(&self) -> u32 {
        self.regs.read_be32(regs::CARD_PRESENT)
    }

    /// Return true if a card is present in `slot`.
    pub fn is_present(&self, slot: u8) -> bool {
        slot < NUM_HW_SLOTS && self.present_mask() & (1 << slot) != 0
    }

    fn check_present(&self, slot: u8) -> Result<(), Error> {
        if slot >= NUM_HW_SLOTS {
            return Err(Error::InvalidArgument("hardware slot out of range"));
        }
        if !self.is_present(slot) {
            return Err(Error::Unavailable(slot));
        }
        Ok(())
    }

    fn check_window(address: u32, len: usize) -> Result<(), Error> {
        let offset = (address & regs::WINDOW_MASK) as usize;
        if offset + len > regs::WINDOW_SIZE {
            return Err(Error::InvalidArgument("access runs past the end of the BDB window"));
        }
        Ok(())
    }

    // Window accesses are single bus cycles, which must be naturally aligned.
    fn check_aligned(address: u32, align: usize) -> Result<(), Error> {
        if address as usize % align != 0 {
            return Err(Error::InvalidArgument("unaligned BDB access"));
        }
        Ok(())
    }

    /// Reset the window state, returning the bitmap of present slots.
    pub fn init(&self) -> u32 {
        let mut txn = self.lock();
        txn.flush();
        txn.disable();
        drop(txn);
        self.present_mask()
    }

    /// Read a `width`-byte register at `address` on `slot`.
    ///
    /// `address` must be a multiple of `width`.
    pub fn read(&self, slot: u8, address: u32, width: Width) -> Result<u64, Error> {
        Self::check_aligned(address, width.bytes())?;
        Self::check_window(address, width.bytes())?;
        self.check_present(slot)?;

        let mut txn = self.lock();
        txn.flush();
        txn.program(slot, address, true);
        let res = txn.posted_read(address, width);
        if res.is_err() {
            txn.state.stats.read_timeouts += 1;
        }
        drop(txn);

        match res {
            Ok(value) => {
                trace!(
                    self.log,
                    "read";
                    "slot" => slot,
                    "address" => format!("0x{address:08x}"),
                    "width" => width.bytes(),
                    "value" => format!("0x{value:x}"),
                );
                Ok(value)
            }
            Err(ctrl) => {
                let count = self.timeouts.fetch_add(1, Ordering::Relaxed);
                if count < self.config.timeout_log_limit {
                    error!(
                        self.log,
                        "posted read timed out";
                        "slot" => slot,
                        "address" => format!("0x{address:08x}"),
                        "timeout" => ?self.config.read_timeout(),
                        "ctrl" => format!("0x{:08x}", ctrl.bits()),
                        "present" => format!("0x{:08x}", self.present_mask()),
                    );
                }
                Err(Error::Timeout)
            }
        }
    }

    /// Write `data` to `address` on `slot`.
    ///
    /// `data` must be 1, 2, 4 or 8 bytes, or a nonzero multiple of 8 bytes,
    /// and `address` must be aligned to the length or, for a block, to 8.
    /// The write is posted; success means only that it was issued.
    pub fn write(&self, slot: u8, address: u32, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("empty BDB write"));
        }
        if Width::from_bytes(data.len() as u32).is_err() && data.len() % 8 != 0 {
            return Err(Error::InvalidArgument(
                "BDB block writes must be a multiple of 8 bytes",
            ));
        }
        Self::check_aligned(address, data.len().min(8))?;
        Self::check_window(address, data.len())?;
        self.check_present(slot)?;

        let mut txn = self.lock();
        txn.flush();
        txn.wait_for_fifo(data.len())?;
        txn.program(slot, address, false);
        txn.store(address, data);
        drop(txn);

        trace!(
            self.log,
            "write";
            "slot" => slot,
            "address" => format!("0x{address:08x}"),
            "len" => data.len(),
        );
        Ok(())
    }

    /// Write the low `width` bytes of `value` to `address` on `slot`.
    pub fn write_word(&self, slot: u8, address: u32, width: Width, value: u64) -> Result<(), Error> {
        let bytes = value.to_be_bytes();
        self.write(slot, address, &bytes[8 - width.bytes()..])
    }

    /// Return a snapshot of the activity counters.
    pub fn stats(&self) -> BdbStats {
        self.lock().state.stats
    }
}

#[cfg(test)]
mod tests {
    use super::regs;
    use super::Ctrl;
    use crate::sim::Access;
    use crate::sim::Direction;
    use crate::sim::Region;
    use crate::test_utils::test_bdb;
    use crate::test_utils::test_bdb_with_config;
    use crate::Error;
    use crate::ConfigBuilder;
    use crate::Variant;
    use nokia_fpga_messages::Width;

    #[test]
    fn test_ctrl_program() {
        let ctrl = Ctrl::program(3, 0x1023_1004, true);
        assert!(ctrl.contains(Ctrl::ENABLE | Ctrl::POSTED_READ));
        assert_eq!(ctrl.slot(), 3);
        assert_eq!(ctrl.address_high(), 2);
        assert_eq!(ctrl.bits(), 0xc000_0203);

        let ctrl = Ctrl::program(31, 0xf800_0000, false);
        assert!(!ctrl.contains(Ctrl::POSTED_READ));
        assert_eq!(ctrl.slot(), 31);
        assert_eq!(ctrl.address_high(), 31);
    }

    #[test]
    fn test_read_flushes_only_when_done_is_set() {
        let (sim, bdb, _) = test_bdb();
        sim.set_present(1 << 1);

        sim.clear_accesses();
        bdb.read(1, 0x100, Width::Four).unwrap();
        let first = sim.accesses();
        assert_eq!(
            first[0],
            Access {
                region: Region::Bdb,
                dir: Direction::Read,
                offset: regs::CARD_PRESENT,
                width: 4,
                value: 1 << 1,
            }
        );
        // Presence, then the flush check of the control register, then
        // straight to programming it.
        assert_eq!(first[1].offset, regs::CTRL);
        assert_eq!(first[1].dir, Direction::Read);
        assert_eq!(first[2].offset, regs::CTRL);
        assert_eq!(first[2].dir, Direction::Write);
        assert_eq!(bdb.stats().flushes, 0);

        sim.set_posted_read_done(true);
        let drains = sim.posted_drains();
        sim.clear_accesses();
        bdb.read(1, 0x100, Width::Four).unwrap();
        let second = sim.accesses();
        assert_eq!(second[1].offset, regs::CTRL);
        assert_eq!(second[2].offset, regs::POSTED_READ_DATA);
        assert_eq!(second[2].dir, Direction::Read);
        assert_eq!(second[3].offset, regs::CTRL);
        assert_eq!(second[3].dir, Direction::Write);
        assert_eq!(bdb.stats().flushes, 1);
        // The flush and the result read.
        assert_eq!(sim.posted_drains(), drains + 2);
    }

    #[test]
    fn test_read_widths_and_lanes() {
        let (sim, bdb, _) = test_bdb();
        sim.set_present(1 << 7);
        sim.poke_remote(7, 0x2000, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99]);

        assert_eq!(bdb.read(7, 0x2000, Width::Eight).unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(bdb.read(7, 0x2000, Width::Four).unwrap(), 0x1122_3344);
        assert_eq!(bdb.read(7, 0x2002, Width::Two).unwrap(), 0x3344);
        assert_eq!(bdb.read(7, 0x2003, Width::One).unwrap(), 0x44);
        assert_eq!(bdb.read(7, 0x2001, Width::One).unwrap(), 0x22);
        assert_eq!(bdb.stats().reads, 5);
    }

    #[test]
    fn test_write_then_read_every_width_and_lane() {
        let (sim, bdb, _) = test_bdb();
        sim.set_present(1 << 9);
        let pattern = 0xf1e2_d3c4_b5a6_9788u64;
        for (i, width) in [Width::One, Width::Two, Width::Four, Width::Eight]
            .into_iter()
            .enumerate()
        {
            let n = width.bytes();
            // Every lane at which a `width`-byte access is aligned.
            for lane in (0..4).step_by(n) {
                let address = 0x0900_0100 + 0x10 * i as u32 + lane as u32;
                let value = pattern.rotate_left(8 * lane as u32) & width.mask();
                bdb.write_word(9, address, width, value).unwrap();
                assert_eq!(
                    sim.peek_remote(9, address, n),
                    value.to_be_bytes()[8 - n..].to_vec(),
                    "width {n} lane {lane}",
                );
                assert_eq!(
                    bdb.read(9, address, width).unwrap(),
                    value,
                    "width {n} lane {lane}",
                );
            }
        }
        // Four single bytes, two halves, one word and one double word.
        assert_eq!(bdb.stats().writes, 8);
        assert_eq!(bdb.stats().reads, 8);
    }

    #[test]
    fn test_unaligned_access_is_rejected() {
        let (sim, bdb, _) = test_bdb();
        sim.set_present(1);
        sim.clear_accesses();

        for (address, width) in [
            (0x2001, Width::Two),
            (0x2002, Width::Four),
            (0x2004, Width::Eight),
        ] {
            assert!(
                matches!(bdb.read(0, address, width), Err(Error::InvalidArgument(_))),
                "read of {} bytes at 0x{address:x} accepted",
                width.bytes(),
            );
        }
        for (address, len) in [(0x11, 2), (0x12, 4), (0x104, 8), (0x104, 16)] {
            assert!(
                matches!(bdb.write(0, address, &vec![0; len]), Err(Error::InvalidArgument(_))),
                "write of {len} bytes at 0x{address:x} accepted",
            );
        }
        // Rejected before the presence check, so nothing was touched.
        assert!(sim.accesses().is_empty());
        assert_eq!(bdb.stats(), Default::default());
    }

    #[test]
    fn test_read_decomposes_address() {
        let (sim, bdb, _) = test_bdb();
        sim.set_present(1 << 3);
        sim.poke_remote(3, 0x1023_1004, &[0xab, 0xcd]);

        sim.clear_accesses();
        assert_eq!(bdb.read(3, 0x1023_1004, Width::Two).unwrap(), 0xabcd);

        let ctrl = sim
            .accesses()
            .into_iter()
            .find(|a| a.region == Region::Bdb && a.dir == Direction::Write)
            .unwrap();
        let ctrl = Ctrl::from_bits_retain(ctrl.value as u32);
        assert_eq!(ctrl.slot(), 3);
        assert_eq!(ctrl.address_high(), 0x1023_1004 >> 27);
        assert_eq!(ctrl.address_high(), 2);

        let window: Vec<_> = sim
            .accesses()
            .into_iter()
            .filter(|a| a.region == Region::Window)
            .collect();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].offset, 0x0023_1004);

        let result = sim
            .accesses()
            .into_iter()
            .filter(|a| a.region == Region::Bdb && a.offset >= regs::POSTED_READ_DATA)
            .last()
            .unwrap();
        assert_eq!(result.offset, regs::POSTED_READ_DATA);
        assert_eq!(result.width, 2);
    }

    #[test]
    fn test_read_times_out_after_configured_polls() {
        let config = ConfigBuilder::new(Variant::CtlCp)
            .bdb_poll_iterations(25)
            .build()
            .unwrap();
        let (sim, bdb, delay) = test_bdb_with_config(&config);
        sim.set_present(1);
        sim.stall_posted_reads(true);

        sim.clear_accesses();
        assert!(matches!(bdb.read(0, 0x40, Width::Four), Err(Error::Timeout)));
        let polls = sim
            .accesses()
            .into_iter()
            .filter(|a| a.offset == regs::CTRL && a.dir == Direction::Read && a.region == Region::Bdb)
            .count();
        // One flush check, then the polls.
        assert_eq!(polls, 1 + 25);
        // No sleep after the last poll.
        assert_eq!(delay.count(), 24);
        assert_eq!(bdb.stats().read_timeouts, 1);

        // The engine is usable again once the remote side responds.
        sim.stall_posted_reads(false);
        assert!(bdb.read(0, 0x40, Width::Four).is_ok());
    }

    #[test]
    fn test_absent_slot_touches_no_transaction_registers() {
        let (sim, bdb, _) = test_bdb();
        sim.set_present(!(1 << 5));
        sim.clear_accesses();

        assert!(matches!(bdb.read(5, 0, Width::Four), Err(Error::Unavailable(5))));
        assert!(matches!(bdb.write(5, 0, &[1, 2, 3, 4]), Err(Error::Unavailable(5))));
        let accesses = sim.accesses();
        assert!(!accesses.is_empty());
        assert!(accesses
            .iter()
            .all(|a| a.region == Region::Bdb && a.offset == regs::CARD_PRESENT));

        assert!(matches!(bdb.read(32, 0, Width::Four), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_write_word_reaches_remote() {
        let (sim, bdb, _) = test_bdb();
        sim.set_present(1 << 2);
        bdb.write_word(2, 0x0800_0010, Width::Four, 0xdead_beef).unwrap();
        assert_eq!(sim.peek_remote(2, 0x0800_0010, 4), vec![0xde, 0xad, 0xbe, 0xef]);

        bdb.write_word(2, 0x0800_0020, Width::Two, 0x1234_5678).unwrap();
        assert_eq!(sim.peek_remote(2, 0x0800_0020, 4), vec![0x56, 0x78, 0, 0]);

        let ctrl = sim
            .accesses()
            .into_iter()
            .filter(|a| a.region == Region::Bdb && a.offset == regs::CTRL && a.dir == Direction::Write)
            .last()
            .unwrap();
        let ctrl = Ctrl::from_bits_retain(ctrl.value as u32);
        assert!(!ctrl.contains(Ctrl::POSTED_READ));
        assert_eq!(ctrl.address_high(), 1);
        assert_eq!(bdb.stats().writes, 2);
    }

    #[test]
    fn test_block_write_strides() {
        let (sim, bdb, _) = test_bdb();
        sim.set_present(1);
        let data: Vec<u8> = (0..24).collect();
        sim.clear_accesses();
        bdb.write(0, 0x100, &data).unwrap();
        assert_eq!(sim.peek_remote(0, 0x100, 24), data);

        let stores: Vec<_> = sim
            .accesses()
            .into_iter()
            .filter(|a| a.region == Region::Window)
            .map(|a| (a.offset, a.width))
            .collect();
        assert_eq!(stores, vec![(0x100, 8), (0x108, 8), (0x110, 8)]);
    }

    #[test]
    fn test_write_rejects_bad_lengths() {
        let (sim, bdb, _) = test_bdb();
        sim.set_present(1);
        for len in [0, 3, 5, 7, 12] {
            let data = vec![0; len];
            assert!(
                matches!(bdb.write(0, 0, &data), Err(Error::InvalidArgument(_))),
                "length {len} accepted",
            );
        }
        assert!(matches!(
            bdb.write(0, regs::WINDOW_MASK - 7, &[0; 16]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_write_waits_for_fifo_room() {
        let (sim, bdb, _) = test_bdb();
        sim.set_present(1);
        // A 4-byte write waits while the depth is at least 56 + 8 - 4.
        sim.queue_fifo_depths(&[64, 60, 59]);
        sim.clear_accesses();
        bdb.write_word(0, 0, Width::Four, 1).unwrap();
        let status_reads = sim
            .accesses()
            .into_iter()
            .filter(|a| a.region == Region::Bdb && a.offset == regs::STATUS)
            .count();
        assert_eq!(status_reads, 3);
        assert_eq!(bdb.stats().fifo_waits, 2);

        // An 8-byte write needs one more free entry.
        sim.queue_fifo_depths(&[56, 55]);
        sim.clear_accesses();
        bdb.write_word(0, 0, Width::Eight, 1).unwrap();
        let status_reads = sim
            .accesses()
            .into_iter()
            .filter(|a| a.region == Region::Bdb && a.offset == regs::STATUS)
            .count();
        assert_eq!(status_reads, 2);
    }

    #[test]
    fn test_bounded_fifo_spin() {
        let config = ConfigBuilder::new(Variant::CtlCp)
            .fifo_spin_limit(3)
            .build()
            .unwrap();
        let (sim, bdb, _) = test_bdb_with_config(&config);
        sim.set_present(1);
        sim.queue_fifo_depths(&[64; 8]);
        assert!(matches!(bdb.write_word(0, 0, Width::Four, 1), Err(Error::Timeout)));
        assert_eq!(sim.peek_remote(0, 0, 4), vec![0; 4]);
    }

    #[test]
    fn test_init_reports_present_slots() {
        let (sim, bdb, _) = test_bdb();
        sim.set_present(0b1010);
        sim.set_posted_read_done(true);
        assert_eq!(bdb.init(), 0b1010);
        assert_eq!(bdb.stats().flushes, 1);
        assert_eq!(sim.ctrl(), 0);
        assert!(bdb.is_present(1));
        assert!(!bdb.is_present(2));
    }
}
