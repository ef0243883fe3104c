// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A behavioral model of the control FPGA.
//!
//! [`SimFpga`] models the BDB control block and window, the memories of the
//! remote slots behind it, and the custom I2C controller with devices attached
//! to its buses. Register regions are handed out as [`SimRegion`]s, which
//! implement [`RegisterBlock`] and record every access.
//!
//! Registers are stored as bytes in bus order, so the big-endian helpers of
//! [`RegisterBlock`] see the same values they would on hardware.

use crate::bdb;
use crate::bdb::Ctrl;
use crate::i2c;
use crate::i2c::Cntr;
use crate::regs::Delay;
use crate::regs::RegisterBlock;
use nokia_fpga_messages::ModselMask;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

/// A register region of the simulated FPGA.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Region {
    /// The BDB control block.
    Bdb,
    /// The BDB window.
    Window,
    /// The custom I2C controller.
    I2c,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

/// One recorded register access.
///
/// `value` is the big-endian value of the bytes transferred.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Access {
    pub region: Region,
    pub dir: Direction,
    pub offset: usize,
    pub width: usize,
    pub value: u64,
}

/// An I2C device with a byte-addressed memory, like an EEPROM or the lower
/// page of an optics module.
///
/// The first byte written after a START sets the memory pointer; further
/// bytes are stored at the pointer. Reads return bytes from the pointer. The
/// pointer advances and wraps at 256.
#[derive(Clone, Debug)]
pub struct SimI2cDevice {
    pub channel: u8,
    pub address: u8,
    /// The module-select line that must be asserted for the device to be
    /// connected to its bus.
    pub modsel: Option<u8>,
    pub memory: [u8; 256],
    pointer: u8,
    awaiting_pointer: bool,
}

impl SimI2cDevice {
    pub fn new(channel: u8, address: u8) -> Self {
        Self {
            channel,
            address,
            modsel: None,
            memory: [0; 256],
            pointer: 0,
            awaiting_pointer: false,
        }
    }

    pub fn with_modsel(mut self, line: u8) -> Self {
        self.modsel = Some(line);
        self
    }

    pub fn with_memory(mut self, offset: u8, data: &[u8]) -> Self {
        for (i, byte) in data.iter().enumerate() {
            self.memory[usize::from(offset.wrapping_add(i as u8))] = *byte;
        }
        self
    }

    fn receive(&mut self, payload: &[u8]) {
        for byte in payload {
            if self.awaiting_pointer {
                self.pointer = *byte;
                self.awaiting_pointer = false;
            } else {
                self.memory[usize::from(self.pointer)] = *byte;
                self.pointer = self.pointer.wrapping_add(1);
            }
        }
    }

    fn transmit(&mut self, len: usize) -> u32 {
        let mut value = 0;
        for _ in 0..len {
            value = (value << 8) | u32::from(self.memory[usize::from(self.pointer)]);
            self.pointer = self.pointer.wrapping_add(1);
        }
        value
    }
}

/// One hardware transaction started on the simulated I2C controller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SimTransaction {
    pub channel: u8,
    pub start: bool,
    pub end: bool,
    pub speed_400k: bool,
    /// The bytes sent, including the address byte of a START.
    pub data: Vec<u8>,
    pub read_len: usize,
}

#[derive(Debug)]
struct SimState {
    bdb: [u8; bdb::regs::BLOCK_SIZE],
    posted_done: bool,
    posted_stalled: bool,
    posted_drains: usize,
    fifo_depths: VecDeque<u8>,
    remote: HashMap<(u8, u32), u8>,

    i2c: [u8; i2c::regs::BLOCK_SIZE],
    i2c_devices: Vec<SimI2cDevice>,
    i2c_target: Option<u8>,
    i2c_status: Cntr,
    i2c_busy_reads: u32,
    i2c_busy_remaining: u32,
    i2c_stuck_busy: bool,
    i2c_sequence_errors: u32,
    i2c_aborts: usize,
    i2c_transactions: Vec<SimTransaction>,

    accesses: Vec<Access>,
}

fn overlaps(offset: usize, len: usize, reg: usize, reg_len: usize) -> bool {
    offset < reg + reg_len && reg < offset + len
}

fn be32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_be_bytes(word)
}

fn set_be32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

impl SimState {
    fn new() -> Self {
        let mut i2c = [0; i2c::regs::BLOCK_SIZE];
        set_be32(&mut i2c, i2c::regs::MODSEL_LO, !0);
        set_be32(&mut i2c, i2c::regs::MODSEL_HI, !0);
        Self {
            bdb: [0; bdb::regs::BLOCK_SIZE],
            posted_done: false,
            posted_stalled: false,
            posted_drains: 0,
            fifo_depths: VecDeque::new(),
            remote: HashMap::new(),
            i2c,
            i2c_devices: Vec::new(),
            i2c_target: None,
            i2c_status: Cntr::empty(),
            i2c_busy_reads: 0,
            i2c_busy_remaining: 0,
            i2c_stuck_busy: false,
            i2c_sequence_errors: 0,
            i2c_aborts: 0,
            i2c_transactions: Vec::new(),
            accesses: Vec::new(),
        }
    }

    fn ctrl(&self) -> Ctrl {
        Ctrl::from_bits_retain(be32(&self.bdb, bdb::regs::CTRL))
    }

    // The done bit is owned by the hardware.
    fn sync_done(&mut self) {
        let mut ctrl = self.ctrl();
        ctrl.set(Ctrl::POSTED_READ_DONE, self.posted_done);
        set_be32(&mut self.bdb, bdb::regs::CTRL, ctrl.bits());
    }

    fn remote_address(&self, offset: usize) -> (u8, u32) {
        let ctrl = self.ctrl();
        (ctrl.slot(), (ctrl.address_high() << 27) | offset as u32)
    }

    fn read(&mut self, region: Region, offset: usize, out: &mut [u8]) {
        match region {
            Region::Bdb => self.bdb_read(offset, out),
            Region::Window => self.window_read(offset, out),
            Region::I2c => self.i2c_read(offset, out),
        }
    }

    fn write(&mut self, region: Region, offset: usize, data: &[u8]) {
        match region {
            Region::Bdb => {
                self.bdb[offset..offset + data.len()].copy_from_slice(data);
                self.sync_done();
            }
            Region::Window => self.window_write(offset, data),
            Region::I2c => self.i2c_write(offset, data),
        }
    }

    fn bdb_read(&mut self, offset: usize, out: &mut [u8]) {
        use bdb::regs::*;
        if overlaps(offset, out.len(), STATUS, 4) {
            let depth = self.fifo_depths.pop_front().unwrap_or(0);
            set_be32(&mut self.bdb, STATUS, u32::from(depth) << FIFO_DEPTH_SHIFT);
        }
        out.copy_from_slice(&self.bdb[offset..offset + out.len()]);
        if overlaps(offset, out.len(), POSTED_READ_DATA, POSTED_READ_DATA_SIZE) {
            self.posted_done = false;
            self.posted_drains += 1;
            self.sync_done();
        }
    }

    fn window_read(&mut self, offset: usize, out: &mut [u8]) {
        out.fill(0);
        let ctrl = self.ctrl();
        if !ctrl.contains(Ctrl::ENABLE | Ctrl::POSTED_READ) || self.posted_stalled {
            return;
        }
        let (slot, address) = self.remote_address(offset);
        let base = address & !3;
        for i in 0..bdb::regs::POSTED_READ_DATA_SIZE {
            let byte = self
                .remote
                .get(&(slot, base.wrapping_add(i as u32)))
                .copied()
                .unwrap_or(0);
            self.bdb[bdb::regs::POSTED_READ_DATA + i] = byte;
        }
        self.posted_done = true;
        self.sync_done();
    }

    fn window_write(&mut self, offset: usize, data: &[u8]) {
        let ctrl = self.ctrl();
        if !ctrl.contains(Ctrl::ENABLE) || ctrl.contains(Ctrl::POSTED_READ) {
            return;
        }
        let (slot, address) = self.remote_address(offset);
        for (i, byte) in data.iter().enumerate() {
            self.remote.insert((slot, address.wrapping_add(i as u32)), *byte);
        }
    }

    fn i2c_read(&mut self, offset: usize, out: &mut [u8]) {
        use i2c::regs::CNTR;
        if overlaps(offset, out.len(), CNTR, 4) {
            let busy = if self.i2c_stuck_busy {
                true
            } else if self.i2c_busy_remaining > 0 {
                self.i2c_busy_remaining -= 1;
                true
            } else {
                false
            };
            let mut cntr = Cntr::from_bits_retain(be32(&self.i2c, CNTR));
            cntr.remove(Cntr::BUSY | Cntr::NACK | Cntr::SEQ_ERR);
            if busy {
                cntr |= Cntr::BUSY;
            } else {
                cntr |= self.i2c_status;
            }
            set_be32(&mut self.i2c, CNTR, cntr.bits());
        }
        out.copy_from_slice(&self.i2c[offset..offset + out.len()]);
    }

    fn i2c_write(&mut self, offset: usize, data: &[u8]) {
        use i2c::regs::CNTR;
        self.i2c[offset..offset + data.len()].copy_from_slice(data);
        if !overlaps(offset, data.len(), CNTR, 4) {
            return;
        }
        let cntr = Cntr::from_bits_retain(be32(&self.i2c, CNTR));
        if cntr.contains(Cntr::ABORT) {
            self.i2c_aborts += 1;
            self.i2c_busy_remaining = 0;
            self.i2c_status = Cntr::empty();
            self.i2c_target = None;
        } else if cntr.intersects(Cntr::WR_REQ | Cntr::RD_REQ) {
            self.i2c_start(cntr);
        }
    }

    fn i2c_start(&mut self, cntr: Cntr) {
        let channel = cntr.channel();
        let start = cntr.contains(Cntr::GEN_START);
        let read_len = if cntr.contains(Cntr::RD_REQ) {
            cntr.rx_count()
        } else {
            0
        };
        let sent = cntr.tx_count().min(4);
        let data = self.i2c[i2c::regs::DATA..i2c::regs::DATA + sent].to_vec();
        self.i2c_transactions.push(SimTransaction {
            channel,
            start,
            end: cntr.contains(Cntr::GEN_END),
            speed_400k: cntr.contains(Cntr::SPEED_400K),
            data: data.clone(),
            read_len,
        });
        self.i2c_busy_remaining = self.i2c_busy_reads;
        self.i2c_status = Cntr::empty();

        if self.i2c_sequence_errors > 0 {
            self.i2c_sequence_errors -= 1;
            self.i2c_status = Cntr::SEQ_ERR;
            return;
        }

        let (payload, writing) = if start {
            match data.split_first() {
                Some((first, rest)) => {
                    self.i2c_target = Some(first >> 1);
                    (rest, first & 1 == 0)
                }
                None => (&data[..], false),
            }
        } else {
            (&data[..], read_len == 0)
        };

        let modsel = ModselMask::from_registers(
            be32(&self.i2c, i2c::regs::MODSEL_LO),
            be32(&self.i2c, i2c::regs::MODSEL_HI),
        );
        let target = self.i2c_target;
        let device = self.i2c_devices.iter_mut().find(|d| {
            Some(d.address) == target
                && d.channel == channel
                && d.modsel.map_or(true, |line| modsel.is_set(line).unwrap_or(false))
        });
        let Some(device) = device else {
            self.i2c_status = Cntr::NACK;
            return;
        };

        if start && writing {
            device.awaiting_pointer = true;
        }
        device.receive(payload);
        if read_len > 0 {
            let value = device.transmit(read_len);
            set_be32(&mut self.i2c, i2c::regs::DATA, value);
        }
    }
}

/// A simulated control FPGA.
///
/// Clones share the same state.
#[derive(Clone, Debug)]
pub struct SimFpga {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimFpga {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFpga {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn region(&self, region: Region) -> SimRegion {
        SimRegion {
            state: self.state.clone(),
            region,
        }
    }

    /// Return the BDB control block.
    pub fn bdb_regs(&self) -> SimRegion {
        self.region(Region::Bdb)
    }

    /// Return the BDB window.
    pub fn bdb_window(&self) -> SimRegion {
        self.region(Region::Window)
    }

    /// Return the I2C controller's registers.
    pub fn i2c_regs(&self) -> SimRegion {
        self.region(Region::I2c)
    }

    /// Set the card-present bitmap.
    pub fn set_present(&self, mask: u32) {
        set_be32(&mut self.state().bdb, bdb::regs::CARD_PRESENT, mask);
    }

    /// Return the current value of the BDB control register.
    pub fn ctrl(&self) -> u32 {
        self.state().ctrl().bits()
    }

    /// Store bytes in the memory of a remote slot.
    pub fn poke_remote(&self, slot: u8, address: u32, data: &[u8]) {
        let mut state = self.state();
        for (i, byte) in data.iter().enumerate() {
            state.remote.insert((slot, address.wrapping_add(i as u32)), *byte);
        }
    }

    /// Return bytes from the memory of a remote slot.
    pub fn peek_remote(&self, slot: u8, address: u32, len: usize) -> Vec<u8> {
        let state = self.state();
        (0..len)
            .map(|i| {
                state
                    .remote
                    .get(&(slot, address.wrapping_add(i as u32)))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Force the posted-read-done bit, as if a read result was left unread.
    pub fn set_posted_read_done(&self, done: bool) {
        let mut state = self.state();
        state.posted_done = done;
        state.sync_done();
    }

    /// Stop (or resume) answering posted reads.
    pub fn stall_posted_reads(&self, stalled: bool) {
        self.state().posted_stalled = stalled;
    }

    /// Return the number of reads of the posted-read result register.
    pub fn posted_drains(&self) -> usize {
        self.state().posted_drains
    }

    /// Queue write-FIFO depths, returned by successive status reads. The
    /// depth reads as zero once the queue is empty.
    pub fn queue_fifo_depths(&self, depths: &[u8]) {
        self.state().fifo_depths.extend(depths.iter().copied());
    }

    pub fn attach_i2c_device(&self, device: SimI2cDevice) {
        self.state().i2c_devices.push(device);
    }

    /// Return the memory of an attached I2C device.
    pub fn i2c_device_memory(&self, channel: u8, address: u8) -> Option<[u8; 256]> {
        self.state()
            .i2c_devices
            .iter()
            .find(|d| d.channel == channel && d.address == address)
            .map(|d| d.memory)
    }

    /// Keep the busy bit set for `reads` status reads of every transaction.
    pub fn set_i2c_busy_reads(&self, reads: u32) {
        self.state().i2c_busy_reads = reads;
    }

    /// Keep the busy bit set until the controller is aborted.
    pub fn set_i2c_stuck_busy(&self, stuck: bool) {
        self.state().i2c_stuck_busy = stuck;
    }

    /// Fail the next transaction with a sequence error.
    pub fn inject_i2c_sequence_error(&self) {
        self.state().i2c_sequence_errors += 1;
    }

    /// Return the number of aborts issued to the I2C controller.
    pub fn i2c_aborts(&self) -> usize {
        self.state().i2c_aborts
    }

    pub fn i2c_transactions(&self) -> Vec<SimTransaction> {
        self.state().i2c_transactions.clone()
    }

    pub fn clear_i2c_transactions(&self) {
        self.state().i2c_transactions.clear();
    }

    /// Return the asserted module-select lines.
    pub fn modsel(&self) -> ModselMask {
        let state = self.state();
        ModselMask::from_registers(
            be32(&state.i2c, i2c::regs::MODSEL_LO),
            be32(&state.i2c, i2c::regs::MODSEL_HI),
        )
    }

    /// Return the I2C output-enable register.
    pub fn i2c_output_enable(&self) -> u32 {
        be32(&self.state().i2c, i2c::regs::OUTPUT_ENABLE)
    }

    pub fn accesses(&self) -> Vec<Access> {
        self.state().accesses.clone()
    }

    pub fn clear_accesses(&self) {
        self.state().accesses.clear();
    }
}

/// One register region of a [`SimFpga`].
#[derive(Clone, Debug)]
pub struct SimRegion {
    state: Arc<Mutex<SimState>>,
    region: Region,
}

impl SimRegion {
    fn size_of(region: Region) -> usize {
        match region {
            Region::Bdb => bdb::regs::BLOCK_SIZE,
            Region::Window => bdb::regs::WINDOW_SIZE,
            Region::I2c => i2c::regs::BLOCK_SIZE,
        }
    }

    fn access<const N: usize>(&self, dir: Direction, offset: usize, bytes: &mut [u8; N]) {
        let size = Self::size_of(self.region);
        assert!(
            offset + N <= size,
            "{:?} access at 0x{offset:x} (width {N}) outside of 0x{size:x}-byte region",
            self.region,
        );
        assert!(
            offset % N == 0,
            "unaligned {:?} access at 0x{offset:x} (width {N})",
            self.region,
        );
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match dir {
            Direction::Read => state.read(self.region, offset, &mut bytes[..]),
            Direction::Write => state.write(self.region, offset, &bytes[..]),
        }
        let value = bytes.iter().fold(0, |acc, b| (acc << 8) | u64::from(*b));
        state.accesses.push(Access {
            region: self.region,
            dir,
            offset,
            width: N,
            value,
        });
    }

    fn read_bytes<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut bytes = [0; N];
        self.access(Direction::Read, offset, &mut bytes);
        bytes
    }

    fn write_bytes<const N: usize>(&self, offset: usize, mut bytes: [u8; N]) {
        self.access(Direction::Write, offset, &mut bytes);
    }
}

// The raw accessors move bytes in host memory order, as a load or store of
// device memory would.
impl RegisterBlock for SimRegion {
    fn size(&self) -> usize {
        Self::size_of(self.region)
    }

    fn read8(&self, offset: usize) -> u8 {
        self.read_bytes::<1>(offset)[0]
    }

    fn read16(&self, offset: usize) -> u16 {
        u16::from_ne_bytes(self.read_bytes(offset))
    }

    fn read32(&self, offset: usize) -> u32 {
        u32::from_ne_bytes(self.read_bytes(offset))
    }

    fn read64(&self, offset: usize) -> u64 {
        u64::from_ne_bytes(self.read_bytes(offset))
    }

    fn write8(&self, offset: usize, value: u8) {
        self.write_bytes(offset, [value])
    }

    fn write16(&self, offset: usize, value: u16) {
        self.write_bytes(offset, value.to_ne_bytes())
    }

    fn write32(&self, offset: usize, value: u32) {
        self.write_bytes(offset, value.to_ne_bytes())
    }

    fn write64(&self, offset: usize, value: u64) {
        self.write_bytes(offset, value.to_ne_bytes())
    }
}

/// Plain memory with no side effects, for exercising the register helpers.
#[derive(Debug)]
pub struct SimMemory {
    bytes: Mutex<Vec<u8>>,
}

impl SimMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; size]),
        }
    }

    fn read_bytes<const N: usize>(&self, offset: usize) -> [u8; N] {
        assert!(offset % N == 0, "unaligned access at 0x{offset:x} (width {N})");
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = [0; N];
        out.copy_from_slice(&bytes[offset..offset + N]);
        out
    }

    fn write_bytes<const N: usize>(&self, offset: usize, data: [u8; N]) {
        assert!(offset % N == 0, "unaligned access at 0x{offset:x} (width {N})");
        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        bytes[offset..offset + N].copy_from_slice(&data);
    }
}

impl RegisterBlock for SimMemory {
    fn size(&self) -> usize {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn read8(&self, offset: usize) -> u8 {
        self.read_bytes::<1>(offset)[0]
    }

    fn read16(&self, offset: usize) -> u16 {
        u16::from_ne_bytes(self.read_bytes(offset))
    }

    fn read32(&self, offset: usize) -> u32 {
        u32::from_ne_bytes(self.read_bytes(offset))
    }

    fn read64(&self, offset: usize) -> u64 {
        u64::from_ne_bytes(self.read_bytes(offset))
    }

    fn write8(&self, offset: usize, value: u8) {
        self.write_bytes(offset, [value])
    }

    fn write16(&self, offset: usize, value: u16) {
        self.write_bytes(offset, value.to_ne_bytes())
    }

    fn write32(&self, offset: usize, value: u32) {
        self.write_bytes(offset, value.to_ne_bytes())
    }

    fn write64(&self, offset: usize, value: u64) {
        self.write_bytes(offset, value.to_ne_bytes())
    }
}

/// A [`Delay`] that records requested delays instead of sleeping.
///
/// Clones share the same record.
#[derive(Clone, Debug, Default)]
pub struct SimDelay {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl SimDelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn delays(&self) -> MutexGuard<'_, Vec<Duration>> {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the number of delays requested.
    pub fn count(&self) -> usize {
        self.delays().len()
    }

    /// Return the number of delays of exactly `duration`.
    pub fn count_of(&self, duration: Duration) -> usize {
        self.delays().iter().filter(|d| **d == duration).count()
    }

    /// Return the sum of all delays requested.
    pub fn total(&self) -> Duration {
        self.delays().iter().sum()
    }

    pub fn clear(&self) {
        self.delays().clear();
    }
}

impl Delay for SimDelay {
    fn delay(&self, duration: Duration) {
        self.delays().push(duration);
    }
}
