// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The custom I2C master of the control FPGA.
//!
//! A hardware transaction moves at most four bytes. The bytes to send are
//! packed most-significant first into the `DATA` register, and a single write
//! of the `CNTR` register selects the physical bus and speed, the number of
//! bytes to send and receive, and whether to generate START and STOP. The
//! controller then runs the transaction, clearing `CNTR.BUSY` when done and
//! leaving any received bytes right-aligned in `DATA`.

use crate::config::Config;
use crate::config::I2cConfig;
use crate::regs::poll;
use crate::regs::Delay;
use crate::regs::RegisterBlock;
use crate::variant::VariantConfig;
use crate::Error;
use slog::debug;
use slog::error;
use slog::trace;
use slog::Logger;
use std::ops::Range;
use std::sync::Arc;

/// Offsets of the I2C controller's registers.
pub mod regs {
    pub const DATA: usize = 0x00;
    pub const CNTR: usize = 0x04;

    /// Active-low module-select lines 31:0.
    pub const MODSEL_LO: usize = 0x08;

    /// Active-low module-select lines 63:32.
    pub const MODSEL_HI: usize = 0x0c;

    /// Bit `n` enables the drivers of physical bus `n`.
    pub const OUTPUT_ENABLE: usize = 0x10;

    pub const BLOCK_SIZE: usize = 0x14;
}

/// The most bytes moved by one hardware transaction.
pub const MAX_XFER: usize = 4;

bitflags::bitflags! {
    /// Bits of the I2C control register.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Cntr: u32 {
        const BUSY       = 1 << 31;
        const SEQ_ERR    = 1 << 30;
        const NACK       = 1 << 29;
        const ABORT      = 1 << 28;
        const WR_REQ     = 1 << 27;
        const RD_REQ     = 1 << 26;
        const GEN_START  = 1 << 25;
        const GEN_END    = 1 << 24;
        const NO_RESTART = 1 << 23;
        const SPEED_400K = 1 << 22;
        const _ = !0;
    }
}

impl Cntr {
    pub const CHAN_SHIFT: u32 = 16;
    pub const CHAN_MASK: u32 = 0x1f;
    pub const TIMER_SHIFT: u32 = 8;
    pub const TIMER_MASK: u32 = 0xff;
    pub const TIMER_BASE: u32 = 0x14;
    pub const TX_CNT_SHIFT: u32 = 4;
    pub const TX_CNT_MASK: u32 = 0x7;
    pub const RX_CNT_MASK: u32 = 0x3;

    pub fn with_channel(self, channel: u8) -> Self {
        self | Self::from_bits_retain((u32::from(channel) & Self::CHAN_MASK) << Self::CHAN_SHIFT)
    }

    pub const fn channel(self) -> u8 {
        ((self.bits() >> Self::CHAN_SHIFT) & Self::CHAN_MASK) as u8
    }

    pub fn with_timer(self, timer: u8) -> Self {
        self | Self::from_bits_retain(u32::from(timer) << Self::TIMER_SHIFT)
    }

    pub fn with_tx_count(self, count: usize) -> Self {
        self | Self::from_bits_retain((count as u32 & Self::TX_CNT_MASK) << Self::TX_CNT_SHIFT)
    }

    /// Return the number of bytes to send, including any address byte.
    pub const fn tx_count(self) -> usize {
        ((self.bits() >> Self::TX_CNT_SHIFT) & Self::TX_CNT_MASK) as usize
    }

    /// Request `count` bytes, which must be from 1 to 4.
    pub fn with_rx_count(self, count: usize) -> Self {
        self | Self::RD_REQ | Self::from_bits_retain((count as u32 - 1) & Self::RX_CNT_MASK)
    }

    /// Return the number of bytes requested, if `RD_REQ` is set.
    pub const fn rx_count(self) -> usize {
        (self.bits() & Self::RX_CNT_MASK) as usize + 1
    }
}

/// One message of a combined transfer.
#[derive(Debug)]
pub enum Msg<'a> {
    Read { addr: u8, buf: &'a mut [u8] },
    Write { addr: u8, data: &'a [u8] },
}

/// One hardware transaction of a segmented write.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteChunk {
    /// Generate START and send the address byte.
    pub start: bool,
    /// Generate STOP.
    pub end: bool,
    /// The payload bytes carried.
    pub range: Range<usize>,
}

/// Split a write of `len` bytes into hardware transactions.
///
/// The first transaction carries the address byte and so at most three
/// payload bytes; later ones carry up to four. A zero-length write is a
/// single START, address, STOP transaction, which polls for an ACK.
pub fn write_chunks(len: usize) -> impl Iterator<Item = WriteChunk> {
    let first = len.min(MAX_XFER - 1);
    let rest = len - first;
    let n_chunks = 1 + rest.div_ceil(MAX_XFER);
    (0..n_chunks).map(move |i| {
        let range = if i == 0 {
            0..first
        } else {
            let start = first + (i - 1) * MAX_XFER;
            start..(start + MAX_XFER).min(len)
        };
        WriteChunk {
            start: i == 0,
            end: i == n_chunks - 1,
            range,
        }
    })
}

/// The custom I2C master, driving one physical bus at a time.
pub struct I2cController<R> {
    log: Logger,
    regs: Arc<R>,
    delay: Arc<dyn Delay>,
    config: I2cConfig,
    variant: &'static VariantConfig,
    channel: Option<u8>,
}

impl<R: RegisterBlock> I2cController<R> {
    /// Create a controller, enabling the output drivers of the variant's
    /// buses.
    pub fn new(
        log: &Logger,
        config: &Config,
        delay: Arc<dyn Delay>,
        regs: Arc<R>,
    ) -> Result<Self, Error> {
        if regs.size() < regs::BLOCK_SIZE {
            return Err(Error::InvalidArgument("I2C register block is too small"));
        }
        let variant = config.variant.config();
        regs.write_be32(regs::OUTPUT_ENABLE, variant.output_enable);
        Ok(Self {
            log: log.new(slog::o!("engine" => "i2c")),
            regs,
            delay,
            config: config.i2c.clone(),
            variant,
            channel: None,
        })
    }

    /// Return the register block, shared with the module-select bank.
    pub fn regs(&self) -> &Arc<R> {
        &self.regs
    }

    /// Return the static configuration of the hardware variant.
    pub fn variant(&self) -> &'static VariantConfig {
        self.variant
    }

    /// Route later transactions to a physical bus, or to none.
    pub fn set_channel(&mut self, channel: Option<u8>) -> Result<(), Error> {
        if channel.is_some_and(|c| u32::from(c) > Cntr::CHAN_MASK) {
            return Err(Error::InvalidArgument("physical I2C channel out of range"));
        }
        self.channel = channel;
        Ok(())
    }

    /// Disconnect from the active physical bus.
    pub fn clear_channel(&mut self) {
        self.channel = None;
    }

    /// Return the active physical bus.
    pub fn channel(&self) -> Option<u8> {
        self.channel
    }

    fn base_cntr(&self) -> Result<Cntr, Error> {
        let channel = self
            .channel
            .ok_or(Error::InvalidArgument("no I2C channel selected"))?;
        let mut cntr = Cntr::empty()
            .with_channel(channel)
            .with_timer(Cntr::TIMER_BASE as u8);
        if self.variant.is_fast(channel) {
            cntr |= Cntr::SPEED_400K;
        }
        Ok(cntr)
    }

    fn check_addr(addr: u8) -> Result<(), Error> {
        if addr > 0x7f {
            return Err(Error::InvalidArgument("I2C address is wider than 7 bits"));
        }
        Ok(())
    }

    // Start a transaction and wait for it to finish.
    fn run(&self, addr: u8, data: u32, cntr: Cntr) -> Result<(), Error> {
        self.regs.write_be32(regs::DATA, data);
        self.regs.write_be32(regs::CNTR, cntr.bits());

        let res = poll(
            &*self.delay,
            self.config.poll_interval,
            self.config.poll_iterations(),
            || Cntr::from_bits_retain(self.regs.read_be32(regs::CNTR)),
            |cntr| !cntr.contains(Cntr::BUSY),
        );
        let status = match res {
            Ok(status) => status,
            Err(status) => {
                self.abort();
                error!(
                    self.log,
                    "transaction timed out";
                    "channel" => cntr.channel(),
                    "addr" => format!("0x{addr:02x}"),
                    "cntr" => format!("0x{:08x}", status.bits()),
                );
                return Err(Error::Timeout);
            }
        };
        if status.contains(Cntr::SEQ_ERR) {
            self.abort();
            error!(
                self.log,
                "sequence error";
                "channel" => cntr.channel(),
                "addr" => format!("0x{addr:02x}"),
            );
            return Err(Error::SequenceError);
        }
        if status.contains(Cntr::NACK) {
            debug!(
                self.log,
                "no ack";
                "channel" => cntr.channel(),
                "addr" => format!("0x{addr:02x}"),
            );
            return Err(Error::NoAck(addr));
        }
        Ok(())
    }

    fn abort(&self) {
        self.regs.write_be32(regs::CNTR, Cntr::ABORT.bits());
    }

    /// Read up to [`MAX_XFER`] bytes from `addr` in one transaction.
    ///
    /// A longer `buf` is rejected rather than truncated, since
    /// [`I2cController::transfer`] splits long reads into chunks of
    /// [`MAX_XFER`] bytes and expects each chunk to fill completely.
    pub fn read(&mut self, addr: u8, buf: &mut [u8]) -> Result<(), Error> {
        Self::check_addr(addr)?;
        if buf.len() > MAX_XFER {
            return Err(Error::InvalidArgument("I2C read longer than 4 bytes"));
        }
        let mut cntr = self.base_cntr()?
            | Cntr::NO_RESTART
            | Cntr::WR_REQ
            | Cntr::GEN_START
            | Cntr::GEN_END;
        cntr = cntr.with_tx_count(1);
        if !buf.is_empty() {
            cntr = cntr.with_rx_count(buf.len());
        }
        let data = ((u32::from(addr) << 1) | 1) << 24;
        self.run(addr, data, cntr)?;

        let value = self.regs.read_be32(regs::DATA);
        let len = buf.len();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = (value >> (8 * (len - 1 - i))) as u8;
        }
        trace!(
            self.log,
            "read";
            "channel" => cntr.channel(),
            "addr" => format!("0x{addr:02x}"),
            "len" => len,
        );
        Ok(())
    }

    /// Write bytes to `addr` in one transaction.
    ///
    /// With `start`, the transaction begins with START and the address byte,
    /// leaving room for three bytes of `data`; otherwise it continues the
    /// previous transaction with up to four. With `end` it finishes with STOP.
    pub fn write(&mut self, addr: u8, data: &[u8], start: bool, end: bool) -> Result<(), Error> {
        Self::check_addr(addr)?;
        let cap = if start { MAX_XFER - 1 } else { MAX_XFER };
        if data.len() > cap {
            return Err(Error::InvalidArgument("I2C write chunk too long"));
        }
        if !start && data.is_empty() {
            return Err(Error::InvalidArgument("empty I2C write without START"));
        }

        let mut cntr = self.base_cntr()? | Cntr::WR_REQ;
        let mut frame = [0u8; MAX_XFER];
        let mut tx = 0;
        if start {
            cntr |= Cntr::GEN_START;
            frame[0] = addr << 1;
            tx = 1;
        }
        if end {
            cntr |= Cntr::GEN_END;
        }
        frame[tx..tx + data.len()].copy_from_slice(data);
        tx += data.len();
        cntr = cntr.with_tx_count(tx);

        self.run(addr, u32::from_be_bytes(frame), cntr)?;
        trace!(
            self.log,
            "write";
            "channel" => cntr.channel(),
            "addr" => format!("0x{addr:02x}"),
            "len" => data.len(),
            "start" => start,
            "end" => end,
        );
        Ok(())
    }

    /// Run a sequence of messages, returning the number processed.
    ///
    /// The first error ends the transfer.
    pub fn transfer(&mut self, msgs: &mut [Msg<'_>]) -> Result<usize, Error> {
        for msg in msgs.iter_mut() {
            match msg {
                Msg::Read { addr, buf } => {
                    if buf.is_empty() {
                        self.read(*addr, &mut [])?;
                    }
                    for chunk in buf.chunks_mut(MAX_XFER) {
                        self.read(*addr, chunk)?;
                    }
                }
                Msg::Write { addr, data } => {
                    for chunk in write_chunks(data.len()) {
                        self.write(*addr, &data[chunk.range], chunk.start, chunk.end)?;
                    }
                }
            }
        }
        Ok(msgs.len())
    }

    /// Return true if a device acknowledges `addr`.
    pub fn probe(&mut self, addr: u8) -> Result<bool, Error> {
        match self.write(addr, &[], true, true) {
            Ok(()) => Ok(true),
            Err(Error::NoAck(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::regs;
    use super::write_chunks;
    use super::Cntr;
    use super::Msg;
    use crate::sim::Direction;
    use crate::sim::Region;
    use crate::sim::SimI2cDevice;
    use crate::sim::SimTransaction;
    use crate::test_utils::test_i2c;
    use crate::test_utils::test_i2c_with_config;
    use crate::ConfigBuilder;
    use crate::Error;
    use crate::Variant;
    use std::time::Duration;

    #[test]
    fn test_write_chunk_accounting() {
        for len in 0..=37 {
            let chunks: Vec<_> = write_chunks(len).collect();
            assert!(!chunks.is_empty());
            assert!(chunks[0].start);
            assert!(chunks.last().unwrap().end);
            assert_eq!(chunks.iter().filter(|c| c.start).count(), 1);
            assert_eq!(chunks.iter().filter(|c| c.end).count(), 1);
            assert!(chunks[0].range.len() <= 3);
            assert!(chunks.iter().all(|c| c.range.len() <= 4));

            // The chunks tile the payload in order.
            let mut next = 0;
            for chunk in &chunks {
                assert_eq!(chunk.range.start, next);
                next = chunk.range.end;
            }
            assert_eq!(next, len);

            let expected = if len <= 3 { 1 } else { 1 + (len - 3).div_ceil(4) };
            assert_eq!(chunks.len(), expected, "length {len}");
            if len > 0 {
                assert!(chunks.iter().all(|c| !c.range.is_empty()));
            }
        }
    }

    #[test]
    fn test_read_frames_and_unpacks() {
        let (sim, mut i2c, _) = test_i2c(Variant::CtlCp);
        sim.attach_i2c_device(SimI2cDevice::new(1, 0x50).with_memory(0, &[0x12, 0x34, 0x56]));
        i2c.set_channel(Some(1)).unwrap();

        sim.clear_accesses();
        let mut buf = [0; 3];
        i2c.read(0x50, &mut buf).unwrap();
        assert_eq!(buf, [0x12, 0x34, 0x56]);

        let writes: Vec<_> = sim
            .accesses()
            .into_iter()
            .filter(|a| a.region == Region::I2c && a.dir == Direction::Write)
            .collect();
        assert_eq!(writes[0].offset, regs::DATA);
        assert_eq!(writes[0].value, 0xa100_0000);
        assert_eq!(writes[1].offset, regs::CNTR);
        let expected = Cntr::NO_RESTART
            | Cntr::WR_REQ
            | Cntr::RD_REQ
            | Cntr::GEN_START
            | Cntr::GEN_END
            | Cntr::from_bits_retain((1 << 16) | (0x14 << 8) | (1 << 4) | 2);
        assert_eq!(writes[1].value as u32, expected.bits());

        assert_eq!(
            sim.i2c_transactions(),
            vec![SimTransaction {
                channel: 1,
                start: true,
                end: true,
                speed_400k: false,
                data: vec![0xa1],
                read_len: 3,
            }]
        );
    }

    #[test]
    fn test_speed_follows_variant_mask() {
        let (sim, mut i2c, _) = test_i2c(Variant::CtlCp);
        sim.attach_i2c_device(SimI2cDevice::new(4, 0x50));
        i2c.set_channel(Some(4)).unwrap();
        let mut buf = [0; 1];
        i2c.read(0x50, &mut buf).unwrap();
        assert!(sim.i2c_transactions()[0].speed_400k);
    }

    #[test]
    fn test_write_frames_with_and_without_start() {
        let (sim, mut i2c, _) = test_i2c(Variant::CtlCp);
        sim.attach_i2c_device(SimI2cDevice::new(0, 0x50));
        i2c.set_channel(Some(0)).unwrap();

        sim.clear_accesses();
        i2c.write(0x50, &[0x10, 0xaa, 0xbb], true, false).unwrap();
        i2c.write(0x50, &[0xcc, 0xdd, 0xee, 0xff], false, true).unwrap();

        let data: Vec<_> = sim
            .accesses()
            .into_iter()
            .filter(|a| a.region == Region::I2c && a.dir == Direction::Write && a.offset == regs::DATA)
            .map(|a| a.value)
            .collect();
        assert_eq!(data, vec![0xa010_aabb, 0xccdd_eeff]);

        let txns = sim.i2c_transactions();
        assert_eq!(txns.len(), 2);
        assert!(txns[0].start && !txns[0].end);
        assert_eq!(txns[0].data.len(), 4);
        assert!(!txns[1].start && txns[1].end);
        assert_eq!(txns[1].data.len(), 4);

        let memory = sim.i2c_device_memory(0, 0x50).unwrap();
        assert_eq!(&memory[0x10..0x16], &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn test_write_rejects_oversized_chunks() {
        let (_, mut i2c, _) = test_i2c(Variant::CtlCp);
        i2c.set_channel(Some(0)).unwrap();
        assert!(matches!(
            i2c.write(0x50, &[0; 4], true, true),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            i2c.write(0x50, &[0; 5], false, true),
            Err(Error::InvalidArgument(_))
        ));
        let mut buf = [0; 5];
        assert!(matches!(i2c.read(0x50, &mut buf), Err(Error::InvalidArgument(_))));
        assert!(matches!(i2c.read(0x80, &mut buf[..1]), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_no_channel_selected() {
        let (_, mut i2c, _) = test_i2c(Variant::CtlCp);
        let mut buf = [0; 1];
        assert!(matches!(i2c.read(0x50, &mut buf), Err(Error::InvalidArgument(_))));
        assert!(i2c.set_channel(Some(32)).is_err());
    }

    #[test]
    fn test_transfer_segments_messages() {
        let (sim, mut i2c, _) = test_i2c(Variant::CtlCp);
        let contents: Vec<u8> = (0..16).collect();
        sim.attach_i2c_device(SimI2cDevice::new(2, 0x51));
        i2c.set_channel(Some(2)).unwrap();

        // Offset byte then nine bytes of data: chunks of 3, 4 and 3.
        let mut payload = vec![0x20];
        payload.extend_from_slice(&contents[..9]);
        let mut msgs = [Msg::Write {
            addr: 0x51,
            data: &payload,
        }];
        assert_eq!(i2c.transfer(&mut msgs).unwrap(), 1);
        let lens: Vec<_> = sim.i2c_transactions().iter().map(|t| t.data.len()).collect();
        assert_eq!(lens, vec![4, 4, 3]);

        sim.clear_i2c_transactions();
        let offset = [0x20];
        let mut buf = [0; 9];
        let mut msgs = [
            Msg::Write {
                addr: 0x51,
                data: &offset,
            },
            Msg::Read {
                addr: 0x51,
                buf: &mut buf,
            },
        ];
        assert_eq!(i2c.transfer(&mut msgs).unwrap(), 2);
        assert_eq!(&buf, &contents[..9]);
        let reads: Vec<_> = sim
            .i2c_transactions()
            .iter()
            .filter(|t| t.read_len > 0)
            .map(|t| t.read_len)
            .collect();
        assert_eq!(reads, vec![4, 4, 1]);
    }

    #[test]
    fn test_zero_length_write_is_one_ack_poll() {
        let (sim, mut i2c, _) = test_i2c(Variant::CtlCp);
        sim.attach_i2c_device(SimI2cDevice::new(0, 0x50));
        i2c.set_channel(Some(0)).unwrap();
        let mut msgs = [Msg::Write {
            addr: 0x50,
            data: &[],
        }];
        i2c.transfer(&mut msgs).unwrap();
        assert_eq!(
            sim.i2c_transactions(),
            vec![SimTransaction {
                channel: 0,
                start: true,
                end: true,
                speed_400k: false,
                data: vec![0xa0],
                read_len: 0,
            }]
        );
        assert!(i2c.probe(0x50).unwrap());
        assert!(!i2c.probe(0x51).unwrap());
    }

    #[test]
    fn test_nack_does_not_abort() {
        let (sim, mut i2c, _) = test_i2c(Variant::CtlCp);
        i2c.set_channel(Some(0)).unwrap();
        let mut buf = [0; 2];
        assert!(matches!(i2c.read(0x3c, &mut buf), Err(Error::NoAck(0x3c))));
        assert_eq!(sim.i2c_aborts(), 0);
    }

    #[test]
    fn test_busy_polling() {
        let (sim, mut i2c, delay) = test_i2c(Variant::CtlCp);
        sim.attach_i2c_device(SimI2cDevice::new(0, 0x50));
        i2c.set_channel(Some(0)).unwrap();
        sim.set_i2c_busy_reads(3);
        let mut buf = [0; 1];
        i2c.read(0x50, &mut buf).unwrap();
        assert_eq!(delay.count(), 3);
        assert_eq!(delay.count_of(Duration::from_micros(5)), 3);
    }

    #[test]
    fn test_timeout_aborts() {
        let config = ConfigBuilder::new(Variant::CtlCp)
            .i2c_timeout(Duration::from_millis(1))
            .build()
            .unwrap();
        let (sim, mut i2c, delay) = test_i2c_with_config(&config);
        sim.attach_i2c_device(SimI2cDevice::new(0, 0x50));
        i2c.set_channel(Some(0)).unwrap();
        sim.set_i2c_stuck_busy(true);
        let mut buf = [0; 1];
        assert!(matches!(i2c.read(0x50, &mut buf), Err(Error::Timeout)));
        assert_eq!(sim.i2c_aborts(), 1);
        // 200 polls, with no sleep after the last one.
        assert_eq!(delay.count(), 199);
    }

    #[test]
    fn test_sequence_error_aborts() {
        let (sim, mut i2c, _) = test_i2c(Variant::CtlCp);
        sim.attach_i2c_device(SimI2cDevice::new(0, 0x50));
        i2c.set_channel(Some(0)).unwrap();
        sim.inject_i2c_sequence_error();
        assert!(matches!(
            i2c.write(0x50, &[1], true, true),
            Err(Error::SequenceError)
        ));
        assert_eq!(sim.i2c_aborts(), 1);
        // The next transaction is unaffected.
        i2c.write(0x50, &[1], true, true).unwrap();
    }

    #[test]
    fn test_output_enable_written_at_init() {
        let (sim, _, _) = test_i2c(Variant::CtlIo);
        assert_eq!(sim.i2c_output_enable(), 0x7f);
    }
}
