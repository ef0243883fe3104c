// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dispatch of `lubde_ioctl_t` requests onto the BDB engine.

use crate::bdb::Bdb;
use crate::iproc::Iproc;
use crate::regs::RegisterBlock;
use crate::Error;
use nokia_fpga_messages::ioctl::INTERFACE_VERSION;
use nokia_fpga_messages::ioctl::LUBDE_FAIL;
use nokia_fpga_messages::ioctl::LUBDE_SUCCESS;
use nokia_fpga_messages::ioctl::PAYLOAD_SIZE;
use nokia_fpga_messages::Cmd;
use nokia_fpga_messages::DeviceFlags;
use nokia_fpga_messages::Error as MessageError;
use nokia_fpga_messages::LubdeIoctl;
use nokia_fpga_messages::Width;
use nokia_fpga_messages::NUM_HW_SLOTS;
use slog::debug;
use slog::info;
use slog::Logger;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// The most switch devices that can be registered.
pub const MAX_DEVICES: usize = 16;

/// A switch ASIC registered with [`Cmd::NokiaRegisterDevice`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SwitchDevice {
    pub slot: u8,
    pub device_id: u32,
    pub revision: u32,
    pub flags: DeviceFlags,
}

/// Handles ioctl requests for one FPGA.
pub struct IoctlHandler<R, W> {
    log: Logger,
    bdb: Arc<Bdb<R, W>>,
    iproc: Iproc<R, W>,
    devices: Mutex<Vec<SwitchDevice>>,
}

fn slot_from(raw: u32) -> Result<u8, Error> {
    match u8::try_from(raw) {
        Ok(slot) if slot < NUM_HW_SLOTS => Ok(slot),
        _ => Err(MessageError::InvalidSlot(raw).into()),
    }
}

fn address_from(raw: u64) -> Result<u32, Error> {
    u32::try_from(raw).map_err(|_| Error::InvalidArgument("BDB address wider than 32 bits"))
}

impl<R: RegisterBlock, W: RegisterBlock> IoctlHandler<R, W> {
    pub fn new(log: &Logger, bdb: Arc<Bdb<R, W>>) -> Self {
        let log = log.new(slog::o!("component" => "ioctl"));
        let iproc = Iproc::new(&log, bdb.clone());
        Self {
            log,
            bdb,
            iproc,
            devices: Mutex::new(Vec::with_capacity(MAX_DEVICES)),
        }
    }

    fn devices(&self) -> MutexGuard<'_, Vec<SwitchDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the registered switch devices.
    pub fn switch_devices(&self) -> Vec<SwitchDevice> {
        self.devices().clone()
    }

    fn device(&self, index: u32) -> Result<SwitchDevice, Error> {
        self.devices()
            .get(index as usize)
            .copied()
            .ok_or(Error::InvalidDevice(index))
    }

    /// Handle one request, filling in its outputs and `rc`.
    pub fn handle(&self, cmd: Cmd, io: &mut LubdeIoctl) {
        match self.dispatch(cmd, io) {
            Ok(()) => io.rc = LUBDE_SUCCESS,
            Err(e) => {
                debug!(
                    self.log,
                    "request failed";
                    "cmd" => ?cmd,
                    "dev" => io.dev,
                    "reason" => %e,
                    "errno" => ?e.errno(),
                );
                io.rc = LUBDE_FAIL;
            }
        }
    }

    /// Handle one request, returning any error instead of encoding it in
    /// `rc`.
    pub fn dispatch(&self, cmd: Cmd, io: &mut LubdeIoctl) -> Result<(), Error> {
        match cmd {
            Cmd::Version => {
                io.d0 = INTERFACE_VERSION;
            }
            Cmd::GetNumDevices => {
                io.d0 = self.devices().len() as u32;
            }
            Cmd::GetDevice => {
                let device = self.device(io.dev)?;
                io.d0 = device.device_id;
                io.d1 = device.revision;
                io.d2 = u32::from(device.slot);
                io.d3 = device.flags.bits();
            }
            Cmd::AttachInstance => {
                let mut devices = self.devices();
                let requested = io.d0;
                if let Some(bad) = (0..32).find(|i| requested & (1 << i) != 0 && *i >= devices.len()) {
                    return Err(Error::InvalidDevice(bad as u32));
                }
                for (i, device) in devices.iter_mut().enumerate() {
                    if requested & (1 << i) != 0 {
                        device.flags |= DeviceFlags::ATTACHED;
                    }
                }
            }
            Cmd::ReadReg => {
                let device = self.device(io.dev)?;
                io.d1 = self.bdb.read(device.slot, io.d0, Width::Four)? as u32;
            }
            Cmd::WriteReg => {
                let device = self.device(io.dev)?;
                self.bdb
                    .write_word(device.slot, io.d0, Width::Four, u64::from(io.d1))?;
            }
            Cmd::NokiaBdbInit => {
                io.d0 = self.bdb.init();
                info!(self.log, "BDB initialized"; "present" => format!("0x{:08x}", io.d0));
            }
            Cmd::NokiaBdbReadWord => {
                let slot = slot_from(io.d0)?;
                let width = Width::from_bytes(io.d1)?;
                let address = address_from(io.p0)?;
                let value = self.bdb.read(slot, address, width)?;
                io.set_value64(value);
            }
            Cmd::NokiaBdbWriteWord => {
                let slot = slot_from(io.d0)?;
                let address = address_from(io.p0)?;
                match Width::from_bytes(io.d1) {
                    Ok(width) => self.bdb.write_word(slot, address, width, io.value64())?,
                    Err(_) => {
                        let len = io.d1 as usize;
                        if len > PAYLOAD_SIZE {
                            return Err(Error::InvalidArgument("BDB block larger than the payload"));
                        }
                        self.bdb.write(slot, address, &io.dx[..len])?;
                    }
                }
            }
            Cmd::NokiaRegisterDevice => {
                let slot = slot_from(io.d0)?;
                let mut flags = DeviceFlags::empty();
                if self.bdb.is_present(slot) {
                    flags |= DeviceFlags::PRESENT;
                }
                let mut devices = self.devices();
                if devices.len() >= MAX_DEVICES {
                    return Err(Error::DeviceTableFull);
                }
                devices.push(SwitchDevice {
                    slot,
                    device_id: io.d1,
                    revision: io.d2,
                    flags,
                });
                io.dev = (devices.len() - 1) as u32;
                info!(
                    self.log,
                    "registered switch device";
                    "index" => io.dev,
                    "slot" => slot,
                    "device_id" => format!("0x{:04x}", io.d1),
                    "revision" => io.d2,
                );
            }
            Cmd::NokiaIprocRead => {
                let slot = slot_from(io.d0)?;
                let address = address_from(io.p0)?;
                io.d1 = self.iproc.read(slot, address)?;
            }
            Cmd::NokiaIprocWrite => {
                let slot = slot_from(io.d0)?;
                let address = address_from(io.p0)?;
                self.iproc.write(slot, address, io.d1)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::IoctlHandler;
    use super::MAX_DEVICES;
    use crate::sim::SimFpga;
    use crate::sim::SimRegion;
    use crate::test_utils::test_bdb;
    use crate::test_utils::test_logger;
    use crate::Error;
    use nokia_fpga_messages::ioctl::INTERFACE_VERSION;
    use nokia_fpga_messages::ioctl::LUBDE_FAIL;
    use nokia_fpga_messages::Cmd;
    use nokia_fpga_messages::DeviceFlags;
    use nokia_fpga_messages::LubdeIoctl;
    use std::sync::Arc;

    fn handler() -> (SimFpga, IoctlHandler<SimRegion, SimRegion>) {
        let (sim, bdb, _) = test_bdb();
        (sim, IoctlHandler::new(&test_logger(), Arc::new(bdb)))
    }

    #[test]
    fn test_version() {
        let (_, handler) = handler();
        let mut io = LubdeIoctl::default();
        io.rc = LUBDE_FAIL;
        handler.handle(Cmd::Version, &mut io);
        assert!(io.succeeded());
        assert_eq!(io.d0, INTERFACE_VERSION);
    }

    #[test]
    fn test_bdb_read_and_write_word() {
        let (sim, handler) = handler();
        sim.set_present(1 << 4);
        sim.poke_remote(4, 0x1000_0040, &[0x0a, 0x0b, 0x0c, 0x0d, 1, 2, 3, 4]);

        let mut io = LubdeIoctl::default();
        io.d0 = 4;
        io.d1 = 8;
        io.p0 = 0x1000_0040;
        handler.handle(Cmd::NokiaBdbReadWord, &mut io);
        assert!(io.succeeded());
        assert_eq!(io.d3, 0x0a0b_0c0d);
        assert_eq!(io.d2, 0x0102_0304);

        let mut io = LubdeIoctl::default();
        io.d0 = 4;
        io.d1 = 2;
        io.p0 = 0x1000_0050;
        io.set_value64(0xbeef);
        handler.handle(Cmd::NokiaBdbWriteWord, &mut io);
        assert!(io.succeeded());
        assert_eq!(sim.peek_remote(4, 0x1000_0050, 2), vec![0xbe, 0xef]);
    }

    #[test]
    fn test_bdb_block_write_from_payload() {
        let (sim, handler) = handler();
        sim.set_present(1);
        let mut io = LubdeIoctl::default();
        io.d1 = 16;
        io.p0 = 0x200;
        for (i, byte) in io.dx.iter_mut().enumerate() {
            *byte = i as u8;
        }
        handler.handle(Cmd::NokiaBdbWriteWord, &mut io);
        assert!(io.succeeded());
        assert_eq!(sim.peek_remote(0, 0x200, 17), {
            let mut expected: Vec<u8> = (0..16).collect();
            expected.push(0);
            expected
        });

        io.d1 = 12;
        handler.handle(Cmd::NokiaBdbWriteWord, &mut io);
        assert_eq!(io.rc, LUBDE_FAIL);
        io.d1 = 72;
        handler.handle(Cmd::NokiaBdbWriteWord, &mut io);
        assert_eq!(io.rc, LUBDE_FAIL);
    }

    #[test]
    fn test_bad_arguments_fail() {
        let (sim, handler) = handler();
        sim.set_present(!0);
        let mut io = LubdeIoctl::default();
        io.d1 = 3;
        assert!(matches!(
            handler.dispatch(Cmd::NokiaBdbReadWord, &mut io),
            Err(Error::Message(_))
        ));
        io.d0 = 32;
        io.d1 = 4;
        assert!(matches!(
            handler.dispatch(Cmd::NokiaBdbReadWord, &mut io),
            Err(Error::Message(_))
        ));
        io.d0 = 0;
        io.p0 = 1 << 32;
        assert!(matches!(
            handler.dispatch(Cmd::NokiaBdbReadWord, &mut io),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_absent_slot_fails() {
        let (sim, handler) = handler();
        sim.set_present(0);
        let mut io = LubdeIoctl::default();
        io.d0 = 2;
        io.d1 = 4;
        assert!(matches!(
            handler.dispatch(Cmd::NokiaBdbReadWord, &mut io),
            Err(Error::Unavailable(2))
        ));
        handler.handle(Cmd::NokiaBdbReadWord, &mut io);
        assert_eq!(io.rc, LUBDE_FAIL);
    }

    #[test]
    fn test_device_table() {
        let (sim, handler) = handler();
        sim.set_present(1 << 6);

        let mut io = LubdeIoctl::default();
        io.d0 = 6;
        io.d1 = 0xb870;
        io.d2 = 1;
        handler.handle(Cmd::NokiaRegisterDevice, &mut io);
        assert!(io.succeeded());
        assert_eq!(io.dev, 0);

        let mut io = LubdeIoctl::default();
        io.d0 = 7;
        handler.handle(Cmd::NokiaRegisterDevice, &mut io);
        assert_eq!(io.dev, 1);

        let mut io = LubdeIoctl::default();
        handler.handle(Cmd::GetNumDevices, &mut io);
        assert_eq!(io.d0, 2);

        let mut io = LubdeIoctl::new(0);
        handler.handle(Cmd::GetDevice, &mut io);
        assert_eq!((io.d0, io.d1, io.d2), (0xb870, 1, 6));
        assert_eq!(DeviceFlags::from_bits_retain(io.d3), DeviceFlags::PRESENT);

        let mut io = LubdeIoctl::new(1);
        handler.handle(Cmd::GetDevice, &mut io);
        assert_eq!(DeviceFlags::from_bits_retain(io.d3), DeviceFlags::empty());

        let mut io = LubdeIoctl::default();
        io.d0 = 0b01;
        handler.handle(Cmd::AttachInstance, &mut io);
        assert!(io.succeeded());
        assert!(handler.switch_devices()[0].flags.contains(DeviceFlags::ATTACHED));
        assert!(!handler.switch_devices()[1].flags.contains(DeviceFlags::ATTACHED));

        io.d0 = 0b100;
        assert!(matches!(
            handler.dispatch(Cmd::AttachInstance, &mut io),
            Err(Error::InvalidDevice(2))
        ));

        let mut io = LubdeIoctl::new(2);
        assert!(matches!(
            handler.dispatch(Cmd::GetDevice, &mut io),
            Err(Error::InvalidDevice(2))
        ));
    }

    #[test]
    fn test_device_registers_use_device_slot() {
        let (sim, handler) = handler();
        sim.set_present(1 << 9);
        let mut io = LubdeIoctl::default();
        io.d0 = 9;
        handler.handle(Cmd::NokiaRegisterDevice, &mut io);

        let mut io = LubdeIoctl::new(0);
        io.d0 = 0x0400_0100;
        io.d1 = 0x1122_3344;
        handler.handle(Cmd::WriteReg, &mut io);
        assert!(io.succeeded());
        assert_eq!(sim.peek_remote(9, 0x0400_0100, 4), vec![0x11, 0x22, 0x33, 0x44]);

        let mut io = LubdeIoctl::new(0);
        io.d0 = 0x0400_0100;
        handler.handle(Cmd::ReadReg, &mut io);
        assert!(io.succeeded());
        assert_eq!(io.d1, 0x1122_3344);
    }

    #[test]
    fn test_device_table_full() {
        let (_, handler) = handler();
        for _ in 0..MAX_DEVICES {
            let mut io = LubdeIoctl::default();
            handler.dispatch(Cmd::NokiaRegisterDevice, &mut io).unwrap();
        }
        let mut io = LubdeIoctl::default();
        assert!(matches!(
            handler.dispatch(Cmd::NokiaRegisterDevice, &mut io),
            Err(Error::DeviceTableFull)
        ));
    }

    #[test]
    fn test_iproc_commands() {
        let (sim, handler) = handler();
        sim.set_present(1 << 1);
        let mut io = LubdeIoctl::default();
        io.d0 = 1;
        io.p0 = 0x1800_0104;
        io.d1 = 0x5555_aaaa;
        handler.handle(Cmd::NokiaIprocWrite, &mut io);
        assert!(io.succeeded());
        assert_eq!(sim.peek_remote(1, 0x7104, 4), vec![0x55, 0x55, 0xaa, 0xaa]);

        let mut io = LubdeIoctl::default();
        io.d0 = 1;
        io.p0 = 0x1800_0104;
        handler.handle(Cmd::NokiaIprocRead, &mut io);
        assert!(io.succeeded());
        assert_eq!(io.d1, 0x5555_aaaa);
    }

    #[test]
    fn test_init_reports_present() {
        let (sim, handler) = handler();
        sim.set_present(0x8000_0001);
        let mut io = LubdeIoctl::default();
        handler.handle(Cmd::NokiaBdbInit, &mut io);
        assert!(io.succeeded());
        assert_eq!(io.d0, 0x8000_0001);
    }
}
