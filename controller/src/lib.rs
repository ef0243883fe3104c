// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side engines for the Nokia switch control FPGA.
//!
//! The FPGA exposes two independent transaction engines:
//!
//! - The back-door bus ([`bdb`]), an indirect window through which registers
//!   of switch ASICs on remote slots are read with posted reads and written
//!   fire-and-forget.
//! - A custom I2C master ([`i2c`]) driven through a data / control register
//!   pair, multiplexed onto many logical buses and optics module-select lines
//!   by [`mux`].
//!
//! Both engines are written against the [`RegisterBlock`] trait, implemented
//! by memory-mapped PCI BARs ([`MmioRegion`]) and by a behavioral model of the
//! FPGA ([`sim::SimFpga`]).

pub mod bdb;
pub mod client;
pub mod config;
pub mod i2c;
pub mod ioctl;
pub mod iproc;
pub mod mmio;
pub mod mux;
pub mod regs;
pub mod server;
pub mod sim;
pub mod variant;

#[cfg(test)]
mod test_utils;

pub use bdb::Bdb;
pub use client::Client;
pub use config::Config;
pub use config::ConfigBuilder;
pub use i2c::I2cController;
pub use i2c::Msg;
pub use ioctl::IoctlHandler;
pub use iproc::Iproc;
pub use mmio::MmioRegion;
pub use mux::ModselBank;
pub use mux::Mux;
pub use nokia_fpga_messages::Width;
pub use regs::Delay;
pub use regs::RegisterBlock;
pub use regs::StdDelay;
pub use server::Server;
pub use variant::Variant;

use nix::errno::Errno;
use nokia_fpga_messages::InvalidModsel;
use nokia_fpga_messages::Error as MessageError;

/// An error accessing the FPGA engines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Hardware slot {0} is not present")]
    Unavailable(u8),

    #[error("Timed out waiting for hardware")]
    Timeout,

    #[error("I2C controller reported a sequence error")]
    SequenceError,

    #[error("No device acknowledged I2C address 0x{0:02x}")]
    NoAck(u8),

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Invalid switch device index: {0}")]
    InvalidDevice(u32),

    #[error("Switch device table is full")]
    DeviceTableFull,

    #[error("Request failed with rc 0x{0:08x}")]
    RequestFailed(u32),

    #[error("Request failed after {0} retries")]
    MaxRetries(usize),

    #[error("Message error")]
    Message(#[from] MessageError),

    #[error("Module-select error")]
    Modsel(#[from] InvalidModsel),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("System error")]
    Nix(#[from] Errno),
}

impl Error {
    /// Return the errno a kernel driver would report for this error.
    pub fn errno(&self) -> Errno {
        match self {
            Error::Unavailable(_) => Errno::ENODEV,
            Error::Timeout | Error::MaxRetries(_) => Errno::ETIMEDOUT,
            Error::SequenceError | Error::RequestFailed(_) => Errno::EIO,
            Error::NoAck(_) => Errno::ENXIO,
            Error::InvalidArgument(_)
            | Error::InvalidDevice(_)
            | Error::Message(_)
            | Error::Modsel(_) => Errno::EINVAL,
            Error::DeviceTableFull => Errno::ENOSPC,
            Error::Io(e) => e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
            Error::Nix(e) => *e,
        }
    }
}
