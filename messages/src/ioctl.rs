// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `lubde_ioctl_t` request image and its command numbers.
//!
//! The layout of [`LubdeIoctl`] is shared bit-for-bit with the existing
//! user-space client, which passes the structure by pointer to the driver.
//! Fields are therefore in host byte order, not network order. When carried
//! over a socket, a request is framed as the raw command number followed by
//! the structure image, see [`encode_frame`] and [`decode_frame`].

use crate::Error;
use serde::Deserialize;
use serde::Serialize;
use static_assertions::assert_eq_size;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The ioctl "type" byte used by every command.
pub const LUBDE_MAGIC: u8 = b'L';

/// `rc` value of a successful request.
pub const LUBDE_SUCCESS: u32 = 0;

/// `rc` value of a failed request.
pub const LUBDE_FAIL: u32 = u32::MAX;

/// The interface version returned by [`Cmd::Version`].
pub const INTERFACE_VERSION: u32 = 1;

/// Size of the `dx` payload union.
pub const PAYLOAD_SIZE: usize = 64;

/// Size of a `lubde_ioctl_t` image.
pub const IOCTL_SIZE: usize = 96;

/// Size of a framed request or response: the command word and the image.
pub const FRAME_SIZE: usize = 4 + IOCTL_SIZE;

// Equivalent of the kernel's `_IO(LUBDE_MAGIC, nr)`.
const fn io(nr: u8) -> u32 {
    ((LUBDE_MAGIC as u32) << 8) | nr as u32
}

/// An ioctl command.
///
/// The field usage of each command is listed in terms of the [`LubdeIoctl`]
/// fields. Inputs not mentioned are ignored; outputs not mentioned are left
/// untouched. Every command sets `rc`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[repr(u32)]
pub enum Cmd {
    /// Out: `d0` = [`INTERFACE_VERSION`].
    Version = io(0),

    /// Out: `d0` = number of registered switch devices.
    GetNumDevices = io(1),

    /// In: `dev`. Out: `d0` = device ID, `d1` = revision, `d2` = hardware
    /// slot, `d3` = [`DeviceFlags`].
    GetDevice = io(2),

    /// In: `d0` = bitmask of device indices to attach.
    AttachInstance = io(3),

    /// In: `dev`, `d0` = register address. Out: `d1` = 32-bit value.
    ReadReg = io(4),

    /// In: `dev`, `d0` = register address, `d1` = 32-bit value.
    WriteReg = io(5),

    /// Reset the BDB window state. Out: `d0` = card-present bitmap.
    NokiaBdbInit = io(0x40),

    /// In: `d0` = hardware slot, `d1` = width in bytes, `p0` = address.
    /// Out: `d2` = low 32 bits, `d3` = high 32 bits of the value read.
    NokiaBdbReadWord = io(0x41),

    /// In: `d0` = hardware slot, `d1` = length in bytes, `p0` = address.
    /// For lengths of 1, 2, 4 or 8, the value is `d3:d2`. Longer lengths
    /// must be multiples of 8 and are taken from `dx`.
    NokiaBdbWriteWord = io(0x42),

    /// In: `d0` = hardware slot, `d1` = device ID, `d2` = revision.
    /// Out: `dev` = index of the new device.
    NokiaRegisterDevice = io(0x43),

    /// In: `d0` = hardware slot, `p0` = iProc address. Out: `d1` = value.
    NokiaIprocRead = io(0x44),

    /// In: `d0` = hardware slot, `p0` = iProc address, `d1` = value.
    NokiaIprocWrite = io(0x45),
}

impl Cmd {
    const ALL: [Cmd; 12] = [
        Cmd::Version,
        Cmd::GetNumDevices,
        Cmd::GetDevice,
        Cmd::AttachInstance,
        Cmd::ReadReg,
        Cmd::WriteReg,
        Cmd::NokiaBdbInit,
        Cmd::NokiaBdbReadWord,
        Cmd::NokiaBdbWriteWord,
        Cmd::NokiaRegisterDevice,
        Cmd::NokiaIprocRead,
        Cmd::NokiaIprocWrite,
    ];

    /// Return the raw ioctl number.
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    /// Decode a raw ioctl number.
    pub fn from_raw(raw: u32) -> Result<Self, Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.as_raw() == raw)
            .ok_or(Error::InvalidCommand(raw))
    }
}

bitflags::bitflags! {
    /// State of a registered switch device, reported by [`Cmd::GetDevice`].
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct DeviceFlags: u32 {
        /// The device's slot reported card-present when registered.
        const PRESENT  = 0b0000_0001;

        /// A client attached to the device with [`Cmd::AttachInstance`].
        const ATTACHED = 0b0000_0010;
    }
}

/// The `lubde_ioctl_t` structure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct LubdeIoctl {
    pub dev: u32,
    pub rc: u32,
    pub d0: u32,
    pub d1: u32,
    pub d2: u32,
    pub d3: u32,
    pub p0: u64,
    /// The payload union of `dw: [u32; 2]` and `buf: [u8; 64]`.
    pub dx: [u8; PAYLOAD_SIZE],
}

assert_eq_size!(LubdeIoctl, [u8; IOCTL_SIZE]);
const_assert_eq!(core::mem::offset_of!(LubdeIoctl, p0), 24);
const_assert_eq!(core::mem::offset_of!(LubdeIoctl, dx), 32);

impl Default for LubdeIoctl {
    fn default() -> Self {
        Self::new(0)
    }
}

impl LubdeIoctl {
    /// Return a zeroed request addressed to device `dev`.
    pub const fn new(dev: u32) -> Self {
        Self {
            dev,
            rc: LUBDE_SUCCESS,
            d0: 0,
            d1: 0,
            d2: 0,
            d3: 0,
            p0: 0,
            dx: [0; PAYLOAD_SIZE],
        }
    }

    /// Return true if `rc` reports success.
    pub const fn succeeded(&self) -> bool {
        self.rc == LUBDE_SUCCESS
    }

    /// Return the 64-bit value carried in `d3:d2`.
    pub const fn value64(&self) -> u64 {
        ((self.d3 as u64) << 32) | self.d2 as u64
    }

    /// Store a 64-bit value into `d3:d2`.
    pub fn set_value64(&mut self, value: u64) {
        self.d2 = value as u32;
        self.d3 = (value >> 32) as u32;
    }
}

// The command word leading every frame.
#[derive(Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
struct FrameHeader {
    cmd: u32,
}

const_assert_eq!(core::mem::size_of::<FrameHeader>() + IOCTL_SIZE, FRAME_SIZE);

/// Write a framed request or response into `buf`.
pub fn encode_frame(cmd: Cmd, io: &LubdeIoctl, buf: &mut [u8; FRAME_SIZE]) {
    let header = FrameHeader { cmd: cmd.as_raw() };
    let (head, body) = buf.split_at_mut(core::mem::size_of::<FrameHeader>());
    head.copy_from_slice(header.as_bytes());
    body.copy_from_slice(io.as_bytes());
}

/// Decode a framed request or response.
///
/// Trailing bytes past [`FRAME_SIZE`] are ignored.
pub fn decode_frame(buf: &[u8]) -> Result<(Cmd, LubdeIoctl), Error> {
    if buf.len() < FRAME_SIZE {
        return Err(Error::FrameTooShort(buf.len()));
    }
    let (header, rest) =
        FrameHeader::read_from_prefix(buf).map_err(|_| Error::FrameTooShort(buf.len()))?;
    let cmd = Cmd::from_raw(header.cmd)?;
    let (io, _) =
        LubdeIoctl::read_from_prefix(rest).map_err(|_| Error::FrameTooShort(buf.len()))?;
    Ok((cmd, io))
}
