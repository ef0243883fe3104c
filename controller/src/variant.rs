// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static per-board configuration of the custom I2C controller.

use serde::Deserialize;
use serde::Serialize;

/// The hardware variants of the control FPGA.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, clap::ValueEnum)]
#[cfg_attr(test, derive(strum::EnumIter))]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Variant {
    /// Control-plane card.
    CtlCp,
    /// I/O card with 36 QSFP cages.
    CtlIo,
    /// Control-plane card, Hornet platform.
    CtlCpHornet,
    /// Control-plane card, Vermilion platform.
    CtlCpVermilion,
    /// I/O card with 64 OSFP cages, Vermilion platform.
    CtlIoVermilion,
}

/// Where a logical I2C channel lands on the controller.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ChannelMap {
    /// The physical bus.
    pub physical: u8,
    /// The module-select line connecting an optics module to that bus, if
    /// any.
    pub modsel: Option<u8>,
}

/// The configuration record of one [`Variant`].
#[derive(Debug)]
pub struct VariantConfig {
    pub name: &'static str,
    /// Logical channel table, indexed by logical channel number.
    pub channels: &'static [ChannelMap],
    /// Bit `n` is set if physical bus `n` runs at 400 kHz.
    pub speed_400k: u32,
    /// Bit `n` enables the output drivers of physical bus `n`.
    pub output_enable: u32,
}

impl VariantConfig {
    /// Return the mapping of a logical channel, if it exists.
    pub fn channel(&self, logical: usize) -> Option<ChannelMap> {
        self.channels.get(logical).copied()
    }

    /// Return true if the physical bus runs at 400 kHz.
    pub const fn is_fast(&self, physical: u8) -> bool {
        physical < 32 && self.speed_400k & (1 << physical) != 0
    }
}

const NO_CHANNEL: ChannelMap = ChannelMap {
    physical: 0,
    modsel: None,
};

// One logical channel per physical bus, none with a module select.
const fn direct<const N: usize>() -> [ChannelMap; N] {
    let mut out = [NO_CHANNEL; N];
    let mut i = 0;
    while i < N {
        out[i] = ChannelMap {
            physical: i as u8,
            modsel: None,
        };
        i += 1;
    }
    out
}

// The first `modules` logical channels are optics cages, `per_bus` to a
// physical bus, each with its own module-select line. The remaining logical
// channels map one-to-one onto the physical buses after those.
const fn optics<const N: usize>(modules: usize, per_bus: usize) -> [ChannelMap; N] {
    let mut out = [NO_CHANNEL; N];
    let first_plain = modules.div_ceil(per_bus);
    let mut i = 0;
    while i < N {
        out[i] = if i < modules {
            ChannelMap {
                physical: (i / per_bus) as u8,
                modsel: Some(i as u8),
            }
        } else {
            ChannelMap {
                physical: (first_plain + i - modules) as u8,
                modsel: None,
            }
        };
        i += 1;
    }
    out
}

static CTL_CP_CHANNELS: [ChannelMap; 8] = direct();
static CTL_IO_CHANNELS: [ChannelMap; 40] = optics(36, 12);
static CTL_CP_HORNET_CHANNELS: [ChannelMap; 12] = direct();
static CTL_CP_VERMILION_CHANNELS: [ChannelMap; 16] = direct();
static CTL_IO_VERMILION_CHANNELS: [ChannelMap; 68] = optics(64, 8);

static CTL_CP: VariantConfig = VariantConfig {
    name: "ctl_cp",
    channels: &CTL_CP_CHANNELS,
    speed_400k: 0x0000_00f0,
    output_enable: 0x0000_00ff,
};

static CTL_IO: VariantConfig = VariantConfig {
    name: "ctl_io",
    channels: &CTL_IO_CHANNELS,
    speed_400k: 0x0000_0000,
    output_enable: 0x0000_007f,
};

static CTL_CP_HORNET: VariantConfig = VariantConfig {
    name: "ctl_cp_hornet",
    channels: &CTL_CP_HORNET_CHANNELS,
    speed_400k: 0x0000_0f00,
    output_enable: 0x0000_0fff,
};

static CTL_CP_VERMILION: VariantConfig = VariantConfig {
    name: "ctl_cp_vermilion",
    channels: &CTL_CP_VERMILION_CHANNELS,
    speed_400k: 0x0000_ffff,
    output_enable: 0x0000_ffff,
};

static CTL_IO_VERMILION: VariantConfig = VariantConfig {
    name: "ctl_io_vermilion",
    channels: &CTL_IO_VERMILION_CHANNELS,
    speed_400k: 0x0000_0f00,
    output_enable: 0x0000_0fff,
};

impl Variant {
    /// Return the static configuration record of this variant.
    pub const fn config(self) -> &'static VariantConfig {
        match self {
            Variant::CtlCp => &CTL_CP,
            Variant::CtlIo => &CTL_IO,
            Variant::CtlCpHornet => &CTL_CP_HORNET,
            Variant::CtlCpVermilion => &CTL_CP_VERMILION,
            Variant::CtlIoVermilion => &CTL_IO_VERMILION,
        }
    }
}
