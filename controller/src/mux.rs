// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multiplexing of logical I2C buses onto the custom I2C master.
//!
//! Each logical channel maps to a physical bus of the controller and, for
//! optics cages, a module-select line. Optics modules share their physical
//! bus, so at most one module-select line is asserted at a time.

use crate::config::Config;
use crate::i2c::regs;
use crate::i2c::I2cController;
use crate::i2c::Msg;
use crate::regs::Delay;
use crate::regs::RegisterBlock;
use crate::variant::ChannelMap;
use crate::variant::VariantConfig;
use crate::Error;
use nokia_fpga_messages::ModselMask;
use slog::debug;
use slog::Logger;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

#[derive(Debug, Default)]
struct ModselState {
    current: Option<u8>,
}

/// The module-select registers of the I2C controller.
///
/// These can be read and written independently of any I2C transaction.
pub struct ModselBank<R> {
    log: Logger,
    regs: Arc<R>,
    delay: Arc<dyn Delay>,
    settle: Duration,
    state: Mutex<ModselState>,
}

impl<R: RegisterBlock> ModselBank<R> {
    pub fn new(log: &Logger, regs: Arc<R>, delay: Arc<dyn Delay>, settle: Duration) -> Self {
        Self {
            log: log.new(slog::o!("engine" => "modsel")),
            regs,
            delay,
            settle,
            state: Mutex::new(ModselState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ModselState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_mask(&self, mask: ModselMask) {
        let [lo, hi] = mask.to_registers();
        self.regs.write_be32(regs::MODSEL_LO, lo);
        self.regs.write_be32(regs::MODSEL_HI, hi);
    }

    /// Assert `line` alone, waiting for the module to settle.
    ///
    /// Nothing is written if `line` is already the selected line. Returns true
    /// if the selection changed. The line is recorded as selected only once it
    /// has settled, and other callers block until then.
    pub fn select(&self, line: u8) -> Result<bool, Error> {
        let (register, bit) = ModselMask::register_for(line)?;
        let mut state = self.state();
        if state.current == Some(line) {
            return Ok(false);
        }
        let previous = state.current.take();
        self.write_mask(ModselMask::empty());
        let offset = if register == 0 {
            regs::MODSEL_LO
        } else {
            regs::MODSEL_HI
        };
        self.regs.write_be32(offset, !(1 << bit));
        self.delay.delay(self.settle);
        state.current = Some(line);
        drop(state);

        debug!(self.log, "selected module"; "line" => line, "previous" => ?previous);
        Ok(true)
    }

    /// Return the line last selected with [`ModselBank::select`].
    pub fn current(&self) -> Option<u8> {
        self.state().current
    }

    /// Read back the asserted lines.
    pub fn asserted(&self) -> ModselMask {
        ModselMask::from_registers(
            self.regs.read_be32(regs::MODSEL_LO),
            self.regs.read_be32(regs::MODSEL_HI),
        )
    }

    /// Assert exactly the lines in `mask`.
    ///
    /// This is a raw override, which does not wait for modules to settle.
    pub fn set_raw(&self, mask: ModselMask) {
        let mut state = self.state();
        self.write_mask(mask);
        state.current = if mask.count() == 1 {
            mask.to_indices().next()
        } else {
            None
        };
    }

    /// Deassert every line.
    pub fn deassert_all(&self) {
        self.set_raw(ModselMask::empty());
    }
}

/// The logical I2C buses of one control FPGA.
pub struct Mux<R> {
    log: Logger,
    i2c: I2cController<R>,
    modsel: Arc<ModselBank<R>>,
}

impl<R: RegisterBlock> Mux<R> {
    /// Create the controller and mux, deasserting every module select.
    pub fn new(
        log: &Logger,
        config: &Config,
        delay: Arc<dyn Delay>,
        regs: Arc<R>,
    ) -> Result<Self, Error> {
        let i2c = I2cController::new(log, config, delay.clone(), regs.clone())?;
        let modsel = Arc::new(ModselBank::new(log, regs, delay, config.i2c.modsel_settle));
        modsel.deassert_all();
        Ok(Self {
            log: log.new(slog::o!("engine" => "mux")),
            i2c,
            modsel,
        })
    }

    pub fn variant(&self) -> &'static VariantConfig {
        self.i2c.variant()
    }

    /// Return the logical channel table.
    pub fn channels(&self) -> &'static [ChannelMap] {
        self.variant().channels
    }

    /// Route the controller to a logical channel.
    pub fn select(&mut self, logical: usize) -> Result<ChannelMap, Error> {
        let map = self
            .variant()
            .channel(logical)
            .ok_or(Error::InvalidArgument("no such logical I2C channel"))?;
        self.i2c.set_channel(Some(map.physical))?;
        if let Some(line) = map.modsel {
            self.modsel.select(line)?;
        }
        debug!(
            self.log,
            "selected channel";
            "logical" => logical,
            "physical" => map.physical,
        );
        Ok(map)
    }

    /// Disconnect the controller from its bus. Module select is left as is.
    pub fn deselect(&mut self) {
        self.i2c.clear_channel();
    }

    /// Run `msgs` on a logical channel.
    pub fn transfer(&mut self, logical: usize, msgs: &mut [Msg<'_>]) -> Result<usize, Error> {
        self.select(logical)?;
        let res = self.i2c.transfer(msgs);
        self.deselect();
        res
    }

    /// Return the controller, for access to the selected bus.
    pub fn controller(&mut self) -> &mut I2cController<R> {
        &mut self.i2c
    }

    pub fn modsel_bank(&self) -> &Arc<ModselBank<R>> {
        &self.modsel
    }
}
