// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for building engines over a simulated FPGA.

use crate::bdb::Bdb;
use crate::config::Config;
use crate::config::ConfigBuilder;
use crate::i2c::I2cController;
use crate::mux::Mux;
use crate::sim::SimDelay;
use crate::sim::SimFpga;
use crate::sim::SimRegion;
use crate::variant::Variant;
use slog::Logger;
use std::sync::Arc;

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

pub fn test_config(variant: Variant) -> Config {
    ConfigBuilder::new(variant).build().unwrap()
}

pub fn test_bdb() -> (SimFpga, Bdb<SimRegion, SimRegion>, SimDelay) {
    test_bdb_with_config(&test_config(Variant::CtlCp))
}

pub fn test_bdb_with_config(config: &Config) -> (SimFpga, Bdb<SimRegion, SimRegion>, SimDelay) {
    let sim = SimFpga::new();
    let delay = SimDelay::new();
    let bdb = Bdb::new(
        &test_logger(),
        &config.bdb,
        Arc::new(delay.clone()),
        sim.bdb_regs(),
        sim.bdb_window(),
    )
    .unwrap();
    sim.clear_accesses();
    (sim, bdb, delay)
}

pub fn test_i2c(variant: Variant) -> (SimFpga, I2cController<SimRegion>, SimDelay) {
    test_i2c_with_config(&test_config(variant))
}

pub fn test_i2c_with_config(config: &Config) -> (SimFpga, I2cController<SimRegion>, SimDelay) {
    let sim = SimFpga::new();
    let delay = SimDelay::new();
    let i2c = I2cController::new(
        &test_logger(),
        config,
        Arc::new(delay.clone()),
        Arc::new(sim.i2c_regs()),
    )
    .unwrap();
    (sim, i2c, delay)
}

pub fn test_mux(variant: Variant) -> (SimFpga, Mux<SimRegion>, SimDelay) {
    let sim = SimFpga::new();
    let delay = SimDelay::new();
    let mux = Mux::new(
        &test_logger(),
        &test_config(variant),
        Arc::new(delay.clone()),
        Arc::new(sim.i2c_regs()),
    )
    .unwrap();
    (sim, mux, delay)
}
