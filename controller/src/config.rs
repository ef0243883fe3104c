// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration of the FPGA engines.

use crate::variant::Variant;
use crate::Error;
use serde::Serialize;
use std::time::Duration;

/// Return the default number of polls of a posted BDB read.
pub const fn default_bdb_poll_iterations() -> u32 {
    1000
}

/// Return the default delay between polls of a posted BDB read.
pub const fn default_bdb_poll_interval() -> Duration {
    Duration::from_micros(1)
}

/// Return the default write-FIFO depth limit.
///
/// A write of `w` bytes waits while the FIFO depth is at least
/// `limit + 8 - w`.
pub const fn default_fifo_depth_limit() -> u8 {
    56
}

/// Return the default number of BDB read timeouts that are logged.
pub const fn default_timeout_log_limit() -> u32 {
    10
}

/// Return the default delay between polls of the I2C busy bit.
pub const fn default_i2c_poll_interval() -> Duration {
    Duration::from_micros(5)
}

/// Return the default bound on a single I2C hardware transaction.
pub const fn default_i2c_timeout() -> Duration {
    Duration::from_millis(100)
}

/// Return the default time allowed for an optics module to settle after its
/// module-select line is asserted.
pub const fn default_modsel_settle() -> Duration {
    Duration::from_millis(5)
}

/// Return the default interval after which a client resends an unanswered
/// request.
pub const fn default_retry_interval() -> Duration {
    Duration::from_secs(1)
}

/// Configuration of the BDB engine.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BdbConfig {
    /// The number of times the control register is polled for a posted read.
    pub poll_iterations: u32,

    /// The delay between polls of a posted read.
    pub poll_interval: Duration,

    /// See [`default_fifo_depth_limit`].
    pub fifo_depth_limit: u8,

    /// The number of status reads a write may spend waiting for room in the
    /// remote write FIFO.
    ///
    /// `None` waits forever. The hardware is expected to drain the FIFO, and
    /// a bound changes behavior on a wedged slot from a hang into
    /// [`Error::Timeout`].
    pub fifo_spin_limit: Option<u64>,

    /// Only this many read timeouts are logged over the life of the engine.
    pub timeout_log_limit: u32,
}

impl Default for BdbConfig {
    fn default() -> Self {
        Self {
            poll_iterations: default_bdb_poll_iterations(),
            poll_interval: default_bdb_poll_interval(),
            fifo_depth_limit: default_fifo_depth_limit(),
            fifo_spin_limit: None,
            timeout_log_limit: default_timeout_log_limit(),
        }
    }
}

impl BdbConfig {
    /// Return the total time a posted read may take.
    pub fn read_timeout(&self) -> Duration {
        self.poll_interval * self.poll_iterations
    }
}

/// Configuration of the custom I2C controller.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct I2cConfig {
    /// The delay between polls of the busy bit.
    pub poll_interval: Duration,

    /// The bound on one hardware transaction.
    pub timeout: Duration,

    /// The settle time after changing module select.
    pub modsel_settle: Duration,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_i2c_poll_interval(),
            timeout: default_i2c_timeout(),
            modsel_settle: default_modsel_settle(),
        }
    }
}

impl I2cConfig {
    /// Return the number of busy-bit polls in one transaction.
    pub fn poll_iterations(&self) -> u32 {
        let n = self.timeout.as_nanos() / self.poll_interval.as_nanos().max(1);
        u32::try_from(n).unwrap_or(u32::MAX).max(1)
    }
}

/// Configuration for the engines of one FPGA.
///
/// The [`ConfigBuilder`] can be used to construct this with the defaults used
/// on production hardware.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Config {
    /// The hardware variant, selecting the I2C channel tables.
    pub variant: Variant,

    pub bdb: BdbConfig,

    pub i2c: I2cConfig,
}

/// A builder interface for generating engine configuration.
#[derive(Debug)]
pub struct ConfigBuilder {
    variant: Variant,
    bdb_poll_iterations: Option<u32>,
    bdb_poll_interval: Option<Duration>,
    fifo_depth_limit: Option<u8>,
    fifo_spin_limit: Option<u64>,
    timeout_log_limit: Option<u32>,
    i2c_poll_interval: Option<Duration>,
    i2c_timeout: Option<Duration>,
    modsel_settle: Option<Duration>,
}

impl ConfigBuilder {
    /// Create a new builder for a hardware variant.
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            bdb_poll_iterations: None,
            bdb_poll_interval: None,
            fifo_depth_limit: None,
            fifo_spin_limit: None,
            timeout_log_limit: None,
            i2c_poll_interval: None,
            i2c_timeout: None,
            modsel_settle: None,
        }
    }

    /// Set the number of polls of a posted BDB read.
    pub fn bdb_poll_iterations(mut self, iterations: u32) -> Self {
        self.bdb_poll_iterations = Some(iterations);
        self
    }

    /// Set the delay between polls of a posted BDB read.
    pub fn bdb_poll_interval(mut self, interval: Duration) -> Self {
        self.bdb_poll_interval = Some(interval);
        self
    }

    /// Set the write-FIFO depth limit.
    pub fn fifo_depth_limit(mut self, limit: u8) -> Self {
        self.fifo_depth_limit = Some(limit);
        self
    }

    /// Bound the wait for room in the remote write FIFO.
    pub fn fifo_spin_limit(mut self, limit: u64) -> Self {
        self.fifo_spin_limit = Some(limit);
        self
    }

    /// Set the number of BDB read timeouts that are logged.
    pub fn timeout_log_limit(mut self, limit: u32) -> Self {
        self.timeout_log_limit = Some(limit);
        self
    }

    /// Set the delay between polls of the I2C busy bit.
    pub fn i2c_poll_interval(mut self, interval: Duration) -> Self {
        self.i2c_poll_interval = Some(interval);
        self
    }

    /// Set the bound on one I2C hardware transaction.
    pub fn i2c_timeout(mut self, timeout: Duration) -> Self {
        self.i2c_timeout = Some(timeout);
        self
    }

    /// Set the module-select settle time.
    pub fn modsel_settle(mut self, settle: Duration) -> Self {
        self.modsel_settle = Some(settle);
        self
    }

    /// Build a `Config` from `self`.
    pub fn build(self) -> Result<Config, Error> {
        let bdb = BdbConfig {
            poll_iterations: self
                .bdb_poll_iterations
                .unwrap_or_else(default_bdb_poll_iterations),
            poll_interval: self
                .bdb_poll_interval
                .unwrap_or_else(default_bdb_poll_interval),
            fifo_depth_limit: self
                .fifo_depth_limit
                .unwrap_or_else(default_fifo_depth_limit),
            fifo_spin_limit: self.fifo_spin_limit,
            timeout_log_limit: self
                .timeout_log_limit
                .unwrap_or_else(default_timeout_log_limit),
        };
        if bdb.poll_iterations == 0 {
            return Err(Error::InvalidArgument("BDB poll iterations must be nonzero"));
        }
        if bdb.fifo_spin_limit == Some(0) {
            return Err(Error::InvalidArgument("FIFO spin limit must be nonzero"));
        }

        let i2c = I2cConfig {
            poll_interval: self
                .i2c_poll_interval
                .unwrap_or_else(default_i2c_poll_interval),
            timeout: self.i2c_timeout.unwrap_or_else(default_i2c_timeout),
            modsel_settle: self.modsel_settle.unwrap_or_else(default_modsel_settle),
        };
        if i2c.poll_interval.is_zero() {
            return Err(Error::InvalidArgument("I2C poll interval must be nonzero"));
        }
        if i2c.timeout < i2c.poll_interval {
            return Err(Error::InvalidArgument(
                "I2C timeout must be at least one poll interval",
            ));
        }

        Ok(Config {
            variant: self.variant,
            bdb,
            i2c,
        })
    }
}
