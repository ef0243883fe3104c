// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::anyhow;
use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use itertools::Itertools;
use nokia_fpga_controller::bdb;
use nokia_fpga_controller::i2c;
use nokia_fpga_controller::sim::SimFpga;
use nokia_fpga_controller::sim::SimI2cDevice;
use nokia_fpga_controller::sim::SimRegion;
use nokia_fpga_controller::Bdb;
use nokia_fpga_controller::Client;
use nokia_fpga_controller::Config;
use nokia_fpga_controller::ConfigBuilder;
use nokia_fpga_controller::IoctlHandler;
use nokia_fpga_controller::Iproc;
use nokia_fpga_controller::MmioRegion;
use nokia_fpga_controller::ModselBank;
use nokia_fpga_controller::Msg;
use nokia_fpga_controller::Mux;
use nokia_fpga_controller::RegisterBlock;
use nokia_fpga_controller::Server;
use nokia_fpga_controller::StdDelay;
use nokia_fpga_controller::Variant;
use nokia_fpga_controller::Width;
use serde::Serialize;
use slog::info;
use slog::Drain;
use slog::Level;
use slog::Logger;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::settings::Style;
use tabled::Table;
use tabled::Tabled;

fn parse_log_level(s: &str) -> Result<Level, String> {
    s.parse().map_err(|_| String::from("invalid log level"))
}

// Parse an integer, in hex if prefixed with `0x`.
fn parse_int<T: TryFrom<u64>>(s: &str) -> Result<T, String> {
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| e.to_string())?;
    T::try_from(value).map_err(|_| format!("{s} is out of range"))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    parse_int(s)
}

fn parse_u32(s: &str) -> Result<u32, String> {
    parse_int(s)
}

fn parse_u64(s: &str) -> Result<u64, String> {
    parse_int(s)
}

fn parse_width(s: &str) -> Result<Width, String> {
    let n = parse_u32(s)?;
    Width::from_bytes(n).map_err(|e| e.to_string())
}

/// Access the back-door bus and I2C controllers of a Nokia control FPGA.
///
/// Registers are reached by mapping the FPGA's PCI BARs from their sysfs
/// resource files, or in a simulated FPGA with `--simulate`.
#[derive(Parser)]
#[command(version, about, long_about)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,

    /// The resource file of the BAR holding the BDB and I2C control blocks.
    #[arg(short, long)]
    resource: Option<PathBuf>,

    /// The resource file of the BAR holding the BDB window.
    #[arg(short, long)]
    window: Option<PathBuf>,

    /// The page-aligned offset of the BDB control block in `resource`.
    #[arg(long, default_value_t = 0, value_parser = parse_int::<usize>)]
    bdb_offset: usize,

    /// The page-aligned offset of the I2C controller in `resource`.
    #[arg(long, default_value_t = 0x1000, value_parser = parse_int::<usize>)]
    i2c_offset: usize,

    /// Operate on a simulated FPGA, with every slot present and a module at
    /// address 0x50 behind each I2C channel.
    #[arg(short, long)]
    simulate: bool,

    /// The hardware variant of the FPGA.
    #[arg(long, value_enum, default_value_t = Variant::CtlCp)]
    variant: Variant,

    /// Print results as JSON.
    #[arg(short, long)]
    json: bool,

    /// The socket of the ioctl server, for `serve` and `call`.
    #[arg(long, default_value = "/var/run/fpgactl.sock")]
    server: PathBuf,

    /// The maximum number of times `call` sends a request.
    #[arg(short, long)]
    n_retries: Option<usize>,

    /// The retry interval for `call`, in milliseconds.
    #[arg(
        long,
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..=10000)
    )]
    retry_interval: u64,

    /// The log-level.
    #[arg(
        short,
        long,
        default_value_t = Level::Info,
        value_parser = parse_log_level
    )]
    log_level: Level,
}

#[derive(Subcommand)]
enum Cmd {
    /// Read a register of a switch device over the BDB.
    BdbRead {
        #[arg(value_parser = parse_u8)]
        slot: u8,
        #[arg(value_parser = parse_u32)]
        address: u32,
        /// The access width in bytes.
        #[arg(short = 'W', long, default_value = "4", value_parser = parse_width)]
        width: Width,
    },

    /// Write a register of a switch device over the BDB.
    BdbWrite {
        #[arg(value_parser = parse_u8)]
        slot: u8,
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u64)]
        value: u64,
        /// The access width in bytes.
        #[arg(short = 'W', long, default_value = "4", value_parser = parse_width)]
        width: Width,
    },

    /// Write a block of bytes over the BDB, in 8-byte stores.
    BdbWriteBlock {
        #[arg(value_parser = parse_u8)]
        slot: u8,
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(required = true, value_parser = parse_u8)]
        data: Vec<u8>,
    },

    /// Read a 32-bit register in the iProc space of a switch device.
    IprocRead {
        #[arg(value_parser = parse_u8)]
        slot: u8,
        #[arg(value_parser = parse_u32)]
        address: u32,
    },

    /// Write a 32-bit register in the iProc space of a switch device.
    IprocWrite {
        #[arg(value_parser = parse_u8)]
        slot: u8,
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        value: u32,
    },

    /// Read from an I2C device on a logical channel.
    I2cRead {
        channel: usize,
        #[arg(value_parser = parse_u8)]
        addr: u8,
        /// The number of bytes to read.
        len: usize,
        /// Write this register offset before reading.
        #[arg(short, long, value_parser = parse_u8)]
        offset: Option<u8>,
    },

    /// Write bytes to an I2C device on a logical channel.
    I2cWrite {
        channel: usize,
        #[arg(value_parser = parse_u8)]
        addr: u8,
        #[arg(required = true, value_parser = parse_u8)]
        data: Vec<u8>,
    },

    /// Probe every 7-bit address on a logical channel.
    I2cDetect { channel: usize },

    /// Show the asserted module-select lines, or change them.
    Modsel {
        /// Assert only this line.
        #[arg(long)]
        line: Option<u8>,
        /// Deassert every line.
        #[arg(long, conflicts_with = "line")]
        clear: bool,
    },

    /// List the logical I2C channels of the variant.
    Channels,

    /// Serve ioctl requests on the `--server` socket.
    Serve,

    /// Send a request to a running server.
    Call {
        #[command(subcommand)]
        request: Request,
    },
}

#[derive(Subcommand)]
enum Request {
    /// Return the server's interface version.
    Version,
    /// Reset the BDB and return the present slots.
    BdbInit,
    BdbRead {
        #[arg(value_parser = parse_u8)]
        slot: u8,
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(short = 'W', long, default_value = "4", value_parser = parse_width)]
        width: Width,
    },
    BdbWrite {
        #[arg(value_parser = parse_u8)]
        slot: u8,
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u64)]
        value: u64,
        #[arg(short = 'W', long, default_value = "4", value_parser = parse_width)]
        width: Width,
    },
    IprocRead {
        #[arg(value_parser = parse_u8)]
        slot: u8,
        #[arg(value_parser = parse_u32)]
        address: u32,
    },
    IprocWrite {
        #[arg(value_parser = parse_u8)]
        slot: u8,
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        value: u32,
    },
}

// The register blocks backing the engines.
trait Backend {
    type Regs: RegisterBlock + 'static;

    fn bdb_regs(&self) -> anyhow::Result<Self::Regs>;
    fn bdb_window(&self) -> anyhow::Result<Self::Regs>;
    fn i2c_regs(&self) -> anyhow::Result<Self::Regs>;
}

struct Hardware {
    resource: Option<PathBuf>,
    window: Option<PathBuf>,
    bdb_offset: usize,
    i2c_offset: usize,
}

impl Hardware {
    fn resource(&self) -> anyhow::Result<&PathBuf> {
        self.resource
            .as_ref()
            .ok_or_else(|| anyhow!("--resource is required without --simulate"))
    }
}

impl Backend for Hardware {
    type Regs = MmioRegion;

    fn bdb_regs(&self) -> anyhow::Result<MmioRegion> {
        let path = self.resource()?;
        MmioRegion::open(path, self.bdb_offset, bdb::regs::BLOCK_SIZE)
            .with_context(|| format!("mapping BDB registers from {}", path.display()))
    }

    fn bdb_window(&self) -> anyhow::Result<MmioRegion> {
        let path = self
            .window
            .as_ref()
            .ok_or_else(|| anyhow!("--window is required without --simulate"))?;
        MmioRegion::open(path, 0, bdb::regs::WINDOW_SIZE)
            .with_context(|| format!("mapping BDB window from {}", path.display()))
    }

    fn i2c_regs(&self) -> anyhow::Result<MmioRegion> {
        let path = self.resource()?;
        MmioRegion::open(path, self.i2c_offset, i2c::regs::BLOCK_SIZE)
            .with_context(|| format!("mapping I2C registers from {}", path.display()))
    }
}

struct Simulated(SimFpga);

impl Simulated {
    fn new(variant: Variant) -> Self {
        let sim = SimFpga::new();
        sim.set_present(u32::MAX);
        // An SFF-8636 identifier byte, so reads return something recognizable.
        for map in variant.config().channels {
            let device = SimI2cDevice::new(map.physical, 0x50).with_memory(0, &[0x11]);
            let device = match map.modsel {
                Some(line) => device.with_modsel(line),
                None => device,
            };
            sim.attach_i2c_device(device);
        }
        Self(sim)
    }
}

impl Backend for Simulated {
    type Regs = SimRegion;

    fn bdb_regs(&self) -> anyhow::Result<SimRegion> {
        Ok(self.0.bdb_regs())
    }

    fn bdb_window(&self) -> anyhow::Result<SimRegion> {
        Ok(self.0.bdb_window())
    }

    fn i2c_regs(&self) -> anyhow::Result<SimRegion> {
        Ok(self.0.i2c_regs())
    }
}

fn open_bdb<B: Backend>(
    log: &Logger,
    config: &Config,
    backend: &B,
) -> anyhow::Result<Bdb<B::Regs, B::Regs>> {
    let bdb = Bdb::new(
        log,
        &config.bdb,
        Arc::new(StdDelay),
        backend.bdb_regs()?,
        backend.bdb_window()?,
    )?;
    Ok(bdb)
}

fn open_mux<B: Backend>(log: &Logger, config: &Config, backend: &B) -> anyhow::Result<Mux<B::Regs>> {
    let mux = Mux::new(log, config, Arc::new(StdDelay), Arc::new(backend.i2c_regs()?))?;
    Ok(mux)
}

#[derive(Serialize)]
struct RegisterValue {
    slot: u8,
    address: u32,
    width: usize,
    value: u64,
}

#[derive(Serialize)]
struct I2cData {
    channel: usize,
    addr: u8,
    data: Vec<u8>,
}

#[derive(Serialize, Tabled)]
struct ChannelRow {
    logical: usize,
    physical: u8,
    speed: &'static str,
    modsel: String,
}

fn hex_bytes(data: &[u8]) -> String {
    data.iter().map(|byte| format!("0x{byte:02x}")).join(",")
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_register(json: bool, value: RegisterValue) -> anyhow::Result<()> {
    if json {
        print_json(&value)
    } else {
        let digits = value.width * 2;
        println!(
            "slot {} 0x{:08x}: 0x{:0digits$x}",
            value.slot, value.address, value.value
        );
        Ok(())
    }
}

fn print_i2c_data(json: bool, value: I2cData) -> anyhow::Result<()> {
    if json {
        print_json(&value)
    } else {
        println!(
            "channel {} 0x{:02x}: [{}]",
            value.channel,
            value.addr,
            hex_bytes(&value.data)
        );
        Ok(())
    }
}

fn print_detect(json: bool, channel: usize, found: &[u8]) -> anyhow::Result<()> {
    if json {
        return print_json(&found);
    }
    println!("channel {channel}");
    println!("    {}", (0..16).map(|col| format!("{col:>2x}")).join(" "));
    for row in (0..0x80u8).step_by(16) {
        let cells = (row..row + 16)
            .map(|addr| {
                if !(0x03..=0x77).contains(&addr) {
                    String::from("  ")
                } else if found.contains(&addr) {
                    format!("{addr:02x}")
                } else {
                    String::from("--")
                }
            })
            .join(" ");
        println!("{row:02x}: {cells}");
    }
    Ok(())
}

async fn run<B: Backend>(args: Args, log: Logger, config: Config, backend: B) -> anyhow::Result<()> {
    match args.cmd {
        Cmd::BdbRead {
            slot,
            address,
            width,
        } => {
            let bdb = open_bdb(&log, &config, &backend)?;
            let value = bdb.read(slot, address, width)?;
            print_register(
                args.json,
                RegisterValue {
                    slot,
                    address,
                    width: width.bytes(),
                    value,
                },
            )?;
        }
        Cmd::BdbWrite {
            slot,
            address,
            value,
            width,
        } => {
            let bdb = open_bdb(&log, &config, &backend)?;
            bdb.write_word(slot, address, width, value)?;
        }
        Cmd::BdbWriteBlock {
            slot,
            address,
            data,
        } => {
            let bdb = open_bdb(&log, &config, &backend)?;
            bdb.write(slot, address, &data)?;
        }
        Cmd::IprocRead { slot, address } => {
            let iproc = Iproc::new(&log, Arc::new(open_bdb(&log, &config, &backend)?));
            let value = iproc.read(slot, address)?;
            print_register(
                args.json,
                RegisterValue {
                    slot,
                    address,
                    width: 4,
                    value: u64::from(value),
                },
            )?;
        }
        Cmd::IprocWrite {
            slot,
            address,
            value,
        } => {
            let iproc = Iproc::new(&log, Arc::new(open_bdb(&log, &config, &backend)?));
            iproc.write(slot, address, value)?;
        }
        Cmd::I2cRead {
            channel,
            addr,
            len,
            offset,
        } => {
            let mut mux = open_mux(&log, &config, &backend)?;
            let mut data = vec![0; len];
            match offset {
                Some(offset) => {
                    let reg = [offset];
                    let mut msgs = [
                        Msg::Write { addr, data: &reg },
                        Msg::Read {
                            addr,
                            buf: &mut data,
                        },
                    ];
                    mux.transfer(channel, &mut msgs)?;
                }
                None => {
                    let mut msgs = [Msg::Read {
                        addr,
                        buf: &mut data,
                    }];
                    mux.transfer(channel, &mut msgs)?;
                }
            }
            print_i2c_data(
                args.json,
                I2cData {
                    channel,
                    addr,
                    data,
                },
            )?;
        }
        Cmd::I2cWrite {
            channel,
            addr,
            data,
        } => {
            let mut mux = open_mux(&log, &config, &backend)?;
            let mut msgs = [Msg::Write { addr, data: &data }];
            mux.transfer(channel, &mut msgs)?;
        }
        Cmd::I2cDetect { channel } => {
            let mut mux = open_mux(&log, &config, &backend)?;
            mux.select(channel)?;
            let mut found = Vec::new();
            for addr in 0x03..=0x77 {
                if mux.controller().probe(addr)? {
                    found.push(addr);
                }
            }
            mux.deselect();
            print_detect(args.json, channel, &found)?;
        }
        Cmd::Modsel { line, clear } => {
            // Opened without the mux, which would deassert every line.
            let bank = ModselBank::new(
                &log,
                Arc::new(backend.i2c_regs()?),
                Arc::new(StdDelay),
                config.i2c.modsel_settle,
            );
            if clear {
                bank.deassert_all();
            } else if let Some(line) = line {
                bank.select(line)?;
            }
            let asserted = bank.asserted().to_indices().collect::<Vec<_>>();
            if args.json {
                print_json(&asserted)?;
            } else {
                println!("asserted: [{}]", asserted.iter().join(","));
            }
        }
        Cmd::Channels => {
            let variant = config.variant.config();
            let rows = variant
                .channels
                .iter()
                .enumerate()
                .map(|(logical, map)| ChannelRow {
                    logical,
                    physical: map.physical,
                    speed: if variant.is_fast(map.physical) {
                        "400k"
                    } else {
                        "100k"
                    },
                    modsel: map.modsel.map(|line| line.to_string()).unwrap_or_default(),
                })
                .collect::<Vec<_>>();
            if args.json {
                print_json(&rows)?;
            } else {
                println!("{}", variant.name);
                let mut table = Table::new(rows);
                table.with(Style::psql());
                println!("{table}");
            }
        }
        Cmd::Serve => {
            let bdb = Arc::new(open_bdb(&log, &config, &backend)?);
            let present = bdb.init();
            info!(log, "BDB initialized"; "present" => format!("0x{present:08x}"));
            let handler = Arc::new(IoctlHandler::new(&log, bdb));
            // A stale socket from a previous run would fail the bind.
            let _ = std::fs::remove_file(&args.server);
            let server = Server::bind(&log, &args.server, handler)?;
            server.run().await?;
        }
        Cmd::Call { request } => {
            call(&log, &args.server, args.n_retries, args.retry_interval, args.json, request).await?;
        }
    }
    Ok(())
}

async fn call(
    log: &Logger,
    server: &Path,
    n_retries: Option<usize>,
    retry_interval: u64,
    json: bool,
    request: Request,
) -> anyhow::Result<()> {
    let local = std::env::temp_dir().join(format!("fpgactl-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&local);
    let mut client = Client::connect(log, server, &local)
        .with_context(|| format!("connecting to {}", server.display()))?
        .retry_interval(Duration::from_millis(retry_interval));
    if let Some(n) = n_retries {
        client = client.n_retries(n);
    }

    let res = async {
        match request {
            Request::Version => {
                let version = client.version().await?;
                if json {
                    print_json(&version)?;
                } else {
                    println!("{version}");
                }
            }
            Request::BdbInit => {
                let present = client.bdb_init().await?;
                if json {
                    print_json(&present)?;
                } else {
                    println!("0x{present:08x}");
                }
            }
            Request::BdbRead {
                slot,
                address,
                width,
            } => {
                let value = client.bdb_read(slot, address, width).await?;
                print_register(
                    json,
                    RegisterValue {
                        slot,
                        address,
                        width: width.bytes(),
                        value,
                    },
                )?;
            }
            Request::BdbWrite {
                slot,
                address,
                value,
                width,
            } => client.bdb_write_word(slot, address, width, value).await?,
            Request::IprocRead { slot, address } => {
                let value = client.iproc_read(slot, address).await?;
                print_register(
                    json,
                    RegisterValue {
                        slot,
                        address,
                        width: 4,
                        value: u64::from(value),
                    },
                )?;
            }
            Request::IprocWrite {
                slot,
                address,
                value,
            } => client.iproc_write(slot, address, value).await?,
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;
    let _ = std::fs::remove_file(&local);
    res
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ConfigBuilder::new(args.variant).build()?;

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, args.log_level).fuse();
    let log = slog::Logger::root(drain, slog::o!());

    if args.simulate {
        let backend = Simulated::new(args.variant);
        run(args, log, config, backend).await
    } else {
        let backend = Hardware {
            resource: args.resource.clone(),
            window: args.window.clone(),
            bdb_offset: args.bdb_offset,
            i2c_offset: args.i2c_offset,
        };
        run(args, log, config, backend).await
    }
}
