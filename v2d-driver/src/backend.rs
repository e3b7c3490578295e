// Vintage2D command stream replay
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fs::{self, File},
    io::BufReader,
    num::ParseIntError,
    path::PathBuf,
    process::exit,
    sync::Arc,
    thread::{spawn, JoinHandle},
};

use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use thiserror::Error as ThisError;
use v2d_driver::{
    dma::{self, DmaMemory},
    driver::MAX_DEVICES,
    hw::PAGE_SIZE,
    sim::{SimWorker, SimulatedV2d},
    DeviceConfig, DriverConfig, SetDimensions, V2dDriver,
};

/// Bus address of the first device's DMA memory.
const DMA_BASE: u64 = 0x1000_0000;
const DMA_LIMIT: u64 = 1 << 32;

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
/// Errors related to the replay front end
pub(crate) enum Error {
    #[error("Invalid device count: {0}")]
    DeviceCountInvalid(u32),
    #[error("Invalid DMA page count: {0}")]
    DmaPagesInvalid(usize),
    #[error("Invalid client description: {0}")]
    ClientInvalid(String),
    #[error("Failed while parsing to integer: {0:?}")]
    ParseFailure(ParseIntError),
    #[error("Client refers to missing device {0}")]
    ClientDeviceMissing(u32),
    #[error("Could not create DMA memory: {0}")]
    CouldNotCreateDma(dma::Error),
    #[error("Could not create simulated device: {0}")]
    CouldNotCreateDevice(v2d_driver::Error),
    #[error("Could not attach device: {0}")]
    CouldNotAttach(v2d_driver::Error),
    #[error("Could not open command stream {0:?}: {1}")]
    CouldNotOpenStream(PathBuf, std::io::Error),
    #[error("Client {0} failed: {1}")]
    ClientFailed(usize, v2d_driver::Error),
    #[error("Could not dump canvas: {0}")]
    DumpFailed(std::io::Error),
}

const V2D_AFTER_HELP: &str = "Each client is given as <minor>:<width>x<height>:<stream>, where \
                              <stream> is a file of little-endian 32-bit command words. \
                              Example, \"-c 0:64x64:a.bin -c 0:128x128:b.bin\"\n";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None, after_help = V2D_AFTER_HELP)]
struct V2dArgs {
    /// Number of simulated devices to attach.
    #[clap(short = 'd', long, default_value_t = 1)]
    devices: u32,

    /// DMA page frames available to each device.
    #[clap(short = 'p', long, default_value_t = 4096)]
    dma_pages: usize,

    /// Wait for each draw to complete before taking the next command.
    #[clap(long)]
    sync_every_draw: bool,

    /// Client session to replay, may be repeated.
    #[clap(short = 'c', long = "client", required = true)]
    clients: Vec<String>,

    /// Directory receiving a raw dump of every client canvas.
    #[clap(long)]
    dump_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
struct ClientSpec {
    minor: u32,
    width: u16,
    height: u16,
    stream: PathBuf,
}

impl TryFrom<&str> for ClientSpec {
    type Error = Error;

    fn try_from(desc: &str) -> Result<Self> {
        let invalid = || Error::ClientInvalid(desc.to_string());

        let mut parts = desc.splitn(3, ':');
        let (minor, dims, stream) = match (parts.next(), parts.next(), parts.next()) {
            (Some(minor), Some(dims), Some(stream)) if !stream.is_empty() => (minor, dims, stream),
            _ => return Err(invalid()),
        };
        let (width, height) = dims.split_once('x').ok_or_else(invalid)?;

        Ok(ClientSpec {
            minor: minor.parse().map_err(Error::ParseFailure)?,
            width: width.parse().map_err(Error::ParseFailure)?,
            height: height.parse().map_err(Error::ParseFailure)?,
            stream: PathBuf::from(stream),
        })
    }
}

#[derive(Debug, PartialEq)]
struct V2dConfiguration {
    driver: DriverConfig,
    dma_pages: usize,
    clients: Vec<ClientSpec>,
    dump_dir: Option<PathBuf>,
}

impl TryFrom<V2dArgs> for V2dConfiguration {
    type Error = Error;

    fn try_from(args: V2dArgs) -> Result<Self> {
        if args.devices == 0 || args.devices > MAX_DEVICES {
            return Err(Error::DeviceCountInvalid(args.devices));
        }

        // Each device needs its ring page plus room for a canvas, and every
        // pool must stay below 4 GiB.
        let span = u64::from(args.devices) * args.dma_pages as u64 * PAGE_SIZE as u64;
        if args.dma_pages < 3 || DMA_BASE + span > DMA_LIMIT {
            return Err(Error::DmaPagesInvalid(args.dma_pages));
        }

        let clients = args
            .clients
            .iter()
            .map(|desc| ClientSpec::try_from(desc.as_str()))
            .collect::<Result<Vec<_>>>()?;

        if let Some(client) = clients.iter().find(|c| c.minor >= args.devices) {
            return Err(Error::ClientDeviceMissing(client.minor));
        }

        Ok(V2dConfiguration {
            driver: DriverConfig {
                max_devices: args.devices,
                device: DeviceConfig {
                    sync_every_draw: args.sync_every_draw,
                },
            },
            dma_pages: args.dma_pages,
            clients,
            dump_dir: args.dump_dir,
        })
    }
}

/// 32-bit FNV-1a, used to report canvas contents compactly.
fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0x811c_9dc5, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(0x0100_0193)
    })
}

fn run_client(
    driver: &V2dDriver,
    index: usize,
    client: &ClientSpec,
    dump_dir: Option<&PathBuf>,
) -> Result<u32> {
    let failed = |e| Error::ClientFailed(index, e);

    let ctx = driver.open(client.minor).map_err(failed)?;
    ctx.set_dimensions(SetDimensions {
        width: client.width,
        height: client.height,
    })
    .map_err(failed)?;

    let file = File::open(&client.stream)
        .map_err(|e| Error::CouldNotOpenStream(client.stream.clone(), e))?;
    let len = ctx.write_from(BufReader::new(file)).map_err(failed)?;
    ctx.fsync().map_err(failed)?;

    let pixels = ctx.read_canvas().map_err(failed)?;
    let sum = checksum(&pixels);
    info!(
        "client {index}: {} commands on v2d{}, canvas {}x{} checksum {sum:08x}",
        len / 4,
        client.minor,
        client.width,
        client.height
    );

    if let Some(dir) = dump_dir {
        let path = dir.join(format!("client{index}-{}x{}.raw", client.width, client.height));
        fs::write(path, &pixels).map_err(Error::DumpFailed)?;
    }

    ctx.close().map_err(failed)?;
    Ok(sum)
}

fn start_backend(args: V2dArgs) -> Result<Vec<u32>> {
    let config = V2dConfiguration::try_from(args)?;
    let driver = Arc::new(V2dDriver::new(config.driver));
    let mut workers: Vec<SimWorker> = Vec::new();

    for i in 0..config.driver.max_devices {
        let base = DMA_BASE + u64::from(i) * (config.dma_pages * PAGE_SIZE) as u64;
        let dma = DmaMemory::new(base, config.dma_pages).map_err(Error::CouldNotCreateDma)?;
        let sim = Arc::new(SimulatedV2d::new(dma.clone()).map_err(Error::CouldNotCreateDevice)?);

        workers.push(sim.start().map_err(Error::CouldNotCreateDevice)?);
        driver.attach(sim, dma).map_err(Error::CouldNotAttach)?;
    }

    let mut handles = Vec::new();
    for (index, client) in config.clients.into_iter().enumerate() {
        let driver = driver.clone();
        let dump_dir = config.dump_dir.clone();

        let handle: JoinHandle<Result<u32>> =
            spawn(move || run_client(&driver, index, &client, dump_dir.as_ref()));
        handles.push(handle);
    }

    // Join every client before reporting the first failure.
    let results: Vec<Result<u32>> = handles
        .into_iter()
        .map(|handle| handle.join().map_err(std::panic::resume_unwind).unwrap())
        .collect();

    for minor in driver.minors() {
        if let Ok(device) = driver.device(minor) {
            let faults = device.faults();
            if faults.total() != 0 {
                warn!("v2d{minor}: hardware faults {faults:?}");
            }
        }
    }

    results.into_iter().collect()
}

pub(crate) fn v2d_init() {
    let env = Env::default().filter_or("RUST_LOG", "info");
    env_logger::init_from_env(env);

    if let Err(e) = start_backend(V2dArgs::parse()) {
        error!("Fatal error: {e}");
        exit(1);
    }
}
