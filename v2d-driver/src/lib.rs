// Vintage2D accelerator driver core
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Control core of a driver for the Vintage2D 2D accelerator.
//!
//! Clients open a [`Context`] on a device, give it canvas dimensions and
//! write a stream of drawing commands. The core validates each command
//! against the context's canvas and setup history, arbitrates the single
//! drawing unit between contexts, feeds it through a ring of commands in DMA
//! memory and waits for completion through interrupts.

use std::io;

use thiserror::Error as ThisError;

pub mod canvas;
pub mod command;
pub mod context;
pub mod device;
pub mod dma;
pub mod driver;
pub mod history;
pub mod hw;
pub mod irq;
pub mod ring;
#[cfg(feature = "simulated")]
pub mod sim;

pub use context::{Context, SetDimensions};
pub use device::{Device, DeviceConfig};
pub use driver::{DriverConfig, V2dDriver};
pub use history::ValidationError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
/// Errors returned to driver clients.
pub enum Error {
    #[error("Invalid canvas dimensions {0}x{1}")]
    InvalidDimensions(u16, u16),
    #[error("Canvas dimensions already set")]
    AlreadyInitialized,
    #[error("Canvas dimensions not set")]
    CanvasNotInitialized,
    #[error("Rejected command: {0}")]
    Validation(#[from] ValidationError),
    #[error("Command stream length {0} is not a multiple of 4")]
    InvalidStreamLength(usize),
    #[error("Request payload of {0} bytes, expected 4")]
    BadPayload(usize),
    #[error("Unknown request {0:#x}")]
    UnknownRequest(u32),
    #[error("Out of DMA memory")]
    OutOfMemory,
    #[error("DMA memory error: {0}")]
    Dma(dma::Error),
    #[error("Device is gone")]
    NoDevice,
    #[error("Device fault: {0}")]
    DeviceFault(String),
    #[error("Page {0} is outside of the canvas mapping")]
    PageOutOfRange(usize),
    #[error("All {0} device minors are in use")]
    TooManyDevices(u32),
    #[error("No device with minor {0}")]
    UnknownDevice(u32),
    #[error("Failed to read command stream: {0}")]
    StreamRead(io::Error),
    #[error("Failed to create eventfd: {0}")]
    EventFdCreate(io::Error),
    #[error("Failed to create an epoll fd: {0}")]
    EpollFdCreate(io::Error),
    #[error("Failed to add to epoll: {0}")]
    EpollAdd(io::Error),
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(io::Error),
}

impl From<dma::Error> for Error {
    fn from(e: dma::Error) -> Self {
        match e {
            dma::Error::OutOfFrames => Error::OutOfMemory,
            e => Error::Dma(e),
        }
    }
}

impl Error {
    /// The errno a character device would return for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidDimensions(..)
            | Error::AlreadyInitialized
            | Error::CanvasNotInitialized
            | Error::Validation(_)
            | Error::InvalidStreamLength(_) => libc::EINVAL,
            Error::OutOfMemory | Error::TooManyDevices(_) => libc::ENOMEM,
            Error::NoDevice | Error::UnknownDevice(_) => libc::ENODEV,
            Error::UnknownRequest(_) => libc::ENOTTY,
            Error::BadPayload(_)
            | Error::Dma(_)
            | Error::DeviceFault(_)
            | Error::PageOutOfRange(_)
            | Error::StreamRead(_)
            | Error::EventFdCreate(_)
            | Error::EpollFdCreate(_)
            | Error::EpollAdd(_)
            | Error::ThreadSpawn(_) => libc::EFAULT,
        }
    }
}
