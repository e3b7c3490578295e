// Device-addressable memory
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Pool of page frames the accelerator can reach over the bus.
//!
//! The pool is a single `vm-memory` region placed at a bus base address
//! below 4 GiB, split into [`PAGE_SIZE`] frames. The same memory object is
//! shared with whoever plays the device side, so both see identical bytes
//! at identical bus addresses.

use std::sync::{Arc, Mutex};

use log::debug;
use thiserror::Error as ThisError;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryError, GuestMemoryMmap, Le32};

use crate::hw::PAGE_SIZE;

/// Highest bus address the device can generate plus one.
const DMA_LIMIT: u64 = 1 << 32;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
/// Errors related to DMA memory.
pub enum Error {
    #[error("DMA base {0:#x} is not page aligned")]
    UnalignedBase(u64),
    #[error("DMA range {0:#x}+{1} pages does not fit the 32-bit bus")]
    OutOfBusRange(u64, usize),
    #[error("Could not create DMA memory: {0}")]
    CreateFailed(String),
    #[error("No free DMA page frame")]
    OutOfFrames,
    #[error("DMA memory access failed: {0}")]
    Access(#[from] GuestMemoryError),
}

struct DmaPool {
    mem: GuestMemoryMmap,
    base: GuestAddress,
    frames: usize,
    // Indices of free frames, lowest address last.
    free: Mutex<Vec<usize>>,
}

/// Shared handle to the device-addressable memory of one device.
#[derive(Clone)]
pub struct DmaMemory {
    pool: Arc<DmaPool>,
}

impl std::fmt::Debug for DmaMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaMemory")
            .field("base", &self.pool.base)
            .field("frames", &self.pool.frames)
            .finish_non_exhaustive()
    }
}

impl DmaMemory {
    pub fn new(base: u64, frames: usize) -> Result<Self> {
        if base % PAGE_SIZE as u64 != 0 {
            return Err(Error::UnalignedBase(base));
        }

        let len = frames as u64 * PAGE_SIZE as u64;
        if frames == 0 || base.checked_add(len).map_or(true, |end| end > DMA_LIMIT) {
            return Err(Error::OutOfBusRange(base, frames));
        }

        let mem = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(base), len as usize)])
            .map_err(|e| Error::CreateFailed(e.to_string()))?;

        debug!("DMA memory at {base:#x}, {frames} frames");

        Ok(Self {
            pool: Arc::new(DmaPool {
                mem,
                base: GuestAddress(base),
                frames,
                free: Mutex::new((0..frames).rev().collect()),
            }),
        })
    }

    /// Takes a zeroed frame from the pool. The frame returns to the pool when
    /// dropped.
    pub fn alloc_frame(&self) -> Result<DmaFrame> {
        let index = self
            .pool
            .free
            .lock()
            .unwrap()
            .pop()
            .ok_or(Error::OutOfFrames)?;

        let frame = DmaFrame {
            pool: self.pool.clone(),
            addr: self.pool.base.unchecked_add((index * PAGE_SIZE) as u64),
        };

        // A failed write drops `frame`, which puts the index back.
        self.pool.mem.write_slice(&[0u8; PAGE_SIZE], frame.addr)?;

        Ok(frame)
    }

    pub fn total_frames(&self) -> usize {
        self.pool.frames
    }

    pub fn free_frames(&self) -> usize {
        self.pool.free.lock().unwrap().len()
    }

    /// The backing memory, as seen from the bus.
    pub fn memory(&self) -> &GuestMemoryMmap {
        &self.pool.mem
    }

    pub fn read_u32(&self, bus_addr: u32) -> Result<u32> {
        let val: Le32 = self.pool.mem.read_obj(GuestAddress(u64::from(bus_addr)))?;
        Ok(val.into())
    }

    pub fn write_u32(&self, bus_addr: u32, val: u32) -> Result<()> {
        self.pool
            .mem
            .write_obj(Le32::from(val), GuestAddress(u64::from(bus_addr)))?;
        Ok(())
    }

    pub fn read(&self, bus_addr: u32, buf: &mut [u8]) -> Result<()> {
        self.pool
            .mem
            .read_slice(buf, GuestAddress(u64::from(bus_addr)))?;
        Ok(())
    }

    pub fn write(&self, bus_addr: u32, buf: &[u8]) -> Result<()> {
        self.pool
            .mem
            .write_slice(buf, GuestAddress(u64::from(bus_addr)))?;
        Ok(())
    }
}

/// One page frame owned by the driver.
pub struct DmaFrame {
    pool: Arc<DmaPool>,
    addr: GuestAddress,
}

impl DmaFrame {
    pub fn addr(&self) -> GuestAddress {
        self.addr
    }

    /// Bus address as programmed into the device. The pool never extends
    /// past 4 GiB, so this is lossless.
    pub fn bus_addr(&self) -> u32 {
        self.addr.raw_value() as u32
    }
}

impl std::fmt::Debug for DmaFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DmaFrame")
            .field(&format_args!("{:#x}", self.addr.raw_value()))
            .finish()
    }
}

impl Drop for DmaFrame {
    fn drop(&mut self) {
        let index = ((self.addr.raw_value() - self.pool.base.raw_value()) as usize) / PAGE_SIZE;
        self.pool.free.lock().unwrap().push(index);
    }
}
