// Command ring
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Single-producer circular command queue in one DMA page.
//!
//! Slot `RING_SLOTS - 1` permanently holds a jump back to slot 0, so the
//! usable positions are `0..RING_SLOTS - 1`. The device consumes from
//! CMD_READ_PTR, the driver publishes through CMD_WRITE_PTR. One position is
//! always left free so a full ring never looks empty.

use log::debug;

use crate::{
    dma::{DmaFrame, DmaMemory},
    hw::{HwWord, V2dHardware, PAGE_SIZE, REG_CMD_READ_PTR, REG_CMD_WRITE_PTR},
    Error, Result,
};

pub const RING_SLOTS: usize = PAGE_SIZE / 4;
const JUMP_SLOT: usize = RING_SLOTS - 1;

/// Most commands ever outstanding at once.
pub const RING_MAX_OCCUPANCY: usize = RING_SLOTS - 2;

pub struct CommandRing {
    dma: DmaMemory,
    frame: DmaFrame,
}

impl CommandRing {
    pub fn new(dma: &DmaMemory) -> Result<Self> {
        Ok(Self {
            dma: dma.clone(),
            frame: dma.alloc_frame()?,
        })
    }

    pub fn base(&self) -> u32 {
        self.frame.bus_addr()
    }

    /// Installs the jump slot and points both cursors at slot 0.
    pub fn reset(&self, hw: &dyn V2dHardware) -> Result<()> {
        self.dma
            .write_u32(self.slot_addr(JUMP_SLOT), HwWord::jump(self.base()))?;
        hw.write_reg(REG_CMD_READ_PTR, self.base());
        hw.write_reg(REG_CMD_WRITE_PTR, self.base());
        debug!("command ring at {:#x}", self.base());
        Ok(())
    }

    fn slot_addr(&self, slot: usize) -> u32 {
        self.base() + 4 * slot as u32
    }

    fn slot_of(&self, reg: u32, hw: &dyn V2dHardware) -> Result<usize> {
        let ptr = hw.read_reg(reg);
        let offset = ptr.wrapping_sub(self.base()) as usize;
        if offset % 4 != 0 || offset / 4 >= RING_SLOTS {
            return Err(Error::DeviceFault(format!(
                "ring pointer {reg:#x} = {ptr:#x} outside of ring at {:#x}",
                self.base()
            )));
        }

        // Sitting on the jump slot is the same position as slot 0.
        Ok((offset / 4) % JUMP_SLOT)
    }

    /// Commands published but not yet fetched by the device.
    pub fn occupancy(&self, hw: &dyn V2dHardware) -> Result<usize> {
        let read = self.slot_of(REG_CMD_READ_PTR, hw)?;
        let write = self.slot_of(REG_CMD_WRITE_PTR, hw)?;
        Ok(if read <= write {
            write - read
        } else {
            write + JUMP_SLOT - read
        })
    }

    /// Whether one more word can be pushed without filling the ring.
    pub fn has_room(&self, hw: &dyn V2dHardware) -> Result<bool> {
        Ok(self.occupancy(hw)? + 1 < JUMP_SLOT)
    }

    /// Writes `word` at the write cursor and publishes it. The caller must
    /// have checked [`Self::has_room`].
    pub fn push(&self, hw: &dyn V2dHardware, word: u32) -> Result<()> {
        let slot = self.slot_of(REG_CMD_WRITE_PTR, hw)?;
        self.dma.write_u32(self.slot_addr(slot), word)?;
        hw.write_reg(REG_CMD_WRITE_PTR, self.slot_addr((slot + 1) % JUMP_SLOT));
        Ok(())
    }
}
