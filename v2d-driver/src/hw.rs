// Vintage2D hardware interface
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Register map, register bit sets and the command word format the
//! accelerator fetches from the command ring.
//!
//! Everything in this module describes the device side of the bus. The
//! client-facing command encoding lives in [`crate::command`].

use bitflags::bitflags;
use vmm_sys_util::eventfd::EventFd;

/// Size of a canvas page, a page-table frame and the ring page.
pub const PAGE_SIZE: usize = 4096;

pub const REG_ENABLE: u32 = 0x000;
pub const REG_INTR: u32 = 0x008;
pub const REG_INTR_ENABLE: u32 = 0x00c;
pub const REG_RESET: u32 = 0x010;
pub const REG_COUNTER: u32 = 0x014;
pub const REG_CMD_READ_PTR: u32 = 0x018;
pub const REG_CMD_WRITE_PTR: u32 = 0x01c;

bitflags! {
    /// Bits of the ENABLE register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Enable: u32 {
        const DRAW = 0x01;
        const FETCH_CMD = 0x04;
    }
}

bitflags! {
    /// Interrupt causes, shared by the INTR and INTR_ENABLE registers.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Intr: u32 {
        const NOTIFY = 0x01;
        const INVALID_CMD = 0x02;
        const PAGE_FAULT = 0x04;
        const CANVAS_OVERFLOW = 0x08;
        const FIFO_OVERFLOW = 0x10;
    }
}

bitflags! {
    /// Bits of the RESET register.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Reset: u32 {
        const DRAW = 0x01;
        const FIFO = 0x02;
        const TLB = 0x08;
    }
}

/// Page-table entry valid bit. The remaining bits hold the page's bus
/// address.
pub const PTE_VALID: u32 = 0x1;
const PTE_ADDR_MASK: u32 = !(PAGE_SIZE as u32 - 1);

pub fn pte(bus_addr: u32) -> u32 {
    (bus_addr & PTE_ADDR_MASK) | PTE_VALID
}

/// Returns the page bus address of a valid entry.
pub fn pte_addr(entry: u32) -> Option<u32> {
    (entry & PTE_VALID != 0).then_some(entry & PTE_ADDR_MASK)
}

const KIND_MASK: u32 = 0x3;
const KIND_CMD: u32 = 0x0;
const KIND_CMD_NOTIFY: u32 = 0x1;
const KIND_JUMP: u32 = 0x2;

const TYPE_MASK: u32 = 0xfc;
const TYPE_CANVAS_PT: u32 = 0x00;
const TYPE_CANVAS_DIMS: u32 = 0x04;
const TYPE_SRC_POS: u32 = 0x08;
const TYPE_DST_POS: u32 = 0x0c;
const TYPE_FILL_COLOR: u32 = 0x10;
const TYPE_DO_BLIT: u32 = 0x14;
const TYPE_DO_FILL: u32 = 0x18;
const TYPE_COUNTER: u32 = 0x1c;

const FIELD_MASK: u32 = 0x7ff;
const COUNTER_MASK: u32 = 0x00ff_ffff;

/// A command as the accelerator executes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwCommand {
    /// Bus address of the canvas page table.
    CanvasPageTable(u32),
    CanvasDims { width: u16, height: u16 },
    SrcPos { x: u16, y: u16 },
    DstPos { x: u16, y: u16 },
    FillColor(u8),
    DoBlit { width: u16, height: u16 },
    DoFill { width: u16, height: u16 },
    /// Stores its payload in the COUNTER register once every earlier command
    /// has completed.
    Counter(u32),
}

/// One decoded ring slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HwWord {
    Command { cmd: HwCommand, notify: bool },
    Jump(u32),
}

fn pos(x: u16, y: u16) -> u32 {
    (u32::from(x) & FIELD_MASK) << 8 | (u32::from(y) & FIELD_MASK) << 20
}

fn size(width: u16, height: u16) -> u32 {
    pos(width.wrapping_sub(1), height.wrapping_sub(1))
}

fn field_x(word: u32) -> u16 {
    (word >> 8 & FIELD_MASK) as u16
}

fn field_y(word: u32) -> u16 {
    (word >> 20 & FIELD_MASK) as u16
}

impl HwCommand {
    /// Encodes the command into a ring word, requesting a NOTIFY interrupt
    /// once it has executed when `notify` is set.
    pub fn encode(self, notify: bool) -> u32 {
        let body = match self {
            Self::CanvasPageTable(addr) => TYPE_CANVAS_PT | (addr & PTE_ADDR_MASK),
            Self::CanvasDims { width, height } => TYPE_CANVAS_DIMS | size(width, height),
            Self::SrcPos { x, y } => TYPE_SRC_POS | pos(x, y),
            Self::DstPos { x, y } => TYPE_DST_POS | pos(x, y),
            Self::FillColor(color) => TYPE_FILL_COLOR | u32::from(color) << 8,
            Self::DoBlit { width, height } => TYPE_DO_BLIT | size(width, height),
            Self::DoFill { width, height } => TYPE_DO_FILL | size(width, height),
            Self::Counter(value) => TYPE_COUNTER | (value & COUNTER_MASK) << 8,
        };

        let kind = if notify { KIND_CMD_NOTIFY } else { KIND_CMD };
        body | kind
    }

    /// Whether the driver asks for a completion interrupt after this command.
    ///
    /// Only draws and sync markers do; setup commands never do.
    pub fn wants_notify(self) -> bool {
        matches!(
            self,
            Self::DoBlit { .. } | Self::DoFill { .. } | Self::Counter(_)
        )
    }
}

impl HwWord {
    pub fn jump(target: u32) -> u32 {
        (target & !KIND_MASK) | KIND_JUMP
    }

    pub fn decode(word: u32) -> Option<Self> {
        let notify = match word & KIND_MASK {
            KIND_CMD => false,
            KIND_CMD_NOTIFY => true,
            KIND_JUMP => return Some(Self::Jump(word & !KIND_MASK)),
            _ => return None,
        };

        let w = field_x(word) + 1;
        let h = field_y(word) + 1;
        let cmd = match word & TYPE_MASK {
            TYPE_CANVAS_PT => HwCommand::CanvasPageTable(word & PTE_ADDR_MASK),
            TYPE_CANVAS_DIMS => HwCommand::CanvasDims {
                width: w,
                height: h,
            },
            TYPE_SRC_POS => HwCommand::SrcPos {
                x: field_x(word),
                y: field_y(word),
            },
            TYPE_DST_POS => HwCommand::DstPos {
                x: field_x(word),
                y: field_y(word),
            },
            TYPE_FILL_COLOR => HwCommand::FillColor((word >> 8) as u8),
            TYPE_DO_BLIT => HwCommand::DoBlit {
                width: w,
                height: h,
            },
            TYPE_DO_FILL => HwCommand::DoFill {
                width: w,
                height: h,
            },
            TYPE_COUNTER => HwCommand::Counter(word >> 8),
            _ => return None,
        };

        Some(Self::Command { cmd, notify })
    }
}

/// Trait that represents the accelerator's register block and interrupt line.
///
/// The production implementation maps BAR0 of the PCI function; the
/// simulated one in [`crate::sim`] lets the core run without hardware.
pub trait V2dHardware: Send + Sync + 'static {
    fn read_reg(&self, offset: u32) -> u32;
    fn write_reg(&self, offset: u32, value: u32);

    /// Event signalled every time the device raises its interrupt line.
    fn irq_event(&self) -> &EventFd;
}
