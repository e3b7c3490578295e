// Simulated Vintage2D accelerator
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Software model of the accelerator, used to run the driver core without
//! hardware.
//!
//! The model fetches ring words from the same DMA memory the driver writes,
//! executes fills and blits through the loaded page table and raises
//! interrupts through an eventfd. It can be stepped by hand, which keeps ring
//! occupancy deterministic, or driven by a worker thread.

use std::{
    ops::Range,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle},
};

use log::{debug, trace, warn};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::{
    dma::DmaMemory,
    hw::{
        pte_addr, Enable, HwCommand, HwWord, Intr, Reset, V2dHardware, PAGE_SIZE, REG_CMD_READ_PTR,
        REG_CMD_WRITE_PTR, REG_COUNTER, REG_ENABLE, REG_INTR, REG_INTR_ENABLE, REG_RESET,
    },
    Error, Result,
};

const PAGE_TABLE_ENTRIES: usize = PAGE_SIZE / 4;

/// Outcome of a device operation; the error is the interrupt it raises.
type Fault<T> = std::result::Result<T, Intr>;

#[derive(Default)]
struct DrawState {
    page_table: Option<u32>,
    dims: Option<(u16, u16)>,
    src: (u16, u16),
    dst: (u16, u16),
    color: u8,
}

#[derive(Default)]
struct SimState {
    enable: Enable,
    intr: Intr,
    intr_enable: Intr,
    counter: u32,
    read_ptr: u32,
    write_ptr: u32,
    draw: DrawState,
    executed: Vec<HwCommand>,
    resets: Vec<Reset>,
    shutdown: bool,
}

impl SimState {
    fn can_fetch(&self) -> bool {
        self.enable.contains(Enable::DRAW | Enable::FETCH_CMD) && self.read_ptr != self.write_ptr
    }
}

/// The canvas as the device sees it: a linear byte range scattered over
/// pages listed in a page table.
struct CanvasView<'a> {
    dma: &'a DmaMemory,
    page_table: u32,
}

impl CanvasView<'_> {
    fn translate(&self, offset: usize) -> Fault<u32> {
        let index = offset / PAGE_SIZE;
        if index >= PAGE_TABLE_ENTRIES {
            return Err(Intr::PAGE_FAULT);
        }

        let entry = self
            .dma
            .read_u32(self.page_table + 4 * index as u32)
            .map_err(|_| Intr::PAGE_FAULT)?;
        let page = pte_addr(entry).ok_or(Intr::PAGE_FAULT)?;
        Ok(page + (offset % PAGE_SIZE) as u32)
    }

    /// Splits `[offset, offset + len)` at page boundaries.
    fn for_each_span<F>(&self, offset: usize, len: usize, mut f: F) -> Fault<()>
    where
        F: FnMut(u32, Range<usize>) -> Fault<()>,
    {
        let mut done = 0;
        while done < len {
            let at = offset + done;
            let chunk = (PAGE_SIZE - at % PAGE_SIZE).min(len - done);
            f(self.translate(at)?, done..done + chunk)?;
            done += chunk;
        }
        Ok(())
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Fault<()> {
        let dma = self.dma;
        self.for_each_span(offset, buf.len(), |addr, range| {
            dma.read(addr, &mut buf[range]).map_err(|_| Intr::PAGE_FAULT)
        })
    }

    fn write(&self, offset: usize, buf: &[u8]) -> Fault<()> {
        let dma = self.dma;
        self.for_each_span(offset, buf.len(), |addr, range| {
            dma.write(addr, &buf[range]).map_err(|_| Intr::PAGE_FAULT)
        })
    }
}

impl DrawState {
    fn view<'a>(&self, dma: &'a DmaMemory) -> Fault<(CanvasView<'a>, u16, u16)> {
        match (self.page_table, self.dims) {
            (Some(page_table), Some((width, height))) => {
                Ok((CanvasView { dma, page_table }, width, height))
            }
            _ => Err(Intr::INVALID_CMD),
        }
    }

    fn check_rect(pos: (u16, u16), w: u16, h: u16, width: u16, height: u16) -> Fault<()> {
        if u32::from(pos.0) + u32::from(w) > u32::from(width)
            || u32::from(pos.1) + u32::from(h) > u32::from(height)
        {
            return Err(Intr::CANVAS_OVERFLOW);
        }
        Ok(())
    }

    fn execute(&mut self, cmd: HwCommand, dma: &DmaMemory) -> Fault<()> {
        match cmd {
            HwCommand::CanvasPageTable(addr) => self.page_table = Some(addr),
            HwCommand::CanvasDims { width, height } => self.dims = Some((width, height)),
            HwCommand::SrcPos { x, y } => self.src = (x, y),
            HwCommand::DstPos { x, y } => self.dst = (x, y),
            HwCommand::FillColor(color) => self.color = color,
            HwCommand::DoFill { width: w, height: h } => {
                let (view, width, height) = self.view(dma)?;
                Self::check_rect(self.dst, w, h, width, height)?;

                let row = vec![self.color; usize::from(w)];
                for y in self.dst.1..self.dst.1 + h {
                    let offset = usize::from(y) * usize::from(width) + usize::from(self.dst.0);
                    view.write(offset, &row)?;
                }
            }
            HwCommand::DoBlit { width: w, height: h } => {
                let (view, width, height) = self.view(dma)?;
                Self::check_rect(self.src, w, h, width, height)?;
                Self::check_rect(self.dst, w, h, width, height)?;

                // Copy through a buffer so overlapping rectangles behave.
                let w = usize::from(w);
                let mut rect = vec![0u8; w * usize::from(h)];
                for (i, row) in rect.chunks_mut(w).enumerate() {
                    let y = usize::from(self.src.1) + i;
                    view.read(y * usize::from(width) + usize::from(self.src.0), row)?;
                }
                for (i, row) in rect.chunks(w).enumerate() {
                    let y = usize::from(self.dst.1) + i;
                    view.write(y * usize::from(width) + usize::from(self.dst.0), row)?;
                }
            }
            HwCommand::Counter(_) => {}
        }
        Ok(())
    }
}

/// Simulated accelerator attached to a DMA memory pool.
pub struct SimulatedV2d {
    dma: DmaMemory,
    state: Mutex<SimState>,
    kick: Condvar,
    irq: EventFd,
}

impl SimulatedV2d {
    pub fn new(dma: DmaMemory) -> Result<Self> {
        Ok(Self {
            dma,
            state: Mutex::new(SimState::default()),
            kick: Condvar::new(),
            irq: EventFd::new(EFD_NONBLOCK).map_err(Error::EventFdCreate)?,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    fn raise(&self, state: &mut SimState, intr: Intr) {
        state.intr |= intr;
        if state.intr_enable.intersects(intr) {
            if let Err(e) = self.irq.write(1) {
                warn!("simulated v2d: failed to raise interrupt: {e}");
            }
        }
    }

    /// Fetches and executes one ring word. Returns false when there is
    /// nothing to fetch.
    pub fn step(&self) -> bool {
        let mut state = self.lock();
        if !state.can_fetch() {
            return false;
        }

        let word = match self.dma.read_u32(state.read_ptr) {
            Ok(word) => word,
            Err(e) => {
                warn!("simulated v2d: fetch at {:#x} failed: {e}", state.read_ptr);
                state.enable.remove(Enable::FETCH_CMD);
                self.raise(&mut state, Intr::INVALID_CMD);
                return true;
            }
        };

        match HwWord::decode(word) {
            Some(HwWord::Jump(target)) => state.read_ptr = target,
            Some(HwWord::Command { cmd, notify }) => {
                state.read_ptr += 4;
                trace!("simulated v2d: {cmd:?}");

                let res = state.draw.execute(cmd, &self.dma);
                if let HwCommand::Counter(value) = cmd {
                    state.counter = value;
                }
                state.executed.push(cmd);

                if let Err(fault) = res {
                    debug!("simulated v2d: {cmd:?} raised {fault:?}");
                    self.raise(&mut state, fault);
                }
                if notify {
                    self.raise(&mut state, Intr::NOTIFY);
                }
            }
            None => {
                state.read_ptr += 4;
                self.raise(&mut state, Intr::INVALID_CMD);
            }
        }
        true
    }

    /// Steps until nothing is left to fetch. Returns the number of words
    /// consumed.
    pub fn run_until_idle(&self) -> usize {
        let mut count = 0;
        while self.step() {
            count += 1;
        }
        count
    }

    /// Commands executed so far, oldest first.
    pub fn executed(&self) -> Vec<HwCommand> {
        self.lock().executed.clone()
    }

    /// Writes to the RESET register so far.
    pub fn resets(&self) -> Vec<Reset> {
        self.lock().resets.clone()
    }

    /// Starts consuming the ring on a worker thread. The worker stops when
    /// the returned handle is dropped.
    pub fn start(self: &Arc<Self>) -> Result<SimWorker> {
        self.lock().shutdown = false;

        let sim = self.clone();
        let handle = thread::Builder::new()
            .name("v2d-sim".to_string())
            .spawn(move || sim.run())
            .map_err(Error::ThreadSpawn)?;

        Ok(SimWorker {
            sim: self.clone(),
            handle: Some(handle),
        })
    }

    fn run(&self) {
        loop {
            let mut state = self.lock();
            while !state.shutdown && !state.can_fetch() {
                state = self.kick.wait(state).unwrap();
            }
            if state.shutdown {
                return;
            }
            drop(state);

            self.step();
        }
    }
}

impl V2dHardware for SimulatedV2d {
    fn read_reg(&self, offset: u32) -> u32 {
        let state = self.lock();
        match offset {
            REG_ENABLE => state.enable.bits(),
            REG_INTR => state.intr.bits(),
            REG_INTR_ENABLE => state.intr_enable.bits(),
            REG_COUNTER => state.counter,
            REG_CMD_READ_PTR => state.read_ptr,
            REG_CMD_WRITE_PTR => state.write_ptr,
            _ => 0,
        }
    }

    fn write_reg(&self, offset: u32, value: u32) {
        let mut state = self.lock();
        match offset {
            REG_ENABLE => state.enable = Enable::from_bits_truncate(value),
            REG_INTR => state.intr.remove(Intr::from_bits_truncate(value)),
            REG_INTR_ENABLE => {
                state.intr_enable = Intr::from_bits_truncate(value);
                let pending = state.intr;
                if state.intr_enable.intersects(pending) {
                    self.raise(&mut state, pending);
                }
            }
            REG_RESET => {
                let reset = Reset::from_bits_truncate(value);
                if reset.contains(Reset::DRAW) {
                    state.draw = DrawState::default();
                }
                state.resets.push(reset);
            }
            REG_COUNTER => state.counter = value,
            REG_CMD_READ_PTR => state.read_ptr = value,
            REG_CMD_WRITE_PTR => state.write_ptr = value,
            _ => warn!("simulated v2d: write to unknown register {offset:#x}"),
        }
        self.kick.notify_all();
    }

    fn irq_event(&self) -> &EventFd {
        &self.irq
    }
}

/// Running worker of a [`SimulatedV2d`].
pub struct SimWorker {
    sim: Arc<SimulatedV2d>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for SimWorker {
    fn drop(&mut self) {
        self.sim.lock().shutdown = true;
        self.sim.kick.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("simulated v2d worker panicked");
            }
        }
    }
}
