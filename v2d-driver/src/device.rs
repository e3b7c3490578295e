// Vintage2D device: context arbitration and completion
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! One accelerator unit shared by every context opened on it.
//!
//! The unit holds the state of at most one context at a time. Draws from
//! another context first drain the queue, reset the drawing engine and load
//! the new context's page table and dimensions. Lock order is device state
//! first, then context.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

use log::{debug, info, warn};

use crate::{
    canvas::Canvas,
    command::Command,
    dma::DmaMemory,
    history::History,
    hw::{
        Enable, HwCommand, Intr, Reset, V2dHardware, REG_COUNTER, REG_ENABLE, REG_INTR,
        REG_INTR_ENABLE, REG_RESET,
    },
    irq::{Completion, FaultCounters, FaultReport, IrqListener},
    ring::CommandRing,
    Error, Result,
};

pub type ContextId = u64;

/// Per-device behaviour knobs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Wait for every draw to complete before returning from the write.
    pub sync_every_draw: bool,
}

/// State guarded by the device lock.
#[derive(Debug, Default)]
pub struct DeviceState {
    active: Option<ContextId>,
}

pub struct Device {
    minor: u32,
    config: DeviceConfig,
    hw: Arc<dyn V2dHardware>,
    dma: DmaMemory,
    ring: CommandRing,
    state: Mutex<DeviceState>,
    completion: Arc<Completion>,
    faults: Arc<FaultCounters>,
    listener: Mutex<Option<IrqListener>>,
    next_context: AtomicU64,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("minor", &self.minor)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn new(
        minor: u32,
        hw: Arc<dyn V2dHardware>,
        dma: DmaMemory,
        config: DeviceConfig,
    ) -> Result<Self> {
        let ring = CommandRing::new(&dma)?;
        let completion = Arc::new(Completion::new());
        let faults = Arc::new(FaultCounters::default());

        let device = Self {
            minor,
            config,
            hw: hw.clone(),
            dma,
            ring,
            state: Mutex::new(DeviceState::default()),
            completion: completion.clone(),
            faults: faults.clone(),
            listener: Mutex::new(None),
            next_context: AtomicU64::new(0),
        };

        device.prepare()?;

        let listener = IrqListener::spawn(format!("v2d{minor}-irq"), hw, completion, faults)?;
        *device.listener.lock().unwrap() = Some(listener);

        info!("v2d{minor}: ready, command ring at {:#x}", device.ring.base());
        Ok(device)
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn config(&self) -> DeviceConfig {
        self.config
    }

    pub fn dma(&self) -> &DmaMemory {
        &self.dma
    }

    pub fn is_present(&self) -> bool {
        self.completion.is_present()
    }

    pub fn faults(&self) -> FaultReport {
        self.faults.report()
    }

    /// Commands waiting in the ring. Does not take the device lock.
    pub fn occupancy(&self) -> Result<usize> {
        self.ring.occupancy(self.hw.as_ref())
    }

    /// Context whose state is currently loaded in the unit.
    pub fn active_context(&self) -> Option<ContextId> {
        self.lock().active
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn next_context_id(&self) -> ContextId {
        self.next_context.fetch_add(1, Ordering::Relaxed)
    }

    fn reset_hw(&self) {
        self.hw.write_reg(REG_ENABLE, 0);
        self.hw.write_reg(REG_INTR_ENABLE, 0);
        self.hw.write_reg(REG_RESET, Reset::all().bits());
        self.hw.write_reg(REG_INTR, Intr::all().bits());
    }

    fn enable_hw(&self) {
        self.hw.write_reg(REG_INTR_ENABLE, Intr::all().bits());
        self.hw
            .write_reg(REG_ENABLE, (Enable::DRAW | Enable::FETCH_CMD).bits());
    }

    /// Brings the unit to a clean, running state with an empty ring.
    fn prepare(&self) -> Result<()> {
        self.reset_hw();
        self.ring.reset(self.hw.as_ref())?;
        self.enable_hw();
        Ok(())
    }

    /// Queues one command, waiting for ring space if needed.
    pub(crate) fn enqueue(&self, _state: &mut DeviceState, cmd: HwCommand) -> Result<()> {
        let hw = self.hw.as_ref();
        self.completion
            .wait_until(|| self.ring.has_room(hw))?;
        self.ring.push(hw, cmd.encode(cmd.wants_notify()))
    }

    /// Waits until everything queued so far has executed. Leaves no context
    /// loaded.
    pub(crate) fn sync_locked(&self, state: &mut DeviceState) -> Result<()> {
        let hw = self.hw.as_ref();
        let marker = if hw.read_reg(REG_COUNTER) == 0 { 1 } else { 0 };

        self.enqueue(state, HwCommand::Counter(marker))?;
        self.completion
            .wait_until(|| Ok(hw.read_reg(REG_COUNTER) == marker))?;

        state.active = None;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let mut state = self.lock();
        if !self.is_present() {
            return Err(Error::NoDevice);
        }
        self.sync_locked(&mut state)
    }

    /// Loads the state of context `id` unless it is already loaded.
    pub(crate) fn ensure_active(
        &self,
        state: &mut DeviceState,
        id: ContextId,
        canvas: &Canvas,
    ) -> Result<()> {
        if state.active == Some(id) {
            return Ok(());
        }

        if let Some(prev) = state.active {
            debug!("v2d{}: switching from context {prev} to {id}", self.minor);
            self.sync_locked(state)?;
        }

        // The ring is drained here, resetting cannot drop queued commands.
        self.reset_hw();

        let dims = canvas.dims();
        self.enqueue(state, HwCommand::CanvasPageTable(canvas.page_table_addr()))?;
        self.enqueue(
            state,
            HwCommand::CanvasDims {
                width: dims.width,
                height: dims.height,
            },
        )?;
        self.enable_hw();

        state.active = Some(id);
        Ok(())
    }

    /// Submits a validated draw, preceded by the setup commands it was
    /// validated against.
    pub(crate) fn submit_draw(
        &self,
        state: &mut DeviceState,
        id: ContextId,
        canvas: &Canvas,
        history: &History,
        draw: Command,
    ) -> Result<()> {
        self.ensure_active(state, id, canvas)?;

        for cmd in history.entries() {
            self.enqueue(state, cmd.to_hw())?;
        }
        self.enqueue(state, draw.to_hw())?;

        if self.config.sync_every_draw {
            self.sync_locked(state)?;
        }
        Ok(())
    }

    /// Makes sure the unit no longer references context `id`, so its frames
    /// can be freed.
    pub(crate) fn release_context(&self, state: &mut DeviceState, id: ContextId) -> Result<()> {
        if state.active != Some(id) {
            return Ok(());
        }

        let res = self.sync_locked(state);
        if let Err(ref e) = res {
            state.active = None;
            if self.is_present() {
                warn!("v2d{}: drain failed ({e}), resetting unit", self.minor);
                self.prepare()?;
            }
        }
        res
    }

    /// Disconnects the unit: waiters fail with [`Error::NoDevice`], the
    /// hardware is reset and its interrupt listener stopped.
    pub(crate) fn detach(&self) {
        self.completion.disconnect();

        let mut state = self.lock();
        self.reset_hw();
        state.active = None;
        drop(state);

        if let Some(mut listener) = self.listener.lock().unwrap().take() {
            listener.stop();
        }
        info!("v2d{}: detached", self.minor);
    }
}
