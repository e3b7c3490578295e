// Interrupt handling and completion waits
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fs::File,
    io,
    os::unix::io::{AsRawFd, FromRawFd},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
};

use log::{debug, warn};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::{
    hw::{Intr, V2dHardware, REG_INTR},
    Error, Result,
};

const IRQ_EVENT: u64 = 0;
const EXIT_EVENT: u64 = 1;

/// Wait queue woken on every interrupt.
///
/// Waiters evaluate their condition with the generation lock held and the
/// listener takes the same lock before broadcasting, so progress made
/// between a check and the wait is never missed.
pub struct Completion {
    generation: Mutex<u64>,
    cond: Condvar,
    present: AtomicBool,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: Condvar::new(),
            present: AtomicBool::new(true),
        }
    }

    /// Blocks until `done` returns true. Fails with [`Error::NoDevice`] once
    /// the device is gone, and with whatever error `done` reports.
    pub fn wait_until<F>(&self, mut done: F) -> Result<()>
    where
        F: FnMut() -> Result<bool>,
    {
        let mut generation = self.generation.lock().unwrap();
        loop {
            if !self.present.load(Ordering::SeqCst) {
                return Err(Error::NoDevice);
            }
            if done()? {
                return Ok(());
            }
            generation = self.cond.wait(generation).unwrap();
        }
    }

    pub fn wake_all(&self) {
        *self.generation.lock().unwrap() += 1;
        self.cond.notify_all();
    }

    /// Number of broadcasts so far.
    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap()
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    /// Marks the device gone and releases every waiter.
    pub fn disconnect(&self) {
        self.present.store(false, Ordering::SeqCst);
        self.wake_all();
    }
}

/// Hardware fault interrupts seen on one device.
#[derive(Default)]
pub struct FaultCounters {
    invalid_cmd: AtomicU64,
    page_fault: AtomicU64,
    canvas_overflow: AtomicU64,
    fifo_overflow: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultReport {
    pub invalid_cmd: u64,
    pub page_fault: u64,
    pub canvas_overflow: u64,
    pub fifo_overflow: u64,
}

impl FaultReport {
    pub fn total(&self) -> u64 {
        self.invalid_cmd + self.page_fault + self.canvas_overflow + self.fifo_overflow
    }
}

impl FaultCounters {
    pub fn record(&self, intr: Intr) {
        let counters = [
            (Intr::INVALID_CMD, &self.invalid_cmd),
            (Intr::PAGE_FAULT, &self.page_fault),
            (Intr::CANVAS_OVERFLOW, &self.canvas_overflow),
            (Intr::FIFO_OVERFLOW, &self.fifo_overflow),
        ];

        for (bit, counter) in counters {
            if intr.contains(bit) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn report(&self) -> FaultReport {
        FaultReport {
            invalid_cmd: self.invalid_cmd.load(Ordering::Relaxed),
            page_fault: self.page_fault.load(Ordering::Relaxed),
            canvas_overflow: self.canvas_overflow.load(Ordering::Relaxed),
            fifo_overflow: self.fifo_overflow.load(Ordering::Relaxed),
        }
    }
}

/// Services one interrupt: reads the cause, acknowledges exactly the bits
/// read and wakes every waiter.
pub fn handle_interrupt(hw: &dyn V2dHardware, completion: &Completion, faults: &FaultCounters) {
    let raw = hw.read_reg(REG_INTR);
    if raw == 0 {
        return;
    }

    let intr = Intr::from_bits_truncate(raw);
    let errors = intr - Intr::NOTIFY;
    if !errors.is_empty() {
        warn!("device reported {errors:?}");
        faults.record(errors);
    }

    hw.write_reg(REG_INTR, raw);
    completion.wake_all();
}

/// Thread servicing the interrupt line of one device.
pub struct IrqListener {
    exit_event: EventFd,
    handle: Option<JoinHandle<()>>,
}

impl IrqListener {
    pub fn spawn(
        name: String,
        hw: Arc<dyn V2dHardware>,
        completion: Arc<Completion>,
        faults: Arc<FaultCounters>,
    ) -> Result<Self> {
        let epoll_fd = epoll::create(true).map_err(Error::EpollFdCreate)?;
        // SAFETY: Safe as the fd is guaranteed to be valid here.
        let epoll_file = unsafe { File::from_raw_fd(epoll_fd) };

        let exit_event = EventFd::new(EFD_NONBLOCK).map_err(Error::EventFdCreate)?;

        for (fd, data) in [
            (hw.irq_event().as_raw_fd(), IRQ_EVENT),
            (exit_event.as_raw_fd(), EXIT_EVENT),
        ] {
            epoll::ctl(
                epoll_fd,
                epoll::ControlOptions::EPOLL_CTL_ADD,
                fd,
                epoll::Event::new(epoll::Events::EPOLLIN, data),
            )
            .map_err(Error::EpollAdd)?;
        }

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || Self::run(epoll_file, hw, completion, faults))
            .map_err(Error::ThreadSpawn)?;

        Ok(Self {
            exit_event,
            handle: Some(handle),
        })
    }

    fn run(
        epoll_file: File,
        hw: Arc<dyn V2dHardware>,
        completion: Arc<Completion>,
        faults: Arc<FaultCounters>,
    ) {
        let mut events = vec![epoll::Event::new(epoll::Events::empty(), 0); 2];

        loop {
            let count = match epoll::wait(epoll_file.as_raw_fd(), -1, events.as_mut_slice()) {
                Ok(count) => count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("interrupt listener stopped: {e}");
                    return;
                }
            };

            for event in events.iter().take(count) {
                let data = event.data;
                match data {
                    EXIT_EVENT => {
                        debug!("interrupt listener exiting");
                        return;
                    }
                    _ => {
                        // Several raises may be folded into one read.
                        if let Err(e) = hw.irq_event().read() {
                            if e.kind() != io::ErrorKind::WouldBlock {
                                warn!("failed to read interrupt event: {e}");
                            }
                        }
                        handle_interrupt(hw.as_ref(), &completion, &faults);
                    }
                }
            }
        }
    }

    /// Stops the thread and waits for it. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.exit_event.write(1) {
                warn!("failed to signal interrupt listener: {e}");
            }
            if handle.join().is_err() {
                warn!("interrupt listener panicked");
            }
        }
    }
}

impl Drop for IrqListener {
    fn drop(&mut self) {
        self.stop();
    }
}
