// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use v2d_driver::{
    command::Command,
    dma::DmaMemory,
    hw::HwCommand,
    sim::{SimWorker, SimulatedV2d},
    DeviceConfig, DriverConfig, V2dDriver,
};

pub const DMA_BASE: u64 = 0x10_0000;

pub struct Rig {
    pub driver: V2dDriver,
    pub sim: Arc<SimulatedV2d>,
    pub dma: DmaMemory,
    pub minor: u32,
}

impl Rig {
    pub fn new(frames: usize, config: DeviceConfig) -> Self {
        let driver = V2dDriver::new(DriverConfig {
            device: config,
            ..Default::default()
        });
        let dma = DmaMemory::new(DMA_BASE, frames).unwrap();
        let sim = Arc::new(SimulatedV2d::new(dma.clone()).unwrap());
        let minor = driver.attach(sim.clone(), dma.clone()).unwrap();

        Rig {
            driver,
            sim,
            dma,
            minor,
        }
    }

    pub fn start(&self) -> SimWorker {
        self.sim.start().unwrap()
    }

    pub fn page_table_loads(&self) -> usize {
        self.sim
            .executed()
            .iter()
            .filter(|cmd| matches!(cmd, HwCommand::CanvasPageTable(_)))
            .count()
    }
}

/// Polls `cond` until it holds, failing the test after a few seconds.
pub fn wait_for<F: FnMut() -> bool>(mut cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Software rendition of a canvas, fed with the same commands as a
/// context.
pub struct Reference {
    width: usize,
    pub pixels: Vec<u8>,
    src: (usize, usize),
    dst: (usize, usize),
    color: u8,
}

impl Reference {
    pub fn new(width: u16, height: u16) -> Self {
        Reference {
            width: usize::from(width),
            pixels: vec![0; usize::from(width) * usize::from(height)],
            src: (0, 0),
            dst: (0, 0),
            color: 0,
        }
    }

    pub fn apply(&mut self, cmds: &[Command]) {
        for cmd in cmds {
            match *cmd {
                Command::SrcPos { x, y } => self.src = (usize::from(x), usize::from(y)),
                Command::DstPos { x, y } => self.dst = (usize::from(x), usize::from(y)),
                Command::FillColor(color) => self.color = color,
                Command::DoFill { width, height } => {
                    for y in 0..usize::from(height) {
                        let at = (self.dst.1 + y) * self.width + self.dst.0;
                        self.pixels[at..at + usize::from(width)].fill(self.color);
                    }
                }
                Command::DoBlit { width, height } => {
                    let w = usize::from(width);
                    let rows: Vec<Vec<u8>> = (0..usize::from(height))
                        .map(|y| {
                            let at = (self.src.1 + y) * self.width + self.src.0;
                            self.pixels[at..at + w].to_vec()
                        })
                        .collect();
                    for (y, row) in rows.iter().enumerate() {
                        let at = (self.dst.1 + y) * self.width + self.dst.0;
                        self.pixels[at..at + w].copy_from_slice(row);
                    }
                }
            }
        }
    }
}

/// A deterministic mix of fills and blits that stays inside a
/// `width` x `height` canvas.
pub fn scene(width: u16, height: u16, seed: u16, draws: usize) -> Vec<Command> {
    let mut state = u32::from(seed).wrapping_mul(2_654_435_761).wrapping_add(1);
    let mut next = move |bound: u16| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        (state % u32::from(bound)) as u16
    };

    let mut cmds = Vec::new();
    for i in 0..draws {
        let w = next(width) + 1;
        let h = next(height) + 1;
        let dst = Command::DstPos {
            x: next(width - w + 1),
            y: next(height - h + 1),
        };

        if i % 3 == 2 {
            cmds.push(Command::SrcPos {
                x: next(width - w + 1),
                y: next(height - h + 1),
            });
            cmds.push(dst);
            cmds.push(Command::DoBlit {
                width: w,
                height: h,
            });
        } else {
            cmds.push(dst);
            cmds.push(Command::FillColor(next(255) as u8 + 1));
            cmds.push(Command::DoFill {
                width: w,
                height: h,
            });
        }
    }
    cmds
}
