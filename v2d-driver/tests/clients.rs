// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Client sessions against a simulated device.

mod common;

use std::{sync::Arc, thread};

use assert_matches::assert_matches;
use v2d_driver::{
    command::{encode_stream, Command, SetupRole},
    hw::{V2dHardware, REG_COUNTER},
    DeviceConfig, Error, SetDimensions, ValidationError,
};

use common::{scene, wait_for, Reference, Rig};

fn dims(width: u16, height: u16) -> SetDimensions {
    SetDimensions { width, height }
}

#[test]
fn test_two_clients_one_after_another() {
    let rig = Rig::new(64, DeviceConfig::default());
    let _worker = rig.start();

    let a = rig.driver.open(rig.minor).unwrap();
    let b = rig.driver.open(rig.minor).unwrap();
    a.set_dimensions(dims(64, 64)).unwrap();
    b.set_dimensions(dims(128, 128)).unwrap();

    let b_table = b.mmap().unwrap();
    let b_pages: Vec<u32> = (0..4).map(|i| b_table.fault(i).unwrap()).collect();

    let scene_a = scene(64, 64, 1, 40);
    a.write(&encode_stream(&scene_a)).unwrap();
    a.fsync().unwrap();

    let scene_b = scene(128, 128, 2, 40);
    b.write(&encode_stream(&scene_b)).unwrap();
    b.fsync().unwrap();

    let mut ref_a = Reference::new(64, 64);
    ref_a.apply(&scene_a);
    let mut ref_b = Reference::new(128, 128);
    ref_b.apply(&scene_b);

    assert_eq!(a.read_canvas().unwrap(), ref_a.pixels);
    assert_eq!(b.read_canvas().unwrap(), ref_b.pixels);

    // One page table load per context, and the second context's table
    // still describes its own pages.
    assert_eq!(rig.page_table_loads(), 2);
    let device = rig.driver.device(rig.minor).unwrap();
    assert_eq!(device.faults().total(), 0);
    for (i, page) in b_pages.iter().enumerate() {
        assert_eq!(b_table.fault(i).unwrap(), *page);
    }
}

#[test]
fn test_concurrent_clients() {
    let rig = Arc::new(Rig::new(256, DeviceConfig::default()));
    let _worker = rig.start();

    let sizes = [(64u16, 64u16), (128, 32), (17, 300), (200, 200)];
    let handles: Vec<_> = sizes
        .iter()
        .enumerate()
        .map(|(i, &(w, h))| {
            let rig = rig.clone();
            thread::spawn(move || {
                let ctx = rig.driver.open(rig.minor).unwrap();
                ctx.set_dimensions(dims(w, h)).unwrap();

                let cmds = scene(w, h, i as u16 + 10, 60);
                // Several writes so contexts interleave on the device.
                for chunk in cmds.chunks(9) {
                    ctx.write(&encode_stream(chunk)).unwrap();
                }
                ctx.fsync().unwrap();

                let mut reference = Reference::new(w, h);
                reference.apply(&cmds);
                assert_eq!(ctx.read_canvas().unwrap(), reference.pixels);
                ctx.close().unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let device = rig.driver.device(rig.minor).unwrap();
    assert_eq!(device.faults().total(), 0);
    assert_eq!(device.occupancy().unwrap(), 0);
    assert!(rig.page_table_loads() >= sizes.len());
    // Everything but the command ring went back to the pool.
    assert_eq!(rig.dma.free_frames(), rig.dma.total_frames() - 1);
}

#[test]
fn test_switch_happens_only_between_contexts() {
    let rig = Rig::new(32, DeviceConfig::default());
    let _worker = rig.start();

    let a = rig.driver.open(rig.minor).unwrap();
    let b = rig.driver.open(rig.minor).unwrap();
    a.set_dimensions(dims(32, 32)).unwrap();
    b.set_dimensions(dims(32, 32)).unwrap();

    let fill = encode_stream(&[
        Command::DstPos { x: 0, y: 0 },
        Command::FillColor(3),
        Command::DoFill {
            width: 4,
            height: 4,
        },
    ]);

    for ctx in [&a, &a, &a, &b, &b, &a] {
        ctx.write(&fill).unwrap();
    }
    a.fsync().unwrap();

    assert_eq!(rig.page_table_loads(), 3);
}

#[test]
fn test_sync_markers_alternate() {
    let rig = Rig::new(16, DeviceConfig::default());
    let _worker = rig.start();

    let ctx = rig.driver.open(rig.minor).unwrap();
    ctx.set_dimensions(dims(8, 8)).unwrap();

    let counters: Vec<u32> = (0..5)
        .map(|_| {
            ctx.fsync().unwrap();
            rig.sim.read_reg(REG_COUNTER)
        })
        .collect();
    assert_eq!(counters, vec![1, 0, 1, 0, 1]);
}

#[test]
fn test_sync_every_draw() {
    let rig = Rig::new(16, DeviceConfig {
        sync_every_draw: true,
    });
    let _worker = rig.start();
    let device = rig.driver.device(rig.minor).unwrap();

    let ctx = rig.driver.open(rig.minor).unwrap();
    ctx.set_dimensions(dims(16, 16)).unwrap();

    for draw in scene(16, 16, 5, 10).chunks(3) {
        ctx.write(&encode_stream(draw)).unwrap();
        assert_eq!(device.occupancy().unwrap(), 0);
        // Each completed draw leaves no context loaded.
        assert_eq!(device.active_context(), None);
    }
    assert_eq!(rig.page_table_loads(), 10);
}

#[test]
fn test_rejected_commands_have_no_effect() {
    let rig = Rig::new(16, DeviceConfig::default());
    let ctx = rig.driver.open(rig.minor).unwrap();
    ctx.set_dimensions(dims(100, 100)).unwrap();

    let cases: Vec<(Vec<Command>, ValidationError)> = vec![
        (
            vec![Command::DoFill {
                width: 1,
                height: 1,
            }],
            ValidationError::MissingSetup(SetupRole::Destination),
        ),
        (
            vec![Command::SrcPos { x: 100, y: 0 }],
            ValidationError::PositionOutOfBounds {
                x: 100,
                y: 0,
                width: 100,
                height: 100,
            },
        ),
    ];

    for (cmds, expected) in cases {
        assert_matches!(
            ctx.write(&encode_stream(&cmds)),
            Err(Error::Validation(e)) if e == expected
        );
    }

    assert_matches!(
        ctx.write(&0x0008_0031u32.to_le_bytes()),
        Err(Error::Validation(ValidationError::Malformed(0x0008_0031)))
    );

    let device = rig.driver.device(rig.minor).unwrap();
    assert_eq!(device.occupancy().unwrap(), 0);
    assert_eq!(rig.sim.run_until_idle(), 0);
    assert!(rig.sim.executed().is_empty());
}

#[test]
fn test_discard_active_context_drains_first() {
    let rig = Rig::new(32, DeviceConfig::default());
    let device = rig.driver.device(rig.minor).unwrap();

    let ctx = rig.driver.open(rig.minor).unwrap();
    ctx.set_dimensions(dims(64, 64)).unwrap();
    let cmds = scene(64, 64, 9, 20);
    ctx.write(&encode_stream(&cmds)).unwrap();
    assert_eq!(device.active_context(), Some(ctx.id()));

    // Let the device run only once the close is blocked on the drain.
    let mapping = ctx.mmap().unwrap();
    let closer = thread::spawn(move || ctx.close());
    wait_for(|| device.occupancy().unwrap() == 2 + cmds.len() + 1);
    let _worker = rig.start();
    closer.join().unwrap().unwrap();

    assert_eq!(device.active_context(), None);
    assert_eq!(device.occupancy().unwrap(), 0);

    // The mapping kept the canvas pages alive and shows the finished scene.
    let mut reference = Reference::new(64, 64);
    reference.apply(&cmds);
    assert_eq!(mapping.pixel(10, 10).unwrap(), reference.pixels[10 * 64 + 10]);
    drop(mapping);
    assert_eq!(rig.dma.free_frames(), rig.dma.total_frames() - 1);
}

#[test]
fn test_write_from_reader() {
    let rig = Rig::new(16, DeviceConfig::default());
    let _worker = rig.start();

    let ctx = rig.driver.open(rig.minor).unwrap();
    ctx.set_dimensions(dims(32, 8)).unwrap();

    let cmds = scene(32, 8, 4, 12);
    let stream = encode_stream(&cmds);
    assert_eq!(ctx.write_from(stream.as_slice()).unwrap(), stream.len());
    ctx.fsync().unwrap();

    let mut reference = Reference::new(32, 8);
    reference.apply(&cmds);
    assert_eq!(ctx.read_canvas().unwrap(), reference.pixels);

    assert_matches!(
        ctx.write_from(&stream[..5]),
        Err(Error::InvalidStreamLength(5))
    );
}
