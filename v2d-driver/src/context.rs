// Client context
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! A context is one client session on a device: it owns a canvas once the
//! client sets its dimensions, validates the client's command stream and
//! forwards draws to the device.

use std::{
    io::Read,
    sync::{Arc, Mutex},
};

use log::{debug, info, warn};

use crate::{
    canvas::{Canvas, CanvasMapping},
    command::{Command, CMD_SIZE},
    device::{ContextId, Device},
    history::{validate, Dimensions, History},
    Error, Result,
};

/// Request code of the set-dimensions control request.
pub const V2D_IOCTL_SET_DIMENSIONS: u32 = 0x4004_7600;

/// Payload of the set-dimensions request: two little-endian `u16`s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetDimensions {
    pub width: u16,
    pub height: u16,
}

impl SetDimensions {
    pub const SIZE: usize = 4;

    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        match payload {
            [w0, w1, h0, h1] => Ok(Self {
                width: u16::from_le_bytes([*w0, *w1]),
                height: u16::from_le_bytes([*h0, *h1]),
            }),
            _ => Err(Error::BadPayload(payload.len())),
        }
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let [w0, w1] = self.width.to_le_bytes();
        let [h0, h1] = self.height.to_le_bytes();
        [w0, w1, h0, h1]
    }
}

#[derive(Default)]
struct ContextInner {
    canvas: Option<Canvas>,
    history: History,
    discarded: bool,
}

pub struct Context {
    id: ContextId,
    device: Arc<Device>,
    inner: Mutex<ContextInner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("minor", &self.device.minor())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn new(device: Arc<Device>) -> Self {
        let id = device.next_context_id();
        info!("v2d{}: context {id} created", device.minor());

        Self {
            id,
            device,
            inner: Mutex::new(ContextInner::default()),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn dims(&self) -> Option<Dimensions> {
        self.inner
            .lock()
            .unwrap()
            .canvas
            .as_ref()
            .map(Canvas::dims)
    }

    /// Allocates the canvas. Allowed once per context.
    pub fn set_dimensions(&self, req: SetDimensions) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.canvas.is_some() || inner.discarded {
            return Err(Error::AlreadyInitialized);
        }

        let dims = Dimensions {
            width: req.width,
            height: req.height,
        };
        inner.canvas = Some(Canvas::allocate(self.device.dma(), dims)?);

        info!(
            "v2d{}: context {} initialized ({}, {})",
            self.device.minor(),
            self.id,
            dims.width,
            dims.height
        );
        Ok(())
    }

    /// Dispatches a raw control request.
    pub fn ioctl(&self, request: u32, payload: &[u8]) -> Result<()> {
        if request != V2D_IOCTL_SET_DIMENSIONS {
            return Err(Error::UnknownRequest(request));
        }
        self.set_dimensions(SetDimensions::from_bytes(payload)?)
    }

    /// Consumes a command stream. Words are applied in order; the first
    /// rejected word ends the call with its error.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.len() % CMD_SIZE != 0 {
            return Err(Error::InvalidStreamLength(buf.len()));
        }

        for word in buf.chunks_exact(CMD_SIZE) {
            let raw = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            self.handle_command(raw)?;
        }
        Ok(buf.len())
    }

    /// Reads a whole command stream from `reader` and writes it.
    pub fn write_from<R: Read>(&self, mut reader: R) -> Result<usize> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).map_err(Error::StreamRead)?;
        self.write(&buf)
    }

    pub fn handle_command(&self, raw: u32) -> Result<()> {
        let cmd = Command::decode(raw)?;
        if cmd.is_draw() {
            self.handle_draw(cmd)
        } else {
            self.handle_setup(cmd)
        }
    }

    fn handle_setup(&self, cmd: Command) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let dims = inner
            .canvas
            .as_ref()
            .map(Canvas::dims)
            .ok_or(Error::CanvasNotInitialized)?;

        validate(dims, &inner.history, cmd)?;
        inner.history.push(cmd);
        Ok(())
    }

    fn handle_draw(&self, cmd: Command) -> Result<()> {
        let mut state = self.device.lock();
        let inner = self.inner.lock().unwrap();
        let canvas = inner.canvas.as_ref().ok_or(Error::CanvasNotInitialized)?;

        if !self.device.is_present() {
            return Err(Error::NoDevice);
        }

        validate(canvas.dims(), &inner.history, cmd)?;
        debug!("context {}: {cmd:?}", self.id);

        self.device
            .submit_draw(&mut state, self.id, canvas, &inner.history, cmd)
    }

    /// Waits until every draw submitted so far, by any context of the
    /// device, has completed.
    pub fn fsync(&self) -> Result<()> {
        let mut state = self.device.lock();
        if !self.device.is_present() {
            return Err(Error::NoDevice);
        }
        if self.inner.lock().unwrap().canvas.is_none() {
            return Err(Error::CanvasNotInitialized);
        }
        self.device.sync_locked(&mut state)
    }

    /// Maps the canvas for the client.
    pub fn mmap(&self) -> Result<CanvasMapping> {
        self.inner
            .lock()
            .unwrap()
            .canvas
            .as_ref()
            .map(Canvas::mapping)
            .ok_or(Error::CanvasNotInitialized)
    }

    /// Copy of the canvas pixels, row-major.
    pub fn read_canvas(&self) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .canvas
            .as_ref()
            .ok_or(Error::CanvasNotInitialized)?
            .read_pixels()
    }

    fn discard(&self) -> Result<()> {
        let mut state = self.device.lock();
        let mut inner = self.inner.lock().unwrap();
        if inner.discarded {
            return Ok(());
        }

        let res = self.device.release_context(&mut state, self.id);
        inner.canvas = None;
        inner.discarded = true;

        info!("v2d{}: context {} discarded", self.device.minor(), self.id);
        res
    }

    /// Ends the session, waiting for this context's pending draws first if
    /// it is the one loaded in the unit.
    pub fn close(self) -> Result<()> {
        self.discard()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.discard() {
            warn!("context {}: {e}", self.id);
        }
    }
}


#[cfg(all(test, feature = "simulated"))]
mod device_tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        command::encode_stream,
        device::DeviceConfig,
        dma::DmaMemory,
        history::ValidationError,
        hw::HwCommand,
        sim::SimulatedV2d,
    };

    fn setup(frames: usize) -> (Arc<SimulatedV2d>, Arc<Device>) {
        let dma = DmaMemory::new(0x10_0000, frames).unwrap();
        let sim = Arc::new(SimulatedV2d::new(dma.clone()).unwrap());
        let device =
            Arc::new(Device::new(0, sim.clone(), dma, DeviceConfig::default()).unwrap());
        (sim, device)
    }

    fn set_dims(ctx: &Context, width: u16, height: u16) -> Result<()> {
        ctx.set_dimensions(SetDimensions { width, height })
    }

    #[test]
    fn test_set_dimensions_once() {
        let (_sim, device) = setup(16);
        let ctx = Context::new(device.clone());

        assert_matches!(set_dims(&ctx, 0, 10), Err(Error::InvalidDimensions(0, 10)));
        assert_matches!(
            set_dims(&ctx, 10, 2049),
            Err(Error::InvalidDimensions(10, 2049))
        );
        assert_eq!(ctx.dims(), None);

        set_dims(&ctx, 100, 100).unwrap();
        assert_matches!(set_dims(&ctx, 10, 10), Err(Error::AlreadyInitialized));
        assert_eq!(
            ctx.dims(),
            Some(Dimensions {
                width: 100,
                height: 100
            })
        );
    }

    #[test]
    fn test_ioctl() {
        let (_sim, device) = setup(16);
        let ctx = Context::new(device);

        let payload = SetDimensions {
            width: 8,
            height: 8,
        }
        .to_bytes();
        assert_matches!(
            ctx.ioctl(0x1234, &payload),
            Err(Error::UnknownRequest(0x1234))
        );
        assert_matches!(
            ctx.ioctl(V2D_IOCTL_SET_DIMENSIONS, &payload[..2]),
            Err(Error::BadPayload(2))
        );
        ctx.ioctl(V2D_IOCTL_SET_DIMENSIONS, &payload).unwrap();
        assert_eq!(ctx.mmap().unwrap().len(), 4096);
    }

    #[test]
    fn test_commands_need_canvas() {
        let (_sim, device) = setup(16);
        let ctx = Context::new(device);

        assert_matches!(
            ctx.write(&encode_stream(&[Command::FillColor(1)])),
            Err(Error::CanvasNotInitialized)
        );
        assert_matches!(
            ctx.write(&encode_stream(&[Command::DoFill {
                width: 1,
                height: 1
            }])),
            Err(Error::CanvasNotInitialized)
        );
        assert_matches!(ctx.fsync(), Err(Error::CanvasNotInitialized));
        assert_matches!(ctx.mmap(), Err(Error::CanvasNotInitialized));
    }

    #[test]
    fn test_write_rejects_bad_streams() {
        let (sim, device) = setup(16);
        let ctx = Context::new(device.clone());
        set_dims(&ctx, 100, 100).unwrap();

        assert_matches!(ctx.write(&[0x32, 0, 0]), Err(Error::InvalidStreamLength(3)));
        assert_matches!(
            ctx.write(&0x35u32.to_le_bytes()),
            Err(Error::Validation(ValidationError::UnknownType(0x35)))
        );

        // The first two words are applied, the out of bounds fill is not.
        let stream = encode_stream(&[
            Command::DstPos { x: 90, y: 90 },
            Command::FillColor(1),
            Command::DoFill {
                width: 20,
                height: 10,
            },
        ]);
        assert_matches!(
            ctx.write(&stream),
            Err(Error::Validation(
                ValidationError::RectangleOutOfBounds { .. }
            ))
        );

        // Nothing reached the hardware.
        assert_eq!(device.occupancy().unwrap(), 0);
        assert_eq!(device.active_context(), None);
        sim.run_until_idle();
        assert!(sim.executed().is_empty());
    }

    #[test]
    fn test_draw_carries_history() {
        let (sim, device) = setup(16);
        let ctx = Context::new(device.clone());
        set_dims(&ctx, 100, 100).unwrap();

        let stream = encode_stream(&[
            Command::DstPos { x: 90, y: 90 },
            Command::FillColor(1),
            Command::DoFill {
                width: 10,
                height: 5,
            },
        ]);
        assert_eq!(ctx.write(&stream).unwrap(), 12);

        // Page table, dimensions, then the two setup commands and the fill.
        assert_eq!(device.occupancy().unwrap(), 5);
        assert_eq!(device.active_context(), Some(ctx.id()));

        assert_eq!(sim.run_until_idle(), 5);
        assert_eq!(
            sim.executed()[2..],
            [
                HwCommand::DstPos { x: 90, y: 90 },
                HwCommand::FillColor(1),
                HwCommand::DoFill {
                    width: 10,
                    height: 5
                },
            ]
        );

        let mapping = ctx.mmap().unwrap();
        assert_eq!(mapping.pixel(90, 90).unwrap(), 1);
        assert_eq!(mapping.pixel(99, 94).unwrap(), 1);
        assert_eq!(mapping.pixel(99, 95).unwrap(), 0);
        assert_eq!(device.faults().total(), 0);

        let _worker = sim.start().unwrap();
        ctx.close().unwrap();
    }

    #[test]
    fn test_discard_releases_frames() {
        let (sim, device) = setup(8);
        let _worker = sim.start().unwrap();
        // The command ring holds one frame.
        assert_eq!(device.dma().free_frames(), 7);

        let ctx = Context::new(device.clone());
        set_dims(&ctx, 100, 100).unwrap();
        assert_eq!(device.dma().free_frames(), 3);
        ctx.write(&encode_stream(&[
            Command::DstPos { x: 0, y: 0 },
            Command::FillColor(9),
            Command::DoFill {
                width: 100,
                height: 100,
            },
        ]))
        .unwrap();

        ctx.close().unwrap();
        assert_eq!(device.dma().free_frames(), 7);
        assert_eq!(device.active_context(), None);
        assert_eq!(device.occupancy().unwrap(), 0);

        // Dropping an uninitialized context is a no-op.
        drop(Context::new(device.clone()));
        assert_eq!(device.dma().free_frames(), 7);
    }
}
