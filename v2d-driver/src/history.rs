// Per-context command history and validation
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! A context remembers its two most recent setup commands. Draws are
//! validated against that window and the canvas dimensions before anything
//! reaches the hardware, and are then submitted together with the window so
//! the device sees exactly the state that was checked.

use thiserror::Error as ThisError;

use crate::command::{Command, SetupRole};

const HISTORY_SLOTS: usize = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ThisError)]
/// Reasons a client command is refused.
pub enum ValidationError {
    #[error("Unknown command type in word {0:#010x}")]
    UnknownType(u32),
    #[error("Malformed command word {0:#010x}")]
    Malformed(u32),
    #[error("Position ({x}, {y}) outside of {width}x{height} canvas")]
    PositionOutOfBounds {
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    },
    #[error("{role:?} rectangle at ({x}, {y}) of size {w}x{h} exceeds {width}x{height} canvas")]
    RectangleOutOfBounds {
        role: SetupRole,
        x: u16,
        y: u16,
        w: u16,
        h: u16,
        width: u16,
        height: u16,
    },
    #[error("Draw requires a preceding {0:?} command")]
    MissingSetup(SetupRole),
}

/// Canvas size of a context, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u16,
    pub height: u16,
}

/// Sliding window of the last two accepted setup commands.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct History {
    slots: [Option<Command>; HISTORY_SLOTS],
    next: usize,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted setup command, evicting the oldest entry.
    pub fn push(&mut self, cmd: Command) {
        debug_assert!(!cmd.is_draw());
        self.slots[self.next] = Some(cmd);
        self.next = (self.next + 1) % HISTORY_SLOTS;
    }

    /// Entries in insertion order, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = Command> + '_ {
        (0..HISTORY_SLOTS).filter_map(move |i| self.slots[(self.next + i) % HISTORY_SLOTS])
    }

    /// Most recent entry establishing `role`.
    pub fn find(&self, role: SetupRole) -> Option<Command> {
        self.entries().filter(|cmd| cmd.role() == Some(role)).last()
    }

    fn position(&self, role: SetupRole) -> Result<(u16, u16), ValidationError> {
        match self.find(role) {
            Some(Command::SrcPos { x, y }) | Some(Command::DstPos { x, y }) => Ok((x, y)),
            _ => Err(ValidationError::MissingSetup(role)),
        }
    }
}

fn check_rect(
    dims: Dimensions,
    role: SetupRole,
    (x, y): (u16, u16),
    w: u16,
    h: u16,
) -> Result<(), ValidationError> {
    let fits_x = u32::from(x) + u32::from(w) <= u32::from(dims.width);
    let fits_y = u32::from(y) + u32::from(h) <= u32::from(dims.height);

    if fits_x && fits_y {
        Ok(())
    } else {
        Err(ValidationError::RectangleOutOfBounds {
            role,
            x,
            y,
            w,
            h,
            width: dims.width,
            height: dims.height,
        })
    }
}

/// Checks `cmd` against the canvas dimensions and the setup history.
///
/// This has no side effects; the caller records setup commands in the
/// history once they are accepted.
pub fn validate(dims: Dimensions, history: &History, cmd: Command) -> Result<(), ValidationError> {
    match cmd {
        Command::SrcPos { x, y } | Command::DstPos { x, y } => {
            if x >= dims.width || y >= dims.height {
                return Err(ValidationError::PositionOutOfBounds {
                    x,
                    y,
                    width: dims.width,
                    height: dims.height,
                });
            }
        }
        Command::FillColor(_) => {}
        Command::DoFill { width, height } => {
            let dst = history.position(SetupRole::Destination)?;
            history
                .find(SetupRole::Color)
                .ok_or(ValidationError::MissingSetup(SetupRole::Color))?;
            check_rect(dims, SetupRole::Destination, dst, width, height)?;
        }
        Command::DoBlit { width, height } => {
            let dst = history.position(SetupRole::Destination)?;
            let src = history.position(SetupRole::Source)?;
            check_rect(dims, SetupRole::Destination, dst, width, height)?;
            check_rect(dims, SetupRole::Source, src, width, height)?;
        }
    }

    Ok(())
}
