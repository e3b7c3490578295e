// Client command stream encoding
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use crate::{history::ValidationError, hw::HwCommand};

pub const CMD_TYPE_SRC_POS: u32 = 0x30;
pub const CMD_TYPE_DST_POS: u32 = 0x31;
pub const CMD_TYPE_FILL_COLOR: u32 = 0x32;
pub const CMD_TYPE_DO_BLIT: u32 = 0x33;
pub const CMD_TYPE_DO_FILL: u32 = 0x34;

const CMD_TYPE_MASK: u32 = 0xff;
const FIELD_MASK: u32 = 0x7ff;

/// Size in bytes of one command in the client stream.
pub const CMD_SIZE: usize = 4;

/// A command written by a client, as found in its command stream.
///
/// Positions range over `0..2048`, draw sizes over `1..=2048`. Whether a
/// command is acceptable depends on the owning context, see
/// [`crate::history::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    SrcPos { x: u16, y: u16 },
    DstPos { x: u16, y: u16 },
    FillColor(u8),
    DoFill { width: u16, height: u16 },
    DoBlit { width: u16, height: u16 },
}

/// The state a setup command establishes for a later draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupRole {
    Source,
    Destination,
    Color,
}

fn pair(a: u16, b: u16) -> u32 {
    (u32::from(a) & FIELD_MASK) << 8 | (u32::from(b) & FIELD_MASK) << 20
}

impl Command {
    /// Decodes a stream word, rejecting unknown tags and words carrying bits
    /// outside their fields.
    pub fn decode(raw: u32) -> Result<Self, ValidationError> {
        let a = (raw >> 8 & FIELD_MASK) as u16;
        let b = (raw >> 20 & FIELD_MASK) as u16;

        let cmd = match raw & CMD_TYPE_MASK {
            CMD_TYPE_SRC_POS => Self::SrcPos { x: a, y: b },
            CMD_TYPE_DST_POS => Self::DstPos { x: a, y: b },
            CMD_TYPE_FILL_COLOR => Self::FillColor((raw >> 8) as u8),
            CMD_TYPE_DO_FILL => Self::DoFill {
                width: a + 1,
                height: b + 1,
            },
            CMD_TYPE_DO_BLIT => Self::DoBlit {
                width: a + 1,
                height: b + 1,
            },
            _ => return Err(ValidationError::UnknownType(raw)),
        };

        if cmd.encode() != raw {
            return Err(ValidationError::Malformed(raw));
        }

        Ok(cmd)
    }

    pub fn encode(self) -> u32 {
        match self {
            Self::SrcPos { x, y } => CMD_TYPE_SRC_POS | pair(x, y),
            Self::DstPos { x, y } => CMD_TYPE_DST_POS | pair(x, y),
            Self::FillColor(color) => CMD_TYPE_FILL_COLOR | u32::from(color) << 8,
            Self::DoFill { width, height } => {
                CMD_TYPE_DO_FILL | pair(width.wrapping_sub(1), height.wrapping_sub(1))
            }
            Self::DoBlit { width, height } => {
                CMD_TYPE_DO_BLIT | pair(width.wrapping_sub(1), height.wrapping_sub(1))
            }
        }
    }

    pub fn role(self) -> Option<SetupRole> {
        match self {
            Self::SrcPos { .. } => Some(SetupRole::Source),
            Self::DstPos { .. } => Some(SetupRole::Destination),
            Self::FillColor(_) => Some(SetupRole::Color),
            Self::DoFill { .. } | Self::DoBlit { .. } => None,
        }
    }

    pub fn is_draw(self) -> bool {
        self.role().is_none()
    }

    pub fn to_hw(self) -> HwCommand {
        match self {
            Self::SrcPos { x, y } => HwCommand::SrcPos { x, y },
            Self::DstPos { x, y } => HwCommand::DstPos { x, y },
            Self::FillColor(color) => HwCommand::FillColor(color),
            Self::DoFill { width, height } => HwCommand::DoFill { width, height },
            Self::DoBlit { width, height } => HwCommand::DoBlit { width, height },
        }
    }
}

/// Serializes commands into the little-endian stream format clients write.
pub fn encode_stream(cmds: &[Command]) -> Vec<u8> {
    cmds.iter()
        .flat_map(|cmd| cmd.encode().to_le_bytes())
        .collect()
}
