//! Binary wire protocol shared by the server and its clients.
//!
//! All multi-byte fields are big-endian. A cell record is 9 bytes:
//! `XH XL YH YL RR GG BB AH AL`. Client messages carry a one-byte tag;
//! server snapshots are `[playing:1][speed:2][count:3][cells:9*count]`.

use thiserror::Error;

/// Encoded size of one cell record.
pub const CELL_BYTES: usize = 9;

/// Fixed header size of an encoded snapshot.
pub const SNAPSHOT_HEADER_BYTES: usize = 6;

const TAG_COMMAND: u8 = 0x00;
const TAG_SET_CELLS: u8 = 0x01;
const TAG_SET_SPEED: u8 = 0x02;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame too short: need {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("unknown client message tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("unknown command value: {0}")]
    UnknownCommand(u8),
}

/// One live cell on the wire. `color` uses the low 24 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cell {
    pub x: u16,
    pub y: u16,
    pub color: u32,
    pub age: u16,
}

/// Player commands carried by a tag-`0x00` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Next = 0,
    Play = 1,
    Pause = 2,
    Clear = 3,
    Randomise = 4,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::Next),
            1 => Ok(Command::Play),
            2 => Ok(Command::Pause),
            3 => Ok(Command::Clear),
            4 => Ok(Command::Randomise),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// A decoded client→server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Command(Command),
    SetCells(Vec<Cell>),
    SetSpeed(u16),
}

impl ClientMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ClientMessage::Command(cmd) => vec![TAG_COMMAND, *cmd as u8],
            ClientMessage::SetCells(cells) => {
                let mut buf = Vec::with_capacity(3 + cells.len() * CELL_BYTES);
                buf.push(TAG_SET_CELLS);
                buf.extend_from_slice(&(cells.len() as u16).to_be_bytes());
                for cell in cells {
                    encode_cell(cell, &mut buf);
                }
                buf
            }
            ClientMessage::SetSpeed(speed) => {
                let mut buf = Vec::with_capacity(3);
                buf.push(TAG_SET_SPEED);
                buf.extend_from_slice(&speed.to_be_bytes());
                buf
            }
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let tag = *frame.first().ok_or(ProtocolError::TooShort {
            expected: 1,
            actual: 0,
        })?;
        match tag {
            TAG_COMMAND => {
                ensure_len(frame, 2)?;
                Ok(ClientMessage::Command(Command::try_from(frame[1])?))
            }
            TAG_SET_CELLS => {
                ensure_len(frame, 3)?;
                let count = u16::from_be_bytes([frame[1], frame[2]]) as usize;
                let needed = 3 + count * CELL_BYTES;
                ensure_len(frame, needed)?;
                let cells = frame[3..needed]
                    .chunks_exact(CELL_BYTES)
                    .map(decode_cell)
                    .collect();
                Ok(ClientMessage::SetCells(cells))
            }
            TAG_SET_SPEED => {
                ensure_len(frame, 3)?;
                Ok(ClientMessage::SetSpeed(u16::from_be_bytes([
                    frame[1], frame[2],
                ])))
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// One full server→client world snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub playing: bool,
    pub speed: u16,
    pub cells: Vec<Cell>,
}

impl Snapshot {
    pub fn encoded_len(&self) -> usize {
        SNAPSHOT_HEADER_BYTES + self.cells.len() * CELL_BYTES
    }

    /// Encodes into `buf`, clearing it first. The buffer keeps its capacity
    /// across calls so a steady-state tick loop does not reallocate.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.reserve(self.encoded_len());
        buf.push(u8::from(self.playing));
        buf.extend_from_slice(&self.speed.to_be_bytes());
        let count = self.cells.len() as u32;
        buf.push((count >> 16) as u8);
        buf.push((count >> 8) as u8);
        buf.push(count as u8);
        for cell in &self.cells {
            encode_cell(cell, buf);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len(frame, SNAPSHOT_HEADER_BYTES)?;
        let playing = frame[0] == 1;
        let speed = u16::from_be_bytes([frame[1], frame[2]]);
        let count = (u32::from(frame[3]) << 16 | u32::from(frame[4]) << 8 | u32::from(frame[5]))
            as usize;
        let needed = SNAPSHOT_HEADER_BYTES + count * CELL_BYTES;
        ensure_len(frame, needed)?;
        let cells = frame[SNAPSHOT_HEADER_BYTES..needed]
            .chunks_exact(CELL_BYTES)
            .map(decode_cell)
            .collect();
        Ok(Snapshot {
            playing,
            speed,
            cells,
        })
    }
}

fn ensure_len(frame: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if frame.len() < expected {
        return Err(ProtocolError::TooShort {
            expected,
            actual: frame.len(),
        });
    }
    Ok(())
}

fn encode_cell(cell: &Cell, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&cell.x.to_be_bytes());
    buf.extend_from_slice(&cell.y.to_be_bytes());
    buf.push((cell.color >> 16) as u8);
    buf.push((cell.color >> 8) as u8);
    buf.push(cell.color as u8);
    buf.extend_from_slice(&cell.age.to_be_bytes());
}

fn decode_cell(b: &[u8]) -> Cell {
    Cell {
        x: u16::from_be_bytes([b[0], b[1]]),
        y: u16::from_be_bytes([b[2], b[3]]),
        color: u32::from(b[4]) << 16 | u32::from(b[5]) << 8 | u32::from(b[6]),
        age: u16::from_be_bytes([b[7], b[8]]),
    }
}
