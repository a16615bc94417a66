//! Over-the-air frame layout.
//!
//! ```text
//! +--------+---------+---------+---------+----------+----------------+
//! | length | id[0]   | id[1]   | id[2]   | header?  | payload...     |
//! +--------+---------+---------+---------+----------+----------------+
//! ```
//!
//! `length` counts everything after itself. The header byte and payload are
//! only sent when the payload is non-empty. The radio appends its own CRC in
//! the 24-bit ID encoding.

use heapless::Vec;
use thiserror_no_std::Error;

use crate::header::DataHeader;
use crate::mem_pool::POOL_CAPACITY;

/// Length, ID, header and a full memory pool.
pub const MAX_FRAME_LEN: usize = 1 + ID_LEN + 1 + POOL_CAPACITY;

pub const ID_LEN: usize = 3;

pub type Frame = Vec<u8, MAX_FRAME_LEN>;

/// How the board ID is laid out in the three ID bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdEncoding {
    /// 24-bit ID; integrity from the radio's hardware CRC.
    Crc24,
    /// 21-bit ID followed by 3 parity bits; no hardware CRC.
    Legacy21,
}

impl IdEncoding {
    pub fn encode(self, board_id: u32) -> [u8; ID_LEN] {
        match self {
            IdEncoding::Crc24 => [
                (board_id >> 16) as u8,
                (board_id >> 8) as u8,
                board_id as u8,
            ],
            IdEncoding::Legacy21 => {
                let parity = (0..21)
                    .step_by(3)
                    .fold(0u8, |acc, shift| acc ^ ((board_id >> shift) & 0x07) as u8);
                [
                    (board_id >> 13) as u8,
                    (board_id >> 5) as u8,
                    ((board_id << 3) as u8) ^ parity,
                ]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("Payload of {len} bytes does not fit a frame")]
    PayloadTooLong { len: usize },
}

/// Assemble a frame from the encoded ID, header and payload.
pub fn build_frame(
    id: [u8; ID_LEN],
    header: DataHeader,
    payload: &[u8],
) -> Result<Frame, PacketError> {
    if payload.len() > POOL_CAPACITY {
        return Err(PacketError::PayloadTooLong { len: payload.len() });
    }

    let mut frame = Frame::new();
    let length = if payload.is_empty() {
        ID_LEN
    } else {
        ID_LEN + 1 + payload.len()
    };

    let overflow = PacketError::PayloadTooLong { len: payload.len() };
    frame.push(length as u8).map_err(|_| overflow)?;
    frame.extend_from_slice(&id).map_err(|_| overflow)?;
    if !payload.is_empty() {
        frame.push(header.to_byte()).map_err(|_| overflow)?;
        frame.extend_from_slice(payload).map_err(|_| overflow)?;
    }
    Ok(frame)
}
