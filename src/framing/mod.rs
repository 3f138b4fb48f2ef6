//! Frame format and the engine that moves messages through it.
//!
//! Every message travels as one frame:
//!
//! ```text
//! +----------------+--------------------+------------------+
//! | id: u16 (BE)   | length: u32 (BE)   | payload          |
//! +----------------+--------------------+------------------+
//!        2 bytes          4 bytes          `length` bytes
//! ```
//!
//! There is no magic number, version or checksum. Frames follow each other
//! without separators.

pub(crate) mod buffer;
mod engine;
mod processor;

pub use buffer::{write_all_spinning, ByteRegion};
pub use engine::{read_frames, write_frames, FrameBuffers};
pub use processor::MessageProcessor;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 6;

/// The frame of an [`EmptyMessage`](crate::EmptyMessage).
pub const HEARTBEAT_FRAME: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub id: u16,
    /// Payload length, excluding the header.
    pub length: u32,
}

impl FrameHeader {
    /// Parses the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than [`HEADER_SIZE`].
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            id: u16::from_be_bytes([bytes[0], bytes[1]]),
            length: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0; HEADER_SIZE];
        bytes[..2].copy_from_slice(&self.id.to_be_bytes());
        bytes[2..].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Header plus payload length.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }
}
