//! Envelope framing for byte streams.
//!
//! Every envelope on the wire is a fixed 9-byte header followed by the payload:
//!
//! ```text
//! +------+-----+-----+-----------------+----------------+-----------+
//! | type | src | dst | game time (u32) | length (u16)   | payload   |
//! |  u8  | u8  | u8  | big-endian      | big-endian     | (length)  |
//! +------+-----+-----+-----------------+----------------+-----------+
//! ```
//!
//! The whole frame, header included, never exceeds [`MAX_MSG_SIZE`]. Decoding
//! is all-or-nothing: an envelope is either fully produced or rejected.

use crate::messages::{Destination, Envelope, MessageType, PlayerIndex};

/// Largest frame, header included.
pub const MAX_MSG_SIZE: usize = 16384;
/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 9;
/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_MSG_SIZE - HEADER_SIZE;

/// Errors produced while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The length field disagrees with the bytes actually present.
    #[error("length field says {declared} bytes but {actual} are present")]
    LengthMismatch {
        /// Payload length claimed by the header.
        declared: usize,
        /// Payload bytes actually available.
        actual: usize,
    },

    /// The type tag is outside every known range.
    #[error("unknown message type tag {0}")]
    UnknownType(u8),

    /// The frame would exceed the maximum message size.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    TooLarge {
        /// Total frame size.
        size: usize,
        /// The maximum.
        max: usize,
    },

    /// Fewer bytes than a header.
    #[error("truncated frame: {0} bytes")]
    Truncated(usize),

    /// A control payload record failed to (de)serialize.
    #[error("payload error: {0}")]
    Payload(#[from] postcard::Error),

    /// A compressed payload could not be expanded.
    #[error("decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
}

impl CodecError {
    /// Whether the failure leaves the byte stream unframeable.
    ///
    /// A fatal error means the connection must be dropped; anything else only
    /// discards the offending envelope.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TooLarge { .. })
    }
}

/// Serialize an envelope into a single frame.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let size = HEADER_SIZE + envelope.payload.len();
    if size > MAX_MSG_SIZE {
        return Err(CodecError::TooLarge {
            size,
            max: MAX_MSG_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(size);
    buf.push(envelope.message_type.tag());
    buf.push(envelope.source.0);
    buf.push(envelope.destination.to_wire());
    buf.extend_from_slice(&envelope.game_time.to_be_bytes());
    buf.extend_from_slice(&(envelope.payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(&envelope.payload);
    Ok(buf)
}

/// Parse exactly one frame. Trailing or missing bytes are an error.
pub fn decode(buf: &[u8]) -> Result<Envelope, CodecError> {
    if buf.len() > MAX_MSG_SIZE {
        return Err(CodecError::TooLarge {
            size: buf.len(),
            max: MAX_MSG_SIZE,
        });
    }
    let header = Header::parse(buf)?;
    let actual = buf.len() - HEADER_SIZE;
    if header.payload_len != actual {
        return Err(CodecError::LengthMismatch {
            declared: header.payload_len,
            actual,
        });
    }
    header.into_envelope(&buf[HEADER_SIZE..])
}

struct Header {
    tag: u8,
    source: u8,
    destination: u8,
    game_time: u32,
    payload_len: usize,
}

impl Header {
    fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::Truncated(buf.len()));
        }
        Ok(Self {
            tag: buf[0],
            source: buf[1],
            destination: buf[2],
            game_time: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
            payload_len: u16::from_be_bytes([buf[7], buf[8]]) as usize,
        })
    }

    fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len
    }

    fn into_envelope(self, payload: &[u8]) -> Result<Envelope, CodecError> {
        let message_type =
            MessageType::from_tag(self.tag).ok_or(CodecError::UnknownType(self.tag))?;
        Ok(Envelope {
            message_type,
            source: PlayerIndex(self.source),
            destination: Destination::from_wire(self.destination),
            game_time: self.game_time,
            payload: payload.to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Stream decoder
// ---------------------------------------------------------------------------

/// Reassembles frames from arbitrarily split stream reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete frame out of the buffer.
    ///
    /// Returns `None` when more bytes are needed. A frame with an unknown tag
    /// is consumed and reported as an error so the caller can count it; the
    /// stream stays aligned. A fatal error leaves the buffer untouched.
    pub fn next_frame(&mut self) -> Option<Result<Envelope, CodecError>> {
        let header = match Header::parse(&self.buf) {
            Ok(h) => h,
            Err(_) => return None,
        };
        let frame_len = header.frame_len();
        if frame_len > MAX_MSG_SIZE {
            return Some(Err(CodecError::TooLarge {
                size: frame_len,
                max: MAX_MSG_SIZE,
            }));
        }
        if self.buf.len() < frame_len {
            return None;
        }
        let result = header.into_envelope(&self.buf[HEADER_SIZE..frame_len]);
        self.buf.drain(..frame_len);
        Some(result)
    }
}
