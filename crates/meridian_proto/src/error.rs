//! Protocol error types.
//!
//! Every decode-side failure is fatal for the connection it occurred on.
//! Peers that produce malformed frames are treated as buggy, not as a
//! condition to recover from.

use crate::frame::MAX_FRAME_SIZE;

/// Errors produced while framing, encoding, or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// A frame announced a length beyond the 2 MiB cap.
    #[error("frame too large: {size} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge {
        /// Announced total size in bytes.
        size: usize,
    },

    /// A frame announced a length too small to hold the type word.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The bad length value from the header.
        length: u32,
    },

    /// The payload ended before a field could be fully read.
    #[error("truncated payload: need {needed} more bytes, have {have}")]
    Truncated {
        /// Minimum bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        have: usize,
    },

    /// An unknown value type tag was encountered.
    #[error("unknown value tag {0:#04x}")]
    UnknownValueTag(u8),

    /// An unknown packet type code was encountered.
    #[error("unknown packet type {0}")]
    UnknownPacketType(u16),

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// A packet payload decoded, but its fields were inconsistent.
    #[error("malformed {packet} packet: {detail}")]
    Malformed {
        /// Wire name of the packet being decoded.
        packet: &'static str,
        /// What was wrong with it.
        detail: String,
    },

    /// Underlying transport failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    /// Whether this error came from the transport rather than the codec.
    ///
    /// Transport errors trigger reconnect-with-backoff; codec errors drop
    /// the connection permanently (peer bug).
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ProtoError::Io(_))
    }
}
