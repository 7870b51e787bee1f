//! Protocol error types.

use thiserror::Error;

/// Errors that can occur when encoding or validating a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// One of the three reserved header bits was set.
    #[error("reserved bits set in frame header: 0x{byte:02X}")]
    ReservedBitsSet {
        /// The offending first header byte.
        byte: u8,
    },

    /// Opcode is not one the protocol defines.
    #[error("bad opcode: {opcode}")]
    BadOpcode {
        /// The low four bits of the first header byte.
        opcode: u8,
    },

    /// A control frame arrived without FIN set.
    #[error("non-final frame for non-fragmentable opcode {opcode}")]
    NonFinalControlFrame {
        /// The control opcode.
        opcode: u8,
    },

    /// Extended length failed the sanity bound.
    #[error("bad frame length: {length}")]
    BadLength {
        /// The decoded length.
        length: u64,
    },

    /// Outbound payload is larger than the encoder supports.
    #[error("unsupported payload size: {length} bytes (max 65535)")]
    UnsupportedPayloadSize {
        /// Payload length in bytes.
        length: usize,
    },

    /// Outbound text has a character with no single-byte encoding.
    #[error("character {ch:?} has no single-byte encoding")]
    UnencodableChar {
        /// The first character above U+00FF.
        ch: char,
    },

    /// The frame decoded fine but carries no message text.
    #[error("frame carries no text message (opcode {opcode}, final {final_frame})")]
    NotTextMessage {
        /// Opcode of the frame.
        opcode: u8,
        /// Whether FIN was set.
        final_frame: bool,
    },
}

/// Errors that can occur while reading a frame from a byte source.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The byte source failed or timed out.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The bytes read do not form a valid frame.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
