//! Frame encoding/decoding.
//!
//! The device speaks a cut-down WebSocket framing. Only the paths the device
//! actually exercises are supported:
//!
//! ```text
//! +-----+------+----------+--------------+----------------+-----------------+
//! | FIN | RSV  | opcode:4 | MASK | len:7 | ext len (0/2/8)| mask key (0/4)  | payload
//! +-----+------+----------+--------------+----------------+-----------------+
//! ```
//!
//! Outbound frames are always final, text, and masked with a fresh key, and
//! never exceed 65535 bytes of payload. Inbound frames are decoded one at a
//! time by [`FrameDecoder`], which pulls exactly the bytes each stage needs
//! from a blocking byte source.

use std::io::{self, Read};

use bytes::{BufMut, BytesMut};

use crate::constants::*;
use crate::error::{DecodeError, ProtocolError};

// ============================================================================
// Opcode
// ============================================================================

/// Frame opcodes the protocol defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    #[default]
    Continuation,
    /// UTF-8 (in practice Latin-1) text.
    Text,
    /// Binary data.
    Binary,
    /// Close.
    Close,
    /// Ping.
    Ping,
    /// Pong.
    Pong,
}

impl Opcode {
    /// Parse the low four header bits, or `None` for reserved opcodes.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            OP_CONTINUATION => Some(Opcode::Continuation),
            OP_TEXT => Some(Opcode::Text),
            OP_BINARY => Some(Opcode::Binary),
            OP_CLOSE => Some(Opcode::Close),
            OP_PING => Some(Opcode::Ping),
            OP_PONG => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// The wire value of this opcode.
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => OP_CONTINUATION,
            Opcode::Text => OP_TEXT,
            Opcode::Binary => OP_BINARY,
            Opcode::Close => OP_CLOSE,
            Opcode::Ping => OP_PING,
            Opcode::Pong => OP_PONG,
        }
    }

    /// Whether a frame with this opcode may have FIN cleared.
    pub fn is_fragmentable(self) -> bool {
        matches!(self, Opcode::Continuation | Opcode::Text | Opcode::Binary)
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A single decoded or to-be-encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// FIN bit.
    pub final_frame: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Masking key, present only on masked frames.
    pub mask: Option<[u8; MASK_KEY_SIZE]>,
    /// Payload bytes, always stored unmasked.
    pub payload: Vec<u8>,
}

impl Frame {
    /// An unmasked, final text frame. Inverse of [`Frame::message_text`]: each
    /// character becomes one byte, so anything above U+00FF is rejected.
    pub fn text(text: &str) -> Result<Self, ProtocolError> {
        Ok(Frame {
            final_frame: true,
            opcode: Opcode::Text,
            mask: None,
            payload: latin1_bytes(text)?,
        })
    }

    /// Whether the frame carries a masking key.
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The message text, if this is a final text frame.
    ///
    /// Bytes map 1:1 to characters; the device never sends multi-byte UTF-8.
    /// Every other opcode combination yields `None`.
    pub fn message_text(&self) -> Option<String> {
        if self.final_frame && self.opcode == Opcode::Text {
            Some(self.payload.iter().map(|&b| b as char).collect())
        } else {
            None
        }
    }

    /// Serialize the frame, masking the payload if a key is present.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let length = self.payload.len();
        if length > MAX_ENCODED_PAYLOAD {
            return Err(ProtocolError::UnsupportedPayloadSize { length });
        }

        let header_len = if length <= MAX_INLINE_LENGTH { 2 } else { 4 };
        let mask_len = if self.is_masked() { MASK_KEY_SIZE } else { 0 };
        let mut buf = BytesMut::with_capacity(header_len + mask_len + length);

        let fin = if self.final_frame { FIN } else { 0 };
        buf.put_u8(fin | self.opcode.as_u8());

        let mask_bit = if self.is_masked() { MASK_BIT } else { 0 };
        if length <= MAX_INLINE_LENGTH {
            buf.put_u8(mask_bit | length as u8);
        } else {
            buf.put_u8(mask_bit | LENGTH_16_MARKER);
            buf.put_u16(length as u16);
        }

        match self.mask {
            Some(mask) => {
                buf.put_slice(&mask);
                let start = buf.len();
                buf.put_slice(&self.payload);
                apply_mask(&mut buf[start..], mask);
            }
            None => buf.put_slice(&self.payload),
        }

        Ok(buf.to_vec())
    }
}

/// XOR `data` in place with the 4-byte key. Applying it twice restores the input.
pub fn apply_mask(data: &mut [u8], mask: [u8; MASK_KEY_SIZE]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % MASK_KEY_SIZE];
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Encoder for client→device frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEncoder;

impl FrameEncoder {
    /// Encode `text` as a final, masked text frame with a fresh random key.
    pub fn encode_text(text: &str) -> Result<Vec<u8>, ProtocolError> {
        Self::encode_text_with_mask(text, rand::random())
    }

    /// Encode `text` with a caller-chosen masking key.
    pub fn encode_text_with_mask(
        text: &str,
        mask: [u8; MASK_KEY_SIZE],
    ) -> Result<Vec<u8>, ProtocolError> {
        Frame {
            mask: Some(mask),
            ..Frame::text(text)?
        }
        .encode()
    }
}

fn latin1_bytes(text: &str) -> Result<Vec<u8>, ProtocolError> {
    text.chars()
        .map(|ch| u8::try_from(ch).map_err(|_| ProtocolError::UnencodableChar { ch }))
        .collect()
}

// ============================================================================
// Decoder
// ============================================================================

/// Stage of an in-progress frame parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeState {
    /// Waiting for the FIN/RSV/opcode byte.
    #[default]
    AwaitOpcode,
    /// Waiting for the MASK/length byte.
    AwaitLength,
    /// Waiting for a 2- or 8-byte big-endian extended length.
    AwaitExtendedLength(usize),
    /// Waiting for the 4-byte masking key.
    AwaitMask,
    /// Waiting for this many payload bytes.
    AwaitPayload(usize),
}

/// Staged decoder for device→client frames.
///
/// Each call to [`FrameDecoder::read_frame`] consumes exactly one frame from the
/// source. Stages only move forward within a frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    state: DecodeState,
    final_frame: bool,
    opcode: Opcode,
    masked: bool,
    length: usize,
    mask: Option<[u8; MASK_KEY_SIZE]>,
}

impl FrameDecoder {
    /// Create a decoder waiting for a new frame.
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    /// Current stage. Back at `AwaitOpcode` after every complete frame.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Read one frame from `source`, blocking until every stage is satisfied.
    pub fn read_frame<R: Read + ?Sized>(&mut self, source: &mut R) -> Result<Frame, DecodeError> {
        self.reset();

        loop {
            match self.state {
                DecodeState::AwaitOpcode => {
                    let byte = read_byte(source)?;
                    self.parse_opcode(byte)?;
                    self.state = DecodeState::AwaitLength;
                }
                DecodeState::AwaitLength => {
                    let byte = read_byte(source)?;
                    self.state = self.parse_length(byte);
                }
                DecodeState::AwaitExtendedLength(size) => {
                    let mut buf = [0u8; 8];
                    source.read_exact(&mut buf[..size])?;
                    self.length = extended_length(&buf[..size])?;
                    self.state = self.after_length();
                }
                DecodeState::AwaitMask => {
                    let mut mask = [0u8; MASK_KEY_SIZE];
                    source.read_exact(&mut mask)?;
                    self.mask = Some(mask);
                    self.state = DecodeState::AwaitPayload(self.length);
                }
                DecodeState::AwaitPayload(length) => {
                    let mut payload = Vec::new();
                    (&mut *source).take(length as u64).read_to_end(&mut payload)?;
                    if payload.len() < length {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("frame payload truncated: {} of {} bytes", payload.len(), length),
                        )
                        .into());
                    }
                    if let Some(mask) = self.mask {
                        apply_mask(&mut payload, mask);
                    }
                    self.state = DecodeState::AwaitOpcode;
                    return Ok(Frame {
                        final_frame: self.final_frame,
                        opcode: self.opcode,
                        mask: self.mask,
                        payload,
                    });
                }
            }
        }
    }

    /// Read one frame and return its message text, if it carries any.
    pub fn read_message<R: Read + ?Sized>(
        &mut self,
        source: &mut R,
    ) -> Result<Option<String>, DecodeError> {
        let frame = self.read_frame(source)?;
        let text = frame.message_text();
        if text.is_none() {
            log::trace!(
                "frame without message text: opcode={:?} final={} len={}",
                frame.opcode,
                frame.final_frame,
                frame.len()
            );
        }
        Ok(text)
    }

    fn reset(&mut self) {
        *self = FrameDecoder::default();
    }

    fn parse_opcode(&mut self, byte: u8) -> Result<(), ProtocolError> {
        if byte & (RSV1 | RSV2 | RSV3) != 0 {
            return Err(ProtocolError::ReservedBitsSet { byte });
        }

        let raw = byte & OPCODE_MASK;
        let opcode = Opcode::from_u8(raw).ok_or(ProtocolError::BadOpcode { opcode: raw })?;
        let final_frame = byte & FIN == FIN;

        if !final_frame && !opcode.is_fragmentable() {
            return Err(ProtocolError::NonFinalControlFrame { opcode: raw });
        }

        self.final_frame = final_frame;
        self.opcode = opcode;
        self.mask = None;
        Ok(())
    }

    fn parse_length(&mut self, byte: u8) -> DecodeState {
        self.masked = byte & MASK_BIT == MASK_BIT;

        match byte & LENGTH_MASK {
            LENGTH_16_MARKER => DecodeState::AwaitExtendedLength(2),
            LENGTH_64_MARKER => DecodeState::AwaitExtendedLength(8),
            length => {
                self.length = length as usize;
                self.after_length()
            }
        }
    }

    fn after_length(&self) -> DecodeState {
        if self.masked {
            DecodeState::AwaitMask
        } else {
            DecodeState::AwaitPayload(self.length)
        }
    }
}

fn read_byte<R: Read + ?Sized>(source: &mut R) -> io::Result<u8> {
    let mut byte = [0u8; 1];
    source.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn extended_length(bytes: &[u8]) -> Result<usize, ProtocolError> {
    let length = bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    if length > MAX_DECODED_LENGTH {
        return Err(ProtocolError::BadLength { length });
    }
    Ok(length as usize)
}
