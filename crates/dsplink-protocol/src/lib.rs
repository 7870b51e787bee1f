//! D-Link DSP Smart Plug Protocol
//!
//! This crate provides the wire-level pieces for talking to D-Link DSP-W245 and
//! DSP-W115 smart plugs. The device listens on a single TLS socket and speaks a
//! reduced, non-conformant variant of WebSocket framing that carries one JSON
//! object per frame.
//!
//! # Protocol Overview
//!
//! - **Frames**: client→device frames are always final, text and masked;
//!   device→client frames are decoded by a staged state machine that reads
//!   exactly the bytes each stage declares.
//! - **Commands** (host → device): JSON objects keyed by a `command` field and
//!   wrapped in an [`Envelope`] carrying sequence, timestamp and credentials.
//! - **Responses** (device → host): JSON objects echoing the `command` name,
//!   with a nonzero `code` signalling a device-side rejection.
//!
//! # Example
//!
//! ```rust,ignore
//! use dsplink_protocol::{Command, Envelope, FrameDecoder, FrameEncoder, Response};
//!
//! // Build and frame a command
//! let json = Envelope::new(timestamp, None).encode(&Command::SignIn)?;
//! let frame = FrameEncoder::encode_text(&json)?;
//!
//! // Read the reply off a byte stream
//! let text = FrameDecoder::new().read_message(&mut stream)?;
//! let response = Response::from_json(&text.unwrap_or_default())?;
//! ```

mod commands;
mod constants;
mod error;
mod frame;
mod responses;
mod types;

pub use commands::*;
pub use constants::*;
pub use error::*;
pub use frame::*;
pub use responses::*;
pub use types::*;
