//! Command/response correlation over one transport.
//!
//! The device replies with exactly one frame per command, but it may also
//! push asynchronous keep-alive echoes at any time. Callers that cannot rule
//! those out use [`ReplyMode::Matching`], which reads until a reply echoing the
//! request's command name shows up.

use std::time::Duration;

use chrono::Utc;
use dsplink_protocol::{
    Command, DecodeError, Envelope, FrameDecoder, FrameEncoder, Model, ProtocolError, Response,
    SettingReply, SocketStates, ALL_SOCKETS, CMD_KEEP_ALIVE,
};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::auth::AuthSession;
use crate::error::{is_timeout, ClientError, Result, TransportError};
use crate::transport::Transport;

/// Frames read before a matching read gives up.
pub const MATCH_ATTEMPTS: usize = 10;
/// Per-read timeout while matching.
pub const MATCH_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// How the reply to a command is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Read exactly one frame.
    Simple,
    /// Skip unrelated frames until the command's own reply arrives, then fall
    /// back to one simple read if the attempt budget runs out.
    Matching,
}

/// Serializes commands onto a transport and reads their replies.
#[derive(Debug)]
pub struct CommandChannel<T: Transport> {
    transport: T,
    decoder: FrameDecoder,
    match_attempts: usize,
    match_timeout: Duration,
    last_invalid_reply: Option<Response>,
}

impl<T: Transport> CommandChannel<T> {
    /// Channel over an upgraded transport.
    pub fn new(transport: T) -> Self {
        CommandChannel {
            transport,
            decoder: FrameDecoder::new(),
            match_attempts: MATCH_ATTEMPTS,
            match_timeout: MATCH_READ_TIMEOUT,
            last_invalid_reply: None,
        }
    }

    /// Override the matching budget.
    pub fn with_match_budget(mut self, attempts: usize, timeout: Duration) -> Self {
        self.match_attempts = attempts;
        self.match_timeout = timeout;
        self
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Whether the transport is still open.
    pub fn is_alive(&mut self) -> bool {
        self.transport.is_alive()
    }

    /// Close the transport.
    pub fn close(&mut self) {
        self.transport.close();
    }

    /// The last socket-state reply that could not be interpreted.
    pub fn last_invalid_reply(&self) -> Option<&Response> {
        self.last_invalid_reply.as_ref()
    }

    /// Send `command` and return its reply.
    ///
    /// Commands other than `sign_in` need a signed-in `auth`. A reply with a
    /// nonzero `code` becomes [`ClientError::Device`].
    pub fn send(
        &mut self,
        command: &Command,
        auth: &AuthSession,
        mode: ReplyMode,
    ) -> Result<Response> {
        let credential = if command.requires_auth() {
            Some(auth.credential()?)
        } else {
            None
        };

        let json = Envelope::new(Utc::now().timestamp(), credential).encode(command)?;
        debug!(command = command.name(), ?mode, "sending command");
        trace!(payload = %json, "outbound");

        let frame = FrameEncoder::encode_text(&json)?;
        self.transport.send_bytes(&frame)?;

        let response = match mode {
            ReplyMode::Simple => self.read_reply()?,
            ReplyMode::Matching => match self.read_matching(command.name())? {
                Some(response) => response,
                None => {
                    debug!(
                        command = command.name(),
                        attempts = self.match_attempts,
                        "no matching reply, falling back to a single read"
                    );
                    self.read_reply()?
                }
            },
        };

        match response {
            Response::Error { code, message, .. } => Err(ClientError::Device { code, message }),
            response => Ok(response),
        }
    }

    /// Query all sockets. `None` if the reply has the wrong shape.
    pub fn query_socket_states(&mut self, auth: &AuthSession) -> Result<Option<SocketStates>> {
        let response = self.send(&Command::query_sockets(ALL_SOCKETS), auth, ReplyMode::Matching)?;
        let states = match &response {
            Response::GetSetting(reply) => reply.socket_states(),
            _ => None,
        };
        if states.is_none() {
            self.retain_invalid(response);
        }
        Ok(states)
    }

    /// Query one 1-based socket. `None` if the reply has the wrong shape.
    pub fn query_socket_state(&mut self, auth: &AuthSession, index: u8) -> Result<Option<bool>> {
        let command = Command::query_sockets(i32::from(index) - 1);
        let response = self.send(&command, auth, ReplyMode::Matching)?;
        let state = match &response {
            Response::GetSetting(reply) => reply.first_value(),
            _ => None,
        };
        if state.is_none() {
            self.retain_invalid(response);
        }
        Ok(state)
    }

    /// Switch a 1-based socket and return the acknowledgement.
    ///
    /// `setting[0].metadata.value` in the acknowledgement is the device's
    /// authoritative new state.
    pub fn set_socket(
        &mut self,
        auth: &AuthSession,
        model: Model,
        index: u8,
        on: bool,
    ) -> Result<SettingReply> {
        let name = auth.setting_name(model, index)?;
        let response = self.send(&Command::set_socket(name, index, on), auth, ReplyMode::Matching)?;
        match response {
            Response::SetSetting(reply) => Ok(reply),
            other => {
                self.retain_invalid(other);
                Ok(SettingReply::new(Value::Null))
            }
        }
    }

    fn retain_invalid(&mut self, response: Response) {
        warn!(reply = ?response, "unexpected reply shape");
        self.last_invalid_reply = Some(response);
    }

    fn read_reply(&mut self) -> Result<Response> {
        let frame = self.decoder.read_frame(&mut self.transport)?;
        let text = frame.message_text().ok_or(ProtocolError::NotTextMessage {
            opcode: frame.opcode.as_u8(),
            final_frame: frame.final_frame,
        })?;
        trace!(payload = %text, "inbound");
        Ok(Response::from_json(&text)?)
    }

    fn read_matching(&mut self, expected: &str) -> Result<Option<Response>> {
        let attempts = self.match_attempts;
        let timeout = self.match_timeout;
        let original = self.transport.read_timeout()?;

        let decoder = &mut self.decoder;
        let mut transport = scopeguard::guard(&mut self.transport, move |t| {
            if let Err(e) = t.set_read_timeout(original) {
                warn!(error = %e, "failed to restore read timeout");
            }
        });
        transport.set_read_timeout(Some(timeout))?;

        for attempt in 1..=attempts {
            let frame = match decoder.read_frame(&mut **transport) {
                Ok(frame) => frame,
                Err(DecodeError::Io(e)) if is_timeout(&e) => {
                    trace!(attempt, expected, "read timed out");
                    continue;
                }
                Err(DecodeError::Io(e)) => return Err(TransportError::Io(e).into()),
                Err(DecodeError::Protocol(e)) => {
                    debug!(attempt, error = %e, "skipping malformed frame");
                    continue;
                }
            };

            let Some(text) = frame.message_text() else {
                trace!(attempt, opcode = ?frame.opcode, "skipping frame without text");
                continue;
            };

            let response = match Response::from_json(&text) {
                Ok(response) => response,
                Err(e) => {
                    debug!(attempt, error = %e, payload = %text, "skipping unparseable reply");
                    continue;
                }
            };

            match response.command() {
                Some(name) if name == expected => return Ok(Some(response)),
                Some(CMD_KEEP_ALIVE) => trace!(attempt, expected, "skipping keep_alive echo"),
                other => debug!(attempt, expected, received = ?other, "skipping unrelated reply"),
            }
        }

        Ok(None)
    }
}
