//! Responses from the device.
//!
//! Every reply is a JSON object. A nonzero `code` marks a device-side
//! rejection; otherwise the `command` echo selects the variant. Setting
//! replies keep their raw JSON so shape problems can be reported instead of
//! raised.

use serde::de::Error as _;
use serde_json::{Map, Value};

use crate::constants::*;
use crate::types::SocketStates;

/// A parsed device reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Reply to `sign_in`.
    SignIn {
        /// Device identifier.
        device_id: Option<String>,
        /// Salt for token derivation.
        salt: Option<String>,
    },

    /// Reply to `get_setting`.
    GetSetting(SettingReply),

    /// Acknowledgement of `set_setting`.
    SetSetting(SettingReply),

    /// Keep-alive reply or asynchronous echo.
    KeepAlive,

    /// Any other successful reply.
    Other {
        /// Echoed command name, if present.
        command: Option<String>,
        /// Full reply object.
        body: Map<String, Value>,
    },

    /// The device rejected the command.
    Error {
        /// Echoed command name, if present.
        command: Option<String>,
        /// Nonzero result code.
        code: i64,
        /// Device-supplied message.
        message: String,
    },
}

impl Response {
    /// Parse a reply from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Classify a reply object.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let Value::Object(body) = value else {
            return Err(serde_json::Error::custom("reply is not a JSON object"));
        };

        let command = body
            .get("command")
            .and_then(Value::as_str)
            .map(str::to_owned);

        if let Some(code) = body.get("code") {
            if code.as_i64() != Some(0) {
                let message = body
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string();
                return Ok(Response::Error {
                    command,
                    code: code.as_i64().unwrap_or(-1),
                    message,
                });
            }
        }

        let response = match command.as_deref() {
            Some(CMD_SIGN_IN) => sign_in(&body),
            // Some firmware omits the echo on the sign-in reply.
            None if body.contains_key("salt") => sign_in(&body),
            Some(CMD_GET_SETTING) => Response::GetSetting(SettingReply::new(Value::Object(body))),
            Some(CMD_SET_SETTING) => Response::SetSetting(SettingReply::new(Value::Object(body))),
            Some(CMD_KEEP_ALIVE) => Response::KeepAlive,
            _ => Response::Other { command, body },
        };
        Ok(response)
    }

    /// The echoed `command` name.
    pub fn command(&self) -> Option<&str> {
        match self {
            Response::SignIn { .. } => Some(CMD_SIGN_IN),
            Response::GetSetting(_) => Some(CMD_GET_SETTING),
            Response::SetSetting(_) => Some(CMD_SET_SETTING),
            Response::KeepAlive => Some(CMD_KEEP_ALIVE),
            Response::Other { command, .. } | Response::Error { command, .. } => command.as_deref(),
        }
    }

    /// Whether this is a device-side rejection.
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    /// The reply as a JSON object, for callers that only display it.
    pub fn into_value(self) -> Value {
        match self {
            Response::Other { body, .. } => Value::Object(body),
            Response::GetSetting(reply) | Response::SetSetting(reply) => reply.raw,
            Response::SignIn { device_id, salt } => serde_json::json!({
                "command": CMD_SIGN_IN,
                "device_id": device_id,
                "salt": salt,
            }),
            Response::KeepAlive => serde_json::json!({ "command": CMD_KEEP_ALIVE }),
            Response::Error {
                command,
                code,
                message,
            } => serde_json::json!({
                "command": command,
                "code": code,
                "message": message,
            }),
        }
    }
}

fn sign_in(body: &Map<String, Value>) -> Response {
    let field = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_owned);
    Response::SignIn {
        device_id: field("device_id"),
        salt: field("salt"),
    }
}

// ============================================================================
// Setting replies
// ============================================================================

/// Raw `get_setting`/`set_setting` reply with lenient accessors.
///
/// Accessors return `None` for any structural problem; the raw JSON stays
/// available for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingReply {
    raw: Value,
}

impl SettingReply {
    /// Wrap a raw reply.
    pub fn new(raw: Value) -> Self {
        SettingReply { raw }
    }

    /// The reply as received.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// `setting[0]`, if the array exists and is non-empty.
    pub fn first_setting(&self) -> Option<&Value> {
        self.raw.get("setting")?.as_array()?.first()
    }

    /// `setting[0].metadata.value` as on/off. Used for single-socket queries
    /// and for the state echoed by a `set_setting` acknowledgement.
    pub fn first_value(&self) -> Option<bool> {
        flag(self.first_setting()?.get("metadata")?.get("value")?)
    }

    /// All-socket states from `setting[0].metadata.value`, keyed 1-based.
    ///
    /// Expects a list of `{idx, metadata: {value}}`. Any malformed entry, or an
    /// empty list, yields `None`.
    pub fn socket_states(&self) -> Option<SocketStates> {
        let entries = self
            .first_setting()?
            .get("metadata")?
            .get("value")?
            .as_array()?;

        let mut states = SocketStates::new();
        for entry in entries {
            let idx = integer(entry.get("idx")?)?;
            let on = flag(entry.get("metadata")?.get("value")?)?;
            let socket = u8::try_from(idx.checked_add(1)?).ok().filter(|&s| s >= 1)?;
            states.insert(socket, on);
        }

        if states.is_empty() {
            None
        } else {
            Some(states)
        }
    }
}

fn integer(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str()?.trim().parse().ok())
}

fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        other => integer(other).map(|n| n == 1),
    }
}
