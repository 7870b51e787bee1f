//! Commands that can be sent to the device.

use std::io;

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::{Map, Value};

use crate::constants::*;
use crate::types::Credential;

/// Commands understood by the device, tagged by their `command` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Request `device_id` and `salt`. Sent without credentials.
    SignIn,

    /// Query device status.
    DeviceStatus,

    /// Scan for wireless networks.
    WlanSurvey,

    /// Upgrade firmware from the image at `url`.
    FwUpgrade {
        /// Firmware image location.
        url: String,
    },

    /// Register the device with a cloud owner.
    Register {
        /// Owner identifier.
        owner_id: String,
        /// Owner token.
        owner_token: String,
        /// Device cloud URL.
        dcd_url: String,
    },

    /// Read settings.
    GetSetting {
        /// Settings to read.
        setting: Vec<SettingQuery>,
    },

    /// Write settings.
    SetSetting {
        /// Settings to write.
        setting: Vec<SettingUpdate>,
    },

    /// Keep the session alive.
    KeepAlive,

    /// Query setup status.
    GetSetupStatus,
}

impl Command {
    /// The `command` field value.
    pub fn name(&self) -> &'static str {
        match self {
            Command::SignIn => CMD_SIGN_IN,
            Command::DeviceStatus => CMD_DEVICE_STATUS,
            Command::WlanSurvey => CMD_WLAN_SURVEY,
            Command::FwUpgrade { .. } => CMD_FW_UPGRADE,
            Command::Register { .. } => CMD_REGISTER,
            Command::GetSetting { .. } => CMD_GET_SETTING,
            Command::SetSetting { .. } => CMD_SET_SETTING,
            Command::KeepAlive => CMD_KEEP_ALIVE,
            Command::GetSetupStatus => CMD_GET_SETUP_STATUS,
        }
    }

    /// Whether the command must carry a device token.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Command::SignIn)
    }

    /// Query one setting class, e.g. [`TYPE_SOCKET`] or [`TYPE_LED`].
    pub fn query_setting(setting_type: u16, idx: i32) -> Self {
        Command::GetSetting {
            setting: vec![SettingQuery { setting_type, idx }],
        }
    }

    /// Socket-state query. `idx` is 0-based, or [`ALL_SOCKETS`].
    pub fn query_sockets(idx: i32) -> Self {
        Self::query_setting(TYPE_SOCKET, idx)
    }

    /// Switch the 1-based socket `index` on or off.
    pub fn set_socket(name: String, index: u8, on: bool) -> Self {
        Command::SetSetting {
            setting: vec![SettingUpdate {
                uid: 0,
                metadata: SettingMetadata {
                    value: i64::from(on),
                },
                name,
                idx: i32::from(index) - 1,
                setting_type: TYPE_SOCKET,
            }],
        }
    }
}

/// One entry of a `get_setting` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingQuery {
    /// Setting class, e.g. [`TYPE_SOCKET`].
    #[serde(rename = "type")]
    pub setting_type: u16,
    /// 0-based index, or -1 for all.
    pub idx: i32,
}

/// One entry of a `set_setting` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingUpdate {
    /// Always 0.
    pub uid: u32,
    /// New value.
    pub metadata: SettingMetadata,
    /// Cosmetic name, see [`crate::setting_name`].
    pub name: String,
    /// 0-based index.
    pub idx: i32,
    /// Setting class.
    #[serde(rename = "type")]
    pub setting_type: u16,
}

/// Value wrapper used by settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingMetadata {
    /// 1 = on, 0 = off for sockets.
    pub value: i64,
}

// ============================================================================
// Envelope
// ============================================================================

/// Fields merged into every command before it is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sequence id (ignored by the device).
    pub sequence_id: u32,
    /// Local connection id (ignored by the device).
    pub local_cid: u32,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Client id.
    pub client_id: String,
    /// Credentials, once signed in.
    pub credential: Option<Credential>,
}

impl Envelope {
    /// Envelope with the fixed sequence fields.
    pub fn new(timestamp: i64, credential: Option<Credential>) -> Self {
        Envelope {
            sequence_id: SEQUENCE_ID,
            local_cid: LOCAL_CID,
            timestamp,
            client_id: CLIENT_ID.to_string(),
            credential,
        }
    }

    /// Merge envelope, credential and command fields into one JSON object.
    /// Command fields win on conflict.
    pub fn to_value(&self, command: &Command) -> Result<Value, serde_json::Error> {
        let mut body = Map::new();
        body.insert("sequence_id".into(), Value::from(self.sequence_id));
        body.insert("local_cid".into(), Value::from(self.local_cid));
        body.insert("timestamp".into(), Value::from(self.timestamp));
        body.insert("client_id".into(), Value::from(self.client_id.as_str()));

        if let Some(credential) = &self.credential {
            body.insert("device_id".into(), Value::from(credential.device_id.as_str()));
            body.insert(
                "device_token".into(),
                Value::from(credential.device_token.as_str()),
            );
        }

        if let Value::Object(fields) = serde_json::to_value(command)? {
            body.extend(fields);
        }

        Ok(Value::Object(body))
    }

    /// Serialize the merged command to compact JSON with every non-ASCII
    /// character written as a `\uXXXX` escape, so the text is always ASCII.
    pub fn encode(&self, command: &Command) -> Result<String, serde_json::Error> {
        let mut out = Vec::new();
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, AsciiFormatter);
        self.to_value(command)?.serialize(&mut serializer)?;
        String::from_utf8(out).map_err(serde::ser::Error::custom)
    }
}

/// Compact formatter that escapes non-ASCII string content as UTF-16 units.
struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (i, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            writer.write_all(fragment[start..i].as_bytes())?;
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            start = i + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }
}
