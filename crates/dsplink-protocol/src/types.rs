//! Common types used in the protocol.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// On/off state per socket, keyed by 1-based socket index.
pub type SocketStates = BTreeMap<u8, bool>;

/// Supported plug models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Model {
    /// DSP-W245, four switchable outlets.
    #[default]
    W245,
    /// DSP-W115, a single outlet.
    W115,
}

impl Model {
    /// Number of switchable sockets on this model.
    pub fn socket_count(self) -> u8 {
        match self {
            Model::W245 => 4,
            Model::W115 => 1,
        }
    }

    /// Whether `index` (1-based) names a socket on this model.
    pub fn has_socket(self, index: u8) -> bool {
        (1..=self.socket_count()).contains(&index)
    }

    /// Model string as used in setting names.
    pub fn as_str(self) -> &'static str {
        match self {
            Model::W245 => "W245",
            Model::W115 => "W115",
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown model string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown model '{0}' (expected W245 or W115)")]
pub struct UnknownModel(pub String);

impl FromStr for Model {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bare = trimmed
            .strip_prefix("DSP-")
            .or_else(|| trimmed.strip_prefix("dsp-"))
            .unwrap_or(trimmed);
        match bare.to_ascii_uppercase().as_str() {
            "W245" => Ok(Model::W245),
            "W115" => Ok(Model::W115),
            _ => Err(UnknownModel(s.to_string())),
        }
    }
}

/// The per-command credential attached once sign-in has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Device identifier returned by `sign_in`.
    pub device_id: String,
    /// `{device_id}-{sha1(pin + salt)}`.
    pub device_token: String,
}

/// Cosmetic setting name the device expects on socket writes:
/// `DSP-{model}-{last 4 of device_id}-{index}`.
pub fn setting_name(model: Model, device_id: &str, index: u8) -> String {
    let suffix = device_id
        .char_indices()
        .rev()
        .nth(3)
        .map_or(device_id, |(i, _)| &device_id[i..]);
    format!("DSP-{}-{}-{}", model, suffix, index)
}
