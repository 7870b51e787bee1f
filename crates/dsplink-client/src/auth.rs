//! Per-connection credentials.
//!
//! `sign_in` yields a device id and salt. Every later command carries
//! `{device_id}-{sha1(pin + salt)}`, recomputed on each use.

use std::fmt;

use dsplink_protocol::{setting_name, Command, Credential, Model, Response};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::channel::{CommandChannel, ReplyMode};
use crate::error::{ClientError, Result};
use crate::transport::Transport;

/// Derive the device token for `pin`, `salt` and `device_id`.
pub fn device_token(pin: &str, salt: &str, device_id: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(pin.as_bytes());
    hasher.update(salt.as_bytes());
    format!("{}-{}", device_id, hex::encode(hasher.finalize()))
}

/// Credentials for one connection. Empty until [`AuthSession::sign_in`]
/// succeeds; cleared on disconnect.
#[derive(Clone)]
pub struct AuthSession {
    pin: String,
    device_id: Option<String>,
    salt: Option<String>,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("pin", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("salt", &self.salt)
            .finish()
    }
}

impl AuthSession {
    /// An empty session for `pin`.
    pub fn new(pin: impl Into<String>) -> Self {
        AuthSession {
            pin: pin.into(),
            device_id: None,
            salt: None,
        }
    }

    /// Whether sign-in has completed.
    pub fn is_signed_in(&self) -> bool {
        self.device_id.is_some() && self.salt.is_some()
    }

    /// Device id from sign-in.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Salt from sign-in.
    pub fn salt(&self) -> Option<&str> {
        self.salt.as_deref()
    }

    /// Store the sign-in result.
    pub fn establish(&mut self, device_id: impl Into<String>, salt: impl Into<String>) {
        self.device_id = Some(device_id.into());
        self.salt = Some(salt.into());
    }

    /// Forget the device id and salt.
    pub fn clear(&mut self) {
        self.device_id = None;
        self.salt = None;
    }

    /// Fresh device token.
    pub fn token(&self) -> Result<String> {
        Ok(self.credential()?.device_token)
    }

    /// Device id and fresh token.
    pub fn credential(&self) -> Result<Credential> {
        match (&self.device_id, &self.salt) {
            (Some(device_id), Some(salt)) => Ok(Credential {
                device_id: device_id.clone(),
                device_token: device_token(&self.pin, salt, device_id),
            }),
            _ => Err(ClientError::NotAuthenticated),
        }
    }

    /// Setting name for socket `index` on `model`.
    pub fn setting_name(&self, model: Model, index: u8) -> Result<String> {
        let device_id = self.device_id().ok_or(ClientError::NotAuthenticated)?;
        Ok(setting_name(model, device_id, index))
    }

    /// Run the sign-in exchange and store the device id and salt.
    pub fn sign_in<T: Transport>(&mut self, channel: &mut CommandChannel<T>) -> Result<()> {
        self.clear();
        let response = channel.send(&Command::SignIn, self, ReplyMode::Simple)?;

        let (device_id, salt) = match response {
            Response::SignIn {
                device_id: Some(device_id),
                salt: Some(salt),
            } => (device_id, salt),
            other => {
                return Err(ClientError::MalformedReply {
                    command: Command::SignIn.name().to_string(),
                    reason: format!("expected device_id and salt, got {:?}", other),
                })
            }
        };

        debug!(device_id = %device_id, "signed in");
        self.establish(device_id, salt);
        Ok(())
    }
}
