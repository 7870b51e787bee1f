//! One-shot reachability check used when a device is first added.

use serde::Serialize;
use tracing::info;

use crate::auth::AuthSession;
use crate::channel::CommandChannel;
use crate::config::DeviceConfig;
use crate::error::{ClientError, Result};
use crate::transport::Connector;

/// Stable identity of a reachable device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    /// Device identifier from sign-in; stable across reconnects.
    pub device_id: String,
    /// Display title.
    pub title: String,
}

/// Connect to the configured device over TLS, sign in, and disconnect.
pub fn probe(config: &DeviceConfig) -> Result<DeviceIdentity> {
    config.validate()?;
    probe_with(&config.connector(), config)
}

/// [`probe`] over an arbitrary connector.
pub fn probe_with<C: Connector>(connector: &C, config: &DeviceConfig) -> Result<DeviceIdentity> {
    let mut channel = CommandChannel::new(connector.connect()?);
    let mut auth = AuthSession::new(config.pin.as_str());

    let signed_in = auth.sign_in(&mut channel);
    channel.close();
    signed_in?;

    let device_id = auth
        .device_id()
        .ok_or(ClientError::NotAuthenticated)?
        .to_string();
    info!(device_id = %device_id, host = %config.host, "device reachable");

    Ok(DeviceIdentity {
        device_id,
        title: config.name.clone(),
    })
}
