//! # dsplink-client
//!
//! Blocking client for D-Link DSP-W245 and DSP-W115 smart plugs.
//!
//! The crate stacks four layers on top of [`dsplink_protocol`]:
//!
//! - **Transport**: TCP + legacy TLS to port 8080, followed by the HTTP
//!   upgrade preamble the device expects ([`TlsConnector`]).
//! - **Auth**: `sign_in` and the per-command device token ([`AuthSession`]).
//! - **Channel**: command/reply correlation that skips asynchronous
//!   keep-alive echoes ([`CommandChannel`]).
//! - **Supervisor**: liveness checks, reconnect-and-retry, failure tracking
//!   and stale-state fallback ([`Supervisor`]).
//!
//! ## Example
//!
//! ```no_run
//! use dsplink_client::{DeviceConfig, Supervisor};
//!
//! let config = DeviceConfig::new("192.168.0.20", "000000");
//! let plug = Supervisor::from_config(&config)?;
//!
//! let outcome = plug.poll()?;
//! println!("sockets: {:?} (stale: {})", outcome.sockets, outcome.stale);
//!
//! let on = plug.set_socket(1, true)?;
//! println!("socket 1 is now {}", if on { "on" } else { "off" });
//! # Ok::<(), dsplink_client::ClientError>(())
//! ```
//!
//! All calls block on network I/O. Run them on a worker thread if the caller
//! cannot tolerate multi-second stalls.

mod auth;
mod channel;
mod config;
mod error;
mod setup;
mod supervisor;
mod transport;

pub use auth::{device_token, AuthSession};
pub use channel::{CommandChannel, ReplyMode, MATCH_ATTEMPTS, MATCH_READ_TIMEOUT};
pub use config::{
    DeviceConfig, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_NAME, DEFAULT_SCAN_INTERVAL_SECS,
    SCAN_INTERVAL_RANGE,
};
pub use error::{is_timeout, ClientError, ErrorKind, Result, TransportError};
pub use setup::{probe, probe_with, DeviceIdentity};
pub use supervisor::{
    wait_interval, FailureRecord, PollOutcome, SessionState, SocketGuard, SocketLocks, Supervisor,
    FAILURE_HISTORY_LEN, UNAVAILABLE_THRESHOLD,
};
pub use transport::{
    send_upgrade, upgrade_request, Connector, TlsConnector, TlsTransport, Transport,
    CONNECT_TIMEOUT, DEFAULT_PORT, IO_TIMEOUT, UPGRADE_PATH,
};
