//! Session supervision: connect, sign in, poll, write, and recover.
//!
//! A [`Supervisor`] owns the only connection to one device. Every command is
//! preceded by a liveness check and gets one reconnect-and-retry on failure.
//! Polls additionally track consecutive failures; the device is reported
//! unavailable only after [`UNAVAILABLE_THRESHOLD`] connection-class failures
//! in a row, and otherwise the last known socket states are served as stale.
//!
//! Locks are taken in a fixed order: per-socket lock, then the link, then the
//! health record.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dsplink_protocol::{Command, Model, Response, SocketStates};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::auth::AuthSession;
use crate::channel::{CommandChannel, ReplyMode};
use crate::error::{ClientError, ErrorKind, Result, TransportError};
use crate::transport::{Connector, TlsConnector, Transport};

/// Failure records kept for diagnostics.
pub const FAILURE_HISTORY_LEN: usize = 3;
/// Consecutive connection-class poll failures before the device is unavailable.
pub const UNAVAILABLE_THRESHOLD: u32 = 3;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No transport.
    #[default]
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport open, sign-in in progress.
    Authenticating,
    /// Signed in and the last poll succeeded.
    Ready,
    /// Signed in but recent polls returned stale data.
    Degraded,
}

/// One failed poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    /// Position in the current failure streak, starting at 1.
    pub ordinal: u32,
    /// Error classification.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
    /// Whether the error counted as connection-class.
    pub connection_error: bool,
    /// Message of the reconnect-and-retry failure, if the retry failed.
    pub retry_message: Option<String>,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

/// Result of a poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollOutcome {
    /// Socket states keyed by 1-based index.
    pub sockets: SocketStates,
    /// Device identifier, once known.
    pub device_id: Option<String>,
    /// True when `sockets` is the last known state rather than fresh data.
    pub stale: bool,
}

// ============================================================================
// Per-socket write locks
// ============================================================================

/// Held while a write to one socket is in flight.
pub struct SocketGuard {
    index: u8,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl SocketGuard {
    /// The locked socket.
    pub fn index(&self) -> u8 {
        self.index
    }
}

impl std::fmt::Debug for SocketGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketGuard").field("index", &self.index).finish()
    }
}

/// One mutex per socket index, created on first use.
#[derive(Debug, Default)]
pub struct SocketLocks {
    locks: Mutex<HashMap<u8, Arc<Mutex<()>>>>,
}

impl SocketLocks {
    /// No locks yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until socket `index` is free and take it.
    pub fn acquire(&self, index: u8) -> SocketGuard {
        let lock = Arc::clone(self.locks.lock().entry(index).or_default());
        SocketGuard {
            index,
            _guard: lock.lock_arc(),
        }
    }

    /// Take socket `index` if it is free.
    pub fn try_acquire(&self, index: u8) -> Option<SocketGuard> {
        let lock = Arc::clone(self.locks.lock().entry(index).or_default());
        lock.try_lock_arc().map(|guard| SocketGuard {
            index,
            _guard: guard,
        })
    }
}

// ============================================================================
// Supervisor
// ============================================================================

struct Link<T: Transport> {
    channel: Option<CommandChannel<T>>,
    auth: AuthSession,
}

#[derive(Debug, Default)]
struct Health {
    state: SessionState,
    consecutive_failures: u32,
    history: VecDeque<FailureRecord>,
    snapshot: Option<SocketStates>,
    device_id: Option<String>,
    last_invalid_reply: Option<Response>,
}

impl Health {
    fn push_failure(&mut self, err: &ClientError) -> usize {
        self.consecutive_failures += 1;
        self.history.push_back(FailureRecord {
            ordinal: self.consecutive_failures,
            kind: err.kind(),
            message: err.to_string(),
            connection_error: err.is_connection_error(),
            retry_message: None,
            at: Utc::now(),
        });
        while self.history.len() > FAILURE_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.len() - 1
    }

    fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
        self.history.clear();
    }

    fn stale_outcome(&self) -> PollOutcome {
        PollOutcome {
            sockets: self.snapshot.clone().unwrap_or_default(),
            device_id: self.device_id.clone(),
            stale: true,
        }
    }
}

/// Owns one device session and its recovery policy.
pub struct Supervisor<C: Connector> {
    connector: C,
    model: Model,
    link: Mutex<Link<C::Transport>>,
    health: Mutex<Health>,
    socket_locks: SocketLocks,
}

impl<C: Connector> std::fmt::Debug for Supervisor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("model", &self.model)
            .field("health", &*self.health.lock())
            .finish_non_exhaustive()
    }
}

impl Supervisor<TlsConnector> {
    /// Supervisor for a TLS connection described by `config`.
    pub fn from_config(config: &crate::config::DeviceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Supervisor::new(config.connector(), config.model, &config.pin))
    }
}

impl<C: Connector> Supervisor<C> {
    /// Disconnected supervisor. Nothing is opened until the first command.
    pub fn new(connector: C, model: Model, pin: impl Into<String>) -> Self {
        Supervisor {
            connector,
            model,
            link: Mutex::new(Link {
                channel: None,
                auth: AuthSession::new(pin),
            }),
            health: Mutex::new(Health::default()),
            socket_locks: SocketLocks::new(),
        }
    }

    /// Device model.
    pub fn model(&self) -> Model {
        self.model
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.health.lock().state
    }

    /// Device identifier from the most recent sign-in.
    pub fn device_id(&self) -> Option<String> {
        self.health.lock().device_id.clone()
    }

    /// Poll failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.health.lock().consecutive_failures
    }

    /// The most recent poll failures, oldest first.
    pub fn failure_history(&self) -> Vec<FailureRecord> {
        self.health.lock().history.iter().cloned().collect()
    }

    /// Last socket states read from or acknowledged by the device.
    pub fn last_snapshot(&self) -> Option<SocketStates> {
        self.health.lock().snapshot.clone()
    }

    /// Last socket-state reply that could not be interpreted.
    pub fn last_invalid_reply(&self) -> Option<Response> {
        self.health.lock().last_invalid_reply.clone()
    }

    /// Per-socket write locks.
    pub fn socket_locks(&self) -> &SocketLocks {
        &self.socket_locks
    }

    /// Open a fresh connection and sign in, dropping any existing one.
    pub fn connect(&self) -> Result<()> {
        let mut link = self.link.lock();
        self.reconnect(&mut link)
    }

    /// Reconnect if the transport is gone or was never signed in.
    pub fn ensure_connected(&self) -> Result<()> {
        let mut link = self.link.lock();
        self.ensure_link(&mut link)
    }

    /// Close the transport and forget the credentials.
    pub fn close(&self) {
        let mut link = self.link.lock();
        if let Some(mut channel) = link.channel.take() {
            channel.close();
        }
        link.auth.clear();
        self.set_state(SessionState::Disconnected);
        debug!("session closed");
    }

    // ------------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------------

    /// Read all socket states and keep the session alive.
    ///
    /// Returns fresh states, or the last known states tagged stale when the
    /// device answered with something unusable or the failure streak is still
    /// short. Fails with [`ClientError::PollFailed`] once
    /// [`UNAVAILABLE_THRESHOLD`] connection-class failures have happened in a
    /// row.
    pub fn poll(&self) -> Result<PollOutcome> {
        let mut link = self.link.lock();

        let first = self.query_and_keep_alive(&mut link);
        let err = match first {
            Ok(Some(states)) => return Ok(self.record_success(states, false)),
            Ok(None) => return Ok(self.record_stale(&link)),
            Err(err) => err,
        };

        let slot = {
            let mut health = self.health.lock();
            let slot = health.push_failure(&err);
            warn!(
                failure = health.consecutive_failures,
                threshold = UNAVAILABLE_THRESHOLD,
                error = %err,
                "error communicating with device"
            );
            slot
        };

        if err.is_retryable() {
            let retried = self.reconnect(&mut link).and_then(|()| {
                self.with_channel(&mut link, |channel, auth| channel.query_socket_states(auth))
            });
            match retried {
                Ok(Some(states)) => {
                    info!("device recovered after reconnect");
                    return Ok(self.record_success(states, true));
                }
                Ok(None) => {}
                Err(retry_err) => {
                    debug!(error = %retry_err, "retry after reconnect failed");
                    if let Some(record) = self.health.lock().history.get_mut(slot) {
                        record.retry_message = Some(retry_err.to_string());
                    }
                }
            }
        }

        let mut health = self.health.lock();
        health.state = SessionState::Degraded;
        if health.consecutive_failures >= UNAVAILABLE_THRESHOLD && err.is_connection_error() {
            let history: Vec<FailureRecord> = health.history.iter().cloned().collect();
            let messages: Vec<&str> = history.iter().map(|r| r.message.as_str()).collect();
            error!(
                failures = health.consecutive_failures,
                history = ?messages,
                last_error = %err,
                "device unavailable"
            );
            return Err(ClientError::PollFailed {
                failures: health.consecutive_failures,
                history,
            });
        }

        debug!(
            failure = health.consecutive_failures,
            has_snapshot = health.snapshot.is_some(),
            "serving last known state"
        );
        Ok(health.stale_outcome())
    }

    fn query_and_keep_alive(
        &self,
        link: &mut Link<C::Transport>,
    ) -> Result<Option<SocketStates>> {
        self.ensure_link(link)?;
        let states = self.with_channel(link, |channel, auth| channel.query_socket_states(auth))?;

        let keep_alive = self.with_channel(link, |channel, auth| {
            channel.send(&Command::KeepAlive, auth, ReplyMode::Matching)
        });
        match keep_alive {
            Ok(_) => Ok(states),
            Err(e) => {
                debug!(error = %e, "keep_alive failed, reconnecting");
                self.reconnect(link)?;
                self.with_channel(link, |channel, auth| channel.query_socket_states(auth))
            }
        }
    }

    fn record_success(&self, states: SocketStates, recovered: bool) -> PollOutcome {
        let mut health = self.health.lock();
        if recovered || health.consecutive_failures > 0 {
            info!(failures = health.consecutive_failures, "poll succeeded, failure streak reset");
        }
        health.reset_failures();
        health.state = SessionState::Ready;
        health.snapshot = Some(states.clone());
        PollOutcome {
            sockets: states,
            device_id: health.device_id.clone(),
            stale: false,
        }
    }

    fn record_stale(&self, link: &Link<C::Transport>) -> PollOutcome {
        let invalid = link
            .channel
            .as_ref()
            .and_then(|channel| channel.last_invalid_reply().cloned());

        let mut health = self.health.lock();
        warn!(
            reply = ?invalid,
            "device returned an invalid state reply, keeping last known states"
        );
        if invalid.is_some() {
            health.last_invalid_reply = invalid;
        }
        health.state = SessionState::Degraded;
        health.stale_outcome()
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Read one 1-based socket. `None` if the reply was unusable.
    pub fn socket_state(&self, index: u8) -> Result<Option<bool>> {
        self.check_index(index)?;
        let state = self.exchange("get_setting", |channel, auth| {
            channel.query_socket_state(auth, index)
        })?;

        match state {
            Some(on) => {
                if let Some(snapshot) = self.health.lock().snapshot.as_mut() {
                    snapshot.insert(index, on);
                }
            }
            None => {
                let link = self.link.lock();
                let invalid = link
                    .channel
                    .as_ref()
                    .and_then(|channel| channel.last_invalid_reply().cloned());
                self.health.lock().last_invalid_reply = invalid;
            }
        }
        Ok(state)
    }

    /// Switch a 1-based socket and return the state the device acknowledged.
    ///
    /// Writes to the same socket are serialized; different sockets do not wait
    /// on each other's locks. A device rejection is returned without a retry.
    pub fn set_socket(&self, index: u8, on: bool) -> Result<bool> {
        self.check_index(index)?;
        let _guard = self.socket_locks.acquire(index);

        let model = self.model;
        let reply = self.exchange("set_setting", |channel, auth| {
            channel.set_socket(auth, model, index, on)
        })?;

        let state = reply.first_value().unwrap_or_else(|| {
            debug!(index, "acknowledgement carried no state, assuming requested state");
            on
        });
        info!(index, on = state, "socket switched");

        let mut health = self.health.lock();
        if health.consecutive_failures > 0 {
            info!(failures = health.consecutive_failures, "write succeeded, failure streak reset");
        }
        health.reset_failures();
        health
            .snapshot
            .get_or_insert_with(SocketStates::new)
            .insert(index, state);
        Ok(state)
    }

    /// Turn every socket off, on, then off again.
    pub fn cycle(&self) -> Result<()> {
        for on in [false, true, false] {
            for index in 1..=self.model.socket_count() {
                self.set_socket(index, on)?;
            }
        }
        Ok(())
    }

    /// Send a keep-alive.
    pub fn keep_alive(&self) -> Result<()> {
        self.command(Command::KeepAlive).map(|_| ())
    }

    /// Device status report.
    pub fn device_status(&self) -> Result<Value> {
        self.command(Command::DeviceStatus)
    }

    /// Wireless networks visible to the device.
    pub fn wlan_survey(&self) -> Result<Value> {
        self.command(Command::WlanSurvey)
    }

    /// Setup status.
    pub fn setup_status(&self) -> Result<Value> {
        self.command(Command::GetSetupStatus)
    }

    /// Ask the device to fetch and install firmware from `url`.
    pub fn upgrade_firmware(&self, url: impl Into<String>) -> Result<Value> {
        self.command(Command::FwUpgrade { url: url.into() })
    }

    /// Register the device with a cloud owner.
    pub fn register(
        &self,
        owner_id: impl Into<String>,
        owner_token: impl Into<String>,
        dcd_url: impl Into<String>,
    ) -> Result<Value> {
        self.command(Command::Register {
            owner_id: owner_id.into(),
            owner_token: owner_token.into(),
            dcd_url: dcd_url.into(),
        })
    }

    fn command(&self, command: Command) -> Result<Value> {
        let response = self.exchange(command.name(), |channel, auth| {
            channel.send(&command, auth, ReplyMode::Matching)
        })?;
        Ok(response.into_value())
    }

    fn check_index(&self, index: u8) -> Result<()> {
        if self.model.has_socket(index) {
            Ok(())
        } else {
            Err(ClientError::InvalidSocket {
                index,
                count: self.model.socket_count(),
            })
        }
    }

    // ------------------------------------------------------------------------
    // Connection management
    // ------------------------------------------------------------------------

    /// Run `op` on a live session, reconnecting and retrying once if it fails
    /// with a retryable error.
    fn exchange<R, F>(&self, operation: &str, mut op: F) -> Result<R>
    where
        F: FnMut(&mut CommandChannel<C::Transport>, &AuthSession) -> Result<R>,
    {
        let mut link = self.link.lock();

        let first = self
            .ensure_link(&mut link)
            .and_then(|()| self.with_channel(&mut link, &mut op));
        match first {
            Err(e) if e.is_retryable() => {
                warn!(operation, error = %e, "command failed, reconnecting and retrying once");
                self.reconnect(&mut link)?;
                self.with_channel(&mut link, &mut op)
            }
            other => other,
        }
    }

    fn with_channel<R, F>(&self, link: &mut Link<C::Transport>, mut op: F) -> Result<R>
    where
        F: FnMut(&mut CommandChannel<C::Transport>, &AuthSession) -> Result<R>,
    {
        let Link { channel, auth } = link;
        let channel = channel.as_mut().ok_or(TransportError::Closed)?;
        op(channel, &*auth)
    }

    fn ensure_link(&self, link: &mut Link<C::Transport>) -> Result<()> {
        let alive = link
            .channel
            .as_mut()
            .map(|channel| channel.is_alive())
            .unwrap_or(false);
        if alive && link.auth.is_signed_in() {
            return Ok(());
        }
        if link.channel.is_some() {
            debug!("transport no longer alive");
        }
        self.reconnect(link)
    }

    fn reconnect(&self, link: &mut Link<C::Transport>) -> Result<()> {
        if let Some(mut channel) = link.channel.take() {
            channel.close();
        }
        link.auth.clear();

        self.set_state(SessionState::Connecting);
        let transport = match self.connector.connect() {
            Ok(transport) => transport,
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                return Err(e.into());
            }
        };

        self.set_state(SessionState::Authenticating);
        let mut channel = CommandChannel::new(transport);
        if let Err(e) = link.auth.sign_in(&mut channel) {
            channel.close();
            self.set_state(SessionState::Disconnected);
            return Err(e);
        }

        let device_id = link.auth.device_id().map(str::to_owned);
        link.channel = Some(channel);

        let mut health = self.health.lock();
        health.state = SessionState::Ready;
        if device_id.is_some() {
            health.device_id = device_id;
        }
        info!(device_id = ?health.device_id, "session established");
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        self.health.lock().state = state;
    }
}

/// Sleep in short steps until `interval` passes or `stop` returns true.
///
/// Returns false if stopped early.
pub fn wait_interval(interval: Duration, stop: impl Fn() -> bool) -> bool {
    const STEP: Duration = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < interval {
        if stop() {
            return false;
        }
        let step = STEP.min(interval - waited);
        std::thread::sleep(step);
        waited += step;
    }
    !stop()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_socket_locks_same_index_blocks() {
        let locks = SocketLocks::new();
        let guard = locks.acquire(1);
        assert_eq!(guard.index(), 1);
        assert!(locks.try_acquire(1).is_none());
        assert!(locks.try_acquire(2).is_some());
        drop(guard);
        assert!(locks.try_acquire(1).is_some());
    }

    #[test]
    fn test_socket_locks_across_threads() {
        let locks = Arc::new(SocketLocks::new());
        let guard = locks.acquire(3);

        let (tx, rx) = mpsc::channel();
        let worker = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let _guard = locks.acquire(3);
                tx.send(()).expect("should send");
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5))
            .expect("waiter should acquire after release");
        worker.join().expect("worker should finish");
    }

    #[test]
    fn test_failure_history_is_bounded() {
        let mut health = Health::default();
        let err = ClientError::Transport(TransportError::Closed);
        for _ in 0..5 {
            health.push_failure(&err);
        }
        assert_eq!(health.consecutive_failures, 5);
        assert_eq!(health.history.len(), FAILURE_HISTORY_LEN);
        assert_eq!(health.history.front().map(|r| r.ordinal), Some(3));
        assert!(health.history.iter().all(|r| r.connection_error));

        health.reset_failures();
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.history.is_empty());
    }

    #[test]
    fn test_stale_outcome_without_snapshot() {
        let health = Health::default();
        let outcome = health.stale_outcome();
        assert!(outcome.stale);
        assert!(outcome.sockets.is_empty());
    }

    #[test]
    fn test_wait_interval_stops_early() {
        assert!(!wait_interval(Duration::from_secs(60), || true));
        assert!(wait_interval(Duration::from_millis(10), || false));
    }
}
