//! Scripted in-memory smart plug used by the integration tests.
//!
//! [`FakeDevice`] holds the plug's state and the test's script; every
//! [`FakeTransport`] opened by a [`FakeConnector`] talks to it. Client frames
//! are decoded and answered synchronously on write, and reads of an empty
//! buffer fail with `WouldBlock` the way a timed-out socket does.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dsplink_client::{device_token, send_upgrade, Connector, TransportError};
use dsplink_protocol::{Frame, FrameDecoder};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub const DEVICE_ID: &str = "XYZ123";
pub const SALT: &str = "abcd";
pub const PIN: &str = "000000";

#[derive(Debug)]
struct DeviceState {
    sockets: BTreeMap<u8, bool>,
    silent: bool,
    dropped_requests: usize,
    connect_failures: u32,
    generation: u32,
    connects: u32,
    state_replies: VecDeque<Value>,
    keep_alive_injections: usize,
    ignored_keep_alives: usize,
    set_rejection: Option<(i64, String)>,
    set_delay: Duration,
    events: Vec<String>,
}

/// Shared handle to the scripted device.
#[derive(Debug, Clone)]
pub struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl FakeDevice {
    /// Device with `socket_count` sockets, all off.
    pub fn new(socket_count: u8) -> Self {
        FakeDevice {
            state: Arc::new(Mutex::new(DeviceState {
                sockets: (1..=socket_count).map(|i| (i, false)).collect(),
                silent: false,
                dropped_requests: 0,
                connect_failures: 0,
                generation: 0,
                connects: 0,
                state_replies: VecDeque::new(),
                keep_alive_injections: 0,
                ignored_keep_alives: 0,
                set_rejection: None,
                set_delay: Duration::ZERO,
                events: Vec::new(),
            })),
        }
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            device: self.clone(),
        }
    }

    /// Stop answering anything, including the upgrade preamble.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Leave the next `n` framed requests unanswered.
    pub fn drop_next_requests(&self, n: usize) {
        self.state.lock().dropped_requests = n;
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().connect_failures = n;
    }

    /// Make every open transport report itself dead.
    pub fn drop_connections(&self) {
        self.state.lock().generation += 1;
    }

    /// Answer the next all-socket query with `reply` instead of the real states.
    pub fn queue_state_reply(&self, reply: Value) {
        self.state.lock().state_replies.push_back(reply);
    }

    /// Push `n` keep-alive echoes ahead of the next reply.
    pub fn inject_keep_alives(&self, n: usize) {
        self.state.lock().keep_alive_injections = n;
    }

    /// Leave the next `n` keep-alive requests unanswered.
    pub fn ignore_keep_alives(&self, n: usize) {
        self.state.lock().ignored_keep_alives = n;
    }

    /// Reject every `set_setting` with `code`.
    pub fn reject_sets(&self, code: i64, message: &str) {
        self.state.lock().set_rejection = Some((code, message.to_string()));
    }

    /// Hold each `set_setting` for `delay` before answering.
    pub fn delay_sets(&self, delay: Duration) {
        self.state.lock().set_delay = delay;
    }

    pub fn set_socket_state(&self, index: u8, on: bool) {
        self.state.lock().sockets.insert(index, on);
    }

    pub fn socket(&self, index: u8) -> Option<bool> {
        self.state.lock().sockets.get(&index).copied()
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }

    /// Event log: `connect`, `recv:<command>`, `reply_read`.
    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    /// Command names received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("recv:").map(str::to_owned))
            .collect()
    }

    fn log(&self, event: impl Into<String>) {
        self.state.lock().events.push(event.into());
    }

    /// Replies for one client request, in delivery order.
    fn handle(&self, request: &Value) -> Vec<Value> {
        let command = request["command"].as_str().unwrap_or_default().to_string();
        self.log(format!("recv:{}", command));

        let delay = {
            let state = self.state.lock();
            if command == "set_setting" {
                state.set_delay
            } else {
                Duration::ZERO
            }
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = self.state.lock();
        if state.silent {
            return Vec::new();
        }
        if state.dropped_requests > 0 {
            state.dropped_requests -= 1;
            return Vec::new();
        }

        let mut replies: Vec<Value> = (0..std::mem::take(&mut state.keep_alive_injections))
            .map(|_| json!({"command": "keep_alive", "code": 0}))
            .collect();

        if command != "sign_in" {
            let expected = device_token(PIN, SALT, DEVICE_ID);
            if request["device_token"].as_str() != Some(expected.as_str()) {
                replies.push(json!({"command": command, "code": 401, "message": "invalid token"}));
                return replies;
            }
        }

        let reply = match command.as_str() {
            "sign_in" => Some(json!({"command": "sign_in", "code": 0, "device_id": DEVICE_ID, "salt": SALT})),
            "get_setting" => {
                let idx = request["setting"][0]["idx"].as_i64().unwrap_or(-1);
                if idx < 0 {
                    Some(state.state_replies.pop_front().unwrap_or_else(|| {
                        let entries: Vec<Value> = state
                            .sockets
                            .iter()
                            .map(|(&i, &on)| json!({"idx": i - 1, "metadata": {"value": u8::from(on)}}))
                            .collect();
                        json!({"command": "get_setting", "code": 0, "setting": [{"metadata": {"value": entries}}]})
                    }))
                } else {
                    let on = state.sockets.get(&((idx + 1) as u8)).copied().unwrap_or(false);
                    Some(json!({"command": "get_setting", "code": 0, "setting": [{"idx": idx, "metadata": {"value": u8::from(on)}}]}))
                }
            }
            "set_setting" => {
                if let Some((code, message)) = state.set_rejection.clone() {
                    Some(json!({"command": "set_setting", "code": code, "message": message}))
                } else {
                    let entry = &request["setting"][0];
                    let idx = entry["idx"].as_i64().unwrap_or(0);
                    let on = entry["metadata"]["value"].as_i64() == Some(1);
                    state.sockets.insert((idx + 1) as u8, on);
                    Some(json!({"command": "set_setting", "code": 0, "setting": [{"idx": idx, "metadata": {"value": u8::from(on)}}]}))
                }
            }
            "keep_alive" => {
                if state.ignored_keep_alives > 0 {
                    state.ignored_keep_alives -= 1;
                    None
                } else {
                    Some(json!({"command": "keep_alive", "code": 0}))
                }
            }
            other => Some(json!({"command": other, "code": 0, "echo": request.clone()})),
        };

        replies.extend(reply);
        replies
    }
}

/// One connection to a [`FakeDevice`].
#[derive(Debug)]
pub struct FakeTransport {
    device: FakeDevice,
    generation: u32,
    upgraded: bool,
    answering: bool,
    closed: bool,
    inbound: VecDeque<u8>,
    read_timeout: Option<Duration>,
}

impl FakeTransport {
    fn queue(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }
}

impl Read for FakeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if self.inbound.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
            *slot = byte;
        }
        if self.inbound.is_empty() && self.answering {
            self.device.log("reply_read");
        }
        Ok(n)
    }
}

impl Write for FakeTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }

        if !self.upgraded {
            assert!(buf.starts_with(b"GET /SwitchCamera HTTP/1.1\r\n"));
            self.upgraded = true;
            if !self.device.state.lock().silent {
                self.queue(b"HTTP/1.1 101 Switching Protocols\r\n\r\n");
            }
            return Ok(buf.len());
        }

        let mut cursor = Cursor::new(buf);
        let frame = FrameDecoder::new()
            .read_frame(&mut cursor)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        assert!(frame.is_masked(), "client frames must be masked");
        let text = frame.message_text().expect("client frames are final text");
        let request: Value = serde_json::from_str(&text).expect("client sends JSON");

        self.answering = true;
        for reply in self.device.handle(&request) {
            let bytes = Frame::text(&reply.to_string())
                .and_then(|f| f.encode())
                .expect("reply fits in a frame");
            self.queue(&bytes);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl dsplink_client::Transport for FakeTransport {
    fn read_timeout(&self) -> Result<Option<Duration>, TransportError> {
        Ok(self.read_timeout)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        !self.closed && self.generation == self.device.state.lock().generation
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Opens [`FakeTransport`]s, honoring scripted connect failures.
#[derive(Debug, Clone)]
pub struct FakeConnector {
    device: FakeDevice,
}

impl Connector for FakeConnector {
    type Transport = FakeTransport;

    fn connect(&self) -> Result<FakeTransport, TransportError> {
        let generation = {
            let mut state = self.device.state.lock();
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(TransportError::Io(io::ErrorKind::ConnectionRefused.into()));
            }
            state.connects += 1;
            state.events.push("connect".to_string());
            state.generation
        };

        let mut transport = FakeTransport {
            device: self.device.clone(),
            generation,
            upgraded: false,
            answering: false,
            closed: false,
            inbound: VecDeque::new(),
            read_timeout: Some(Duration::from_secs(10)),
        };
        send_upgrade(&mut transport, "fake-plug", 8080)?;
        Ok(transport)
    }
}
