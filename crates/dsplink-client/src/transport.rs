//! TCP/TLS transport to the device.
//!
//! The device listens on port 8080 behind TLS with no usable certificate chain
//! and legacy protocol versions. After the TLS handshake the client sends a
//! literal HTTP upgrade request; the device does not answer with a conformant
//! WebSocket handshake, so the reply is read and discarded.
//!
//! Retry policy does not live here: every failure is returned to the caller.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use openssl::ssl::{SslConnector, SslMethod, SslStream, SslVerifyMode};
use tracing::{debug, trace, warn};

use crate::error::TransportError;

/// Port the device listens on.
pub const DEFAULT_PORT: u16 = 8080;
/// Bound on the TCP connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default socket read/write timeout.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);
/// Path of the upgrade request.
pub const UPGRADE_PATH: &str = "/SwitchCamera";
/// Maximum bytes read from the upgrade reply.
const UPGRADE_REPLY_LIMIT: usize = 1024;

/// A byte stream to the device.
///
/// [`Read`] is the byte source frames are decoded from; [`Write`] carries
/// encoded frames.
pub trait Transport: Read + Write + Send {
    /// Current read timeout.
    fn read_timeout(&self) -> Result<Option<Duration>, TransportError>;

    /// Change the read timeout. `None` blocks indefinitely.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError>;

    /// Check without blocking whether the peer still has the socket open.
    fn is_alive(&mut self) -> bool;

    /// Close the socket. Safe to call more than once.
    fn close(&mut self);

    /// Write all of `buf` and flush.
    fn send_bytes(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.write_all(buf)?;
        self.flush()?;
        Ok(())
    }

    /// Read whatever is available, up to `max` bytes, in one call.
    fn receive_raw(&mut self, max: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; max];
        let n = self.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// Opens new transports. Each call yields a fresh, upgraded connection.
pub trait Connector: Send + Sync {
    /// Transport produced by this connector.
    type Transport: Transport;

    /// Open a connection.
    fn connect(&self) -> Result<Self::Transport, TransportError>;
}

/// The HTTP upgrade request the device expects.
pub fn upgrade_request(host: &str, port: u16) -> String {
    format!(
        "GET {UPGRADE_PATH} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Connection: Upgrade\r\n\
         Accept: */*\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: \r\n\
         Sec-WebSocket-Extensions: x-webkit-deflate-frame\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Protocol: \r\n\
         Pragma: no-cache\r\n\
         Cache-Control: no-cache\r\n\r\n"
    )
}

/// Send the upgrade request and discard the reply.
///
/// Fails only if the write fails or the device closes the socket instead of
/// replying.
pub fn send_upgrade<T: Transport + ?Sized>(
    transport: &mut T,
    host: &str,
    port: u16,
) -> Result<(), TransportError> {
    transport.send_bytes(upgrade_request(host, port).as_bytes())?;
    let reply = transport.receive_raw(UPGRADE_REPLY_LIMIT)?;
    if reply.is_empty() {
        return Err(TransportError::Closed);
    }
    trace!(reply = %String::from_utf8_lossy(&reply), "upgrade reply ignored");
    Ok(())
}

// ============================================================================
// TLS transport
// ============================================================================

/// TLS socket to the device.
#[derive(Debug)]
pub struct TlsTransport {
    stream: Option<SslStream<TcpStream>>,
}

impl TlsTransport {
    /// Wrap an established TLS stream.
    pub fn new(stream: SslStream<TcpStream>) -> Self {
        TlsTransport {
            stream: Some(stream),
        }
    }

    fn stream(&mut self) -> io::Result<&mut SslStream<TcpStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))
    }

    fn tcp(&self) -> Result<&TcpStream, TransportError> {
        self.stream
            .as_ref()
            .map(SslStream::get_ref)
            .ok_or(TransportError::Closed)
    }
}

impl Read for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }
}

impl Write for TlsTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }
}

impl Transport for TlsTransport {
    fn read_timeout(&self) -> Result<Option<Duration>, TransportError> {
        Ok(self.tcp()?.read_timeout()?)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        Ok(self.tcp()?.set_read_timeout(timeout)?)
    }

    fn is_alive(&mut self) -> bool {
        match self.tcp() {
            Ok(tcp) => peer_alive(tcp),
            Err(_) => false,
        }
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown() {
                trace!(error = %e, "TLS shutdown failed");
            }
            let _ = stream.get_ref().shutdown(Shutdown::Both);
            debug!("transport closed");
        }
    }
}

impl Drop for TlsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Non-blocking peek: `false` once the peer has closed or the socket errored.
/// Blocking mode is restored before returning, whatever the peek saw.
fn peer_alive(tcp: &TcpStream) -> bool {
    if tcp.set_nonblocking(true).is_err() {
        return false;
    }

    let mut byte = [0u8; 1];
    let peeked = tcp.peek(&mut byte);
    let restored = tcp.set_nonblocking(false).is_ok();

    let open = match peeked {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) => e.kind() == io::ErrorKind::WouldBlock,
    };
    restored && open
}

/// Opens [`TlsTransport`]s to one device.
///
/// The TLS context is built per connection and accepts any certificate, legacy
/// protocol versions and weak ciphers. It is never shared with other
/// connections.
#[derive(Debug, Clone)]
pub struct TlsConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TlsConnector {
    /// Connector for `host` on the default port.
    pub fn new(host: impl Into<String>) -> Self {
        TlsConnector {
            host: host.into(),
            port: DEFAULT_PORT,
            connect_timeout: CONNECT_TIMEOUT,
            io_timeout: IO_TIMEOUT,
        }
    }

    /// Override the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the default read/write timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Target host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Target port.
    pub fn port(&self) -> u16 {
        self.port
    }

    fn open_tcp(&self) -> Result<TcpStream, TransportError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve(format!("{}:{} ({})", self.host, self.port, e)))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(tcp) => {
                    tcp.set_read_timeout(Some(self.io_timeout))?;
                    tcp.set_write_timeout(Some(self.io_timeout))?;
                    return Ok(tcp);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "TCP connect failed");
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) => TransportError::Io(e),
            None => TransportError::Resolve(format!("{}:{}", self.host, self.port)),
        })
    }

    fn legacy_tls(&self) -> Result<SslConnector, TransportError> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())?;
        builder.set_verify(SslVerifyMode::NONE);
        // OpenSSL 3 refuses TLS 1.0/1.1 above security level 0.
        if let Err(e) = builder.set_cipher_list("DEFAULT@SECLEVEL=0") {
            warn!(error = %e, "could not relax cipher policy, using library defaults");
        }
        builder.set_min_proto_version(None)?;
        Ok(builder.build())
    }
}

impl Connector for TlsConnector {
    type Transport = TlsTransport;

    fn connect(&self) -> Result<TlsTransport, TransportError> {
        debug!(host = %self.host, port = self.port, "connecting");
        let tcp = self.open_tcp()?;

        let mut config = self.legacy_tls()?.configure()?;
        config.set_verify_hostname(false);
        config.set_use_server_name_indication(false);
        let stream = config
            .connect(&self.host, tcp)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let mut transport = TlsTransport::new(stream);
        send_upgrade(&mut transport, &self.host, self.port)?;
        debug!(host = %self.host, "connected and upgraded");
        Ok(transport)
    }
}
