//! A single pooled TCP connection to a Carbon listener.
//!
//! [`TcpClient`] owns one socket and one wire encoder. All socket work runs
//! on the shared [`EventLoopHandle`](crate::event_loop::EventLoopHandle);
//! every call waits for exactly one outcome and never retries.
//!
//! A client is not meant to be shared: `send` takes `&mut self`, and the
//! [`ConnectionPool`](crate::pool::ConnectionPool) is what serializes access
//! when many tasks publish at once.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, lookup_host};

use crate::encode::{EncodeFn, Protocol};
use crate::error::{CloseError, ConfigError, ConnectError, SendError};
use crate::event_loop::EventLoopHandle;
use crate::pool::PoolItem;
use crate::record::Record;

/// Connection settings for one Carbon endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Carbon host name or IP address.
    pub host: String,
    /// Carbon port.
    pub port: u16,
    /// Wire protocol spoken on this port.
    pub protocol: Protocol,
    /// Upper bound on resolve + connect.
    pub connect_timeout: Duration,
    /// Upper bound on writing and flushing one batch.
    pub write_timeout: Duration,
}

impl ClientConfig {
    /// Creates a config using the protocol's default Carbon port.
    ///
    /// Defaults: 5s connect timeout, 5s write timeout.
    pub fn new(host: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port: protocol.default_port(),
            protocol,
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the write timeout.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the host is empty, the port is zero, or a
    /// timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Missing { field: "host" });
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "connect_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "write_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Lifecycle of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, never opened.
    Idle,
    /// `open()` in progress.
    Connecting,
    /// Connected and usable.
    Open,
    /// Closed locally or by the peer.
    Closed,
    /// A connect or write failed.
    Failed,
}

/// One TCP connection with an installed wire encoder.
#[derive(Debug)]
pub struct TcpClient {
    config: ClientConfig,
    encode: EncodeFn,
    event_loop: EventLoopHandle,
    state: ConnectionState,
    stream: Option<TcpStream>,
}

impl TcpClient {
    /// Creates an unopened client on the given event loop.
    pub fn new(config: ClientConfig, event_loop: &EventLoopHandle) -> Self {
        let encode = config.protocol.encoder();
        Self {
            config,
            encode,
            event_loop: event_loop.clone(),
            state: ConnectionState::Idle,
            stream: None,
        }
    }

    /// The client's configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current connection state.
    ///
    /// An `Open` connection whose socket was lost to an abandoned operation
    /// reports `Failed`.
    pub fn state(&self) -> ConnectionState {
        match (self.state, &self.stream) {
            (ConnectionState::Open, None) => ConnectionState::Failed,
            (state, _) => state,
        }
    }

    /// Whether the connection opened successfully and has not since failed
    /// or been closed.
    ///
    /// This reflects local knowledge only; use [`probe`](Self::probe) to also
    /// notice a peer that hung up.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Connects to the configured endpoint.
    ///
    /// Resolution and connect together are bounded by `connect_timeout`.
    /// Opening an already open client is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::UnresolvedHost`], [`ConnectError::Refused`],
    /// [`ConnectError::TimedOut`], [`ConnectError::Io`], or
    /// [`ConnectError::EventLoopClosed`]. No retry is attempted.
    pub async fn open(&mut self) -> Result<(), ConnectError> {
        if self.is_open() {
            return Ok(());
        }

        self.stream = None;
        self.state = ConnectionState::Connecting;

        let host = self.config.host.clone();
        let port = self.config.port;
        let timeout = self.config.connect_timeout;

        let outcome = self
            .event_loop
            .run(async move {
                let addr = format!("{host}:{port}");
                match tokio::time::timeout(timeout, connect(&host, port, timeout)).await {
                    Ok(result) => result,
                    Err(_) => Err(ConnectError::TimedOut { addr, timeout }),
                }
            })
            .await
            .unwrap_or(Err(ConnectError::EventLoopClosed));

        match outcome {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(
                        target_addr = %self.config.address(),
                        error = %e,
                        "failed to set TCP_NODELAY, continuing with default buffering"
                    );
                }
                self.stream = Some(stream);
                self.state = ConnectionState::Open;
                tracing::debug!(
                    target_addr = %self.config.address(),
                    protocol = %self.config.protocol,
                    "connected to carbon"
                );
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Failed;
                tracing::debug!(
                    target_addr = %self.config.address(),
                    error = %e,
                    "carbon connect failed"
                );
                Err(e)
            }
        }
    }

    /// Encodes `batch` and writes it as one frame.
    ///
    /// The frame is fully encoded before any byte is written. An empty batch
    /// is a no-op. On failure the socket is dropped and the client becomes
    /// `Failed`; the caller decides whether to reopen.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotConnected`] if the client is not open, or the
    /// write/flush failure.
    pub async fn send(&mut self, batch: &[Record]) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::NotConnected);
        }
        if batch.is_empty() {
            return Ok(());
        }
        let Some(mut stream) = self.stream.take() else {
            return Err(SendError::NotConnected);
        };

        let frame = (self.encode)(batch);
        let timeout = self.config.write_timeout;

        let outcome = self
            .event_loop
            .run(async move {
                let result = match tokio::time::timeout(timeout, write_frame(&mut stream, &frame))
                    .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(SendError::Io { source: e }),
                    Err(_) => Err(SendError::TimedOut { timeout }),
                };
                (stream, result)
            })
            .await;

        match outcome {
            Some((stream, Ok(()))) => {
                self.stream = Some(stream);
                tracing::trace!(
                    target_addr = %self.config.address(),
                    records = batch.len(),
                    "batch sent"
                );
                Ok(())
            }
            Some((_stream, Err(e))) => {
                self.state = ConnectionState::Failed;
                tracing::warn!(
                    target_addr = %self.config.address(),
                    error = %e,
                    records = batch.len(),
                    "carbon send failed, dropping connection"
                );
                Err(e)
            }
            None => {
                self.state = ConnectionState::Failed;
                Err(SendError::EventLoopClosed)
            }
        }
    }

    /// Shuts down the socket. Closing a closed client is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the shutdown I/O error of a socket that was still open. The
    /// client is `Closed` either way.
    pub async fn close(&mut self) -> Result<(), CloseError> {
        if self.state != ConnectionState::Idle {
            self.state = ConnectionState::Closed;
        }
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };

        match self.event_loop.run(async move { stream.shutdown().await }).await {
            Some(Err(e)) if e.kind() != ErrorKind::NotConnected => {
                Err(CloseError::Io { source: e })
            }
            _ => Ok(()),
        }
    }

    /// Checks for a peer that has hung up, then reports [`is_open`](Self::is_open).
    ///
    /// Carbon never writes to its clients, so a readable socket means EOF or
    /// an error. Does not block.
    pub fn probe(&mut self) -> bool {
        let Some(stream) = &self.stream else {
            return self.is_open();
        };

        let mut buf = [0u8; 1];
        match stream.try_read(&mut buf) {
            Ok(0) => {
                tracing::debug!(target_addr = %self.config.address(), "peer closed connection");
                self.stream = None;
                self.state = ConnectionState::Closed;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::debug!(
                    target_addr = %self.config.address(),
                    error = %e,
                    "connection failed health probe"
                );
                self.stream = None;
                self.state = ConnectionState::Failed;
            }
        }

        self.is_open()
    }
}

impl PoolItem for TcpClient {
    async fn open(&mut self) -> Result<(), ConnectError> {
        TcpClient::open(self).await
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        TcpClient::close(self).await
    }

    async fn check_health(&mut self) -> bool {
        self.probe()
    }
}

/// Resolves `host` and connects to the first address that accepts.
async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| ConnectError::UnresolvedHost {
            host: host.to_string(),
            source: Some(e),
        })?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some((addr, e)),
        }
    }

    match last_error {
        None => Err(ConnectError::UnresolvedHost {
            host: host.to_string(),
            source: None,
        }),
        Some((addr, e)) if e.kind() == ErrorKind::ConnectionRefused => Err(ConnectError::Refused {
            addr: addr.to_string(),
            source: e,
        }),
        Some((addr, e)) if e.kind() == ErrorKind::TimedOut => Err(ConnectError::TimedOut {
            addr: addr.to_string(),
            timeout,
        }),
        Some((addr, e)) => Err(ConnectError::Io {
            addr: addr.to_string(),
            source: e,
        }),
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> std::io::Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await
}
