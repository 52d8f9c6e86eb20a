//! Error types for the graphyte exporter and render reader.

use std::time::Duration;

use thiserror::Error;

/// The main error type for all graphyte operations.
///
/// Each variant wraps the error enum of one concern so callers can match on
/// the layer that failed while still using a single `Result` alias.
#[derive(Error, Debug)]
pub enum GraphyteError {
    /// Error establishing a TCP connection.
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Error writing a batch to an open connection.
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// Error shutting down a connection.
    #[error("close error: {0}")]
    Close(#[from] CloseError),

    /// Error from the connection pool.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Error executing a render query.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Error driving the iterative reader lifecycle.
    #[error("reader error: {0}")]
    Reader(#[from] ReaderError),

    /// Error driving the publisher lifecycle.
    #[error("publisher error: {0}")]
    Publisher(#[from] PublisherError),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors that can occur while opening a connection.
///
/// Each failure cause is a distinct variant so callers can tell an unknown
/// host from a refused or timed-out connect.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The host name did not resolve to any address.
    #[error("could not resolve host '{host}'")]
    UnresolvedHost {
        /// The host that failed to resolve.
        host: String,
        /// The resolver error, if one was reported.
        #[source]
        source: Option<std::io::Error>,
    },

    /// The remote end actively refused the connection.
    #[error("connection refused by {addr}")]
    Refused {
        /// The address that refused.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The connect attempt did not finish within the configured timeout.
    #[error("connect to {addr} timed out after {timeout:?}")]
    TimedOut {
        /// The address being connected to.
        addr: String,
        /// The configured connect timeout.
        timeout: Duration,
    },

    /// Any other I/O failure while connecting.
    #[error("failed to connect to {addr}: {source}")]
    Io {
        /// The address being connected to.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The event loop backing the client has been shut down.
    #[error("event loop is shut down")]
    EventLoopClosed,
}

/// Errors that can occur while sending a batch.
#[derive(Error, Debug)]
pub enum SendError {
    /// The client has no open socket.
    #[error("connection is not open")]
    NotConnected,

    /// Writing or flushing the frame failed.
    #[error("write failed: {source}")]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The write did not complete within the configured timeout.
    #[error("write timed out after {timeout:?}")]
    TimedOut {
        /// The configured write timeout.
        timeout: Duration,
    },

    /// The event loop backing the client has been shut down.
    #[error("event loop is shut down")]
    EventLoopClosed,
}

/// Errors that can occur while shutting down a connection.
#[derive(Error, Debug)]
pub enum CloseError {
    /// The socket shutdown reported an I/O error.
    #[error("shutdown failed: {source}")]
    Io {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the connection pool itself.
///
/// Errors produced by the work a caller runs inside
/// [`ConnectionPool::with_pool_item`](crate::pool::ConnectionPool::with_pool_item)
/// are returned untouched as that closure's own output.
#[derive(Error, Debug)]
pub enum PoolError {
    /// One or more members failed to open during readiness.
    #[error("{failed} of {total} pool members failed to open; first error: {}", first_error(errors))]
    NotReady {
        /// Number of members whose open failed.
        failed: usize,
        /// Pool size.
        total: usize,
        /// Every open failure, in member order.
        errors: Vec<ConnectError>,
    },

    /// An unhealthy member could not be rebuilt before hand-out.
    #[error("failed to rebuild unhealthy pool member: {0}")]
    Rebuild(#[source] ConnectError),

    /// Closing one or more members failed; carries the first error.
    #[error("failed to close pool member: {0}")]
    Close(#[source] CloseError),

    /// The pool has been closed.
    #[error("pool is closed")]
    Closed,
}

fn first_error(errors: &[ConnectError]) -> String {
    errors
        .first()
        .map_or_else(|| "none".to_string(), ToString::to_string)
}

/// Errors that can occur while executing a render query.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The configured root URL could not be parsed.
    #[error("invalid render URL '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Failed to build the HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The request failed at the transport level.
    #[error("HTTP request failed: {source}")]
    Request {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-2xx status.
    #[error("server returned status {status}: {body}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// The response body was not a valid render JSON document.
    #[error("failed to decode render response: {source}")]
    Decode {
        /// The JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from misuse of the iterative reader lifecycle.
#[derive(Error, Debug)]
pub enum ReaderError {
    /// `start()` was called on a reader that is already running.
    #[error("reader is already running")]
    AlreadyRunning,

    /// `start()` was called before an abandoned `stop()` was completed.
    #[error("reader is still stopping; call stop() again first")]
    StillStopping,

    /// Building the query client failed during start.
    #[error("failed to initialize query client: {0}")]
    Init(#[source] QueryError),
}

/// Errors from misuse of the publisher lifecycle.
#[derive(Error, Debug)]
pub enum PublisherError {
    /// `start()` was called on a publisher that is already running.
    #[error("publisher is already started")]
    AlreadyStarted,

    /// An operation needing a started publisher was called while stopped.
    #[error("publisher is not started")]
    NotStarted,

    /// The dedicated event loop runtime could not be built.
    #[error("failed to build event loop: {source}")]
    EventLoop {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A numeric or duration field is out of range.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// The configuration field.
        field: &'static str,
        /// Why it is invalid.
        reason: String,
    },

    /// A required field is missing or empty.
    #[error("missing required field '{field}'")]
    Missing {
        /// The configuration field.
        field: &'static str,
    },

    /// An unknown protocol name was given.
    #[error("unknown protocol '{0}' (expected 'plaintext' or 'pickle')")]
    UnknownProtocol(String),
}

/// Type alias for `Result<T, GraphyteError>`.
pub type Result<T> = std::result::Result<T, GraphyteError>;
