//! # graphyte
//!
//! Graphite/Carbon export and render-API polling.
//!
//! graphyte writes timestamped numeric measurements to a Carbon listener
//! over raw TCP, in either the plaintext line protocol or the pickle
//! protocol, and reads stored data back by polling Graphite's `/render`
//! HTTP API on a fixed delay.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Byte-exact plaintext and pickle encoders; a batch is fully encoded before
//!   any byte hits the socket
//! - Fixed-size connection pool with at most one borrower per connection and
//!   health checks on acquire and release
//! - One explicitly owned event loop per publisher, torn down exactly once
//! - Incremental render polling: each cycle only delivers datapoints newer
//!   than anything seen before, and a failed cycle never ends the loop
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use graphyte::{ClientConfig, GraphitePublisher, Protocol, PublisherConfig, Record};
//!
//! # async fn run() -> graphyte::Result<()> {
//! let config = PublisherConfig::new(ClientConfig::new("carbon.local", Protocol::Pickle));
//! let mut publisher = GraphitePublisher::new(config);
//! publisher.start().await?;
//!
//! publisher
//!     .publish(&[
//!         Record::at_epoch_seconds("servers.web1.load", 0.72, 1_700_000_000)
//!             .with_tag("dc", "east"),
//!     ])
//!     .await?;
//!
//! publisher.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`GraphitePublisher`] — Owns the event loop and connection pool
//! - [`IterativeReader`] — Background render polling with a hand-off channel
//! - [`Record`] — One measurement: path, value, timestamp, tags
//! - [`Protocol`] — Selects the wire encoder
//!
//! ## Modules
//!
//! - [`record`] — Record type
//! - [`sanitize`] — Path and tag sanitization
//! - [`encode`] — Plaintext, pickle, and event encoders
//! - [`event_loop`] — Owned I/O runtime handle
//! - [`client`] — Single pooled TCP connection
//! - [`pool`] — Connection pool
//! - [`publisher`] — Export lifecycle
//! - [`render`] — Render query, response model, HTTP client
//! - [`cursor`] — Poll cursor
//! - [`reader`] — Iterative polling reader
//! - [`telemetry`] — Optional meter and event collaborators
//! - [`error`] — Error types

pub mod client;
pub mod cursor;
pub mod encode;
pub mod error;
pub mod event_loop;
pub mod pool;
pub mod publisher;
pub mod reader;
pub mod record;
pub mod render;
pub mod sanitize;
pub mod telemetry;

// Re-export primary API types at crate root for convenience.
pub use client::{ClientConfig, ConnectionState, TcpClient};
pub use encode::Protocol;
pub use encode::events::Event;
pub use error::{GraphyteError, Result};
pub use pool::{ConnectionPool, PoolConfig, PoolItem};
pub use publisher::{GraphitePublisher, PublisherConfig};
pub use reader::{IterativeReader, ReaderConfig, ResultEnvelope};
pub use record::Record;
pub use render::{HttpRenderClient, RenderConfig, RenderQuery, TimeBound};
