//! Graphite publisher: the export side in one handle.
//!
//! [`GraphitePublisher::start`] creates the event loop, builds a pool of
//! [`TcpClient`]s on it, and waits until every connection is open.
//! [`publish`](GraphitePublisher::publish) writes one batch over one pooled
//! connection. [`stop`](GraphitePublisher::stop) closes the pool and then
//! tears the event loop down.

use serde::{Deserialize, Serialize};

use crate::client::{ClientConfig, TcpClient};
use crate::encode::events::Event;
use crate::error::{ConfigError, PublisherError, Result};
use crate::event_loop::EventLoop;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::record::Record;

/// Everything a publisher needs to connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Carbon endpoint.
    pub client: ClientConfig,
    /// Pool sizing and health checks.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Worker threads of a dedicated I/O runtime; `None` runs socket work on
    /// the caller's runtime.
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl PublisherConfig {
    /// Creates a config with the default pool on the caller's runtime.
    pub fn new(client: ClientConfig) -> Self {
        Self {
            client,
            pool: PoolConfig::default(),
            worker_threads: None,
        }
    }

    /// Sets the pool configuration.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Runs socket work on a dedicated runtime with `threads` workers.
    #[must_use]
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an invalid client or pool section, or a
    /// dedicated runtime with zero workers.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.client.validate()?;
        self.pool.validate()?;
        if self.worker_threads == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "worker_threads",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

struct Started {
    pool: ConnectionPool<TcpClient>,
    event_loop: EventLoop,
}

/// Publishes record batches to Carbon over a connection pool.
pub struct GraphitePublisher {
    config: PublisherConfig,
    started: Option<Started>,
}

impl GraphitePublisher {
    /// Creates a stopped publisher.
    pub fn new(config: PublisherConfig) -> Self {
        Self {
            config,
            started: None,
        }
    }

    /// The publisher's configuration.
    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Whether `start()` has succeeded and `stop()` has not been called.
    pub fn is_started(&self) -> bool {
        self.started.is_some()
    }

    /// Connections not currently in use, `0` while stopped.
    pub fn idle_connections(&self) -> usize {
        self.started.as_ref().map_or(0, |s| s.pool.idle_count())
    }

    /// Creates the event loop and pool and opens every connection.
    ///
    /// On failure everything created so far is released and the publisher
    /// stays stopped.
    ///
    /// # Errors
    ///
    /// Returns [`PublisherError::AlreadyStarted`] if running, a config
    /// error, an event loop error, or the pool's readiness failure.
    pub async fn start(&mut self) -> Result<()> {
        if self.started.is_some() {
            return Err(PublisherError::AlreadyStarted.into());
        }
        self.config.validate()?;

        let event_loop = match self.config.worker_threads {
            Some(threads) => EventLoop::dedicated(threads)?,
            None => EventLoop::current()?,
        };

        let handle = event_loop.handle();
        let client_config = self.config.client.clone();
        let pool = ConnectionPool::new(self.config.pool.clone(), move || {
            TcpClient::new(client_config.clone(), &handle)
        })?;

        if let Err(e) = pool.await_readiness().await {
            if let Err(close_err) = pool.close().await {
                tracing::debug!(error = %close_err, "error releasing partially opened pool");
            }
            event_loop.shutdown();
            return Err(e.into());
        }

        tracing::info!(
            target_addr = %self.config.client.address(),
            protocol = %self.config.client.protocol,
            connections = pool.size(),
            dedicated_runtime = event_loop.is_dedicated(),
            "graphite publisher started"
        );
        self.started = Some(Started { pool, event_loop });
        Ok(())
    }

    /// Sends `records` as one batch over one pooled connection.
    ///
    /// # Errors
    ///
    /// Returns [`PublisherError::NotStarted`] while stopped, a pool error if
    /// no healthy connection could be obtained, or the send failure.
    pub async fn publish(&self, records: &[Record]) -> Result<()> {
        let started = self.started.as_ref().ok_or(PublisherError::NotStarted)?;
        started
            .pool
            .with_pool_item(async |client: &mut TcpClient| client.send(records).await)
            .await??;
        Ok(())
    }

    /// Sends `events` as one batch, with non-numeric payloads written as `0`.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish).
    pub async fn publish_events(&self, events: &[Event]) -> Result<()> {
        let records: Vec<Record> = events.iter().map(Event::to_record).collect();
        self.publish(&records).await
    }

    /// Closes every connection, then tears down the event loop.
    ///
    /// Stopping a stopped publisher does nothing.
    ///
    /// # Errors
    ///
    /// Returns the first connection close failure. The publisher is stopped
    /// either way.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(Started { pool, event_loop }) = self.started.take() else {
            return Ok(());
        };

        let closed = pool.close().await;
        drop(pool);
        event_loop.shutdown();

        tracing::info!(
            target_addr = %self.config.client.address(),
            "graphite publisher stopped"
        );
        closed.map_err(Into::into)
    }
}

impl std::fmt::Debug for GraphitePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphitePublisher")
            .field("config", &self.config)
            .field("started", &self.is_started())
            .finish()
    }
}
