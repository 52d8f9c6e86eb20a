//! Fixed-size pool of health-checked connections.
//!
//! The pool owns `N` members built by a factory. A caller borrows one member
//! at a time through [`ConnectionPool::with_pool_item`], which guarantees
//! exclusive access for the duration of the closure, so two tasks never
//! write to the same socket concurrently.
//!
//! # Design
//!
//! - A semaphore with `N` permits gates checkout; holding a permit means an
//!   index is waiting in the idle list.
//! - Each member sits behind its own async mutex, held for the whole lease.
//! - Members are handed back on drop, so a caller whose future is cancelled
//!   mid-lease still returns its member. The next health check catches any
//!   damage the cancellation left behind.
//! - Unhealthy members are rebuilt in place: closed, replaced via the
//!   factory, and reopened. A member whose rebuild failed or was cancelled
//!   is flagged and rebuilt before its next hand-out, whatever the
//!   health-check policy says.
//!
//! Which idle member a caller receives is unspecified.
//!
//! # Example
//!
//! ```rust,no_run
//! use graphyte::client::{ClientConfig, TcpClient};
//! use graphyte::encode::Protocol;
//! use graphyte::event_loop::EventLoop;
//! use graphyte::pool::{ConnectionPool, PoolConfig};
//! use graphyte::Record;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let event_loop = EventLoop::current()?;
//! let handle = event_loop.handle();
//! let config = ClientConfig::new("carbon.local", Protocol::Plaintext);
//!
//! let pool = ConnectionPool::new(PoolConfig::new(4), move || {
//!     TcpClient::new(config.clone(), &handle)
//! })?;
//! pool.await_readiness().await?;
//!
//! let batch = [Record::at_epoch_seconds("servers.web1.load", 0.7, 1_700_000_000)];
//! pool.with_pool_item(async |client: &mut TcpClient| client.send(&batch).await)
//!     .await??;
//!
//! pool.close().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::{MutexGuard as StdMutexGuard, PoisonError};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, Semaphore, SemaphorePermit};

use crate::error::{CloseError, ConfigError, ConnectError, PoolError};

/// Something the pool can open, health-check, and close.
pub trait PoolItem: Send + 'static {
    /// Opens the underlying connection.
    fn open(&mut self) -> impl Future<Output = Result<(), ConnectError>> + Send;

    /// Closes the underlying connection. Must be idempotent.
    fn close(&mut self) -> impl Future<Output = Result<(), CloseError>> + Send;

    /// Returns `false` if the item must be rebuilt before further use.
    fn check_health(&mut self) -> impl Future<Output = bool> + Send;
}

/// Pool sizing and health-check policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of members.
    pub size: usize,
    /// Health-check a member before handing it out.
    pub check_on_acquire: bool,
    /// Health-check a member after the caller is done with it.
    pub check_on_release: bool,
}

impl PoolConfig {
    /// Creates a config with `size` members, checking on acquire only.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            check_on_acquire: true,
            check_on_release: false,
        }
    }

    /// Sets whether members are checked before hand-out.
    #[must_use]
    pub fn with_check_on_acquire(mut self, enabled: bool) -> Self {
        self.check_on_acquire = enabled;
        self
    }

    /// Sets whether members are checked after use.
    #[must_use]
    pub fn with_check_on_release(mut self, enabled: bool) -> Self {
        self.check_on_release = enabled;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `size` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pool.size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(4)
    }
}

struct PoolMember<T> {
    item: T,
    /// Set while the item is known to be unusable.
    needs_rebuild: bool,
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// A fixed-size pool of [`PoolItem`]s with exclusive checkout.
pub struct ConnectionPool<T: PoolItem> {
    config: PoolConfig,
    members: Vec<Mutex<PoolMember<T>>>,
    idle: std::sync::Mutex<Vec<usize>>,
    available: Semaphore,
    factory: Factory<T>,
}

impl<T: PoolItem> ConnectionPool<T> {
    /// Builds `config.size` unopened members with `factory`.
    ///
    /// Call [`await_readiness`](Self::await_readiness) before use.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn new<F>(config: PoolConfig, factory: F) -> Result<Self, ConfigError>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        config.validate()?;

        let members = (0..config.size)
            .map(|_| {
                Mutex::new(PoolMember {
                    item: factory(),
                    needs_rebuild: false,
                })
            })
            .collect();

        Ok(Self {
            idle: std::sync::Mutex::new((0..config.size).rev().collect()),
            available: Semaphore::new(config.size),
            members,
            factory: Box::new(factory),
            config,
        })
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Number of members not currently checked out.
    pub fn idle_count(&self) -> usize {
        self.idle_list().len()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.available.is_closed()
    }

    /// Opens every member concurrently and waits for all outcomes.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotReady`] listing every failed open if any
    /// member failed, or [`PoolError::Closed`] after `close()`.
    pub async fn await_readiness(&self) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let opens = self.members.iter().map(|member| async move {
            let mut member = member.lock().await;
            member.item.open().await
        });
        let errors: Vec<ConnectError> = join_all(opens)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if errors.is_empty() {
            tracing::info!(size = self.size(), "connection pool ready");
            Ok(())
        } else {
            tracing::warn!(
                failed = errors.len(),
                size = self.size(),
                "connection pool failed to become ready"
            );
            Err(PoolError::NotReady {
                failed: errors.len(),
                total: self.size(),
                errors,
            })
        }
    }

    /// Runs `f` with exclusive access to one healthy member.
    ///
    /// Waits while every member is checked out. With `check_on_acquire`, an
    /// unhealthy member is rebuilt before `f` sees it; with
    /// `check_on_release`, it is rebuilt after `f` returns. A member whose
    /// earlier rebuild failed is always rebuilt before `f` sees it. The
    /// closure's own result, including any transport error, is passed
    /// through as-is.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool is closed, or
    /// [`PoolError::Rebuild`] if an unhealthy member could not be reopened.
    pub async fn with_pool_item<R>(&self, f: impl AsyncFnOnce(&mut T) -> R) -> Result<R, PoolError> {
        let mut lease = self.checkout().await?;

        if lease.member.needs_rebuild {
            tracing::debug!(member = lease.index(), "member flagged broken, rebuilding");
            self.rebuild(&mut lease.member)
                .await
                .map_err(PoolError::Rebuild)?;
        } else if self.config.check_on_acquire && !lease.member.item.check_health().await {
            tracing::debug!(member = lease.index(), "unhealthy member on acquire, rebuilding");
            self.rebuild(&mut lease.member)
                .await
                .map_err(PoolError::Rebuild)?;
        }

        let out = f(&mut lease.member.item).await;

        if self.config.check_on_release && !lease.member.item.check_health().await {
            tracing::debug!(member = lease.index(), "unhealthy member on release, rebuilding");
            if let Err(e) = self.rebuild(&mut lease.member).await {
                tracing::warn!(
                    member = lease.index(),
                    error = %e,
                    "failed to rebuild pool member, will retry on next acquire"
                );
            }
        }

        Ok(out)
    }

    /// Closes every member concurrently.
    ///
    /// Every member is attempted even if some fail. Waits for checked-out
    /// members to be returned first.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Close`] carrying the first close failure.
    pub async fn close(&self) -> Result<(), PoolError> {
        self.available.close();

        let closes = self.members.iter().map(|member| async move {
            let mut member = member.lock().await;
            member.item.close().await
        });
        let first_error = join_all(closes).await.into_iter().find_map(Result::err);

        tracing::info!(size = self.size(), "connection pool closed");
        match first_error {
            Some(e) => Err(PoolError::Close(e)),
            None => Ok(()),
        }
    }

    async fn checkout(&self) -> Result<Lease<'_, T>, PoolError> {
        let permit = self
            .available
            .acquire()
            .await
            .map_err(|_| PoolError::Closed)?;
        let index = self.idle_list().pop().ok_or(PoolError::Closed)?;

        // From here on the index goes back to the idle list on drop, even if
        // this future is cancelled while waiting for the lock.
        let slot = Slot {
            pool: self,
            index,
            _permit: permit,
        };
        let member = self.members[index].lock().await;

        Ok(Lease { member, slot })
    }

    /// Replaces the member's item; the member stays flagged until the new
    /// item opens, so a failed or cancelled rebuild is retried on next use.
    async fn rebuild(&self, member: &mut PoolMember<T>) -> Result<(), ConnectError> {
        member.needs_rebuild = true;
        if let Err(e) = member.item.close().await {
            tracing::debug!(error = %e, "error closing unhealthy member");
        }
        member.item = (self.factory)();
        member.item.open().await?;
        member.needs_rebuild = false;
        Ok(())
    }

    fn idle_list(&self) -> StdMutexGuard<'_, Vec<usize>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: PoolItem> std::fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("idle", &self.idle_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// A reserved member index; returned to the idle list on drop.
struct Slot<'a, T: PoolItem> {
    pool: &'a ConnectionPool<T>,
    index: usize,
    _permit: SemaphorePermit<'a>,
}

impl<T: PoolItem> Drop for Slot<'_, T> {
    fn drop(&mut self) {
        // The permit is released after this push, so a woken waiter always
        // finds an index.
        self.pool.idle_list().push(self.index);
    }
}

/// Exclusive access to one member for the duration of a checkout.
struct Lease<'a, T: PoolItem> {
    member: MutexGuard<'a, PoolMember<T>>,
    slot: Slot<'a, T>,
}

impl<T: PoolItem> Lease<'_, T> {
    fn index(&self) -> usize {
        self.slot.index
    }
}
