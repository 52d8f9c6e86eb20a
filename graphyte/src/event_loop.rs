//! The I/O event loop backing pooled TCP clients.
//!
//! An [`EventLoop`] is created once by the component that owns the clients
//! (the publisher's `start()`), handed to each client as a cheap
//! [`EventLoopHandle`], and torn down exactly once in `stop()`. It either
//! borrows the caller's tokio runtime or owns a dedicated multi-thread
//! runtime.
//!
//! Socket operations are spawned onto the loop and their outcome comes back
//! over a `oneshot` channel, so every operation has exactly one completion.
//! Dropping the awaiting future abandons the result; the spawned work keeps
//! running until it finishes or the loop shuts down.

use std::future::Future;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::PublisherError;

/// Owner of the I/O runtime used by pooled clients.
#[derive(Debug)]
pub struct EventLoop {
    runtime: Option<Runtime>,
    handle: EventLoopHandle,
}

impl EventLoop {
    /// Uses the tokio runtime the caller is running on.
    ///
    /// # Errors
    ///
    /// Returns an error if called outside a tokio runtime.
    pub fn current() -> Result<Self, PublisherError> {
        let runtime = Handle::try_current().map_err(|e| PublisherError::EventLoop {
            source: std::io::Error::other(e),
        })?;
        Ok(Self {
            runtime: None,
            handle: EventLoopHandle::new(runtime),
        })
    }

    /// Builds a dedicated multi-thread runtime with `worker_threads` workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be built.
    pub fn dedicated(worker_threads: usize) -> Result<Self, PublisherError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("graphyte-io")
            .enable_all()
            .build()
            .map_err(|e| PublisherError::EventLoop { source: e })?;
        let handle = EventLoopHandle::new(runtime.handle().clone());
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    /// Returns a handle that clients use to run socket work on this loop.
    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    /// Whether this loop owns its runtime.
    pub fn is_dedicated(&self) -> bool {
        self.runtime.is_some()
    }

    /// Stops accepting work and releases the runtime if it is owned.
    ///
    /// Pending operations resolve as [`EventLoopHandle::run`] returning `None`.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.handle.shutdown.cancel();
        if let Some(runtime) = self.runtime.take() {
            // Safe to call from inside another runtime, unlike dropping it.
            runtime.shutdown_background();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Cloneable reference to an [`EventLoop`].
#[derive(Debug, Clone)]
pub struct EventLoopHandle {
    runtime: Handle,
    shutdown: CancellationToken,
}

impl EventLoopHandle {
    fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether the owning loop has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Runs `work` on the loop and waits for its single outcome.
    ///
    /// Returns `None` if the loop is shut down before or while the work runs.
    pub async fn run<F, T>(&self, work: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let shutdown = self.shutdown.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                out = work => {
                    let _ = tx.send(out);
                }
            }
        });

        rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_on_current_runtime() {
        let event_loop = EventLoop::current().unwrap();
        assert!(!event_loop.is_dedicated());

        let out = event_loop.handle().run(async { 40 + 2 }).await;
        assert_eq!(out, Some(42));
    }

    #[tokio::test]
    async fn test_run_after_shutdown_returns_none() {
        let event_loop = EventLoop::current().unwrap();
        let handle = event_loop.handle();
        event_loop.shutdown();

        assert!(handle.is_shut_down());
        assert_eq!(handle.run(async { 1 }).await, None);
    }

    #[tokio::test]
    async fn test_dedicated_runtime_runs_work() {
        let event_loop = EventLoop::dedicated(1).unwrap();
        assert!(event_loop.is_dedicated());

        let name = event_loop
            .handle()
            .run(async { std::thread::current().name().map(str::to_string) })
            .await;
        assert_eq!(name, Some(Some("graphyte-io".to_string())));

        event_loop.shutdown();
    }

    #[test]
    fn test_current_outside_runtime_fails() {
        assert!(EventLoop::current().is_err());
    }
}
