//! Request and observe the shutdown of a stream consumer run
//!
//! A consumer run holds leases on shards of a stream. Stopping it abruptly leaves those leases to
//! expire on their own, so shutdown is a two-step handshake: some party asks for the run to stop,
//! and the run reports back once it has released its leases and flushed its shards.
//!
//! # Coordinate shutdown with the [`ShutdownManager`] type
//!
//! The [`ShutdownManager`] is owned by whoever decides when the process stops, e.g., a signal
//! handler. Each consumer run [`register`][ShutdownManager::register]s to receive a
//! [`ShutdownToken`], uses [`wait_for_shutdown`][ShutdownToken::wait_for_shutdown] as its
//! shutdown request, and calls [`complete`][ShutdownToken::complete] after its graceful shutdown
//! sequence has finished. [`join`][ShutdownManager::join] resolves once every registered run has
//! completed.
use std::sync::Arc;

use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Manage shutdown of one or more consumer runs
#[derive(Debug)]
pub struct ShutdownManager {
    requested: CancellationToken,
    runs: TaskTracker,
}

impl ShutdownManager {
    /// Create a [`ShutdownManager`] with no registered runs
    pub fn new() -> Self {
        Self {
            requested: CancellationToken::new(),
            runs: TaskTracker::new(),
        }
    }

    /// Register a consumer run that must shut down gracefully before the process may exit
    ///
    /// Provides a [`ShutdownToken`] which the run is responsible for handling. The run must invoke
    /// [`complete`][ShutdownToken::complete], or drop every clone of the token, for
    /// [`join`][Self::join] to resolve.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self) -> ShutdownToken {
        let (tx, rx) = oneshot::channel();
        self.runs.spawn(rx);
        ShutdownToken::new(self.requested.clone(), tx)
    }

    /// Request shutdown of every registered run
    pub fn shutdown(&self) {
        info!("consumer shutdown requested");
        self.requested.cancel();
    }

    /// Whether shutdown was requested, either through [`shutdown`][Self::shutdown] or by a run
    /// via [`trigger_shutdown`][ShutdownToken::trigger_shutdown]
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.is_cancelled()
    }

    /// Waits for every registered run to report completion
    pub async fn join(&self) {
        self.runs.close();
        self.runs.wait().await;
        debug!("all consumer runs completed shutdown");
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A token that a consumer run obtains via [`register`][ShutdownManager::register]
///
/// This implements [`Clone`] so that sub-components of a run can observe the shutdown request or
/// trigger shutdown internally.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    requested: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    fn new(requested: CancellationToken, complete_tx: oneshot::Sender<()>) -> Self {
        Self {
            requested,
            complete_tx: Arc::new(Mutex::new(Some(complete_tx))),
        }
    }

    /// A token that is not tied to any [`ShutdownManager`]
    ///
    /// Shutdown can only be requested through [`trigger_shutdown`][Self::trigger_shutdown] on a
    /// clone of the token, and completion is not observed by anyone.
    pub fn detached() -> Self {
        let (tx, _rx) = oneshot::channel();
        Self::new(CancellationToken::new(), tx)
    }

    /// Request shutdown from inside a run, e.g., after an unrecoverable failure
    ///
    /// This is visible to the issuing [`ShutdownManager`] and to every other run registered with
    /// it.
    pub fn trigger_shutdown(&self) {
        self.requested.cancel();
    }

    /// Whether shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.is_cancelled()
    }

    /// Future that completes when shutdown is requested
    pub async fn wait_for_shutdown(&self) {
        self.requested.cancelled().await;
    }

    /// Signal back to the [`ShutdownManager`] that the run owning this token has released its
    /// leases and it is safe for the process to exit
    pub fn complete(&self) {
        if let Some(s) = self.complete_tx.lock().take() {
            let _ = s.send(());
        }
    }
}
