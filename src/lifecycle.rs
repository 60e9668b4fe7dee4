//! Process-wide shutdown and connection tracking

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Shutdown handle shared by the listener and every connection task.
///
/// Triggering it stops the accept loops and aborts in-flight connections;
/// [`Shutdown::drain`] then waits, bounded, for the tasks to finish.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that fires once shutdown begins
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Spawn a tracked task that is dropped as soon as shutdown begins.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = fut => {}
                () = token.cancelled() => {}
            }
        });
    }

    /// Tracked tasks still running
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `grace` for every tracked task to finish.
    /// Returns `false` if the grace period elapsed first.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        debug!("Draining {} connection task(s)", self.tracker.len());
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }
}

/// Run `fut`, failing with [`Error::Timeout`] naming `what` if it takes
/// longer than `limit`.
pub async fn with_deadline<T, F>(limit: Duration, what: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(what))?
}

/// Wait for Ctrl+C, or SIGTERM on unix.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
