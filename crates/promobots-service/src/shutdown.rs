//! Process shutdown.
//!
//! Waits for SIGINT, SIGTERM or cancellation of the root context, then
//! cancels the root context (so consumers stop on their own) and closes the
//! database pool within [`SHUTDOWN_TIMEOUT`].

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::storage::Database;

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("Shutdown did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Interrupt,
    Terminate,
    Cancelled,
}

pub struct ShutdownCoordinator {
    ctx: CancellationToken,
    db: Database,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub const fn new(ctx: CancellationToken, db: Database) -> Self {
        Self {
            ctx,
            db,
            timeout: SHUTDOWN_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Block until a signal or cancellation arrives, then drain.
    pub async fn run(self) -> Result<ShutdownTrigger, ShutdownError> {
        let trigger = self.wait_for_trigger().await?;
        self.drain(trigger).await?;
        Ok(trigger)
    }

    async fn wait_for_trigger(&self) -> Result<ShutdownTrigger, ShutdownError> {
        #[cfg(unix)]
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();

        Ok(tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownTrigger::Interrupt,
            _ = sigterm_future => ShutdownTrigger::Terminate,
            () = self.ctx.cancelled() => ShutdownTrigger::Cancelled,
        })
    }

    /// Cancel the root context and close the pool under the deadline.
    pub async fn drain(&self, trigger: ShutdownTrigger) -> Result<(), ShutdownError> {
        info!(?trigger, "Shutting down");
        self.ctx.cancel();
        finish_within(self.timeout, self.db.close()).await?;
        info!("Database pool closed");
        Ok(())
    }
}

/// Run `work` with a deadline detached from any cancelled context.
pub async fn finish_within<F>(timeout: Duration, work: F) -> Result<(), ShutdownError>
where
    F: Future<Output = ()>,
{
    tokio::time::timeout(timeout, work).await.map_err(|_| {
        error!(timeout_secs = timeout.as_secs(), "Shutdown deadline exceeded");
        ShutdownError::Timeout(timeout)
    })
}
