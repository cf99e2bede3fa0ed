//! Interrupt handling for SIGTERM and SIGINT.
//!
//! Ensures that on interruption:
//! - Partially written archives and digest files are removed
//! - The execution guard is released before the process exits

use std::sync::{Arc, Mutex};
use tokio::signal;
use tracing::info;

use super::cleanup::CleanupRegistry;
use super::guard::ExecutionGuard;

/// Signal that ended the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    cleanup: CleanupRegistry,
    guard: Mutex<Option<Arc<ExecutionGuard>>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator watching `cleanup`
    pub fn new(cleanup: CleanupRegistry) -> Self {
        Self {
            cleanup,
            guard: Mutex::new(None),
        }
    }

    /// Release this guard when shutting down
    pub fn register_guard(&self, guard: Arc<ExecutionGuard>) {
        *self.guard.lock().unwrap_or_else(|e| e.into_inner()) = Some(guard);
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT)
    pub async fn wait_for_signal(&self) -> std::io::Result<ShutdownSignal> {
        #[cfg(unix)]
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        #[cfg(unix)]
        let received = tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), aborting run...");
                ShutdownSignal::Interrupt
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, aborting run...");
                ShutdownSignal::Terminate
            }
        };

        #[cfg(not(unix))]
        let received = {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, aborting run...");
            ShutdownSignal::Interrupt
        };

        Ok(received)
    }

    /// Remove partial artifacts and release the guard
    pub fn shutdown(&self) {
        let removed = self.cleanup.remove_all();
        if removed > 0 {
            info!(removed, "Partial artifacts removed");
        }

        if let Some(guard) = self.guard.lock().unwrap_or_else(|e| e.into_inner()).take() {
            guard.release();
        }

        info!("Shutdown cleanup complete");
    }
}
