pub mod finalizer;
pub mod http;
pub mod merger;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod scheduler;
pub mod sources;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::errors::{InstallerError, Result};

pub use merger::{MergeCandidate, MergePlan, MergedGroup};
pub use planner::{DiffTask, InstallMode, InstallPlan, SourceSpan, Span};
pub use progress::ProgressEvent;
pub use scheduler::RunOutcome;
pub use sources::{source_for, UpdateSource};

/// Installer-wide shared state. Passed explicitly instead of living in
/// process globals so tests can build as many as they need.
#[derive(Clone)]
pub struct InstallContext {
    pub client: reqwest::Client,
    cancel: watch::Receiver<bool>,
    progress: mpsc::Sender<ProgressEvent>,
}

impl InstallContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(InstallerError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Best-effort progress publication; a slow consumer never blocks a
    /// worker.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.progress.try_send(event);
    }
}

/// Cancels every worker observing the paired context.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

pub fn install_context(
    client: reqwest::Client,
) -> (InstallContext, CancelHandle, mpsc::Receiver<ProgressEvent>) {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (progress_tx, progress_rx) = mpsc::channel(256);
    (
        InstallContext {
            client,
            cancel: cancel_rx,
            progress: progress_tx,
        },
        CancelHandle {
            tx: Arc::new(cancel_tx),
        },
        progress_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_handle_flips_context() {
        let client = reqwest::Client::new();
        let (ctx, handle, _rx) = install_context(client);
        assert!(!ctx.is_cancelled());
        assert!(ctx.check_cancelled().is_ok());
        handle.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(
            ctx.check_cancelled(),
            Err(InstallerError::Cancelled)
        ));
    }
}
