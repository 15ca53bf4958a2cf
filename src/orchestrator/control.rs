//! Run control (run/start/stop/retry).

use super::{Orchestrator, RunGuard};
use crate::error::{Error, Result};
use crate::types::{Event, RetryScope, RunSummary};
use tokio_util::sync::CancellationToken;

impl Orchestrator {
    /// Discover new units and drive every unit as far as it can go
    ///
    /// Returns once no unit can make further progress in this pass, or after a
    /// [`stop`](Self::stop) once in-flight stage invocations have finished.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyRunning`] if a run or retry already owns the pipeline
    /// - [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown) began
    /// - a state store error that prevented the pass from being scheduled
    pub async fn run(&self) -> Result<RunSummary> {
        let (guard, token) = self.control.claim()?;
        self.run_claimed(guard, token).await
    }

    /// Start a run in the background
    ///
    /// The claim is taken before this returns, so a second `start()` or `run()`
    /// fails with [`Error::AlreadyRunning`] right away. Collect the result with
    /// [`stop`](Self::stop) or [`wait`](Self::wait).
    pub async fn start(&self) -> Result<()> {
        let (guard, token) = self.control.claim()?;
        let orchestrator = self.clone();
        let handle = tokio::spawn(async move { orchestrator.run_claimed(guard, token).await });
        *self.control.background.lock().await = Some(handle);
        tracing::info!("Pipeline run started in background");
        Ok(())
    }

    /// Wait for a background run to finish on its own
    ///
    /// Returns `None` when no background run was started.
    pub async fn wait(&self) -> Result<Option<RunSummary>> {
        let handle = self.control.background.lock().await.take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Other(format!("pipeline run task failed: {e}")))?
                .map(Some),
            None => Ok(None),
        }
    }

    /// Request a graceful stop and wait for the current run to wind down
    ///
    /// In-flight collaborator calls are not interrupted; no new stage
    /// invocation starts after this is called. Returns the summary of a run
    /// started with [`start`](Self::start), if there was one.
    pub async fn stop(&self) -> Result<Option<RunSummary>> {
        tracing::info!("Stop requested");
        self.control.current_token().cancel();

        let summary = self.wait().await?;
        self.wait_for_idle().await;
        Ok(summary)
    }

    /// Re-execute recorded failures within `scope`
    ///
    /// Like [`run`](Self::run), a retry owns the pipeline while it works.
    pub async fn retry(&self, scope: RetryScope) -> Result<RunSummary> {
        let (_guard, token) = self.control.claim()?;
        tracing::info!(scope = ?scope, "Retrying recorded failures");

        let ledger = crate::ledger::RetryLedger::new(self.runner(token));
        let summary = ledger.retry(&scope).await?;

        tracing::info!(%summary, "Retry finished");
        self.emit(Event::RunFinished {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    async fn run_claimed(&self, _guard: RunGuard, token: CancellationToken) -> Result<RunSummary> {
        tracing::info!("Pipeline run started");

        // A source outage leaves known units to work on
        let discovered = match self.discover().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Discovery failed, continuing with known units");
                0
            }
        };

        let mut summary = self.run_pass(&token).await?;
        summary.units_discovered = discovered;
        summary.cancelled |= token.is_cancelled();

        tracing::info!(%summary, "Pipeline run finished");
        self.emit(Event::RunFinished {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Poll until no run owns the pipeline
    pub(crate) async fn wait_for_idle(&self) {
        loop {
            if !self.control.is_running() {
                return;
            }
            tracing::debug!("Waiting for the active run to finish");
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}
