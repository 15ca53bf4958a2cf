//! The pipeline orchestrator, split into focused submodules.
//!
//! The `Orchestrator` struct and its methods are organized by domain:
//! - [`scheduler`] - Discovery and the scheduling pass over units
//! - [`unit_task`] - Driving one unit through consecutive stages
//! - [`workers`] - Bounded Enrich and Publish worker pools
//! - [`control`] - Run, start, stop and retry
//! - [`lifecycle`] - Startup recovery and graceful shutdown

mod control;
mod lifecycle;
mod scheduler;
mod unit_task;
mod workers;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::governor::DiskSpaceGovernor;
use crate::ledger::RetryLedger;
use crate::stages::StageRunner;
use crate::types::{DiskBudgetStatus, Event, PipelineStatus, RunSummary};
use futures::Stream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

/// Run ownership and cancellation
#[derive(Clone)]
pub(crate) struct RunControl {
    /// Token of the current (or last) run; replaced when a run is claimed
    pub(crate) cancel: Arc<std::sync::Mutex<CancellationToken>>,
    /// Set while a run or retry owns the pipeline
    pub(crate) running: Arc<AtomicBool>,
    /// Handle of a run started in the background with `start()`
    pub(crate) background: Arc<tokio::sync::Mutex<Option<JoinHandle<Result<RunSummary>>>>>,
    /// Flag to indicate whether new runs are accepted (set to false during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
}

/// Releases the run claim when dropped, even if the run panicked
pub(crate) struct RunGuard {
    running: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl RunControl {
    fn new() -> Self {
        Self {
            cancel: Arc::new(std::sync::Mutex::new(CancellationToken::new())),
            running: Arc::new(AtomicBool::new(false)),
            background: Arc::new(tokio::sync::Mutex::new(None)),
            accepting_new: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Take ownership of the pipeline for one run
    ///
    /// Fails with [`Error::ShuttingDown`] after shutdown began and with
    /// [`Error::AlreadyRunning`] while another run or retry holds the claim.
    pub(crate) fn claim(&self) -> Result<(RunGuard, CancellationToken)> {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }

        let token = CancellationToken::new();
        *self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token.clone();
        Ok((
            RunGuard {
                running: self.running.clone(),
            },
            token,
        ))
    }

    pub(crate) fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Main pipeline instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Orchestrator {
    /// State store (wrapped in Arc for sharing across tasks)
    /// Public for integration tests to inspect unit and file records
    pub db: Arc<Database>,
    /// Disk budget shared by every unit task
    pub(crate) governor: Arc<DiskSpaceGovernor>,
    /// Source, embedder and publisher
    pub(crate) collaborators: Collaborators,
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Run ownership and cancellation
    pub(crate) control: RunControl,
}

impl Orchestrator {
    /// Create a new Orchestrator instance
    ///
    /// This initializes all core components:
    /// - Validates the configuration
    /// - Creates the working directory
    /// - Opens/creates the SQLite state store and runs migrations
    /// - Rebuilds the disk budget from resident units
    /// - Sets up the event broadcast channel
    pub async fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.storage.work_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create work directory '{}': {}",
                        config.storage.work_dir.display(),
                        e
                    ),
                ))
            })?;

        let db = Database::new(&config.storage.database_path).await?;

        if db.was_unclean_shutdown().await? {
            tracing::warn!("Previous run did not shut down cleanly; resuming from recorded state");
        }
        db.set_clean_start().await?;

        // Create broadcast channel with buffer size of 1000 events
        let (event_tx, _rx) = broadcast::channel(1000);

        let governor = Arc::new(DiskSpaceGovernor::new(&config.disk_budget));

        let orchestrator = Self {
            db: Arc::new(db),
            governor,
            collaborators,
            config: Arc::new(config),
            event_tx,
            control: RunControl::new(),
        };

        orchestrator.restore_budget().await?;

        tracing::info!(
            source = orchestrator.collaborators.source.name(),
            embedder = orchestrator.collaborators.embedder.name(),
            publisher = orchestrator.collaborators.publisher.name(),
            "Pipeline initialized"
        );

        Ok(orchestrator)
    }

    /// Subscribe to pipeline events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events independently.
    /// A subscriber that falls behind by more than 1000 events receives
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Pipeline events as a stream
    ///
    /// Events missed by a lagging consumer are skipped with a warning.
    pub fn events(&self) -> impl Stream<Item = Event> + Send + 'static {
        BroadcastStream::new(self.event_tx.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::warn!(missed, "event consumer lagged, events dropped");
                None
            }
        })
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Whether a run or retry currently owns the pipeline
    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Ledger for inspecting failures outside of a run
    ///
    /// Retries made through it are not coordinated with a concurrent run;
    /// prefer [`retry`](Self::retry), which claims the pipeline first.
    pub fn ledger(&self) -> RetryLedger {
        RetryLedger::new(self.runner(CancellationToken::new()))
    }

    /// Snapshot of unit and file counts, the disk budget and the failure count
    pub async fn status(&self) -> Result<PipelineStatus> {
        let units = self.db.unit_state_counts().await?;
        let files = self.db.file_state_counts(None).await?;
        let checkpoint = self.db.get_checkpoint().await?;
        let failures = self.ledger().count_failures().await?;

        let measured_bytes =
            match crate::utils::measure_dir(self.config.storage.work_dir.clone()).await {
                Ok(bytes) => bytes,
                // Removed between the walk and the read
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(Error::Io(e)),
            };

        let budget = self.governor.snapshot();
        Ok(PipelineStatus {
            running: self.is_running(),
            units,
            files,
            disk_budget: DiskBudgetStatus {
                ceiling_bytes: budget.ceiling_bytes,
                margin_bytes: budget.margin_bytes,
                reserved_bytes: budget.resident_bytes,
                measured_bytes,
                residents: budget.reservations.into_iter().map(|r| r.unit_id).collect(),
            },
            checkpoint,
            failures,
        })
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn current_token(&self) -> CancellationToken {
        self.control.current_token()
    }

    /// Stage runner bound to `cancel`
    pub(crate) fn runner(&self, cancel: CancellationToken) -> StageRunner {
        StageRunner::new(
            self.db.clone(),
            self.governor.clone(),
            self.collaborators.clone(),
            self.config.clone(),
            self.event_tx.clone(),
            cancel,
        )
    }
}
