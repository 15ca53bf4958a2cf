//! # media-relay
//!
//! Resumable, disk-budgeted pipeline that moves an archived media library
//! (a set of ZIP exports) into a photo library.
//!
//! Each archive is one *unit* that goes through five stages:
//!
//! 1. **Fetch** - download the archive, gated by the disk budget
//! 2. **Unpack** - expand it into one record per media file
//! 3. **Enrich** - embed sidecar metadata into each file
//! 4. **Publish** - upload each file into its album
//! 5. **Reclaim** - delete the unit's local artifacts
//!
//! Every transition is committed to a SQLite state store before the next
//! stage starts, so a crashed or stopped run resumes where it left off and
//! never repeats a finished collaborator call. Failures are recorded per unit
//! or per file and can be retried by stage, unit or file.
//!
//! ## Quick Start
//!
//! ```no_run
//! use media_relay::{Collaborators, Config, DirectorySource, HttpPublisher, Orchestrator};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.disk_budget.ceiling_bytes = Some(50 * 1024 * 1024 * 1024);
//!
//!     let collaborators = Collaborators::new(
//!         Arc::new(DirectorySource::new("/exports")),
//!         Collaborators::default_embedder(),
//!         Arc::new(HttpPublisher::new(
//!             url::Url::parse("https://photos.example.com/api/upload")?,
//!             Duration::from_secs(120),
//!         )?),
//!     );
//!     let orchestrator = Orchestrator::new(config, collaborators).await?;
//!
//!     // Subscribe to events
//!     let mut events = orchestrator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let summary = orchestrator.run().await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// External collaborators (archive source, metadata embedder, publisher)
pub mod collaborators;
/// Configuration types
pub mod config;
/// StateStore persistence layer
pub mod db;
/// Error types
pub mod error;
/// Archive extraction
pub mod extraction;
/// Disk budget governor
pub mod governor;
/// Failure ledger and scoped retries
pub mod ledger;
/// Pipeline orchestrator (decomposed into focused submodules)
pub mod orchestrator;
/// Per-worker call pacing
pub mod pacing;
/// Retry logic with exponential backoff
pub mod retry;
/// Idempotent stage execution
pub mod stages;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use collaborators::{
    ArchiveSource, Collaborators, DestinationPublisher, DirectorySource, EmbedError,
    ExiftoolEmbedder, HttpPublisher, MetadataEmbedder, NoOpEmbedder, PublishError, SourceError,
};
pub use config::Config;
pub use db::Database;
pub use error::{DatabaseError, Error, ErrorKind, Result, StageError};
pub use governor::{DiskSpaceGovernor, FetchDecision};
pub use ledger::{FailureEntry, FailureRef, RetryLedger};
pub use orchestrator::Orchestrator;
pub use stages::{StageOutcome, StageRunner};
pub use types::{
    Checkpoint, Event, FileRecord, FileRef, FileState, ListedUnit, MetadataDescriptor,
    PipelineStatus, RetryScope, RunSummary, Stage, StageCounts, Unit, UnitId, UnitState,
};

/// Helper function to run the pipeline with graceful signal handling.
///
/// Starts a run in the background and waits until it finishes or a termination
/// signal arrives. Then calls the orchestrator's `shutdown()` method, which lets
/// in-flight stage invocations finish before persisting state.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use media_relay::{Collaborators, Config, Orchestrator, run_with_shutdown};
///
/// # async fn example(collaborators: Collaborators) -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = Orchestrator::new(Config::default(), collaborators).await?;
///
/// // Run with automatic signal handling
/// run_with_shutdown(&orchestrator).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_with_shutdown(orchestrator: &Orchestrator) -> Result<()> {
    orchestrator.start().await?;
    tokio::select! {
        _ = wait_for_signal() => {}
        finished = orchestrator.wait() => {
            if let Ok(Some(summary)) = finished {
                tracing::info!(%summary, "Pipeline run finished before a signal arrived");
            }
        }
    }
    orchestrator.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
