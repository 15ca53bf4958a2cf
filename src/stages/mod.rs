//! StageRunner: idempotent execution of one pipeline stage
//!
//! Every stage follows the same shape:
//!
//! 1. load the record and decide whether there is anything to do (a second
//!    invocation in the same state is a no-op or, for Fetch, a verification)
//! 2. write the checkpoint and emit [`Event::StageStarted`]
//! 3. call the collaborator under the per-call timeout, backing off on
//!    transient errors
//! 4. persist the new state, emit the transition, clear the checkpoint
//!
//! A collaborator failure is recorded against the unit or file as a
//! `Failed*` state with its attempt count and reason, and comes back as
//! [`StageOutcome::Failed`]. A state store failure comes back as `Err`: the
//! caller must stop working on that unit, and the checkpoint is left for resume.
//!
//! Stages are split by domain:
//! - [`fetch`] - download and verify a unit's archive
//! - [`unpack`] - expand the archive into file records
//! - [`enrich`] - embed metadata into one file
//! - [`publish`] - upload one file
//! - [`reclaim`] - delete a unit's local artifacts

mod enrich;
mod fetch;
mod publish;
mod reclaim;
mod unpack;


pub use unpack::flatten_sidecar;

use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result, StageError};
use crate::governor::DiskSpaceGovernor;
use crate::retry::with_retry_until;
use crate::types::{
    Checkpoint, Event, FileRecord, FileRef, FileState, LastError, Stage, Unit, UnitId, UnitState,
};
use crate::utils::{resolve_within, sanitize_component};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// What a single stage invocation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The record moved to the stage's success state
    Completed,
    /// The record was already past this stage; nothing was done
    AlreadyDone,
    /// The failure was recorded against the record
    Failed(StageError),
    /// Preconditions are not met yet (e.g. Reclaim with files still in flight)
    Blocked(String),
}

impl StageOutcome {
    /// Whether the invocation left the record in the stage's success state
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Completed | StageOutcome::AlreadyDone)
    }
}

/// On-disk layout of one unit's working set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPaths {
    /// `<work_dir>/unit_<id>`
    pub root: PathBuf,
    /// The fetched archive
    pub archive: PathBuf,
    /// Unpack root
    pub extracted: PathBuf,
}

impl UnitPaths {
    /// Layout for `unit_id` under `work_dir`
    pub fn new(work_dir: &Path, unit_id: &UnitId) -> Self {
        let root = work_dir.join(format!("unit_{}", sanitize_component(unit_id.as_str())));
        Self::from_root(root)
    }

    /// Layout rooted at an existing unit directory
    pub fn from_root(root: PathBuf) -> Self {
        Self {
            archive: root.join("archive"),
            extracted: root.join("extracted"),
            root,
        }
    }

    /// Where a file record lives on disk
    pub fn file(&self, relative: &str) -> Option<PathBuf> {
        resolve_within(&self.extracted, relative)
    }
}

/// Runs single stages against units and files
///
/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct StageRunner {
    db: Arc<Database>,
    governor: Arc<DiskSpaceGovernor>,
    collaborators: Collaborators,
    config: Arc<Config>,
    event_tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl StageRunner {
    /// Create a runner; `cancel` stops automatic backoff (never an in-flight call)
    pub fn new(
        db: Arc<Database>,
        governor: Arc<DiskSpaceGovernor>,
        collaborators: Collaborators,
        config: Arc<Config>,
        event_tx: broadcast::Sender<Event>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            governor,
            collaborators,
            config,
            event_tx,
            cancel,
        }
    }

    /// Run the stage that moves a unit out of its current state
    ///
    /// Enrich and Publish at unit level only close the stage once every file
    /// has been attempted; the per-file work is driven by the orchestrator's
    /// worker pools.
    pub async fn run_unit_stage(&self, unit_id: &UnitId, stage: Stage) -> Result<StageOutcome> {
        match stage {
            Stage::Fetch => self.fetch(unit_id).await,
            Stage::Unpack => self.unpack(unit_id).await,
            Stage::Enrich => self.finish_enrich(unit_id).await,
            Stage::Publish => self.finish_publish(unit_id).await,
            Stage::Reclaim => self.reclaim(unit_id).await,
        }
    }

    /// Shared state store handle
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Working directory layout for a unit
    pub fn unit_paths(&self, unit: &Unit) -> UnitPaths {
        match &unit.local_path {
            Some(root) => UnitPaths::from_root(root.clone()),
            None => UnitPaths::new(&self.config.storage.work_dir, &unit.id),
        }
    }

    pub(crate) fn governor(&self) -> &Arc<DiskSpaceGovernor> {
        &self.governor
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Whether a stop was requested for the run this runner belongs to
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    pub(crate) async fn load_unit(&self, unit_id: &UnitId) -> Result<Unit> {
        self.db
            .get_unit(unit_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("unit {}", unit_id)))
    }

    pub(crate) async fn load_file(&self, file: &FileRef) -> Result<FileRecord> {
        self.db
            .get_file(&file.unit_id, &file.path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {}", file)))
    }

    /// Write the checkpoint and announce the stage
    async fn begin(&self, stage: Stage, unit_id: &UnitId, path: Option<&str>) -> Result<()> {
        self.db
            .set_checkpoint(&Checkpoint::new(
                stage,
                unit_id.clone(),
                path.map(str::to_string),
            ))
            .await?;
        self.emit(Event::StageStarted {
            stage,
            unit_id: unit_id.clone(),
            path: path.map(str::to_string),
        });
        Ok(())
    }

    async fn finish(&self, stage: Stage, unit_id: &UnitId) -> Result<()> {
        self.db.clear_checkpoint_for(unit_id, stage).await?;
        Ok(())
    }

    /// Invoke a collaborator under the call timeout, backing off on transient errors
    async fn call<T, F, Fut>(&self, what: &str, mut operation: F) -> std::result::Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StageError>>,
    {
        let timeout = self.config.workers.call_timeout;
        with_retry_until(&self.config.retry, &self.cancel, || {
            let call = operation();
            async move {
                match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(StageError::Transient(format!(
                        "{} timed out after {}s",
                        what,
                        timeout.as_secs()
                    ))),
                }
            }
        })
        .await
    }

    /// Record a unit-level stage failure and emit it
    pub(crate) async fn record_unit_failure(
        &self,
        unit_id: &UnitId,
        stage: Stage,
        error: StageError,
    ) -> Result<StageOutcome> {
        let failed = UnitState::failed_at(stage).ok_or_else(|| {
            Error::Other(format!("{} has no unit-level failure state", stage))
        })?;
        let last_error = LastError::from(&error);

        let (before, unit) = self
            .db
            .modify_unit(unit_id, move |unit| {
                unit.state = failed;
                unit.attempts = unit.attempts.saturating_add(1);
                unit.last_error = Some(last_error);
            })
            .await?;

        tracing::warn!(
            unit_id = %unit_id,
            stage = %stage,
            kind = %error.kind(),
            attempts = unit.attempts,
            error = %error,
            "stage failed"
        );

        self.emit(Event::UnitTransition {
            unit_id: unit_id.clone(),
            from: before,
            to: unit.state,
        });
        self.emit(Event::StageFailed {
            stage,
            unit_id: unit_id.clone(),
            path: None,
            kind: error.kind(),
            error: error.message().to_string(),
        });
        self.finish(stage, unit_id).await?;

        Ok(StageOutcome::Failed(error))
    }

    /// Record a per-file stage failure, abandoning the file at the attempt limit
    pub(crate) async fn record_file_failure(
        &self,
        file: &FileRef,
        stage: Stage,
        error: StageError,
    ) -> Result<StageOutcome> {
        let failed = FileState::failed_at(stage).ok_or_else(|| {
            Error::Other(format!("{} has no file-level failure state", stage))
        })?;
        let last_error = LastError::from(&error);
        let abandon_after = self.config.policy.abandon_after_attempts;

        let (before, record) = self
            .db
            .modify_file(file, move |record| {
                record.attempts = record.attempts.saturating_add(1);
                record.last_error = Some(last_error);
                record.state = match abandon_after {
                    Some(limit) if record.attempts >= limit => FileState::Abandoned,
                    _ => failed,
                };
            })
            .await?;

        if record.state == FileState::Abandoned {
            tracing::warn!(
                unit_id = %file.unit_id,
                path = %file.path,
                stage = %stage,
                attempts = record.attempts,
                error = %error,
                "file abandoned after reaching the attempt limit"
            );
        } else {
            tracing::warn!(
                unit_id = %file.unit_id,
                path = %file.path,
                album = %record.album,
                stage = %stage,
                kind = %error.kind(),
                attempts = record.attempts,
                error = %error,
                "file stage failed"
            );
        }

        self.emit(Event::FileTransition {
            unit_id: file.unit_id.clone(),
            path: file.path.clone(),
            from: before,
            to: record.state,
        });
        self.emit(Event::StageFailed {
            stage,
            unit_id: file.unit_id.clone(),
            path: Some(file.path.clone()),
            kind: error.kind(),
            error: error.message().to_string(),
        });
        self.finish(stage, &file.unit_id).await?;

        Ok(StageOutcome::Failed(error))
    }

    /// Persist a successful unit transition and emit it
    async fn advance_unit<F>(&self, unit_id: &UnitId, stage: Stage, change: F) -> Result<Unit>
    where
        F: FnOnce(&mut Unit) + Send,
    {
        let (before, unit) = self.db.modify_unit(unit_id, change).await?;
        tracing::info!(
            unit_id = %unit_id,
            stage = %stage,
            from = %before,
            to = %unit.state,
            "unit advanced"
        );
        self.emit(Event::UnitTransition {
            unit_id: unit_id.clone(),
            from: before,
            to: unit.state,
        });
        self.finish(stage, unit_id).await?;
        Ok(unit)
    }

    /// Persist a successful file transition and emit it
    async fn advance_file<F>(&self, file: &FileRef, stage: Stage, change: F) -> Result<FileRecord>
    where
        F: FnOnce(&mut FileRecord) + Send,
    {
        let (before, record) = self.db.modify_file(file, change).await?;
        tracing::debug!(
            unit_id = %file.unit_id,
            path = %file.path,
            stage = %stage,
            from = %before,
            to = %record.state,
            "file advanced"
        );
        self.emit(Event::FileTransition {
            unit_id: file.unit_id.clone(),
            path: file.path.clone(),
            from: before,
            to: record.state,
        });
        self.finish(stage, &file.unit_id).await?;
        Ok(record)
    }

    /// Location of a file record on disk
    async fn file_location(&self, record: &FileRecord) -> Result<std::result::Result<PathBuf, StageError>> {
        let unit = self.load_unit(&record.unit_id).await?;
        Ok(self.unit_paths(&unit).file(&record.path).ok_or_else(|| {
            StageError::Integrity(format!(
                "file path '{}' resolves outside the unpack root",
                record.path
            ))
        }))
    }
}
