//! RetryLedger: the failures recorded in the state store, and scoped retries of them
//!
//! The ledger keeps no state of its own. Every query is answered from the
//! `Failed*` rows of the state store, so the ledger can never disagree with
//! the records it describes.
//!
//! Retrying a file re-invokes only the stage it failed at: a `FailedPublish`
//! file is published from the artifact already on disk, and nothing upstream
//! (Fetch, Unpack, Enrich) runs as a side effect. Retrying a unit resets it to
//! the state its stage started from and runs that one stage again; a Fetch
//! retry must pass the disk budget like any other fetch.

use crate::error::{Error, ErrorKind, Result, StageError};
use crate::governor::FetchDecision;
use crate::pacing::CallPacer;
use crate::stages::{StageOutcome, StageRunner};
use crate::types::{
    Event, FileRecord, FileRef, FileState, RetryScope, RunSummary, Stage, Unit, UnitId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::Mutex;

/// What a recorded failure is attached to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", content = "id", rename_all = "snake_case")]
pub enum FailureRef {
    /// A unit-level stage (Fetch, Unpack, Reclaim)
    Unit(UnitId),
    /// A per-file stage (Enrich, Publish)
    File(FileRef),
}

impl FailureRef {
    /// Unit the failure belongs to
    pub fn unit_id(&self) -> &UnitId {
        match self {
            FailureRef::Unit(id) => id,
            FailureRef::File(file) => &file.unit_id,
        }
    }
}

impl fmt::Display for FailureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureRef::Unit(id) => write!(f, "unit {}", id),
            FailureRef::File(file) => write!(f, "file {}", file),
        }
    }
}

/// One entry of the ledger
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    /// Failed unit or file
    pub target: FailureRef,
    /// Stage it failed at
    pub stage: Stage,
    /// Failure classification
    pub kind: ErrorKind,
    /// Recorded reason
    pub message: String,
    /// Failed attempts so far
    pub attempts: u32,
    /// Destination album, for file failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    /// Unit working directory at the time of the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<std::path::PathBuf>,
    /// When the failure was recorded
    pub updated_at: DateTime<Utc>,
}

impl FailureEntry {
    fn from_unit(unit: &Unit) -> Option<Self> {
        let stage = unit.state.failed_stage()?;
        let (kind, message) = reason(unit.last_error.as_ref());
        Some(Self {
            target: FailureRef::Unit(unit.id.clone()),
            stage,
            kind,
            message,
            attempts: unit.attempts,
            album: None,
            local_path: unit.local_path.clone(),
            updated_at: unit.updated_at,
        })
    }

    fn from_file(record: &FileRecord, unit: Option<&Unit>) -> Option<Self> {
        let stage = record.state.failed_stage()?;
        let (kind, message) = reason(record.last_error.as_ref());
        Some(Self {
            target: FailureRef::File(record.file_ref()),
            stage,
            kind,
            message,
            attempts: record.attempts,
            album: Some(record.album.clone()),
            local_path: unit.and_then(|u| u.local_path.clone()),
            updated_at: record.updated_at,
        })
    }
}

fn reason(last_error: Option<&crate::types::LastError>) -> (ErrorKind, String) {
    match last_error {
        Some(e) => (e.kind, e.message.clone()),
        None => (ErrorKind::Permanent, "no reason recorded".to_string()),
    }
}

/// Queryable view of recorded failures with scoped re-execution
#[derive(Clone)]
pub struct RetryLedger {
    runner: StageRunner,
}

impl RetryLedger {
    /// Ledger over the records `runner` writes
    pub fn new(runner: StageRunner) -> Self {
        Self { runner }
    }

    /// Record a stage failure against a unit or file
    ///
    /// Stages record their own failures; this is the entry point for failures
    /// detected outside a stage invocation.
    pub async fn record_failure(
        &self,
        target: &FailureRef,
        stage: Stage,
        error: StageError,
    ) -> Result<()> {
        match target {
            FailureRef::Unit(unit_id) => {
                self.runner
                    .record_unit_failure(unit_id, stage, error)
                    .await?;
            }
            FailureRef::File(file) => {
                self.runner.record_file_failure(file, stage, error).await?;
            }
        }
        Ok(())
    }

    /// Every recorded failure, optionally only those at `stage`
    ///
    /// Unit failures come first, then file failures; each group oldest first.
    pub async fn list_failures(&self, stage: Option<Stage>) -> Result<Vec<FailureEntry>> {
        let db = self.runner.db();

        let mut units: Vec<FailureEntry> = db
            .list_failed_units(stage)
            .await?
            .iter()
            .filter_map(FailureEntry::from_unit)
            .collect();
        units.sort_by_key(|e| e.updated_at);

        let mut files = Vec::new();
        for record in db.list_failed_files(stage).await? {
            let unit = db.get_unit(&record.unit_id).await?;
            if let Some(entry) = FailureEntry::from_file(&record, unit.as_ref()) {
                files.push(entry);
            }
        }
        files.sort_by_key(|e| e.updated_at);

        units.extend(files);
        Ok(units)
    }

    /// Number of recorded failures
    pub async fn count_failures(&self) -> Result<u64> {
        let db = self.runner.db();
        let units = db.list_failed_units(None).await?.len();
        let files = db.list_failed_files(None).await?.len();
        Ok((units + files) as u64)
    }

    /// Re-run the stage one failure was recorded at
    pub async fn retry_single(&self, target: &FailureRef) -> Result<StageOutcome> {
        match target {
            FailureRef::File(file) => self.retry_file(file).await,
            FailureRef::Unit(unit_id) => self.retry_unit_stage(unit_id).await,
        }
    }

    async fn retry_file(&self, file: &FileRef) -> Result<StageOutcome> {
        let record = self.runner.load_file(file).await?;
        let Some(stage) = record.state.failed_stage() else {
            return Ok(StageOutcome::Blocked(format!(
                "file is {}, there is no failure to retry",
                record.state
            )));
        };

        tracing::info!(unit_id = %file.unit_id, path = %file.path, stage = %stage, attempts = record.attempts, "retrying file");
        match stage {
            Stage::Enrich => self.runner.enrich_file(file).await,
            _ => {
                let pacer = Mutex::new(CallPacer::new(
                    self.runner.config().workers.publish_min_interval,
                ));
                self.runner.publish_file(file, &pacer).await
            }
        }
    }

    async fn retry_unit_stage(&self, unit_id: &UnitId) -> Result<StageOutcome> {
        let unit = self.runner.load_unit(unit_id).await?;
        let (Some(stage), Some(target)) = (unit.state.failed_stage(), unit.state.retry_state())
        else {
            return Ok(StageOutcome::Blocked(format!(
                "unit is {}, there is no failure to retry",
                unit.state
            )));
        };

        if stage == Stage::Fetch {
            // Kept artifacts of the failed attempt are overwritten by the new fetch
            let kept = self.runner.governor().release(unit_id);
            match self.runner.governor().try_reserve(unit_id, unit.size_bytes) {
                FetchDecision::Authorized {
                    reserved_bytes,
                    oversized,
                } => {
                    self.runner.emit(Event::FetchAuthorized {
                        unit_id: unit_id.clone(),
                        reserved_bytes,
                    });
                    if oversized {
                        self.runner.emit(Event::BudgetPolicyWarning {
                            unit_id: unit_id.clone(),
                            message: format!(
                                "unit needs {} bytes, more than the disk budget allows; fetching because nothing else is resident",
                                reserved_bytes
                            ),
                        });
                    }
                }
                FetchDecision::Deferred {
                    requested_bytes,
                    resident_bytes,
                } => {
                    if kept > 0 {
                        self.runner.governor().hold(unit_id, kept);
                    }
                    tracing::info!(unit_id = %unit_id, requested_bytes, resident_bytes, "fetch retry deferred by disk budget");
                    self.runner.emit(Event::FetchDeferred {
                        unit_id: unit_id.clone(),
                        requested_bytes,
                        resident_bytes,
                    });
                    return Ok(StageOutcome::Blocked(format!(
                        "disk budget full: {} bytes resident, {} bytes requested",
                        resident_bytes, requested_bytes
                    )));
                }
            }
        }

        let (before, reset) = self
            .runner
            .db()
            .modify_unit(unit_id, move |unit| unit.state = target)
            .await?;
        tracing::info!(unit_id = %unit_id, stage = %stage, attempts = reset.attempts, "retrying unit");
        self.runner.emit(Event::UnitTransition {
            unit_id: unit_id.clone(),
            from: before,
            to: reset.state,
        });

        self.runner.run_unit_stage(unit_id, stage).await
    }

    /// Retry every recorded failure, optionally only those at `stage`
    ///
    /// A retry that hits a state store error is logged and the remaining
    /// failures are still attempted.
    pub async fn retry_all(&self, stage: Option<Stage>) -> Result<RunSummary> {
        let entries = self.list_failures(stage).await?;
        tracing::info!(failures = entries.len(), stage = ?stage, "retrying recorded failures");
        self.retry_entries(entries).await
    }

    /// Retry a unit's own failure and the failures of its files
    pub async fn retry_unit(&self, unit_id: &UnitId) -> Result<RunSummary> {
        let entries = self
            .list_failures(None)
            .await?
            .into_iter()
            .filter(|e| e.target.unit_id() == unit_id)
            .collect();
        self.retry_entries(entries).await
    }

    /// Retry whatever `scope` selects
    pub async fn retry(&self, scope: &RetryScope) -> Result<RunSummary> {
        match scope {
            RetryScope::All => self.retry_all(None).await,
            RetryScope::Stage(stage) => self.retry_all(Some(*stage)).await,
            RetryScope::Unit(unit_id) => self.retry_unit(unit_id).await,
            RetryScope::File(file) => {
                let record = self.runner.load_file(file).await?;
                let unit = self.runner.db().get_unit(&file.unit_id).await?;
                let entries = FailureEntry::from_file(&record, unit.as_ref())
                    .into_iter()
                    .collect();
                self.retry_entries(entries).await
            }
        }
    }

    async fn retry_entries(&self, entries: Vec<FailureEntry>) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        for entry in entries {
            if self.runner.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            match self.retry_single(&entry.target).await {
                Ok(StageOutcome::Blocked(why)) => {
                    if entry.stage == Stage::Fetch {
                        summary.units_deferred += 1;
                    }
                    tracing::info!(failure = %entry.target, stage = %entry.stage, reason = %why, "retry not possible yet");
                }
                Ok(outcome) => summary.record(entry.stage, outcome.is_success()),
                Err(e) => {
                    tracing::error!(failure = %entry.target, stage = %entry.stage, error = %e, "retry aborted by state store failure");
                    summary.record(entry.stage, false);
                }
            }
        }

        summary.outstanding_failures = self.count_failures().await?;
        Ok(summary)
    }

    /// Give up on a failed file: it becomes terminal and stops blocking Reclaim
    ///
    /// The last error is kept so the reason stays visible.
    pub async fn abandon(&self, file: &FileRef) -> Result<FileRecord> {
        let record = self.runner.load_file(file).await?;
        if record.state.failed_stage().is_none() {
            return Err(Error::InvalidTransition {
                entity: "file",
                from: record.state.to_string(),
                to: FileState::Abandoned.to_string(),
            });
        }

        let (before, abandoned) = self
            .runner
            .db()
            .modify_file(file, |record| record.state = FileState::Abandoned)
            .await?;
        tracing::warn!(unit_id = %file.unit_id, path = %file.path, from = %before, "file abandoned");
        self.runner.emit(Event::FileTransition {
            unit_id: file.unit_id.clone(),
            path: file.path.clone(),
            from: before,
            to: abandoned.state,
        });
        Ok(abandoned)
    }
}
