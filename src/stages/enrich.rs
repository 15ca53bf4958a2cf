//! Enrich: embed a file's metadata descriptor

use super::{StageOutcome, StageRunner};
use crate::error::{ErrorKind, Result, StageError};
use crate::types::{FileRef, FileState, LastError, Stage, UnitId, UnitState};

impl StageRunner {
    /// Embed metadata into one extracted file
    ///
    /// A file with no descriptor is enriched without calling the embedder.
    /// Re-invoking on an Enriched (or later) file is a no-op.
    pub async fn enrich_file(&self, file: &FileRef) -> Result<StageOutcome> {
        let record = self.load_file(file).await?;
        match record.state {
            FileState::Pending | FileState::FailedEnrich => {}
            FileState::Enriched
            | FileState::FailedPublish
            | FileState::Published
            | FileState::Skipped
            | FileState::Abandoned => {
                tracing::debug!(unit_id = %file.unit_id, path = %file.path, state = %record.state, "enrich not needed");
                return Ok(StageOutcome::AlreadyDone);
            }
        }

        self.begin(Stage::Enrich, &file.unit_id, Some(&file.path))
            .await?;

        let descriptor = match record.descriptor.clone() {
            Some(descriptor) if !descriptor.is_empty() => descriptor,
            _ => {
                self.advance_file(file, Stage::Enrich, |record| {
                    record.state = FileState::Enriched;
                    record.metadata_applied = false;
                    // A sidecar problem found during unpack stays visible
                    if record
                        .last_error
                        .as_ref()
                        .is_some_and(|e| e.kind != ErrorKind::Permanent)
                    {
                        record.last_error = None;
                    }
                })
                .await?;
                return Ok(StageOutcome::Completed);
            }
        };

        let location = match self.file_location(&record).await? {
            Ok(location) => location,
            Err(e) => return self.record_file_failure(file, Stage::Enrich, e).await,
        };

        let embedder = self.collaborators.embedder.clone();
        let result = self
            .call("embed", || {
                let embedder = embedder.clone();
                let location = location.clone();
                let descriptor = descriptor.clone();
                async move {
                    embedder
                        .embed(&location, &descriptor)
                        .await
                        .map_err(StageError::from)
                }
            })
            .await;

        match result {
            Ok(()) => {
                self.advance_file(file, Stage::Enrich, |record| {
                    record.state = FileState::Enriched;
                    record.metadata_applied = true;
                    record.last_error = None;
                })
                .await?;
                Ok(StageOutcome::Completed)
            }
            Err(e)
                if e.kind() == ErrorKind::Permanent
                    && self.config.policy.publish_without_metadata =>
            {
                tracing::warn!(
                    unit_id = %file.unit_id,
                    path = %file.path,
                    error = %e,
                    "metadata not embedded; publishing without it as configured"
                );
                let reason = LastError::from(&e);
                self.advance_file(file, Stage::Enrich, move |record| {
                    record.state = FileState::Enriched;
                    record.metadata_applied = false;
                    record.attempts = record.attempts.saturating_add(1);
                    record.last_error = Some(reason);
                })
                .await?;
                Ok(StageOutcome::Completed)
            }
            Err(e) => self.record_file_failure(file, Stage::Enrich, e).await,
        }
    }

    /// Close the Enrich stage of an Unpacked unit once every file was attempted
    pub async fn finish_enrich(&self, unit_id: &UnitId) -> Result<StageOutcome> {
        let unit = self.load_unit(unit_id).await?;
        match unit.state {
            UnitState::Unpacked => {}
            UnitState::Pending
            | UnitState::Fetched
            | UnitState::FailedFetch
            | UnitState::FailedUnpack => {
                return Ok(StageOutcome::Blocked("unit not unpacked yet".into()));
            }
            _ => return Ok(StageOutcome::AlreadyDone),
        }

        let unattempted = self
            .db
            .list_files(unit_id, Some(FileState::Pending))
            .await?
            .len();
        if unattempted > 0 {
            return Ok(StageOutcome::Blocked(format!(
                "{} file(s) not attempted yet",
                unattempted
            )));
        }

        self.advance_unit(unit_id, Stage::Enrich, |unit| {
            unit.state = UnitState::Enriched;
        })
        .await?;
        Ok(StageOutcome::Completed)
    }
}
