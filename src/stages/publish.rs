//! Publish: upload enriched files to the destination library

use super::{StageOutcome, StageRunner};
use crate::collaborators::PublishError;
use crate::error::{Result, StageError};
use crate::pacing::CallPacer;
use crate::types::{FileRef, FileState, Stage, UnitId, UnitState};
use tokio::sync::Mutex;

impl StageRunner {
    /// Upload one Enriched (or previously failed) file
    ///
    /// `pacer` belongs to the calling worker; a rate-limit response with a
    /// `Retry-After` pushes that worker's next call back.
    pub async fn publish_file(&self, file: &FileRef, pacer: &Mutex<CallPacer>) -> Result<StageOutcome> {
        let record = self.load_file(file).await?;
        match record.state {
            FileState::Enriched | FileState::FailedPublish => {}
            FileState::Published | FileState::Skipped | FileState::Abandoned => {
                tracing::debug!(unit_id = %file.unit_id, path = %file.path, state = %record.state, "publish not needed");
                return Ok(StageOutcome::AlreadyDone);
            }
            FileState::Pending | FileState::FailedEnrich => {
                return Ok(StageOutcome::Blocked(format!(
                    "file is {}; it must be enriched before it can be published",
                    record.state
                )));
            }
        }

        self.begin(Stage::Publish, &file.unit_id, Some(&file.path))
            .await?;

        let location = match self.file_location(&record).await? {
            Ok(location) => location,
            Err(e) => return self.record_file_failure(file, Stage::Publish, e).await,
        };

        let publisher = self.collaborators.publisher.clone();
        let album = record.album.clone();
        let result = self
            .call("publish", || {
                let publisher = publisher.clone();
                let location = location.clone();
                let album = album.clone();
                async move {
                    pacer.lock().await.pace().await;
                    match publisher.publish(&location, &album).await {
                        Ok(asset_id) => Ok(asset_id),
                        Err(e) => {
                            if let PublishError::RateLimited {
                                retry_after: Some(wait),
                            } = &e
                            {
                                pacer.lock().await.hold_off(*wait);
                            }
                            Err(StageError::from(e))
                        }
                    }
                }
            })
            .await;

        match result {
            Ok(asset_id) => {
                let was_failed = record.state == FileState::FailedPublish;
                let published = self
                    .advance_file(file, Stage::Publish, move |record| {
                        record.state = FileState::Published;
                        record.asset_id = Some(asset_id);
                        if was_failed {
                            record.last_error = None;
                        }
                    })
                    .await?;
                tracing::info!(
                    unit_id = %file.unit_id,
                    path = %file.path,
                    album = %published.album,
                    asset_id = published.asset_id.as_deref().unwrap_or_default(),
                    "file published"
                );
                Ok(StageOutcome::Completed)
            }
            Err(e) => self.record_file_failure(file, Stage::Publish, e).await,
        }
    }

    /// Close the Publish stage of an Enriched unit once every publishable file was attempted
    pub async fn finish_publish(&self, unit_id: &UnitId) -> Result<StageOutcome> {
        let unit = self.load_unit(unit_id).await?;
        match unit.state {
            UnitState::Enriched => {}
            UnitState::Published | UnitState::Reclaimed | UnitState::FailedReclaim => {
                return Ok(StageOutcome::AlreadyDone);
            }
            _ => return Ok(StageOutcome::Blocked("unit not enriched yet".into())),
        }

        let unattempted = self
            .db
            .list_files(unit_id, Some(FileState::Enriched))
            .await?
            .len();
        if unattempted > 0 {
            return Ok(StageOutcome::Blocked(format!(
                "{} enriched file(s) not published yet",
                unattempted
            )));
        }

        self.advance_unit(unit_id, Stage::Publish, |unit| {
            unit.state = UnitState::Published;
        })
        .await?;
        Ok(StageOutcome::Completed)
    }
}
