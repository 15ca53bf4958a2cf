//! Fetch: download a unit's archive and verify it

use super::{StageOutcome, StageRunner, UnitPaths};
use crate::error::{Result, StageError};
use crate::types::{Event, Stage, Unit, UnitId, UnitState};
use std::path::Path;

impl StageRunner {
    /// Download and verify the archive of a Pending unit
    ///
    /// On a Fetched unit the archive already on disk is verified instead of
    /// downloaded again. The caller is responsible for holding a disk budget
    /// reservation. A successful fetch resizes it to the measured archive; a
    /// failed one keeps only what is left on disk.
    pub async fn fetch(&self, unit_id: &UnitId) -> Result<StageOutcome> {
        let unit = self.load_unit(unit_id).await?;
        match unit.state {
            UnitState::Pending => {}
            UnitState::Fetched => return self.reverify(&unit).await,
            UnitState::FailedFetch => {
                return Ok(StageOutcome::Blocked(
                    "fetch failed earlier; retry it through the retry ledger".into(),
                ));
            }
            _ => return Ok(StageOutcome::AlreadyDone),
        }

        self.begin(Stage::Fetch, unit_id, None).await?;
        let paths = UnitPaths::new(&self.config.storage.work_dir, unit_id);

        match self.download(&unit, &paths).await {
            Ok(size) => {
                let root = paths.root.clone();
                self.advance_unit(unit_id, Stage::Fetch, move |unit| {
                    unit.state = UnitState::Fetched;
                    unit.size_bytes = size;
                    unit.local_path = Some(root);
                    unit.last_error = None;
                })
                .await?;
                if !self.governor.settle(unit_id, size) {
                    self.emit(Event::BudgetPolicyWarning {
                        unit_id: unit_id.clone(),
                        message: format!(
                            "archive measured {} bytes on disk, more than was reserved; new fetches wait until space is released",
                            size
                        ),
                    });
                }
                tracing::info!(unit_id = %unit_id, size_bytes = size, "archive fetched");
                Ok(StageOutcome::Completed)
            }
            Err(e) => {
                self.hold_failed_artifacts(unit_id, &paths).await;
                self.record_unit_failure(unit_id, Stage::Fetch, e).await
            }
        }
    }

    /// Keep or remove what a failed fetch left behind
    ///
    /// Kept artifacts stay reserved at their size on disk until a retry
    /// replaces them; anything that cannot be measured is removed.
    async fn hold_failed_artifacts(&self, unit_id: &UnitId, paths: &UnitPaths) {
        if self.config.policy.keep_failed_fetch_artifacts {
            match crate::utils::measure_dir(paths.root.clone()).await {
                Ok(0) => {}
                Ok(bytes) => {
                    self.governor.hold(unit_id, bytes);
                    tracing::debug!(unit_id = %unit_id, held_bytes = bytes, "failed fetch artifacts kept");
                    return;
                }
                Err(e) => {
                    tracing::warn!(unit_id = %unit_id, error = %e, "could not measure failed fetch artifacts");
                }
            }
        }
        remove_partial(&paths.root).await;
        self.governor.release(unit_id);
    }

    async fn download(&self, unit: &Unit, paths: &UnitPaths) -> std::result::Result<u64, StageError> {
        tokio::fs::create_dir_all(&paths.root).await.map_err(|e| {
            StageError::Permanent(format!(
                "failed to create unit directory {}: {}",
                paths.root.display(),
                e
            ))
        })?;

        let source = self.collaborators.source.clone();
        let reported = self
            .call("fetch", || {
                let source = source.clone();
                let locator = unit.locator.clone();
                let archive = paths.archive.clone();
                async move {
                    source
                        .fetch(&locator, &archive)
                        .await
                        .map_err(StageError::from)
                }
            })
            .await?;

        self.verify_archive(unit, &paths.archive, Some(reported)).await?;
        Ok(reported)
    }

    /// Idempotent re-invocation on a Fetched unit: check, never re-download
    async fn reverify(&self, unit: &Unit) -> Result<StageOutcome> {
        let paths = self.unit_paths(unit);
        match self.verify_archive(unit, &paths.archive, None).await {
            Ok(()) => {
                tracing::debug!(unit_id = %unit.id, "archive already fetched and intact");
                Ok(StageOutcome::AlreadyDone)
            }
            Err(e) => {
                // The state machine has no way back from Fetched; unpack will
                // fail on the same archive and record it there
                tracing::warn!(unit_id = %unit.id, error = %e, "fetched archive no longer verifies");
                Ok(StageOutcome::Failed(e))
            }
        }
    }

    /// Size and checksum checks on the archive on disk
    async fn verify_archive(
        &self,
        unit: &Unit,
        archive: &Path,
        reported: Option<u64>,
    ) -> std::result::Result<(), StageError> {
        let on_disk = tokio::fs::metadata(archive)
            .await
            .map_err(|e| {
                StageError::Integrity(format!("archive {} is missing: {}", archive.display(), e))
            })?
            .len();

        if let Some(reported) = reported
            && reported != on_disk
        {
            return Err(StageError::Integrity(format!(
                "source reported {} bytes but {} bytes are on disk",
                reported, on_disk
            )));
        }
        if unit.size_bytes > 0 && unit.size_bytes != on_disk {
            return Err(StageError::Integrity(format!(
                "listed size is {} bytes but {} bytes were fetched",
                unit.size_bytes, on_disk
            )));
        }

        if let Some(expected) = unit.checksum.as_deref()
            && self.config.policy.verify_checksums
        {
            let path = archive.to_path_buf();
            let actual = tokio::task::spawn_blocking(move || crate::utils::sha256_file(&path))
                .await
                .map_err(|e| StageError::Permanent(format!("checksum task failed: {}", e)))?
                .map_err(StageError::from)?;
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(StageError::Integrity(format!(
                    "checksum mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
        }

        Ok(())
    }
}

async fn remove_partial(root: &Path) {
    match tokio::fs::remove_dir_all(root).await {
        Ok(()) => tracing::debug!(path = %root.display(), "removed failed fetch artifacts"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %root.display(), error = %e, "could not remove failed fetch artifacts")
        }
    }
}
