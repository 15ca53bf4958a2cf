//! Reclaim: delete a unit's local artifacts once every file is terminal

use super::{StageOutcome, StageRunner};
use crate::error::{Result, StageError};
use crate::types::{Event, Stage, UnitId, UnitState};

impl StageRunner {
    /// Remove the archive and extracted tree of a Published unit
    ///
    /// Refuses while any file is not terminal. Safe to repeat after a partial
    /// deletion: a directory that is already gone counts as removed.
    pub async fn reclaim(&self, unit_id: &UnitId) -> Result<StageOutcome> {
        let unit = self.load_unit(unit_id).await?;
        match unit.state {
            UnitState::Published => {}
            UnitState::Reclaimed => return Ok(StageOutcome::AlreadyDone),
            UnitState::FailedReclaim => {
                return Ok(StageOutcome::Blocked(
                    "reclaim failed earlier; retry it through the retry ledger".into(),
                ));
            }
            _ => return Ok(StageOutcome::Blocked("unit not published yet".into())),
        }

        // Recomputed from the rows every time; never cached
        let outstanding = self.db.count_non_terminal_files(unit_id).await?;
        if outstanding > 0 {
            tracing::debug!(unit_id = %unit_id, outstanding, "reclaim waiting on files");
            return Ok(StageOutcome::Blocked(format!(
                "{} file(s) not terminal",
                outstanding
            )));
        }

        self.begin(Stage::Reclaim, unit_id, None).await?;
        let paths = self.unit_paths(&unit);

        match tokio::fs::remove_dir_all(&paths.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(unit_id = %unit_id, path = %paths.root.display(), "unit directory already gone");
            }
            Err(e) => {
                let error = StageError::Permanent(format!(
                    "failed to remove {}: {}",
                    paths.root.display(),
                    e
                ));
                return self.record_unit_failure(unit_id, Stage::Reclaim, error).await;
            }
        }

        self.advance_unit(unit_id, Stage::Reclaim, |unit| {
            unit.state = UnitState::Reclaimed;
            unit.local_path = None;
            unit.last_error = None;
        })
        .await?;

        let released_bytes = self.governor.release(unit_id);
        tracing::info!(unit_id = %unit_id, released_bytes, "unit reclaimed");
        self.emit(Event::UnitReclaimed {
            unit_id: unit_id.clone(),
            released_bytes,
        });
        Ok(StageOutcome::Completed)
    }
}
