//! The single in-progress checkpoint.
//!
//! Written before a stage starts and cleared when it succeeds. It only steers
//! resume ordering; stages are idempotent, so a stale checkpoint is harmless.

use crate::error::DatabaseError;
use crate::types::{Checkpoint, Stage, UnitId};
use crate::{Error, Result};

use super::{CheckpointRow, Database};

impl Database {
    /// Record the stage about to run, replacing any previous checkpoint
    pub async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoint (slot, stage, unit_id, file_path, written_at)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(slot) DO UPDATE SET
                stage = excluded.stage,
                unit_id = excluded.unit_id,
                file_path = excluded.file_path,
                written_at = excluded.written_at
            "#,
        )
        .bind(checkpoint.stage.as_str())
        .bind(checkpoint.unit_id.as_str())
        .bind(&checkpoint.file_path)
        .bind(checkpoint.written_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to set checkpoint: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// The current checkpoint, if any
    pub async fn get_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            "SELECT stage, unit_id, file_path, written_at FROM checkpoint WHERE slot = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get checkpoint: {}",
                e
            )))
        })?;

        row.map(Checkpoint::try_from).transpose()
    }

    /// Remove the checkpoint unconditionally
    pub async fn clear_checkpoint(&self) -> Result<()> {
        sqlx::query("DELETE FROM checkpoint")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to clear checkpoint: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Remove the checkpoint only if it still points at this unit and stage
    ///
    /// With several units in flight the slot may already belong to another
    /// unit's stage; that checkpoint must survive.
    pub async fn clear_checkpoint_for(&self, unit_id: &UnitId, stage: Stage) -> Result<bool> {
        let result = sqlx::query("DELETE FROM checkpoint WHERE unit_id = ? AND stage = ?")
            .bind(unit_id.as_str())
            .bind(stage.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to clear checkpoint: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
