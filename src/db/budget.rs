//! Persisted disk budget record.

use crate::error::DatabaseError;
use crate::types::{DiskBudget, Reservation};
use crate::{Error, Result};

use super::Database;

impl Database {
    /// Persist the governor's current budget
    pub async fn save_disk_budget(&self, budget: &DiskBudget) -> Result<()> {
        let reservations = serde_json::to_string(&budget.reservations)?;
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO disk_budget (
                slot, ceiling_bytes, margin_bytes, resident_bytes, reservations, updated_at
            ) VALUES (1, ?, ?, ?, ?, ?)
            ON CONFLICT(slot) DO UPDATE SET
                ceiling_bytes = excluded.ceiling_bytes,
                margin_bytes = excluded.margin_bytes,
                resident_bytes = excluded.resident_bytes,
                reservations = excluded.reservations,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(budget.ceiling_bytes.map(|c| c as i64))
        .bind(budget.margin_bytes as i64)
        .bind(budget.resident_bytes as i64)
        .bind(reservations)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to save disk budget: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// The last persisted budget, if one was ever saved
    pub async fn load_disk_budget(&self) -> Result<Option<DiskBudget>> {
        let row: Option<(Option<i64>, i64, i64, String)> = sqlx::query_as(
            r#"
            SELECT ceiling_bytes, margin_bytes, resident_bytes, reservations
            FROM disk_budget WHERE slot = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to load disk budget: {}",
                e
            )))
        })?;

        let Some((ceiling, margin, resident, reservations)) = row else {
            return Ok(None);
        };

        let reservations: Vec<Reservation> = serde_json::from_str(&reservations).map_err(|e| {
            Error::Database(DatabaseError::Corrupt(format!(
                "undecodable disk budget reservations: {}",
                e
            )))
        })?;

        Ok(Some(DiskBudget {
            ceiling_bytes: ceiling.map(|c| c.max(0) as u64),
            margin_bytes: margin.max(0) as u64,
            resident_bytes: resident.max(0) as u64,
            reservations,
        }))
    }
}
