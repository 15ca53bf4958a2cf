//! Unit records and their state transitions.

use std::collections::BTreeMap;

use crate::error::DatabaseError;
use crate::types::{ListedUnit, Stage, Unit, UnitId, UnitState};
use crate::{Error, Result};
use sqlx::SqliteConnection;

use super::{Database, UnitRow};

const UNIT_COLUMNS: &str = "id, locator, size_bytes, checksum, local_path, state, attempts, \
     last_error_kind, last_error_message, discovered_at, updated_at";

impl Database {
    /// Insert a unit reported by the source lister, unless it is already known
    ///
    /// Returns true if the unit was new. Known units are left untouched, whatever
    /// their state.
    pub async fn insert_discovered_unit(&self, listed: &ListedUnit) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO units (
                id, locator, size_bytes, checksum, state, attempts,
                discovered_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(listed.id.as_str())
        .bind(&listed.locator)
        .bind(listed.size_bytes as i64)
        .bind(&listed.checksum)
        .bind(UnitState::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert unit: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// Get a unit by id
    pub async fn get_unit(&self, id: &UnitId) -> Result<Option<Unit>> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM units WHERE id = ?");
        let row = sqlx::query_as::<_, UnitRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get unit: {}",
                    e
                )))
            })?;

        row.map(Unit::try_from).transpose()
    }

    /// Insert or update a unit
    ///
    /// The stored state must be able to move to `unit.state`; a non-monotonic
    /// move is refused with [`Error::InvalidTransition`] and nothing is written.
    pub async fn upsert_unit(&self, unit: &Unit) -> Result<()> {
        let mut conn = self.begin_write().await?;

        let result = async {
            if let Some(current) = Self::fetch_unit(&mut conn, &unit.id).await? {
                check_unit_transition(current.state, unit.state)?;
            }
            Self::write_unit(&mut conn, unit).await
        }
        .await;

        Self::finish_write(&mut conn, result, "unit upsert").await
    }

    /// Read, change and write back a unit in one transaction
    ///
    /// Returns the state before the change and the stored result.
    pub async fn modify_unit<F>(&self, id: &UnitId, change: F) -> Result<(UnitState, Unit)>
    where
        F: FnOnce(&mut Unit) + Send,
    {
        let mut conn = self.begin_write().await?;

        let result = async {
            let mut unit = Self::fetch_unit(&mut conn, id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("unit {}", id)))?;
            let before = unit.state;
            change(&mut unit);
            check_unit_transition(before, unit.state)?;
            unit.updated_at = chrono::Utc::now();
            Self::write_unit(&mut conn, &unit).await?;
            Ok((before, unit))
        }
        .await;

        Self::finish_write(&mut conn, result, "unit update").await
    }

    /// List units, optionally only those in one state
    pub async fn list_units(&self, state: Option<UnitState>) -> Result<Vec<Unit>> {
        let rows = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {UNIT_COLUMNS} FROM units WHERE state = ? ORDER BY discovered_at ASC, id ASC"
                );
                sqlx::query_as::<_, UnitRow>(&sql)
                    .bind(state.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql =
                    format!("SELECT {UNIT_COLUMNS} FROM units ORDER BY discovered_at ASC, id ASC");
                sqlx::query_as::<_, UnitRow>(&sql)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list units: {}",
                e
            )))
        })?;

        rows.into_iter().map(Unit::try_from).collect()
    }

    /// Units in a `Failed*` state, optionally only those that failed at `stage`
    pub async fn list_failed_units(&self, stage: Option<Stage>) -> Result<Vec<Unit>> {
        let states: Vec<UnitState> = match stage {
            Some(stage) => UnitState::failed_at(stage).into_iter().collect(),
            None => vec![
                UnitState::FailedFetch,
                UnitState::FailedUnpack,
                UnitState::FailedReclaim,
            ],
        };

        let mut failed = Vec::new();
        for state in states {
            failed.extend(self.list_units(Some(state)).await?);
        }
        failed.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        Ok(failed)
    }

    /// Number of units in each state
    pub async fn unit_state_counts(&self) -> Result<BTreeMap<UnitState, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM units GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to count units: {}",
                        e
                    )))
                })?;

        rows.into_iter()
            .map(|(state, count)| {
                UnitState::parse(&state)
                    .map(|state| (state, count.max(0) as u64))
                    .ok_or_else(|| super::corrupt("unit state", &state))
            })
            .collect()
    }

    async fn fetch_unit(conn: &mut SqliteConnection, id: &UnitId) -> Result<Option<Unit>> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM units WHERE id = ?");
        let row = sqlx::query_as::<_, UnitRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read unit: {}",
                    e
                )))
            })?;

        row.map(Unit::try_from).transpose()
    }

    async fn write_unit(conn: &mut SqliteConnection, unit: &Unit) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let local_path = unit
            .local_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        sqlx::query(
            r#"
            INSERT INTO units (
                id, locator, size_bytes, checksum, local_path, state, attempts,
                last_error_kind, last_error_message, discovered_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                locator = excluded.locator,
                size_bytes = excluded.size_bytes,
                checksum = excluded.checksum,
                local_path = excluded.local_path,
                state = excluded.state,
                attempts = excluded.attempts,
                last_error_kind = excluded.last_error_kind,
                last_error_message = excluded.last_error_message,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(unit.id.as_str())
        .bind(&unit.locator)
        .bind(unit.size_bytes as i64)
        .bind(&unit.checksum)
        .bind(local_path)
        .bind(unit.state.as_str())
        .bind(i64::from(unit.attempts))
        .bind(unit.last_error.as_ref().map(|e| e.kind.as_str()))
        .bind(unit.last_error.as_ref().map(|e| e.message.as_str()))
        .bind(unit.discovered_at.timestamp())
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write unit {}: {}",
                unit.id, e
            )))
        })?;

        Ok(())
    }
}

fn check_unit_transition(from: UnitState, to: UnitState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            entity: "unit",
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
