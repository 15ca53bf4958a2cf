//! File records.
//!
//! Aggregates such as "are all files of this unit terminal" are recomputed by
//! scanning rows on every call; nothing about a unit's files is cached.

use std::collections::BTreeMap;

use crate::error::DatabaseError;
use crate::types::{FileRecord, FileRef, FileState, Stage, UnitId};
use crate::{Error, Result};
use sqlx::SqliteConnection;

use super::{Database, FileRow};

const FILE_COLUMNS: &str = "unit_id, path, size_bytes, state, descriptor, album, \
     metadata_applied, asset_id, last_error_kind, last_error_message, attempts, updated_at";

impl Database {
    /// Insert a freshly extracted file unless a record for it already exists
    ///
    /// Returns true if the record was new. Re-running Unpack never clobbers a
    /// record that has already progressed.
    pub async fn insert_file_if_absent(&self, file: &FileRecord) -> Result<bool> {
        let descriptor = encode_descriptor(file)?;
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO files (
                unit_id, path, size_bytes, state, descriptor, album,
                metadata_applied, asset_id, last_error_kind, last_error_message,
                attempts, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(unit_id, path) DO NOTHING
            "#,
        )
        .bind(file.unit_id.as_str())
        .bind(&file.path)
        .bind(file.size_bytes as i64)
        .bind(file.state.as_str())
        .bind(descriptor)
        .bind(&file.album)
        .bind(i64::from(file.metadata_applied))
        .bind(&file.asset_id)
        .bind(file.last_error.as_ref().map(|e| e.kind.as_str()))
        .bind(file.last_error.as_ref().map(|e| e.message.as_str()))
        .bind(i64::from(file.attempts))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert file: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// Get one file of a unit
    pub async fn get_file(&self, unit_id: &UnitId, path: &str) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE unit_id = ? AND path = ?");
        let row = sqlx::query_as::<_, FileRow>(&sql)
            .bind(unit_id.as_str())
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get file: {}",
                    e
                )))
            })?;

        row.map(FileRecord::try_from).transpose()
    }

    /// Insert or update a file
    ///
    /// Refuses moves the file state machine does not allow, such as
    /// Pending straight to Published.
    pub async fn upsert_file(&self, file: &FileRecord) -> Result<()> {
        let mut conn = self.begin_write().await?;

        let result = async {
            if let Some(current) = Self::fetch_file(&mut conn, &file.unit_id, &file.path).await? {
                check_file_transition(current.state, file.state)?;
            }
            Self::write_file(&mut conn, file).await
        }
        .await;

        Self::finish_write(&mut conn, result, "file upsert").await
    }

    /// Read, change and write back a file in one transaction
    ///
    /// Returns the state before the change and the stored result.
    pub async fn modify_file<F>(&self, file: &FileRef, change: F) -> Result<(FileState, FileRecord)>
    where
        F: FnOnce(&mut FileRecord) + Send,
    {
        let mut conn = self.begin_write().await?;

        let result = async {
            let mut record = Self::fetch_file(&mut conn, &file.unit_id, &file.path)
                .await?
                .ok_or_else(|| Error::NotFound(format!("file {}", file)))?;
            let before = record.state;
            change(&mut record);
            check_file_transition(before, record.state)?;
            record.updated_at = chrono::Utc::now();
            Self::write_file(&mut conn, &record).await?;
            Ok((before, record))
        }
        .await;

        Self::finish_write(&mut conn, result, "file update").await
    }

    /// List the files of a unit, optionally only those in one state
    pub async fn list_files(
        &self,
        unit_id: &UnitId,
        state: Option<FileState>,
    ) -> Result<Vec<FileRecord>> {
        let rows = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {FILE_COLUMNS} FROM files WHERE unit_id = ? AND state = ? ORDER BY path ASC"
                );
                sqlx::query_as::<_, FileRow>(&sql)
                    .bind(unit_id.as_str())
                    .bind(state.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql =
                    format!("SELECT {FILE_COLUMNS} FROM files WHERE unit_id = ? ORDER BY path ASC");
                sqlx::query_as::<_, FileRow>(&sql)
                    .bind(unit_id.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list files: {}",
                e
            )))
        })?;

        rows.into_iter().map(FileRecord::try_from).collect()
    }

    /// Every file of every unit
    pub async fn list_all_files(&self) -> Result<Vec<FileRecord>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files ORDER BY unit_id ASC, path ASC");
        let rows = sqlx::query_as::<_, FileRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list files: {}",
                    e
                )))
            })?;

        rows.into_iter().map(FileRecord::try_from).collect()
    }

    /// Files in a failed state, optionally only those that failed at `stage`
    pub async fn list_failed_files(&self, stage: Option<Stage>) -> Result<Vec<FileRecord>> {
        let states: Vec<FileState> = match stage {
            Some(stage) => FileState::failed_at(stage).into_iter().collect(),
            None => vec![FileState::FailedEnrich, FileState::FailedPublish],
        };
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE state IN ({placeholders}) \
             ORDER BY unit_id ASC, path ASC"
        );
        let mut query = sqlx::query_as::<_, FileRow>(&sql);
        for state in &states {
            query = query.bind(state.as_str());
        }

        let rows = query.fetch_all(&self.pool).await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list failed files: {}",
                e
            )))
        })?;

        rows.into_iter().map(FileRecord::try_from).collect()
    }

    /// Number of files of a unit that are not yet Published, Skipped or Abandoned
    pub async fn count_non_terminal_files(&self, unit_id: &UnitId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM files
            WHERE unit_id = ? AND state NOT IN ('published', 'skipped', 'abandoned')
            "#,
        )
        .bind(unit_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count files: {}",
                e
            )))
        })?;

        Ok(count.max(0) as u64)
    }

    /// Number of files in each state, for one unit or for all of them
    pub async fn file_state_counts(
        &self,
        unit_id: Option<&UnitId>,
    ) -> Result<BTreeMap<FileState, u64>> {
        let rows: Vec<(String, i64)> = match unit_id {
            Some(unit_id) => {
                sqlx::query_as("SELECT state, COUNT(*) FROM files WHERE unit_id = ? GROUP BY state")
                    .bind(unit_id.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query_as("SELECT state, COUNT(*) FROM files GROUP BY state")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count files: {}",
                e
            )))
        })?;

        rows.into_iter()
            .map(|(state, count)| {
                FileState::parse(&state)
                    .map(|state| (state, count.max(0) as u64))
                    .ok_or_else(|| super::corrupt("file state", &state))
            })
            .collect()
    }

    async fn fetch_file(
        conn: &mut SqliteConnection,
        unit_id: &UnitId,
        path: &str,
    ) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE unit_id = ? AND path = ?");
        let row = sqlx::query_as::<_, FileRow>(&sql)
            .bind(unit_id.as_str())
            .bind(path)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read file: {}",
                    e
                )))
            })?;

        row.map(FileRecord::try_from).transpose()
    }

    async fn write_file(conn: &mut SqliteConnection, file: &FileRecord) -> Result<()> {
        let descriptor = encode_descriptor(file)?;
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO files (
                unit_id, path, size_bytes, state, descriptor, album,
                metadata_applied, asset_id, last_error_kind, last_error_message,
                attempts, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(unit_id, path) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                state = excluded.state,
                descriptor = excluded.descriptor,
                album = excluded.album,
                metadata_applied = excluded.metadata_applied,
                asset_id = excluded.asset_id,
                last_error_kind = excluded.last_error_kind,
                last_error_message = excluded.last_error_message,
                attempts = excluded.attempts,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(file.unit_id.as_str())
        .bind(&file.path)
        .bind(file.size_bytes as i64)
        .bind(file.state.as_str())
        .bind(descriptor)
        .bind(&file.album)
        .bind(i64::from(file.metadata_applied))
        .bind(&file.asset_id)
        .bind(file.last_error.as_ref().map(|e| e.kind.as_str()))
        .bind(file.last_error.as_ref().map(|e| e.message.as_str()))
        .bind(i64::from(file.attempts))
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write file {}: {}",
                file.file_ref(),
                e
            )))
        })?;

        Ok(())
    }
}

fn encode_descriptor(file: &FileRecord) -> Result<Option<String>> {
    file.descriptor
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(Error::from)
}

fn check_file_transition(from: FileState, to: FileState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            entity: "file",
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
