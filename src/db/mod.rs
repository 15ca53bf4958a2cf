//! StateStore for media-relay
//!
//! Durable SQLite record of per-unit and per-file progress. Every write is
//! committed (WAL, `synchronous = FULL`) before the call returns, so a crash
//! after a successful write never loses it.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`units`] - Unit records and their transitions
//! - [`files`] - File records, per-unit aggregates computed by scanning
//! - [`checkpoint`] - The single in-progress marker
//! - [`budget`] - Persisted disk budget
//! - [`state`] - Runtime state (shutdown tracking)
//! - [`snapshot`] - Structured export of everything stored

use crate::error::DatabaseError;
use crate::types::{
    Checkpoint, DiskBudget, FileRecord, FileState, LastError, MetadataDescriptor, Stage, Unit,
    UnitId, UnitState,
};
use crate::{Error, ErrorKind};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::pool::PoolConnection;
use sqlx::{FromRow, Sqlite, SqliteConnection, sqlite::SqlitePool};
use std::path::PathBuf;

mod budget;
mod checkpoint;
mod files;
mod migrations;
mod snapshot;
mod state;
mod units;

/// Unit record from database (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub struct UnitRow {
    /// Stable unit id
    pub id: String,
    /// Source locator
    pub locator: String,
    /// Archive size in bytes
    pub size_bytes: i64,
    /// Expected SHA-256, hex
    pub checksum: Option<String>,
    /// Working directory while resident
    pub local_path: Option<String>,
    /// State as snake_case text
    pub state: String,
    /// Failed attempts at unit-level stages
    pub attempts: i64,
    /// Kind of the last recorded failure
    pub last_error_kind: Option<String>,
    /// Message of the last recorded failure
    pub last_error_message: Option<String>,
    /// Unix timestamp of discovery
    pub discovered_at: i64,
    /// Unix timestamp of the last write
    pub updated_at: i64,
}

/// File record from database (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    /// Owning unit
    pub unit_id: String,
    /// Relative path inside the unit
    pub path: String,
    /// Size on disk
    pub size_bytes: i64,
    /// State as snake_case text
    pub state: String,
    /// Metadata descriptor as JSON
    pub descriptor: Option<String>,
    /// Destination album
    pub album: String,
    /// Whether tags were written (0 = no, 1 = yes)
    pub metadata_applied: i64,
    /// Destination asset id
    pub asset_id: Option<String>,
    /// Kind of the last recorded failure
    pub last_error_kind: Option<String>,
    /// Message of the last recorded failure
    pub last_error_message: Option<String>,
    /// Failed attempts
    pub attempts: i64,
    /// Unix timestamp of the last write
    pub updated_at: i64,
}

/// Checkpoint record from database (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub struct CheckpointRow {
    /// Stage as text
    pub stage: String,
    /// Unit in progress
    pub unit_id: String,
    /// File in progress, for per-file stages
    pub file_path: Option<String>,
    /// Unix timestamp the checkpoint was written
    pub written_at: i64,
}

/// Everything the store holds, in a serializable form
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// When the snapshot was taken
    pub exported_at: DateTime<Utc>,
    /// Every unit ever discovered
    pub units: Vec<Unit>,
    /// Every file ever extracted
    pub files: Vec<FileRecord>,
    /// Stage last in progress
    pub checkpoint: Option<Checkpoint>,
    /// Persisted disk budget
    pub disk_budget: Option<DiskBudget>,
}

/// Database handle for media-relay
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Acquire a connection and take the write lock up front
    ///
    /// `BEGIN IMMEDIATE` makes concurrent writers queue on the busy timeout
    /// instead of failing when a read-then-write transaction is upgraded.
    async fn begin_write(&self) -> Result<PoolConnection<Sqlite>, Error> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

        Ok(conn)
    }

    /// Commit on success, roll back on error
    async fn finish_write<T>(
        conn: &mut SqliteConnection,
        result: Result<T, Error>,
        what: &str,
    ) -> Result<T, Error> {
        match result {
            Ok(value) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::QueryFailed(format!(
                            "Failed to commit {}: {}",
                            what, e
                        )))
                    })?;
                Ok(value)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn corrupt(what: &str, value: &str) -> Error {
    Error::Database(DatabaseError::Corrupt(format!("unknown {what} '{value}'")))
}

fn last_error_from_columns(
    kind: Option<String>,
    message: Option<String>,
) -> Result<Option<LastError>, Error> {
    match (kind, message) {
        (Some(kind), message) => {
            let kind = ErrorKind::parse(&kind).ok_or_else(|| corrupt("error kind", &kind))?;
            Ok(Some(LastError::new(kind, message.unwrap_or_default())))
        }
        (None, _) => Ok(None),
    }
}

impl TryFrom<UnitRow> for Unit {
    type Error = Error;

    fn try_from(row: UnitRow) -> Result<Self, Self::Error> {
        let state =
            UnitState::parse(&row.state).ok_or_else(|| corrupt("unit state", &row.state))?;
        Ok(Unit {
            id: UnitId(row.id),
            locator: row.locator,
            size_bytes: row.size_bytes.max(0) as u64,
            checksum: row.checksum,
            local_path: row.local_path.map(PathBuf::from),
            state,
            attempts: row.attempts.max(0) as u32,
            last_error: last_error_from_columns(row.last_error_kind, row.last_error_message)?,
            discovered_at: timestamp(row.discovered_at),
            updated_at: timestamp(row.updated_at),
        })
    }
}

impl TryFrom<FileRow> for FileRecord {
    type Error = Error;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        let state =
            FileState::parse(&row.state).ok_or_else(|| corrupt("file state", &row.state))?;
        let descriptor = row
            .descriptor
            .as_deref()
            .map(serde_json::from_str::<MetadataDescriptor>)
            .transpose()
            .map_err(|e| {
                Error::Database(DatabaseError::Corrupt(format!(
                    "undecodable descriptor for {}:{}: {}",
                    row.unit_id, row.path, e
                )))
            })?;
        Ok(FileRecord {
            unit_id: UnitId(row.unit_id),
            path: row.path,
            size_bytes: row.size_bytes.max(0) as u64,
            state,
            descriptor,
            album: row.album,
            metadata_applied: row.metadata_applied != 0,
            asset_id: row.asset_id,
            last_error: last_error_from_columns(row.last_error_kind, row.last_error_message)?,
            attempts: row.attempts.max(0) as u32,
            updated_at: timestamp(row.updated_at),
        })
    }
}

impl TryFrom<CheckpointRow> for Checkpoint {
    type Error = Error;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        let stage = Stage::parse(&row.stage).ok_or_else(|| corrupt("stage", &row.stage))?;
        Ok(Checkpoint {
            stage,
            unit_id: UnitId(row.unit_id),
            file_path: row.file_path,
            written_at: timestamp(row.written_at),
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
