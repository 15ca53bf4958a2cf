//! Session markers kept in `runtime_state`.
//!
//! `session_open` is written as `"1"` when an orchestrator opens the store and
//! flipped to `"0"` by a completed shutdown. Finding it still open at startup
//! means the previous process died mid-run.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

const SESSION_KEY: &str = "session_open";

impl Database {
    /// Whether the previous session ended without a completed shutdown
    ///
    /// A store that has never been opened by an orchestrator counts as unclean,
    /// which only affects logging.
    pub async fn was_unclean_shutdown(&self) -> Result<bool> {
        let marker: Option<String> =
            sqlx::query_scalar("SELECT value FROM runtime_state WHERE key = ?")
                .bind(SESSION_KEY)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| session_error("read session marker", e))?;

        Ok(marker.as_deref() != Some("0"))
    }

    /// Record that a session is open
    pub async fn set_clean_start(&self) -> Result<()> {
        self.write_session_marker("1")
            .await
            .map_err(|e| session_error("open session", e))
    }

    /// Record that the session closed through a completed shutdown
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        self.write_session_marker("0")
            .await
            .map_err(|e| session_error("close session", e))
    }

    async fn write_session_marker(&self, marker: &str) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO runtime_state (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(SESSION_KEY)
        .bind(marker)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map(|_| ())
    }
}

fn session_error(action: &str, e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::QueryFailed(format!(
        "Failed to {action}: {e}"
    )))
}
