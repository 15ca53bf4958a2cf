//! Structured export of the whole store.

use crate::Result;

use super::{Database, StateSnapshot};

impl Database {
    /// Every record the store holds, ready to serialize
    pub async fn export_snapshot(&self) -> Result<StateSnapshot> {
        Ok(StateSnapshot {
            exported_at: chrono::Utc::now(),
            units: self.list_units(None).await?,
            files: self.list_all_files().await?,
            checkpoint: self.get_checkpoint().await?,
            disk_budget: self.load_disk_budget().await?,
        })
    }
}

impl StateSnapshot {
    /// Pretty-printed JSON form
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
