use crate::db::*;
use crate::types::ListedUnit;
use tempfile::NamedTempFile;

mod state;

/// Fresh database on a temp file; keep the file alive for the test's duration
async fn temp_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

fn listed(id: &str, size_bytes: u64) -> ListedUnit {
    ListedUnit {
        id: UnitId::from(id),
        locator: format!("takeout/{id}.zip"),
        size_bytes,
        checksum: None,
    }
}
