//! Custom assertions for end-to-end tests

use media_relay::{Orchestrator, UnitId, UnitState};
use std::path::Path;

/// Assert the stored state of a unit
pub async fn assert_unit_state(orchestrator: &Orchestrator, id: &str, expected: UnitState) {
    let unit = orchestrator
        .db
        .get_unit(&UnitId::new(id))
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("unit {id} not recorded"));
    assert_eq!(unit.state, expected, "unit {id}");
}

/// Number of regular files anywhere under `dir`
pub fn files_under(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}
