//! Unpack: expand a fetched archive into file records

use super::{StageOutcome, StageRunner};
use crate::error::{ErrorKind, Result};
use crate::extraction::{ExtractedEntry, extract_archive};
use crate::types::{
    Event, FileRecord, FileState, LastError, MetadataDescriptor, Stage, UnitId, UnitState,
};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Reason prefix stored on files excluded by policy
const POLICY_SKIP: &str = "policy_skip";

impl StageRunner {
    /// Extract a Fetched unit and record one file per archive entry
    ///
    /// Records that already exist (from an interrupted earlier run) are left
    /// untouched, so progress made on them is never lost.
    pub async fn unpack(&self, unit_id: &UnitId) -> Result<StageOutcome> {
        let unit = self.load_unit(unit_id).await?;
        match unit.state {
            UnitState::Fetched => {}
            UnitState::Pending | UnitState::FailedFetch => {
                return Ok(StageOutcome::Blocked("archive not fetched yet".into()));
            }
            UnitState::FailedUnpack => {
                return Ok(StageOutcome::Blocked(
                    "unpack failed earlier; retry it through the retry ledger".into(),
                ));
            }
            _ => return Ok(StageOutcome::AlreadyDone),
        }

        self.begin(Stage::Unpack, unit_id, None).await?;
        let paths = self.unit_paths(&unit);

        let entries = match extract_archive(paths.archive.clone(), paths.extracted.clone()).await {
            Ok(entries) => entries,
            Err(e) => return self.record_unit_failure(unit_id, Stage::Unpack, e).await,
        };

        let records = self.plan_records(unit_id, &entries).await;
        let mut inserted = 0usize;
        for record in &records {
            if self.db.insert_file_if_absent(record).await? {
                inserted += 1;
                if record.state == FileState::Skipped {
                    self.emit(Event::FileTransition {
                        unit_id: unit_id.clone(),
                        path: record.path.clone(),
                        from: FileState::Pending,
                        to: FileState::Skipped,
                    });
                }
            }
        }

        tracing::info!(
            unit_id = %unit_id,
            files = records.len(),
            inserted,
            skipped = records.iter().filter(|r| r.state == FileState::Skipped).count(),
            "archive unpacked"
        );

        self.advance_unit(unit_id, Stage::Unpack, |unit| {
            unit.state = UnitState::Unpacked;
            unit.last_error = None;
        })
        .await?;
        Ok(StageOutcome::Completed)
    }

    /// Turn extracted entries into file records: albums, sidecars and policy skips
    async fn plan_records(&self, unit_id: &UnitId, entries: &[ExtractedEntry]) -> Vec<FileRecord> {
        let policy = &self.config.policy;
        let sidecar_suffix = format!(".{}", policy.sidecar_extension.trim_start_matches('.'));
        let present: HashSet<&str> = entries.iter().map(|e| e.relative_path.as_str()).collect();

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let relative = entry.relative_path.as_str();
            let album = album_for(relative, &policy.default_album);
            let mut record = FileRecord::extracted(
                unit_id.clone(),
                relative.to_string(),
                entry.size_bytes,
                album,
            );

            let is_sidecar = relative
                .to_ascii_lowercase()
                .ends_with(&sidecar_suffix.to_ascii_lowercase());
            if is_sidecar || policy.is_skipped_extension(Path::new(relative)) {
                let why = if is_sidecar {
                    "metadata sidecar"
                } else {
                    "excluded extension"
                };
                record.state = FileState::Skipped;
                record.last_error = Some(LastError::new(
                    ErrorKind::Permanent,
                    format!("{POLICY_SKIP}: {why}"),
                ));
                records.push(record);
                continue;
            }

            if let Some(sidecar) = sidecar_candidates(relative, &sidecar_suffix)
                .into_iter()
                .find(|c| present.contains(c.as_str()))
            {
                let sidecar_path = entries
                    .iter()
                    .find(|e| e.relative_path == sidecar)
                    .map(|e| e.path.clone());
                if let Some(sidecar_path) = sidecar_path {
                    match read_sidecar(&sidecar_path).await {
                        Ok(descriptor) => record.descriptor = Some(descriptor),
                        Err(reason) => {
                            tracing::warn!(
                                unit_id = %unit_id,
                                path = %relative,
                                sidecar = %sidecar,
                                error = %reason,
                                "ignoring unreadable metadata sidecar"
                            );
                            record.last_error = Some(LastError::new(
                                ErrorKind::Permanent,
                                format!("unreadable sidecar {}: {}", sidecar, reason),
                            ));
                        }
                    }
                }
            }

            records.push(record);
        }
        records
    }
}

/// Album of a file: its parent directory inside the archive
fn album_for(relative: &str, default_album: &str) -> String {
    let mut parts: Vec<&str> = relative.split('/').collect();
    parts.pop();
    parts
        .last()
        .map(|dir| dir.to_string())
        .filter(|dir| !dir.is_empty())
        .unwrap_or_else(|| default_album.to_string())
}

/// `a/IMG_1.jpg` looks for `a/IMG_1.jpg.json`, then `a/IMG_1.json`
fn sidecar_candidates(relative: &str, suffix: &str) -> Vec<String> {
    let mut candidates = vec![format!("{relative}{suffix}")];
    let (dir, name) = match relative.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, relative),
    };
    if let Some((stem, _)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        candidates.push(match dir {
            Some(dir) => format!("{dir}/{stem}{suffix}"),
            None => format!("{stem}{suffix}"),
        });
    }
    candidates
}

async fn read_sidecar(path: &Path) -> std::result::Result<MetadataDescriptor, String> {
    let raw = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let value: serde_json::Value = serde_json::from_slice(&raw).map_err(|e| e.to_string())?;
    flatten_sidecar(&value).ok_or_else(|| "sidecar is not a JSON object".to_string())
}

/// Flatten a sidecar JSON object into dotted tag names
///
/// `{"photoTakenTime": {"timestamp": "1577836800"}}` becomes
/// `photoTakenTime.timestamp = 1577836800`. Array elements are keyed by index;
/// nulls are dropped. Returns `None` unless the top level is an object.
pub fn flatten_sidecar(value: &serde_json::Value) -> Option<MetadataDescriptor> {
    let object = value.as_object()?;
    let mut tags = BTreeMap::new();
    for (key, child) in object {
        flatten_into(key, child, &mut tags);
    }
    Some(MetadataDescriptor { tags })
}

fn flatten_into(prefix: &str, value: &serde_json::Value, tags: &mut BTreeMap<String, String>) {
    use serde_json::Value;

    match value {
        Value::Null => {}
        Value::Bool(b) => {
            tags.insert(prefix.to_string(), b.to_string());
        }
        Value::Number(n) => {
            tags.insert(prefix.to_string(), n.to_string());
        }
        Value::String(s) => {
            tags.insert(prefix.to_string(), s.clone());
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_into(&format!("{prefix}.{index}"), item, tags);
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(&format!("{prefix}.{key}"), child, tags);
            }
        }
    }
}
