use crate::error::StageError;
use crate::utils::{relative_slash_path, resolve_within};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Unix file type bits of a symlink entry
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// One regular file written (or found intact) under the unpack root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntry {
    /// `/`-separated path relative to the unpack root
    pub relative_path: String,
    /// Absolute location on disk
    pub path: PathBuf,
    /// Uncompressed size
    pub size_bytes: u64,
    /// Already present with the right size; not rewritten
    pub reused: bool,
}

/// Validated entry, ready to be written
struct PlannedEntry {
    index: usize,
    target: PathBuf,
    is_dir: bool,
    size: u64,
}

/// Archive extractor for ZIP files
///
/// Every entry name is validated before anything is written: a single entry
/// that would land outside the destination fails the whole extraction.
pub struct ZipExtractor;

impl ZipExtractor {
    fn open(archive_path: &Path) -> Result<zip::ZipArchive<std::fs::File>, StageError> {
        let file = std::fs::File::open(archive_path).map_err(|e| {
            StageError::Permanent(format!(
                "failed to open archive {}: {}",
                archive_path.display(),
                e
            ))
        })?;

        zip::ZipArchive::new(file).map_err(|e| {
            StageError::Permanent(format!(
                "failed to read ZIP archive {}: {}",
                archive_path.display(),
                e
            ))
        })
    }

    /// Check every entry of the archive without writing anything
    fn plan(
        archive: &mut zip::ZipArchive<std::fs::File>,
        dest_path: &Path,
    ) -> Result<Vec<PlannedEntry>, StageError> {
        let mut planned = Vec::with_capacity(archive.len());

        for index in 0..archive.len() {
            let entry = archive.by_index(index).map_err(|e| {
                StageError::Permanent(format!("failed to read ZIP entry {}: {}", index, e))
            })?;
            let name = entry.name().to_string();

            if entry
                .unix_mode()
                .is_some_and(|mode| mode & S_IFMT == S_IFLNK)
            {
                return Err(StageError::Integrity(format!(
                    "archive entry '{}' is a symbolic link",
                    name
                )));
            }

            let target = match (entry.enclosed_name(), resolve_within(dest_path, &name)) {
                (Some(_), Some(target)) => target,
                _ if entry.is_dir() && matches!(name.trim_matches('/'), "" | ".") => continue,
                _ => {
                    return Err(StageError::Integrity(format!(
                        "archive entry '{}' resolves outside the unpack root",
                        name
                    )));
                }
            };

            planned.push(PlannedEntry {
                index,
                target,
                is_dir: entry.is_dir(),
                size: entry.size(),
            });
        }

        Ok(planned)
    }

    fn write_entry(
        archive: &mut zip::ZipArchive<std::fs::File>,
        entry: &PlannedEntry,
    ) -> Result<bool, StageError> {
        if let Ok(existing) = std::fs::symlink_metadata(&entry.target)
            && existing.is_file()
            && existing.len() == entry.size
        {
            return Ok(true);
        }

        if let Some(parent) = entry.target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StageError::Permanent(format!("failed to create parent directories: {}", e))
            })?;
        }

        let mut source = archive.by_index(entry.index).map_err(|e| {
            StageError::Permanent(format!("failed to read ZIP entry {}: {}", entry.index, e))
        })?;

        // Write beside the target and rename, so a crash never leaves a
        // truncated file that looks complete
        let mut partial = entry.target.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let mut outfile = std::fs::File::create(&partial)
            .map_err(|e| StageError::Permanent(format!("failed to create output file: {}", e)))?;
        std::io::copy(&mut source, &mut outfile)
            .map_err(|e| StageError::Permanent(format!("failed to extract file: {}", e)))?;
        outfile
            .flush()
            .and_then(|_| outfile.sync_all())
            .map_err(|e| StageError::Permanent(format!("failed to flush file: {}", e)))?;
        std::fs::rename(&partial, &entry.target)
            .map_err(|e| StageError::Permanent(format!("failed to move file into place: {}", e)))?;

        Ok(false)
    }

    /// Extract `archive_path` into `dest_path`
    ///
    /// Re-running over a partially extracted tree keeps files that are already
    /// complete. Returns every regular file of the archive, sorted by path.
    pub fn extract(archive_path: &Path, dest_path: &Path) -> Result<Vec<ExtractedEntry>, StageError> {
        debug!(?archive_path, ?dest_path, "attempting ZIP extraction");

        let mut archive = Self::open(archive_path)?;
        let planned = Self::plan(&mut archive, dest_path)?;

        std::fs::create_dir_all(dest_path).map_err(|e| {
            StageError::Permanent(format!("failed to create destination: {}", e))
        })?;

        let mut extracted = Vec::new();
        let mut reused_count = 0usize;
        for entry in &planned {
            if entry.is_dir {
                std::fs::create_dir_all(&entry.target).map_err(|e| {
                    StageError::Permanent(format!("failed to create directory: {}", e))
                })?;
                continue;
            }

            let reused = Self::write_entry(&mut archive, entry)?;
            if reused {
                reused_count += 1;
            }

            let relative_path = relative_slash_path(dest_path, &entry.target).ok_or_else(|| {
                StageError::Integrity(format!(
                    "extracted file {} is not under the unpack root",
                    entry.target.display()
                ))
            })?;
            extracted.push(ExtractedEntry {
                relative_path,
                path: entry.target.clone(),
                size_bytes: entry.size,
                reused,
            });
        }

        extracted.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        info!(
            ?archive_path,
            extracted_count = extracted.len(),
            reused_count,
            "ZIP extraction successful"
        );
        Ok(extracted)
    }
}
