//! Archive source backed by a local directory of ZIP files

use super::traits::{ArchiveSource, SourceError};
use crate::types::{ListedUnit, UnitId};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Extension of the optional checksum sidecar next to each archive
const CHECKSUM_SUFFIX: &str = "sha256";

/// Lists `*.zip` files in a directory and fetches them by copying
///
/// The unit id is the archive's file stem and the locator its file name.
/// A `<archive>.sha256` file next to an archive supplies its checksum
/// (first whitespace-separated token, as written by `sha256sum`).
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    /// Serve archives found directly under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory being served
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_checksum(archive: &Path) -> Option<String> {
        let mut sidecar = archive.as_os_str().to_owned();
        sidecar.push(".");
        sidecar.push(CHECKSUM_SUFFIX);
        let raw = tokio::fs::read_to_string(PathBuf::from(sidecar)).await.ok()?;
        raw.split_whitespace()
            .next()
            .map(|token| token.to_ascii_lowercase())
    }
}

fn source_io_error(context: &str, e: std::io::Error) -> SourceError {
    let message = format!("{context}: {e}");
    match e.kind() {
        std::io::ErrorKind::TimedOut
        | std::io::ErrorKind::Interrupted
        | std::io::ErrorKind::WouldBlock => SourceError::Transient(message),
        _ => SourceError::Permanent(message),
    }
}

#[async_trait]
impl ArchiveSource for DirectorySource {
    async fn list_units(&self) -> Result<Vec<ListedUnit>, SourceError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| source_io_error("failed to read source directory", e))?;

        let mut units = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| source_io_error("failed to read source entry", e))?
        {
            let path = entry.path();
            let is_zip = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
            if !is_zip {
                continue;
            }

            let metadata = entry
                .metadata()
                .await
                .map_err(|e| source_io_error("failed to stat archive", e))?;
            if !metadata.is_file() {
                continue;
            }

            let (Some(stem), Some(file_name)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.file_name().and_then(|s| s.to_str()),
            ) else {
                tracing::warn!(path = %path.display(), "skipping archive with a non UTF-8 name");
                continue;
            };

            units.push(ListedUnit {
                id: UnitId::new(stem),
                locator: file_name.to_string(),
                size_bytes: metadata.len(),
                checksum: Self::read_checksum(&path).await,
            });
        }

        units.sort_by(|a, b| a.id.cmp(&b.id));
        tracing::debug!(root = %self.root.display(), count = units.len(), "listed archives");
        Ok(units)
    }

    async fn fetch(&self, locator: &str, dest: &Path) -> Result<u64, SourceError> {
        // Locators are bare file names; anything else would reach outside the root
        let source = crate::utils::resolve_within(&self.root, locator)
            .filter(|p| p.parent() == Some(self.root.as_path()))
            .ok_or_else(|| SourceError::Permanent(format!("invalid locator '{locator}'")))?;

        tokio::fs::copy(&source, dest)
            .await
            .map_err(|e| source_io_error(&format!("failed to copy {}", source.display()), e))
    }

    fn name(&self) -> &'static str {
        "directory"
    }
}
