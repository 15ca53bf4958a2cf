//! Archive extraction
//!
//! Unpack expands a unit's archive with [`ZipExtractor`]. Extraction is
//! all-or-nothing with respect to safety: entry names are validated up front,
//! and an absolute path, a `..` component or a symlink entry fails the whole
//! archive as an integrity error before a single byte is written.
//!
//! Extraction itself is resumable. Files are written through a `.partial`
//! sibling and renamed into place, and a re-run keeps files whose size already
//! matches the archive.

mod zip;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use zip::{ExtractedEntry, ZipExtractor};

use crate::error::StageError;
use std::path::PathBuf;

/// Extract an archive off the async runtime
///
/// # Example
/// ```no_run
/// use media_relay::extraction::extract_archive;
/// use std::path::PathBuf;
///
/// # async fn example() -> Result<(), media_relay::StageError> {
/// let files = extract_archive(
///     PathBuf::from("/work/unit_takeout-001/archive"),
///     PathBuf::from("/work/unit_takeout-001/extracted"),
/// )
/// .await?;
/// println!("Extracted {} files", files.len());
/// # Ok(())
/// # }
/// ```
pub async fn extract_archive(
    archive_path: PathBuf,
    dest_path: PathBuf,
) -> Result<Vec<ExtractedEntry>, StageError> {
    tokio::task::spawn_blocking(move || ZipExtractor::extract(&archive_path, &dest_path))
        .await
        .map_err(|e| StageError::Permanent(format!("extraction task failed: {}", e)))?
}
