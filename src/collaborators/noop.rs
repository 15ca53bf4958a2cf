//! No-op metadata embedder for running without an embedding tool

use super::traits::{EmbedError, MetadataEmbedder};
use crate::types::MetadataDescriptor;
use async_trait::async_trait;
use std::path::Path;

/// Embedder that accepts every call and leaves the file untouched
///
/// Used when no `exiftool` binary is available. Files still move through
/// Enrich so that Publish is not blocked; their descriptors stay recorded in
/// the state store.
///
/// # Examples
///
/// ```
/// use media_relay::collaborators::{MetadataEmbedder, NoOpEmbedder};
/// use media_relay::types::MetadataDescriptor;
/// use std::path::Path;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let embedder = NoOpEmbedder;
/// embedder
///     .embed(Path::new("IMG_0001.jpg"), &MetadataDescriptor::default())
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct NoOpEmbedder;

#[async_trait]
impl MetadataEmbedder for NoOpEmbedder {
    async fn embed(&self, path: &Path, descriptor: &MetadataDescriptor) -> Result<(), EmbedError> {
        tracing::debug!(
            path = %path.display(),
            tags = descriptor.tags.len(),
            "no-op embedder, leaving file untouched"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_never_touches_the_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("a.jpg");
        std::fs::write(&path, b"pixels").unwrap();

        let mut descriptor = MetadataDescriptor::default();
        descriptor
            .tags
            .insert("title".to_string(), "Beach".to_string());

        NoOpEmbedder.embed(&path, &descriptor).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"pixels");
        assert_eq!(NoOpEmbedder.name(), "noop");
    }
}
