//! External collaborators of the pipeline
//!
//! The pipeline never talks to the outside world directly. Each stage goes
//! through one of three trait objects:
//!
//! - [`ArchiveSource`]: lists units and downloads their archives (Fetch)
//! - [`MetadataEmbedder`]: writes tags into a media file in place (Enrich)
//! - [`DestinationPublisher`]: uploads a file into an album (Publish)
//!
//! Concrete adapters:
//!
//! - [`DirectorySource`]: archives in a local directory
//! - [`ExiftoolEmbedder`]: external `exiftool` binary
//! - [`NoOpEmbedder`]: accepts everything, for when no embedding tool is installed
//! - [`HttpPublisher`]: multipart upload to an HTTP endpoint
//!
//! Every collaborator failure is typed, and converts into a
//! [`StageError`](crate::error::StageError) so the orchestrator can branch on
//! transient vs permanent without inspecting messages.

mod directory;
mod exiftool;
mod http;
mod noop;
mod traits;

pub use directory::DirectorySource;
pub use exiftool::ExiftoolEmbedder;
pub use http::HttpPublisher;
pub use noop::NoOpEmbedder;
pub use traits::{
    ArchiveSource, DestinationPublisher, EmbedError, MetadataEmbedder, PublishError, SourceError,
};

use std::sync::Arc;

/// The three collaborators a pipeline runs against
#[derive(Clone)]
pub struct Collaborators {
    /// Lists and downloads archives
    pub source: Arc<dyn ArchiveSource>,
    /// Embeds metadata into extracted files
    pub embedder: Arc<dyn MetadataEmbedder>,
    /// Publishes enriched files
    pub publisher: Arc<dyn DestinationPublisher>,
}

impl Collaborators {
    /// Bundle the three collaborators
    pub fn new(
        source: Arc<dyn ArchiveSource>,
        embedder: Arc<dyn MetadataEmbedder>,
        publisher: Arc<dyn DestinationPublisher>,
    ) -> Self {
        Self {
            source,
            embedder,
            publisher,
        }
    }

    /// Use `exiftool` from PATH when installed, otherwise the no-op embedder
    pub fn default_embedder() -> Arc<dyn MetadataEmbedder> {
        ExiftoolEmbedder::from_path()
            .map(|e| Arc::new(e) as Arc<dyn MetadataEmbedder>)
            .unwrap_or_else(|| Arc::new(NoOpEmbedder))
    }
}
