//! Collaborator contracts consumed by the pipeline stages

use crate::error::StageError;
use crate::types::{ListedUnit, MetadataDescriptor};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by an [`ArchiveSource`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Temporary failure; the call may succeed if repeated
    #[error("transient source failure: {0}")]
    Transient(String),
    /// The archive cannot be obtained (missing, forbidden, corrupt upstream)
    #[error("permanent source failure: {0}")]
    Permanent(String),
}

impl From<SourceError> for StageError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Transient(m) => StageError::Transient(m),
            SourceError::Permanent(m) => StageError::Permanent(m),
        }
    }
}

/// Failure reported by a [`MetadataEmbedder`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmbedError {
    /// The file format cannot carry embedded metadata
    #[error("unsupported file: {0}")]
    Unsupported(String),
    /// The embedder ran and refused the file
    #[error("metadata embedding failed: {0}")]
    Failed(String),
    /// Temporary failure (tool busy, interrupted)
    #[error("transient embedding failure: {0}")]
    Transient(String),
}

impl From<EmbedError> for StageError {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::Transient(m) => StageError::Transient(m),
            EmbedError::Unsupported(m) => StageError::Permanent(format!("unsupported file: {m}")),
            EmbedError::Failed(m) => StageError::Permanent(m),
        }
    }
}

/// Failure reported by a [`DestinationPublisher`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The destination asked the caller to slow down
    #[error("rate limited by destination")]
    RateLimited {
        /// How long the destination asked to wait, when it said
        retry_after: Option<Duration>,
    },
    /// Credentials were refused or lack the required scope
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Temporary failure (5xx, connection reset, timeout)
    #[error("transient publish failure: {0}")]
    Transient(String),
    /// The destination refused this particular file
    #[error("rejected by destination: {0}")]
    Rejected(String),
}

impl PublishError {
    /// Wait requested by the destination, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PublishError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<PublishError> for StageError {
    fn from(e: PublishError) -> Self {
        match e {
            PublishError::RateLimited { retry_after } => StageError::Transient(match retry_after {
                Some(wait) => format!("rate limited, retry after {}s", wait.as_secs()),
                None => "rate limited".to_string(),
            }),
            PublishError::Transient(m) => StageError::Transient(m),
            PublishError::PermissionDenied(m) => {
                StageError::Permanent(format!("permission denied: {m}"))
            }
            PublishError::Rejected(m) => StageError::Permanent(format!("rejected: {m}")),
        }
    }
}

/// Lists and downloads opaque archive blobs
///
/// Implementations are shared across tasks and must be `Send + Sync`.
/// The pipeline never inspects a locator; it hands back exactly what
/// [`list_units`](Self::list_units) returned.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Every unit the source currently offers
    ///
    /// Ids must be stable across calls; a unit seen before is ignored by discovery.
    async fn list_units(&self) -> Result<Vec<ListedUnit>, SourceError>;

    /// Download the archive at `locator` to the file `dest`
    ///
    /// `dest`'s parent directory exists. Returns the number of bytes written.
    /// A second call with the same `dest` must overwrite, not append.
    async fn fetch(&self, locator: &str, dest: &Path) -> Result<u64, SourceError>;

    /// Name of the source (for logging and debugging)
    fn name(&self) -> &'static str;
}

/// Writes metadata tags into a media file in place
#[async_trait]
pub trait MetadataEmbedder: Send + Sync {
    /// Embed every tag of `descriptor` into the file at `path`
    ///
    /// Must be safe to call twice with the same arguments.
    async fn embed(&self, path: &Path, descriptor: &MetadataDescriptor) -> Result<(), EmbedError>;

    /// Name of the embedder (for logging and debugging)
    fn name(&self) -> &'static str;
}

/// Uploads files into the destination library
#[async_trait]
pub trait DestinationPublisher: Send + Sync {
    /// Upload the file at `path` into `album`, returning the destination's asset id
    async fn publish(&self, path: &Path, album: &str) -> Result<String, PublishError>;

    /// Name of the publisher (for logging and debugging)
    fn name(&self) -> &'static str;
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn rate_limits_and_blips_are_transient() {
        let limited: StageError = PublishError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        }
        .into();
        assert_eq!(limited.kind(), ErrorKind::Transient);
        assert!(limited.message().contains("30s"));

        let blip: StageError = SourceError::Transient("connection reset".into()).into();
        assert_eq!(blip.kind(), ErrorKind::Transient);

        let busy: StageError = EmbedError::Transient("interrupted".into()).into();
        assert_eq!(busy.kind(), ErrorKind::Transient);
    }

    #[test]
    fn refusals_are_permanent() {
        for err in [
            StageError::from(PublishError::PermissionDenied("scope".into())),
            StageError::from(PublishError::Rejected("too large".into())),
            StageError::from(EmbedError::Unsupported("x.mkv".into())),
            StageError::from(EmbedError::Failed("bad tag".into())),
            StageError::from(SourceError::Permanent("410 gone".into())),
        ] {
            assert_eq!(err.kind(), ErrorKind::Permanent, "{err}");
        }
    }

    #[test]
    fn retry_after_only_on_rate_limit() {
        let wait = Duration::from_secs(5);
        assert_eq!(
            PublishError::RateLimited {
                retry_after: Some(wait)
            }
            .retry_after(),
            Some(wait)
        );
        assert_eq!(PublishError::Transient("503".into()).retry_after(), None);
    }
}
