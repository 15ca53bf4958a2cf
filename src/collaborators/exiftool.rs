//! Metadata embedder driving the external `exiftool` binary

use super::traits::{EmbedError, MetadataEmbedder};
use crate::types::MetadataDescriptor;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Embedder that writes tags with `exiftool -TAG=value -overwrite_original <file>`
///
/// # Examples
///
/// ```no_run
/// use media_relay::collaborators::{ExiftoolEmbedder, MetadataEmbedder};
/// use media_relay::types::MetadataDescriptor;
/// use std::path::Path;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let embedder = ExiftoolEmbedder::from_path().expect("exiftool not found in PATH");
///
/// let mut descriptor = MetadataDescriptor::default();
/// descriptor.tags.insert("Title".into(), "Beach".into());
/// embedder.embed(Path::new("IMG_0001.jpg"), &descriptor).await?;
/// # Ok(())
/// # }
/// ```
pub struct ExiftoolEmbedder {
    binary_path: PathBuf,
}

impl ExiftoolEmbedder {
    /// Create an embedder with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Attempt to find `exiftool` in PATH
    ///
    /// Returns `None` when the binary is not installed.
    pub fn from_path() -> Option<Self> {
        which::which("exiftool").ok().map(Self::new)
    }

    /// Command-line arguments for one embed call
    fn arguments(path: &Path, descriptor: &MetadataDescriptor) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = Vec::with_capacity(descriptor.tags.len() + 3);
        args.push("-overwrite_original".into());
        args.push("-m".into());
        for (key, value) in &descriptor.tags {
            args.push(format!("-{key}={value}").into());
        }
        args.push(path.as_os_str().to_owned());
        args
    }
}

/// Classify a non-zero exiftool exit from its stderr
fn classify_failure(stderr: &str) -> EmbedError {
    let message = stderr.trim().to_string();
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("not yet supported")
        || lowered.contains("unknown file type")
        || lowered.contains("can't currently write")
    {
        EmbedError::Unsupported(message)
    } else if lowered.contains("temporarily unavailable") || lowered.contains("interrupted") {
        EmbedError::Transient(message)
    } else {
        EmbedError::Failed(message)
    }
}

#[async_trait]
impl MetadataEmbedder for ExiftoolEmbedder {
    async fn embed(&self, path: &Path, descriptor: &MetadataDescriptor) -> Result<(), EmbedError> {
        if descriptor.is_empty() {
            return Ok(());
        }

        // A call dropped on timeout must not keep rewriting the file
        let output = Command::new(&self.binary_path)
            .args(Self::arguments(path, descriptor))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => {
                    EmbedError::Transient(format!("Failed to execute exiftool: {}", e))
                }
                _ => EmbedError::Failed(format!("Failed to execute exiftool: {}", e)),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    fn name(&self) -> &'static str {
        "exiftool"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arguments_put_tags_before_the_file() {
        let mut descriptor = MetadataDescriptor::default();
        descriptor
            .tags
            .insert("Title".to_string(), "Beach".to_string());
        descriptor
            .tags
            .insert("DateTimeOriginal".to_string(), "2020:01:01 00:00:00".to_string());

        let args = ExiftoolEmbedder::arguments(Path::new("/w/IMG_1.jpg"), &descriptor);
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(
            args,
            vec![
                "-overwrite_original",
                "-m",
                "-DateTimeOriginal=2020:01:01 00:00:00",
                "-Title=Beach",
                "/w/IMG_1.jpg",
            ]
        );
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("Error: Writing of MKV files is not yet supported - a.mkv"),
            EmbedError::Unsupported(_)
        ));
        assert!(matches!(
            classify_failure("Error: Unknown file type - a.xyz"),
            EmbedError::Unsupported(_)
        ));
        assert!(matches!(
            classify_failure("Error: Not a valid JPG (looks more like a PNG)"),
            EmbedError::Failed(_)
        ));
    }

    #[test]
    fn test_from_path_consistency_with_which_crate() {
        let which_result = which::which("exiftool");
        let from_path_result = ExiftoolEmbedder::from_path();
        assert_eq!(which_result.is_ok(), from_path_result.is_some());
    }

    #[tokio::test]
    async fn test_empty_descriptor_does_not_spawn() {
        let embedder = ExiftoolEmbedder::new(PathBuf::from("/nonexistent/exiftool-binary"));
        embedder
            .embed(Path::new("/nonexistent/a.jpg"), &MetadataDescriptor::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_failure() {
        let embedder = ExiftoolEmbedder::new(PathBuf::from("/nonexistent/exiftool-binary"));
        let mut descriptor = MetadataDescriptor::default();
        descriptor.tags.insert("Title".to_string(), "x".to_string());

        let err = embedder
            .embed(Path::new("/nonexistent/a.jpg"), &descriptor)
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::Failed(_)));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timed_out_call_does_not_leave_exiftool_running() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("pid");
        let binary = temp_dir.path().join("exiftool");
        std::fs::write(
            &binary,
            format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let embedder = ExiftoolEmbedder::new(binary);
        let mut descriptor = MetadataDescriptor::default();
        descriptor.tags.insert("Title".to_string(), "x".to_string());

        let call = embedder.embed(Path::new("/nonexistent/a.jpg"), &descriptor);
        assert!(tokio::time::timeout(Duration::from_millis(500), call).await.is_err());

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let stat = format!("/proc/{pid}/stat");
        let mut gone = false;
        for _ in 0..50 {
            // A killed but unreaped child shows up as a zombie
            gone = match std::fs::read_to_string(&stat) {
                Err(_) => true,
                Ok(line) => line
                    .rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            };
            if gone {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "exiftool process {pid} still running after the call was dropped");
    }
}
