//! Destination publisher uploading over HTTP multipart

use super::traits::{DestinationPublisher, PublishError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Asset id as returned by the upload endpoint (string or number)
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AssetId {
    Text(String),
    Number(u64),
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: AssetId,
}

/// Publisher that POSTs each file to an upload endpoint
///
/// The request is `multipart/form-data` with an `album` text field and a
/// `file` part. A 2xx response must carry a JSON body `{"id": ...}`.
///
/// Status mapping: 429 is rate limiting (honouring `Retry-After` in seconds),
/// 401/403 permission denied, 5xx transient, any other non-2xx a rejection of
/// the file.
pub struct HttpPublisher {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpPublisher {
    /// Create a publisher for `endpoint` with a per-request timeout
    pub fn new(endpoint: Url, timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                crate::Error::Io(std::io::Error::other(format!(
                    "Failed to create HTTP client: {}",
                    e
                )))
            })?;

        Ok(Self { client, endpoint })
    }

    /// Upload endpoint
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl DestinationPublisher for HttpPublisher {
    async fn publish(&self, path: &Path, album: &str) -> Result<String, PublishError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| PublishError::Rejected(format!("cannot read {}: {}", path.display(), e)))?;
        let length = file
            .metadata()
            .await
            .map_err(|e| PublishError::Rejected(format!("cannot stat {}: {}", path.display(), e)))?
            .len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));
        let part = reqwest::multipart::Part::stream_with_length(body, length).file_name(file_name);
        let form = reqwest::multipart::Form::new()
            .text("album", album.to_string())
            .part("file", part);

        let response = self
            .client
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PublishError::Transient(format!("upload timed out: {}", e))
                } else if e.is_connect() {
                    PublishError::Transient(format!("connection failed: {}", e))
                } else {
                    PublishError::Transient(format!("upload failed: {}", e))
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PublishError::RateLimited {
                retry_after: parse_retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let message = format!("HTTP {}: {}", status, detail.trim());
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    PublishError::PermissionDenied(message)
                }
                s if s.is_server_error() => PublishError::Transient(message),
                _ => PublishError::Rejected(message),
            });
        }

        let parsed: UploadResponse = response
            .json()
            .await
            .map_err(|e| PublishError::Rejected(format!("unexpected upload response: {}", e)))?;

        Ok(match parsed.id {
            AssetId::Text(id) => id,
            AssetId::Number(id) => id.to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn publisher_for(server: &MockServer) -> HttpPublisher {
        let endpoint = Url::parse(&format!("{}/upload", server.uri())).unwrap();
        HttpPublisher::new(endpoint, Duration::from_secs(5)).unwrap()
    }

    fn media_file(temp_dir: &TempDir) -> std::path::PathBuf {
        let file = temp_dir.path().join("IMG_0001.jpg");
        std::fs::write(&file, b"jpeg bytes").unwrap();
        file
    }

    #[tokio::test]
    async fn test_publish_returns_asset_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .and(body_string_contains("Summer Trip"))
            .and(body_string_contains("IMG_0001.jpg"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "asset-123"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let publisher = publisher_for(&server).await;
        let id = publisher
            .publish(&media_file(&temp_dir), "Summer Trip")
            .await
            .unwrap();

        assert_eq!(id, "asset-123");
    }

    #[tokio::test]
    async fn test_numeric_asset_ids_are_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": 42})))
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let id = publisher_for(&server)
            .await
            .publish(&media_file(&temp_dir), "a")
            .await
            .unwrap();
        assert_eq!(id, "42");
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let err = publisher_for(&server)
            .await
            .publish(&media_file(&temp_dir), "a")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            PublishError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let cases = [
            (401, "permission"),
            (403, "permission"),
            (500, "transient"),
            (503, "transient"),
            (400, "rejected"),
            (413, "rejected"),
        ];

        let temp_dir = TempDir::new().unwrap();
        let file = media_file(&temp_dir);

        for (status, expected) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
                .mount(&server)
                .await;

            let err = publisher_for(&server)
                .await
                .publish(&file, "a")
                .await
                .unwrap_err();
            let actual = match err {
                PublishError::PermissionDenied(_) => "permission",
                PublishError::Transient(_) => "transient",
                PublishError::Rejected(_) => "rejected",
                PublishError::RateLimited { .. } => "rate_limited",
            };
            assert_eq!(actual, expected, "status {status}");
        }
    }

    #[tokio::test]
    async fn test_success_without_id_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let temp_dir = TempDir::new().unwrap();
        let err = publisher_for(&server)
            .await
            .publish(&media_file(&temp_dir), "a")
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let endpoint = Url::parse("http://127.0.0.1:1/upload").unwrap();
        let publisher = HttpPublisher::new(endpoint, Duration::from_secs(2)).unwrap();
        let temp_dir = TempDir::new().unwrap();

        let err = publisher
            .publish(&media_file(&temp_dir), "a")
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Transient(_)));
    }
}
