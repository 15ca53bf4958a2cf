//! Archive fixtures and pipeline builders backed by real collaborators

use media_relay::{
    Collaborators, Config, DirectorySource, HttpPublisher, NoOpEmbedder, Orchestrator,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Path of the upload endpoint on the mock server
pub const UPLOAD_PATH: &str = "/api/assets";

/// Write a ZIP archive named `<id>.zip` into `dir`
pub fn write_archive(dir: &Path, id: &str, files: &[(&str, &[u8])]) -> PathBuf {
    let archive = dir.join(format!("{id}.zip"));
    let file = std::fs::File::create(&archive).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap();
    archive
}

/// An export with `count` photos in one album, plus a sidecar for the first photo
pub fn write_album(dir: &Path, id: &str, album: &str, count: usize) -> PathBuf {
    let names: Vec<String> = (0..count)
        .map(|i| format!("{album}/IMG_{i:03}.jpg"))
        .collect();
    let sidecar_name = format!("{album}/IMG_000.jpg.json");
    let sidecar = br#"{"title": "first", "geoData": {"latitude": 48.85}}"#;

    let mut files: Vec<(&str, &[u8])> = names
        .iter()
        .map(|name| (name.as_str(), b"\xff\xd8\xff\xe0 jpeg payload".as_slice()))
        .collect();
    if count > 0 {
        files.push((sidecar_name.as_str(), sidecar.as_slice()));
    }
    write_archive(dir, id, &files)
}

/// Mount an upload endpoint that accepts everything
pub async fn accept_uploads(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(UPLOAD_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "asset"})),
        )
        .mount(server)
        .await;
}

/// Mount an upload endpoint that answers every request with `status`
pub async fn reject_uploads(server: &MockServer, status: u16) {
    Mock::given(method("POST"))
        .and(path(UPLOAD_PATH))
        .respond_with(ResponseTemplate::new(status).set_body_string("refused"))
        .mount(server)
        .await;
}

/// Config rooted in `root` with fast retries
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.work_dir = root.join("work");
    config.storage.database_path = root.join("state.db");
    config.retry.max_attempts = 1;
    config.retry.initial_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);
    config.retry.jitter = false;
    config.disk_budget.check_free_space = false;
    config
}

/// A pipeline over a directory source, the no-op embedder and an HTTP publisher
pub struct Pipeline {
    pub orchestrator: Orchestrator,
    pub config: Config,
    pub exports: PathBuf,
    pub server: MockServer,
    pub temp_dir: TempDir,
}

impl Pipeline {
    pub async fn new(adjust: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let exports = temp_dir.path().join("exports");
        std::fs::create_dir_all(&exports).unwrap();
        let mut config = test_config(temp_dir.path());
        adjust(&mut config);

        let server = MockServer::start().await;
        let orchestrator = Self::open(&config, &exports, &server).await;

        Self {
            orchestrator,
            config,
            exports,
            server,
            temp_dir,
        }
    }

    /// A fresh orchestrator over the same state store, as after a restart
    pub async fn reopen(&self) -> Orchestrator {
        Self::open(&self.config, &self.exports, &self.server).await
    }

    async fn open(config: &Config, exports: &Path, server: &MockServer) -> Orchestrator {
        let endpoint = url::Url::parse(&format!("{}{}", server.uri(), UPLOAD_PATH)).unwrap();
        let collaborators = Collaborators::new(
            Arc::new(DirectorySource::new(exports)),
            Arc::new(NoOpEmbedder),
            Arc::new(HttpPublisher::new(endpoint, Duration::from_secs(10)).unwrap()),
        );
        Orchestrator::new(config.clone(), collaborators).await.unwrap()
    }

    /// Number of upload requests the server has seen
    pub async fn upload_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or(0)
    }
}
