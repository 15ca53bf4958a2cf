//! Shared test helpers: collaborator stubs with call counters and pipeline builders.

use crate::collaborators::{
    ArchiveSource, Collaborators, DestinationPublisher, EmbedError, MetadataEmbedder,
    PublishError, SourceError,
};
use crate::config::Config;
use crate::db::Database;
use crate::governor::DiskSpaceGovernor;
use crate::orchestrator::Orchestrator;
use crate::stages::StageRunner;
use crate::types::{Event, ListedUnit, MetadataDescriptor, UnitId};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Build an in-memory ZIP archive
pub(crate) fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// `count` media files in one album, each `size` bytes
pub(crate) fn media_files(album: &str, count: usize, size: usize) -> Vec<(String, Vec<u8>)> {
    (0..count)
        .map(|i| (format!("{album}/IMG_{i:04}.jpg"), vec![(i % 251) as u8; size]))
        .collect()
}

/// Borrowed view of owned file lists for [`zip_bytes`]
pub(crate) fn as_entries(files: &[(String, Vec<u8>)]) -> Vec<(&str, &[u8])> {
    files
        .iter()
        .map(|(name, content)| (name.as_str(), content.as_slice()))
        .collect()
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Archive source serving in-memory archives
#[derive(Default)]
pub(crate) struct StubSource {
    units: Mutex<Vec<ListedUnit>>,
    archives: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<VecDeque<SourceError>>,
    listing_failures: Mutex<VecDeque<SourceError>>,
    fetch_calls: AtomicUsize,
    per_locator: Mutex<HashMap<String, usize>>,
}

impl StubSource {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Offer an archive; the listing carries its real size and checksum
    pub(crate) fn add_unit(&self, id: &str, archive: Vec<u8>) -> ListedUnit {
        let listed = ListedUnit {
            id: UnitId::new(id),
            locator: format!("{id}.zip"),
            size_bytes: archive.len() as u64,
            checksum: Some(sha256_hex(&archive)),
        };
        self.archives
            .lock()
            .unwrap()
            .insert(listed.locator.clone(), archive);
        self.units.lock().unwrap().push(listed.clone());
        listed
    }

    /// Offer a unit whose listing claims `size_bytes` (no checksum)
    pub(crate) fn add_unit_with_listed_size(
        &self,
        id: &str,
        archive: Vec<u8>,
        size_bytes: u64,
    ) -> ListedUnit {
        let mut listed = self.add_unit(id, archive);
        listed.size_bytes = size_bytes;
        listed.checksum = None;
        let mut units = self.units.lock().unwrap();
        if let Some(last) = units.last_mut() {
            *last = listed.clone();
        }
        listed
    }

    /// Fail the next fetch with `error`
    pub(crate) fn fail_next(&self, error: SourceError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Fail the next listing with `error`
    pub(crate) fn fail_next_listing(&self, error: SourceError) {
        self.listing_failures.lock().unwrap().push_back(error);
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_calls_for(&self, id: &str) -> usize {
        self.per_locator
            .lock()
            .unwrap()
            .get(&format!("{id}.zip"))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ArchiveSource for StubSource {
    async fn list_units(&self) -> Result<Vec<ListedUnit>, SourceError> {
        if let Some(error) = self.listing_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(self.units.lock().unwrap().clone())
    }

    async fn fetch(&self, locator: &str, dest: &Path) -> Result<u64, SourceError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .per_locator
            .lock()
            .unwrap()
            .entry(locator.to_string())
            .or_default() += 1;

        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let bytes = self
            .archives
            .lock()
            .unwrap()
            .get(locator)
            .cloned()
            .ok_or_else(|| SourceError::Permanent(format!("no archive {locator}")))?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?;
        Ok(bytes.len() as u64)
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

/// Embedder that records calls and fails for configured file names
#[derive(Default)]
pub(crate) struct StubEmbedder {
    calls: AtomicUsize,
    failures: Mutex<HashMap<String, EmbedError>>,
    embedded: Mutex<Vec<(String, MetadataDescriptor)>>,
}

impl StubEmbedder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every call for a path ending in `suffix`
    pub(crate) fn fail_on(&self, suffix: &str, error: EmbedError) {
        self.failures
            .lock()
            .unwrap()
            .insert(suffix.to_string(), error);
    }

    pub(crate) fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn embedded(&self) -> Vec<(String, MetadataDescriptor)> {
        self.embedded.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataEmbedder for StubEmbedder {
    async fn embed(&self, path: &Path, descriptor: &MetadataDescriptor) -> Result<(), EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let shown = path.to_string_lossy().replace('\\', "/");
        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(suffix, _)| shown.ends_with(suffix.as_str()))
            .map(|(_, e)| e.clone());
        if let Some(error) = failure {
            return Err(error);
        }
        self.embedded
            .lock()
            .unwrap()
            .push((shown, descriptor.clone()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

/// Publisher that records uploads and fails for configured file names
#[derive(Default)]
pub(crate) struct StubPublisher {
    calls: AtomicUsize,
    next_id: AtomicU64,
    failures: Mutex<HashMap<String, PublishError>>,
    transient_budget: Mutex<HashMap<String, usize>>,
    published: Mutex<Vec<(String, String)>>,
    delay: Mutex<Option<Duration>>,
}

impl StubPublisher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every call for a path ending in `suffix`
    pub(crate) fn fail_on(&self, suffix: &str, error: PublishError) {
        self.failures
            .lock()
            .unwrap()
            .insert(suffix.to_string(), error);
    }

    /// Fail the first `times` calls for `suffix` with a transient error
    pub(crate) fn flaky_on(&self, suffix: &str, times: usize) {
        self.transient_budget
            .lock()
            .unwrap()
            .insert(suffix.to_string(), times);
    }

    /// Sleep this long inside every call
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(file name, album)` of every successful upload
    pub(crate) fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl DestinationPublisher for StubPublisher {
    async fn publish(&self, path: &Path, album: &str) -> Result<String, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let shown = path.to_string_lossy().replace('\\', "/");
        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(suffix, _)| shown.ends_with(suffix.as_str()))
            .map(|(_, e)| e.clone());
        if let Some(error) = failure {
            return Err(error);
        }
        {
            let mut budget = self.transient_budget.lock().unwrap();
            if let Some(remaining) = budget
                .iter_mut()
                .find(|(suffix, _)| shown.ends_with(suffix.as_str()))
                .map(|(_, n)| n)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(PublishError::Transient("503 service unavailable".into()));
            }
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.published
            .lock()
            .unwrap()
            .push((file_name, album.to_string()));
        Ok(format!(
            "asset-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst) + 1
        ))
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

/// Config rooted in `root` with fast retries and an unlimited budget
pub(crate) fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.work_dir = root.join("work");
    config.storage.database_path = root.join("state.db");
    config.retry.max_attempts = 2;
    config.retry.initial_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);
    config.retry.jitter = false;
    config.workers.call_timeout = Duration::from_secs(10);
    config.disk_budget.check_free_space = false;
    config
}

/// The stubs a test pipeline runs against
pub(crate) struct Stubs {
    pub(crate) source: Arc<StubSource>,
    pub(crate) embedder: Arc<StubEmbedder>,
    pub(crate) publisher: Arc<StubPublisher>,
}

impl Stubs {
    pub(crate) fn new() -> Self {
        Self {
            source: StubSource::new(),
            embedder: StubEmbedder::new(),
            publisher: StubPublisher::new(),
        }
    }

    pub(crate) fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.source.clone(),
            self.embedder.clone(),
            self.publisher.clone(),
        )
    }
}

/// A stage runner over a fresh database, for exercising single stages
pub(crate) struct RunnerFixture {
    pub(crate) runner: StageRunner,
    pub(crate) db: Arc<Database>,
    pub(crate) governor: Arc<DiskSpaceGovernor>,
    pub(crate) stubs: Stubs,
    pub(crate) events: broadcast::Receiver<Event>,
    pub(crate) config: Arc<Config>,
    pub(crate) temp_dir: TempDir,
}

pub(crate) async fn create_runner_fixture(adjust: impl FnOnce(&mut Config)) -> RunnerFixture {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(temp_dir.path());
    adjust(&mut config);
    std::fs::create_dir_all(&config.storage.work_dir).unwrap();

    let db = Arc::new(Database::new(&config.storage.database_path).await.unwrap());
    let governor = Arc::new(DiskSpaceGovernor::new(&config.disk_budget));
    let (event_tx, events) = broadcast::channel(10_000);
    let stubs = Stubs::new();
    let config = Arc::new(config);

    let runner = StageRunner::new(
        db.clone(),
        governor.clone(),
        stubs.collaborators(),
        config.clone(),
        event_tx,
        CancellationToken::new(),
    );

    RunnerFixture {
        runner,
        db,
        governor,
        stubs,
        events,
        config,
        temp_dir,
    }
}

/// A full orchestrator over a fresh working directory
pub(crate) struct PipelineFixture {
    pub(crate) orchestrator: Orchestrator,
    pub(crate) stubs: Stubs,
    pub(crate) config: Config,
    pub(crate) temp_dir: TempDir,
}

pub(crate) async fn create_test_pipeline(adjust: impl FnOnce(&mut Config)) -> PipelineFixture {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(temp_dir.path());
    adjust(&mut config);
    let stubs = Stubs::new();
    let orchestrator = Orchestrator::new(config.clone(), stubs.collaborators())
        .await
        .unwrap();

    PipelineFixture {
        orchestrator,
        stubs,
        config,
        temp_dir,
    }
}

/// Drain every event currently buffered on `rx`
pub(crate) fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
