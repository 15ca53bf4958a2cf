//! Core types for media-relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::ErrorKind;

/// Stable identifier for a unit, as reported by the archive source
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub String);

impl UnitId {
    /// Create a new UnitId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UnitId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UnitId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pipeline stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Obtain the archive from the source
    Fetch,
    /// Expand the archive into file records
    Unpack,
    /// Embed metadata into each file
    Enrich,
    /// Upload each file to the destination library
    Publish,
    /// Delete local artifacts
    Reclaim,
}

impl Stage {
    /// All stages in pipeline order
    pub const ALL: [Stage; 5] = [
        Stage::Fetch,
        Stage::Unpack,
        Stage::Enrich,
        Stage::Publish,
        Stage::Reclaim,
    ];

    /// Stable text stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Unpack => "unpack",
            Stage::Enrich => "enrich",
            Stage::Publish => "publish",
            Stage::Reclaim => "reclaim",
        }
    }

    /// Parse the stored text form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fetch" => Some(Stage::Fetch),
            "unpack" => Some(Stage::Unpack),
            "enrich" => Some(Stage::Enrich),
            "publish" => Some(Stage::Publish),
            "reclaim" => Some(Stage::Reclaim),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit lifecycle state
///
/// Forward progress is `Pending → Fetched → Unpacked → Enriched → Published → Reclaimed`.
/// Unit-level stages that can fail have a `Failed*` branch which only ever retries
/// back to the state the stage started from. Enrich and Publish fail per file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Discovered, nothing local yet
    Pending,
    /// Archive is on disk and verified
    Fetched,
    /// Archive expanded into file records
    Unpacked,
    /// Every file has been through Enrich
    Enriched,
    /// Every enriched file has been through Publish
    Published,
    /// Local artifacts removed
    Reclaimed,
    /// Fetch failed
    FailedFetch,
    /// Unpack failed
    FailedUnpack,
    /// Reclaim failed
    FailedReclaim,
}

impl UnitState {
    /// Stable text stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::Fetched => "fetched",
            UnitState::Unpacked => "unpacked",
            UnitState::Enriched => "enriched",
            UnitState::Published => "published",
            UnitState::Reclaimed => "reclaimed",
            UnitState::FailedFetch => "failed_fetch",
            UnitState::FailedUnpack => "failed_unpack",
            UnitState::FailedReclaim => "failed_reclaim",
        }
    }

    /// Parse the stored text form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UnitState::Pending),
            "fetched" => Some(UnitState::Fetched),
            "unpacked" => Some(UnitState::Unpacked),
            "enriched" => Some(UnitState::Enriched),
            "published" => Some(UnitState::Published),
            "reclaimed" => Some(UnitState::Reclaimed),
            "failed_fetch" => Some(UnitState::FailedFetch),
            "failed_unpack" => Some(UnitState::FailedUnpack),
            "failed_reclaim" => Some(UnitState::FailedReclaim),
            _ => None,
        }
    }

    /// The stage that moves a unit out of this state, if any
    pub fn next_stage(&self) -> Option<Stage> {
        match self {
            UnitState::Pending => Some(Stage::Fetch),
            UnitState::Fetched => Some(Stage::Unpack),
            UnitState::Unpacked => Some(Stage::Enrich),
            UnitState::Enriched => Some(Stage::Publish),
            UnitState::Published => Some(Stage::Reclaim),
            _ => None,
        }
    }

    /// Failure branch for a unit-level stage
    pub fn failed_at(stage: Stage) -> Option<Self> {
        match stage {
            Stage::Fetch => Some(UnitState::FailedFetch),
            Stage::Unpack => Some(UnitState::FailedUnpack),
            Stage::Reclaim => Some(UnitState::FailedReclaim),
            Stage::Enrich | Stage::Publish => None,
        }
    }

    /// The stage a failed state failed at
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            UnitState::FailedFetch => Some(Stage::Fetch),
            UnitState::FailedUnpack => Some(Stage::Unpack),
            UnitState::FailedReclaim => Some(Stage::Reclaim),
            _ => None,
        }
    }

    /// State a failed unit returns to on retry
    pub fn retry_state(&self) -> Option<Self> {
        match self {
            UnitState::FailedFetch => Some(UnitState::Pending),
            UnitState::FailedUnpack => Some(UnitState::Fetched),
            UnitState::FailedReclaim => Some(UnitState::Published),
            _ => None,
        }
    }

    /// Whether the unit is in a `Failed*` state
    pub fn is_failed(&self) -> bool {
        self.failed_stage().is_some()
    }

    /// Whether the unit may occupy local disk in this state
    pub fn is_resident(&self) -> bool {
        matches!(
            self,
            UnitState::Fetched
                | UnitState::Unpacked
                | UnitState::Enriched
                | UnitState::Published
                | UnitState::FailedUnpack
                | UnitState::FailedReclaim
        )
    }

    /// Whether moving from `self` to `next` keeps the state machine monotonic
    pub fn can_transition_to(&self, next: UnitState) -> bool {
        use UnitState::*;

        if *self == next {
            return true;
        }
        matches!(
            (*self, next),
            (Pending, Fetched)
                | (Pending, FailedFetch)
                | (Fetched, Unpacked)
                | (Fetched, FailedUnpack)
                | (Unpacked, Enriched)
                | (Enriched, Published)
                | (Published, Reclaimed)
                | (Published, FailedReclaim)
                | (FailedFetch, Pending)
                | (FailedUnpack, Fetched)
                | (FailedReclaim, Published)
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Extracted, not yet enriched
    Pending,
    /// Metadata embedded (or nothing to embed)
    Enriched,
    /// Excluded by policy; never published
    Skipped,
    /// Accepted by the destination library
    Published,
    /// Given up on by the operator or by the attempt limit
    Abandoned,
    /// Enrich failed
    FailedEnrich,
    /// Publish failed
    FailedPublish,
}

impl FileState {
    /// Stable text stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Pending => "pending",
            FileState::Enriched => "enriched",
            FileState::Skipped => "skipped",
            FileState::Published => "published",
            FileState::Abandoned => "abandoned",
            FileState::FailedEnrich => "failed_enrich",
            FileState::FailedPublish => "failed_publish",
        }
    }

    /// Parse the stored text form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FileState::Pending),
            "enriched" => Some(FileState::Enriched),
            "skipped" => Some(FileState::Skipped),
            "published" => Some(FileState::Published),
            "abandoned" => Some(FileState::Abandoned),
            "failed_enrich" => Some(FileState::FailedEnrich),
            "failed_publish" => Some(FileState::FailedPublish),
            _ => None,
        }
    }

    /// Terminal files no longer block Reclaim
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileState::Published | FileState::Skipped | FileState::Abandoned
        )
    }

    /// The stage a failed state failed at
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            FileState::FailedEnrich => Some(Stage::Enrich),
            FileState::FailedPublish => Some(Stage::Publish),
            _ => None,
        }
    }

    /// Failure branch for a file-level stage
    pub fn failed_at(stage: Stage) -> Option<Self> {
        match stage {
            Stage::Enrich => Some(FileState::FailedEnrich),
            Stage::Publish => Some(FileState::FailedPublish),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is allowed
    ///
    /// Published is only reachable from Enriched (or a failed publish of an
    /// enriched file); Skipped is only reachable from Pending.
    pub fn can_transition_to(&self, next: FileState) -> bool {
        use FileState::*;

        if *self == next {
            return true;
        }
        matches!(
            (*self, next),
            (Pending, Enriched)
                | (Pending, Skipped)
                | (Pending, FailedEnrich)
                | (Pending, Abandoned)
                | (FailedEnrich, Enriched)
                | (FailedEnrich, Abandoned)
                | (Enriched, Published)
                | (Enriched, FailedPublish)
                | (Enriched, Abandoned)
                | (FailedPublish, Published)
                | (FailedPublish, Abandoned)
        )
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded reason a unit or file is short of done
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Failure classification
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
}

impl LastError {
    /// Create a new recorded error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&crate::error::StageError> for LastError {
    fn from(e: &crate::error::StageError) -> Self {
        Self::new(e.kind(), e.message())
    }
}

/// Opaque tag key/value pairs handed to the metadata embedder
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataDescriptor {
    /// Tags keyed by dotted name
    pub tags: BTreeMap<String, String>,
}

impl MetadataDescriptor {
    /// Whether there is anything to embed
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// A unit as reported by the archive source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedUnit {
    /// Stable id
    pub id: UnitId,
    /// Where the source finds the archive
    pub locator: String,
    /// Expected archive size in bytes (0 = unknown)
    pub size_bytes: u64,
    /// Expected SHA-256 of the archive, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// One archive moving through the pipeline
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Stable id
    pub id: UnitId,
    /// Where the source finds the archive
    pub locator: String,
    /// Archive size in bytes (listed, then measured after Fetch)
    pub size_bytes: u64,
    /// Expected SHA-256 of the archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Working directory while the unit is resident
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    /// Current state
    pub state: UnitState,
    /// Failed attempts at unit-level stages
    pub attempts: u32,
    /// Last recorded failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    /// When the lister first reported this unit
    pub discovered_at: DateTime<Utc>,
    /// Last state write
    pub updated_at: DateTime<Utc>,
}

impl Unit {
    /// A freshly discovered unit
    pub fn discovered(listed: ListedUnit) -> Self {
        let now = Utc::now();
        Self {
            id: listed.id,
            locator: listed.locator,
            size_bytes: listed.size_bytes,
            checksum: listed.checksum,
            local_path: None,
            state: UnitState::Pending,
            attempts: 0,
            last_error: None,
            discovered_at: now,
            updated_at: now,
        }
    }
}

/// Identifies one file inside a unit
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileRef {
    /// Owning unit
    pub unit_id: UnitId,
    /// Path relative to the unit's extraction root, `/`-separated
    pub path: String,
}

impl FileRef {
    /// Create a new file reference
    pub fn new(unit_id: impl Into<UnitId>, path: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.unit_id, self.path)
    }
}

/// Tracked state for one file inside a unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Owning unit
    pub unit_id: UnitId,
    /// Path relative to the unit's extraction root, `/`-separated
    pub path: String,
    /// Size on disk after extraction
    pub size_bytes: u64,
    /// Current state
    pub state: FileState,
    /// Tags to embed, if a sidecar was found
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<MetadataDescriptor>,
    /// Destination album
    pub album: String,
    /// Whether tags were actually written into the file
    pub metadata_applied: bool,
    /// Destination asset id once published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    /// Last recorded failure or skip reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    /// Failed attempts across Enrich and Publish
    pub attempts: u32,
    /// Last state write
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// A freshly extracted file
    pub fn extracted(unit_id: UnitId, path: String, size_bytes: u64, album: String) -> Self {
        Self {
            unit_id,
            path,
            size_bytes,
            state: FileState::Pending,
            descriptor: None,
            album,
            metadata_applied: false,
            asset_id: None,
            last_error: None,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    /// Reference to this record
    pub fn file_ref(&self) -> FileRef {
        FileRef::new(self.unit_id.clone(), self.path.clone())
    }
}

/// Marker of the stage last in progress
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Stage that was started
    pub stage: Stage,
    /// Unit being worked on
    pub unit_id: UnitId,
    /// File being worked on, for per-file stages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// When the checkpoint was written
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Checkpoint for a stage starting now
    pub fn new(stage: Stage, unit_id: UnitId, file_path: Option<String>) -> Self {
        Self {
            stage,
            unit_id,
            file_path,
            written_at: Utc::now(),
        }
    }
}

/// Budget reserved by one resident unit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Resident unit
    pub unit_id: UnitId,
    /// Bytes reserved for it
    pub bytes: u64,
}

/// Process-wide disk budget record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskBudget {
    /// Configured ceiling (None = unlimited)
    pub ceiling_bytes: Option<u64>,
    /// Safety margin subtracted from the ceiling
    pub margin_bytes: u64,
    /// Bytes currently reserved by resident units
    pub resident_bytes: u64,
    /// Per-unit reservations
    pub reservations: Vec<Reservation>,
}

/// Scope of a retry request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "target", rename_all = "snake_case")]
pub enum RetryScope {
    /// Every recorded failure
    All,
    /// Failures at one stage
    Stage(Stage),
    /// One unit: its own failure and the failures of its files
    Unit(UnitId),
    /// One file
    File(FileRef),
}

/// Per-stage success and failure counts for one run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    /// Successful stage invocations
    pub succeeded: u64,
    /// Failed stage invocations
    pub failed: u64,
}

/// Outcome of one scheduling pass
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Counts per stage
    pub stages: BTreeMap<Stage, StageCounts>,
    /// Units newly reported by the source
    pub units_discovered: u64,
    /// Units that reached Reclaimed during the pass
    pub units_reclaimed: u64,
    /// Units left resident with files that are not yet terminal
    pub units_stalled: u64,
    /// Units whose Fetch the disk budget refused
    pub units_deferred: u64,
    /// Failures recorded in the ledger after the pass
    pub outstanding_failures: u64,
    /// Whether the pass was cut short by a stop request
    pub cancelled: bool,
}

impl RunSummary {
    /// Record one stage outcome
    pub fn record(&mut self, stage: Stage, succeeded: bool) {
        let counts = self.stages.entry(stage).or_default();
        if succeeded {
            counts.succeeded += 1;
        } else {
            counts.failed += 1;
        }
    }

    /// Fold another summary into this one
    pub fn merge(&mut self, other: &RunSummary) {
        for (stage, counts) in &other.stages {
            let entry = self.stages.entry(*stage).or_default();
            entry.succeeded += counts.succeeded;
            entry.failed += counts.failed;
        }
        self.units_discovered += other.units_discovered;
        self.units_reclaimed += other.units_reclaimed;
        self.units_stalled += other.units_stalled;
        self.units_deferred += other.units_deferred;
        self.cancelled |= other.cancelled;
    }

    /// Counts for one stage
    pub fn counts(&self, stage: Stage) -> StageCounts {
        self.stages.get(&stage).copied().unwrap_or_default()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "stage      ok    failed")?;
        for stage in Stage::ALL {
            let counts = self.counts(stage);
            writeln!(
                f,
                "{:<9} {:>4} {:>9}",
                stage.as_str(),
                counts.succeeded,
                counts.failed
            )?;
        }
        writeln!(
            f,
            "units: {} discovered, {} reclaimed, {} stalled, {} deferred",
            self.units_discovered, self.units_reclaimed, self.units_stalled, self.units_deferred
        )?;
        if self.cancelled {
            writeln!(f, "run stopped before completion")?;
        }
        if self.outstanding_failures > 0 {
            write!(
                f,
                "{} failure(s) recorded; list them with the retry ledger and retry by stage, unit or file",
                self.outstanding_failures
            )?;
        } else {
            write!(f, "no outstanding failures")?;
        }
        Ok(())
    }
}

/// Disk budget as reported by `status()`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskBudgetStatus {
    /// Configured ceiling (None = unlimited)
    pub ceiling_bytes: Option<u64>,
    /// Safety margin
    pub margin_bytes: u64,
    /// Bytes reserved through the governor
    pub reserved_bytes: u64,
    /// Bytes actually on disk under the working directory
    pub measured_bytes: u64,
    /// Units currently holding a reservation
    pub residents: Vec<UnitId>,
}

/// Snapshot returned by `status()`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    /// Whether a run is in progress
    pub running: bool,
    /// Units by state
    pub units: BTreeMap<UnitState, u64>,
    /// Files by state
    pub files: BTreeMap<FileState, u64>,
    /// Disk budget
    pub disk_budget: DiskBudgetStatus,
    /// Stage last in progress, if it did not finish
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
    /// Failures recorded in the ledger
    pub failures: u64,
}

/// Event emitted as units and files move through the pipeline
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The source reported a unit not seen before
    UnitDiscovered {
        /// Unit id
        unit_id: UnitId,
        /// Listed size in bytes
        size_bytes: u64,
    },

    /// The governor authorized a fetch
    FetchAuthorized {
        /// Unit id
        unit_id: UnitId,
        /// Bytes reserved
        reserved_bytes: u64,
    },

    /// The governor refused a fetch for now
    FetchDeferred {
        /// Unit id
        unit_id: UnitId,
        /// Bytes that would have been reserved
        requested_bytes: u64,
        /// Bytes held by residents at the time
        resident_bytes: u64,
    },

    /// A stage invocation started
    StageStarted {
        /// Stage
        stage: Stage,
        /// Unit id
        unit_id: UnitId,
        /// File, for per-file stages
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    /// A unit changed state
    UnitTransition {
        /// Unit id
        unit_id: UnitId,
        /// Previous state
        from: UnitState,
        /// New state
        to: UnitState,
    },

    /// A file changed state
    FileTransition {
        /// Owning unit
        unit_id: UnitId,
        /// File path inside the unit
        path: String,
        /// Previous state
        from: FileState,
        /// New state
        to: FileState,
    },

    /// A stage failure was recorded
    StageFailed {
        /// Stage
        stage: Stage,
        /// Unit id
        unit_id: UnitId,
        /// File, for per-file stages
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        /// Failure classification
        kind: ErrorKind,
        /// Error message
        error: String,
    },

    /// A budget rule was bent to keep the pipeline moving
    BudgetPolicyWarning {
        /// Unit id
        unit_id: UnitId,
        /// Explanation
        message: String,
    },

    /// A unit's local artifacts were removed
    UnitReclaimed {
        /// Unit id
        unit_id: UnitId,
        /// Bytes released back to the budget
        released_bytes: u64,
    },

    /// A scheduling pass finished
    RunFinished {
        /// Pass summary
        summary: RunSummary,
    },

    /// The orchestrator is shutting down
    Shutdown,
}
