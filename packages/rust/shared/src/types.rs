//! Core domain types for kbflow datasets, processing units, and run records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::KbflowError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// A UUID v7 wrapper for dataset identifiers.
    DatasetId
);

uuid_id!(
    /// A UUID v7 wrapper for pipeline run identifiers.
    RunId
);

uuid_id!(
    /// Identifier of a source item stored in a dataset.
    ItemId
);

// ---------------------------------------------------------------------------
// DatasetRef
// ---------------------------------------------------------------------------

/// A caller-supplied reference to a dataset: either its id or its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DatasetRef {
    Id(DatasetId),
    Name(String),
}

impl DatasetRef {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => write!(f, "'{name}'"),
        }
    }
}

/// A string that parses as a UUID is an id reference; anything else is a name.
impl FromStr for DatasetRef {
    type Err = KbflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(KbflowError::validation("dataset reference must not be empty"));
        }
        match Uuid::parse_str(trimmed) {
            Ok(uuid) => Ok(Self::Id(DatasetId(uuid))),
            Err(_) => Ok(Self::Name(trimmed.to_string())),
        }
    }
}

impl From<DatasetId> for DatasetRef {
    fn from(id: DatasetId) -> Self {
        Self::Id(id)
    }
}

// ---------------------------------------------------------------------------
// Principal & permissions
// ---------------------------------------------------------------------------

/// Opaque identity on whose behalf a run executes.
///
/// The engine never looks inside; it only hands the principal to the
/// permission and registry collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(credential: impl Into<String>) -> Self {
        Self(credential.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Actions a principal may be granted on a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Delete,
    Share,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Read, Action::Write, Action::Delete, Action::Share];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Share => "share",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict returned by a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    Allowed,
    Denied(String),
}

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

/// A named collection of source items owned by a principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    /// Principal that created the dataset.
    pub owner: String,
    pub created_at: DateTime<Utc>,
    /// Most recent run against this dataset, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<RunId>,
}

// ---------------------------------------------------------------------------
// ProcessingUnit
// ---------------------------------------------------------------------------

/// Lowercase hex SHA-256 of a payload's canonical JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a payload. `serde_json` maps are key-ordered, so equal
    /// values always serialize to the same bytes.
    pub fn of(payload: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(payload.to_string().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap an already computed digest (e.g. one read back from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a unit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub dataset_id: DatasetId,
    pub source_item_id: ItemId,
}

/// One item of work flowing through a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingUnit {
    pub payload: serde_json::Value,
    pub fingerprint: Fingerprint,
    pub provenance: Provenance,
}

impl ProcessingUnit {
    pub fn new(dataset_id: DatasetId, source_item_id: ItemId, payload: serde_json::Value) -> Self {
        Self {
            fingerprint: Fingerprint::of(&payload),
            payload,
            provenance: Provenance {
                dataset_id,
                source_item_id,
            },
        }
    }

    /// A new unit with the same provenance carrying `payload`.
    pub fn derive(&self, payload: serde_json::Value) -> Self {
        Self {
            fingerprint: Fingerprint::of(&payload),
            payload,
            provenance: self.provenance,
        }
    }

    /// The payload as text: a JSON string, or the `text` field of an object.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Object(map) => map.get("text").and_then(|v| v.as_str()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Params
// ---------------------------------------------------------------------------

/// Immutable key/value parameters handed to every step invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, serde_json::Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `self` overlaid with `overrides`; keys in `overrides` win.
    pub fn merged(&self, overrides: &Params) -> Params {
        let mut merged = self.0.clone();
        merged.extend(overrides.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Params(merged)
    }
}

impl<K: Into<String>, V: Into<serde_json::Value>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ---------------------------------------------------------------------------
// Run ledger
// ---------------------------------------------------------------------------

/// Status of a pipeline run against one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Processing,
    Completed,
    Errored,
    PartiallyCompleted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::PartiallyCompleted => "partially_completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Errored | Self::PartiallyCompleted
        )
    }

    /// Transitions only move forward along Started → Processing → terminal.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Started, Self::Processing) => true,
            (Self::Started | Self::Processing, n) => n.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = KbflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            "partially_completed" => Ok(Self::PartiallyCompleted),
            other => Err(KbflowError::validation(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

/// Structured error captured in a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    /// Stable error tag, see [`KbflowError::kind`].
    pub kind: String,
    /// Task that failed, when the failure came from a step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub message: String,
}

impl From<&KbflowError> for RunError {
    fn from(err: &KbflowError) -> Self {
        let task = match err {
            KbflowError::TaskExecution { task, .. } => Some(task.clone()),
            _ => None,
        };
        Self {
            kind: err.kind().to_string(),
            task,
            message: err.to_string(),
        }
    }
}

/// Counter increments applied to a ledger entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    pub processed: u64,
    pub skipped: u64,
}

impl ProgressDelta {
    pub fn is_empty(&self) -> bool {
        self.processed == 0 && self.skipped == 0
    }
}

/// Durable record of one pipeline run against one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLedgerEntry {
    pub run_id: RunId,
    pub dataset_id: DatasetId,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub processed_count: u64,
    pub skipped_count: u64,
}

/// Per-dataset outcome reported to callers of the run coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub dataset_id: DatasetId,
    pub run_id: RunId,
    pub status: RunStatus,
    pub processed_count: u64,
    pub skipped_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl From<RunLedgerEntry> for RunResult {
    fn from(entry: RunLedgerEntry) -> Self {
        Self {
            dataset_id: entry.dataset_id,
            run_id: entry.run_id,
            status: entry.status,
            processed_count: entry.processed_count,
            skipped_count: entry.skipped_count,
            error: entry.error,
        }
    }
}
