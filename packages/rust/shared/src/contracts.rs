//! Collaborator contracts consumed by the execution engine.
//!
//! The engine reaches permissions, datasets, the run ledger, and the
//! incremental-skip index only through these traits. Implementations must be
//! `Send + Sync` for use behind `Arc<dyn ...>`.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    Action, Dataset, DatasetId, DatasetRef, Fingerprint, ItemId, Permission, Principal,
    ProcessingUnit, ProgressDelta, RunError, RunId, RunLedgerEntry, RunStatus,
};

/// Decides whether a principal may act on a dataset.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check(
        &self,
        principal: &Principal,
        dataset_id: DatasetId,
        action: Action,
    ) -> Result<Permission>;
}

/// Dataset lookup, creation, and item listing.
#[async_trait]
pub trait DatasetRegistry: Send + Sync {
    /// Resolve a reference to an existing dataset id. `Ok(None)` when no
    /// dataset matches.
    async fn resolve(&self, reference: &DatasetRef) -> Result<Option<DatasetId>>;

    /// Return the id of the dataset named `name`, creating it (owned by
    /// `owner`, with every action granted) if it does not exist.
    async fn create_if_absent(&self, name: &str, owner: &Principal) -> Result<DatasetId>;

    async fn get_dataset(&self, dataset_id: DatasetId) -> Result<Option<Dataset>>;

    /// Datasets owned by `principal`, oldest first.
    async fn list_owned(&self, principal: &Principal) -> Result<Vec<DatasetId>>;

    /// Store a new source item. Items with a payload already present in the
    /// dataset are not duplicated; the existing unit is returned.
    async fn add_item(
        &self,
        dataset_id: DatasetId,
        payload: serde_json::Value,
    ) -> Result<ProcessingUnit>;

    /// Every item of the dataset, in insertion order.
    async fn list_items(&self, dataset_id: DatasetId) -> Result<Vec<ProcessingUnit>>;

    /// Items not yet marked completed for `pipeline_name`, in insertion order.
    async fn list_unprocessed_items(
        &self,
        dataset_id: DatasetId,
        pipeline_name: &str,
    ) -> Result<Vec<ProcessingUnit>>;

    async fn mark_items_completed(
        &self,
        dataset_id: DatasetId,
        pipeline_name: &str,
        item_ids: &[ItemId],
    ) -> Result<()>;

    async fn set_last_run(&self, dataset_id: DatasetId, run_id: RunId) -> Result<()>;
}

/// Durable record of pipeline runs.
///
/// Status changes are monotone; writes against a terminal entry are ignored.
#[async_trait]
pub trait RunLedgerStore: Send + Sync {
    /// Create an entry in `Started` and return its id.
    async fn open_entry(&self, dataset_id: DatasetId, pipeline_name: &str) -> Result<RunId>;

    /// Move a `Started` entry to `Processing`.
    async fn begin_processing(&self, run_id: RunId) -> Result<()>;

    async fn append_progress(&self, run_id: RunId, delta: ProgressDelta) -> Result<()>;

    /// Move a non-terminal entry to the terminal `status`.
    async fn close(&self, run_id: RunId, status: RunStatus, error: Option<RunError>)
    -> Result<()>;

    async fn get_entry(&self, run_id: RunId) -> Result<Option<RunLedgerEntry>>;

    /// Most recently opened entry for the dataset.
    async fn latest_for_dataset(&self, dataset_id: DatasetId) -> Result<Option<RunLedgerEntry>>;
}

/// Per (dataset, task) record of unit fingerprints already processed.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn is_completed(
        &self,
        dataset_id: DatasetId,
        task_name: &str,
        fingerprint: &Fingerprint,
    ) -> Result<bool>;

    async fn record_completed(
        &self,
        dataset_id: DatasetId,
        task_name: &str,
        fingerprints: &[Fingerprint],
    ) -> Result<()>;
}
