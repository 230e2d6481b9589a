//! In-process implementation of every collaborator contract.
//!
//! Used by tests and by embedders that do not need durable state. Follows the
//! same rules as the libSQL store: names are unique, duplicate payloads are
//! not re-added, and terminal ledger entries never change.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use kbflow_shared::{
    Action, Dataset, DatasetId, DatasetRef, DatasetRegistry, Fingerprint, FingerprintStore,
    ItemId, KbflowError, Permission, PermissionChecker, Principal, ProcessingUnit, ProgressDelta,
    Result, RunError, RunId, RunLedgerEntry, RunLedgerStore, RunStatus,
};

#[derive(Default)]
struct MemoryState {
    datasets: Vec<Dataset>,
    grants: HashSet<(DatasetId, String, Action)>,
    items: HashMap<DatasetId, Vec<ProcessingUnit>>,
    completed_items: HashSet<(DatasetId, String, ItemId)>,
    runs: HashMap<RunId, RunLedgerEntry>,
    run_order: Vec<RunId>,
    fingerprints: HashSet<(DatasetId, String, Fingerprint)>,
}

impl MemoryState {
    fn dataset_mut(&mut self, id: DatasetId) -> Option<&mut Dataset> {
        self.datasets.iter_mut().find(|d| d.id == id)
    }
}

/// Datasets, grants, ledger and fingerprints held in memory.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| KbflowError::Storage("memory backend lock poisoned".into()))
    }

    /// Grant `action` on a dataset to `principal`.
    pub fn grant(&self, dataset_id: DatasetId, principal: &Principal, action: Action) -> Result<()> {
        self.lock()?
            .grants
            .insert((dataset_id, principal.as_str().to_string(), action));
        Ok(())
    }

    /// Remove a grant, including the owner's.
    pub fn revoke(&self, dataset_id: DatasetId, principal: &Principal, action: Action) -> Result<()> {
        self.lock()?
            .grants
            .remove(&(dataset_id, principal.as_str().to_string(), action));
        Ok(())
    }

    /// Number of ledger entries ever opened.
    pub fn run_count(&self) -> Result<usize> {
        Ok(self.lock()?.run_order.len())
    }
}

#[async_trait]
impl PermissionChecker for MemoryBackend {
    async fn check(
        &self,
        principal: &Principal,
        dataset_id: DatasetId,
        action: Action,
    ) -> Result<Permission> {
        let state = self.lock()?;
        if state
            .grants
            .contains(&(dataset_id, principal.as_str().to_string(), action))
        {
            Ok(Permission::Allowed)
        } else {
            Ok(Permission::Denied(format!(
                "no {action} grant for this principal"
            )))
        }
    }
}

#[async_trait]
impl DatasetRegistry for MemoryBackend {
    async fn resolve(&self, reference: &DatasetRef) -> Result<Option<DatasetId>> {
        let state = self.lock()?;
        let found = match reference {
            DatasetRef::Id(id) => state.datasets.iter().find(|d| d.id == *id),
            DatasetRef::Name(name) => state.datasets.iter().find(|d| d.name == *name),
        };
        Ok(found.map(|d| d.id))
    }

    async fn create_if_absent(&self, name: &str, owner: &Principal) -> Result<DatasetId> {
        let mut state = self.lock()?;
        if let Some(existing) = state.datasets.iter().find(|d| d.name == name) {
            return Ok(existing.id);
        }
        let id = DatasetId::new();
        state.datasets.push(Dataset {
            id,
            name: name.to_string(),
            owner: owner.as_str().to_string(),
            created_at: Utc::now(),
            last_run_id: None,
        });
        for action in Action::ALL {
            state
                .grants
                .insert((id, owner.as_str().to_string(), action));
        }
        Ok(id)
    }

    async fn get_dataset(&self, dataset_id: DatasetId) -> Result<Option<Dataset>> {
        let state = self.lock()?;
        Ok(state.datasets.iter().find(|d| d.id == dataset_id).cloned())
    }

    async fn list_owned(&self, principal: &Principal) -> Result<Vec<DatasetId>> {
        let state = self.lock()?;
        Ok(state
            .datasets
            .iter()
            .filter(|d| d.owner == principal.as_str())
            .map(|d| d.id)
            .collect())
    }

    async fn add_item(
        &self,
        dataset_id: DatasetId,
        payload: serde_json::Value,
    ) -> Result<ProcessingUnit> {
        let mut state = self.lock()?;
        let unit = ProcessingUnit::new(dataset_id, ItemId::new(), payload);
        let items = state.items.entry(dataset_id).or_default();
        if let Some(existing) = items.iter().find(|u| u.fingerprint == unit.fingerprint) {
            return Ok(existing.clone());
        }
        items.push(unit.clone());
        Ok(unit)
    }

    async fn list_items(&self, dataset_id: DatasetId) -> Result<Vec<ProcessingUnit>> {
        let state = self.lock()?;
        Ok(state.items.get(&dataset_id).cloned().unwrap_or_default())
    }

    async fn list_unprocessed_items(
        &self,
        dataset_id: DatasetId,
        pipeline_name: &str,
    ) -> Result<Vec<ProcessingUnit>> {
        let state = self.lock()?;
        let Some(items) = state.items.get(&dataset_id) else {
            return Ok(Vec::new());
        };
        Ok(items
            .iter()
            .filter(|u| {
                !state.completed_items.contains(&(
                    dataset_id,
                    pipeline_name.to_string(),
                    u.provenance.source_item_id,
                ))
            })
            .cloned()
            .collect())
    }

    async fn mark_items_completed(
        &self,
        dataset_id: DatasetId,
        pipeline_name: &str,
        item_ids: &[ItemId],
    ) -> Result<()> {
        let mut state = self.lock()?;
        for item_id in item_ids {
            state
                .completed_items
                .insert((dataset_id, pipeline_name.to_string(), *item_id));
        }
        Ok(())
    }

    async fn set_last_run(&self, dataset_id: DatasetId, run_id: RunId) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(dataset) = state.dataset_mut(dataset_id) {
            dataset.last_run_id = Some(run_id);
        }
        Ok(())
    }
}

#[async_trait]
impl RunLedgerStore for MemoryBackend {
    async fn open_entry(&self, dataset_id: DatasetId, pipeline_name: &str) -> Result<RunId> {
        let mut state = self.lock()?;
        let run_id = RunId::new();
        let now = Utc::now();
        state.runs.insert(
            run_id,
            RunLedgerEntry {
                run_id,
                dataset_id,
                pipeline_name: pipeline_name.to_string(),
                status: RunStatus::Started,
                started_at: now,
                updated_at: now,
                completed_at: None,
                error: None,
                processed_count: 0,
                skipped_count: 0,
            },
        );
        state.run_order.push(run_id);
        Ok(run_id)
    }

    async fn begin_processing(&self, run_id: RunId) -> Result<()> {
        let mut state = self.lock()?;
        match state.runs.get_mut(&run_id) {
            Some(entry) if entry.status.can_transition_to(RunStatus::Processing) => {
                entry.status = RunStatus::Processing;
                entry.updated_at = Utc::now();
            }
            _ => warn!(%run_id, "begin_processing ignored: run is not in started state"),
        }
        Ok(())
    }

    async fn append_progress(&self, run_id: RunId, delta: ProgressDelta) -> Result<()> {
        let mut state = self.lock()?;
        match state.runs.get_mut(&run_id) {
            Some(entry) if !entry.status.is_terminal() => {
                entry.processed_count += delta.processed;
                entry.skipped_count += delta.skipped;
                entry.updated_at = Utc::now();
            }
            _ => warn!(%run_id, "progress ignored: run is terminal or unknown"),
        }
        Ok(())
    }

    async fn close(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<RunError>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(KbflowError::validation(format!(
                "cannot close run {run_id} with non-terminal status {status}"
            )));
        }
        let mut state = self.lock()?;
        match state.runs.get_mut(&run_id) {
            Some(entry) if entry.status.can_transition_to(status) => {
                let now = Utc::now();
                entry.status = status;
                entry.error = error;
                entry.updated_at = now;
                entry.completed_at = Some(now);
            }
            _ => warn!(%run_id, %status, "close ignored: run is terminal or unknown"),
        }
        Ok(())
    }

    async fn get_entry(&self, run_id: RunId) -> Result<Option<RunLedgerEntry>> {
        Ok(self.lock()?.runs.get(&run_id).cloned())
    }

    async fn latest_for_dataset(&self, dataset_id: DatasetId) -> Result<Option<RunLedgerEntry>> {
        let state = self.lock()?;
        Ok(state
            .run_order
            .iter()
            .rev()
            .filter_map(|id| state.runs.get(id))
            .find(|entry| entry.dataset_id == dataset_id)
            .cloned())
    }
}

#[async_trait]
impl FingerprintStore for MemoryBackend {
    async fn is_completed(
        &self,
        dataset_id: DatasetId,
        task_name: &str,
        fingerprint: &Fingerprint,
    ) -> Result<bool> {
        Ok(self.lock()?.fingerprints.contains(&(
            dataset_id,
            task_name.to_string(),
            fingerprint.clone(),
        )))
    }

    async fn record_completed(
        &self,
        dataset_id: DatasetId,
        task_name: &str,
        fingerprints: &[Fingerprint],
    ) -> Result<()> {
        let mut state = self.lock()?;
        for fingerprint in fingerprints {
            state
                .fingerprints
                .insert((dataset_id, task_name.to_string(), fingerprint.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn owner_gets_every_action() {
        let backend = MemoryBackend::new();
        let alice = Principal::new("alice");
        let id = backend.create_if_absent("docs", &alice).await.unwrap();
        for action in Action::ALL {
            assert_eq!(
                backend.check(&alice, id, action).await.unwrap(),
                Permission::Allowed
            );
        }
        assert!(matches!(
            backend.check(&Principal::new("eve"), id, Action::Read).await.unwrap(),
            Permission::Denied(_)
        ));
        backend.revoke(id, &alice, Action::Write).unwrap();
        assert!(matches!(
            backend.check(&alice, id, Action::Write).await.unwrap(),
            Permission::Denied(_)
        ));
    }

    #[tokio::test]
    async fn unprocessed_items_exclude_completed() {
        let backend = MemoryBackend::new();
        let id = backend
            .create_if_absent("docs", &Principal::new("a"))
            .await
            .unwrap();
        let first = backend.add_item(id, json!("one")).await.unwrap();
        backend.add_item(id, json!("two")).await.unwrap();
        let dup = backend.add_item(id, json!("one")).await.unwrap();
        assert_eq!(dup, first);
        assert_eq!(backend.list_items(id).await.unwrap().len(), 2);

        backend
            .mark_items_completed(id, "p", &[first.provenance.source_item_id])
            .await
            .unwrap();
        let pending = backend.list_unprocessed_items(id, "p").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, json!("two"));
    }

    #[tokio::test]
    async fn latest_entry_per_dataset() {
        let backend = MemoryBackend::new();
        let a = DatasetId::new();
        let b = DatasetId::new();
        backend.open_entry(a, "p").await.unwrap();
        let b_run = backend.open_entry(b, "p").await.unwrap();
        let a_run = backend.open_entry(a, "p").await.unwrap();
        assert_eq!(
            backend.latest_for_dataset(a).await.unwrap().unwrap().run_id,
            a_run
        );
        assert_eq!(
            backend.latest_for_dataset(b).await.unwrap().unwrap().run_id,
            b_run
        );
        assert!(backend.latest_for_dataset(DatasetId::new()).await.unwrap().is_none());
        assert_eq!(backend.run_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn closed_entries_are_frozen() {
        let backend = MemoryBackend::new();
        let run_id = backend.open_entry(DatasetId::new(), "p").await.unwrap();
        backend
            .close(run_id, RunStatus::PartiallyCompleted, None)
            .await
            .unwrap();
        backend.begin_processing(run_id).await.unwrap();
        backend.close(run_id, RunStatus::Completed, None).await.unwrap();
        backend
            .append_progress(run_id, ProgressDelta { processed: 1, skipped: 0 })
            .await
            .unwrap();
        let entry = backend.get_entry(run_id).await.unwrap().unwrap();
        assert_eq!(entry.status, RunStatus::PartiallyCompleted);
        assert_eq!(entry.processed_count, 0);
    }

    #[tokio::test]
    async fn last_run_pointer_updates_the_dataset() {
        let backend = MemoryBackend::new();
        let alice = Principal::new("alice");
        let id = backend.create_if_absent("docs", &alice).await.unwrap();
        let before = backend.get_dataset(id).await.unwrap().unwrap();
        assert_eq!(backend.get_dataset(id).await.unwrap(), Some(before.clone()));

        let run_id = backend.open_entry(id, "p").await.unwrap();
        backend.set_last_run(id, run_id).await.unwrap();
        let after = backend.get_dataset(id).await.unwrap().unwrap();
        assert_ne!(after, before);
        assert_eq!(after, Dataset { last_run_id: Some(run_id), ..before });
    }

    #[tokio::test]
    async fn writes_to_unknown_runs_are_ignored() {
        let backend = MemoryBackend::new();
        let run_id = RunId::new();
        backend.begin_processing(run_id).await.unwrap();
        backend
            .append_progress(run_id, ProgressDelta { processed: 3, skipped: 0 })
            .await
            .unwrap();
        backend.close(run_id, RunStatus::Completed, None).await.unwrap();
        assert!(backend.get_entry(run_id).await.unwrap().is_none());
        assert_eq!(backend.run_count().unwrap(), 0);
    }
}
