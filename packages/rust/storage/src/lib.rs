//! libSQL storage layer for datasets, permissions, and the run ledger.
//!
//! The [`Storage`] struct wraps a local libSQL database and implements every
//! collaborator contract the engine consumes: [`DatasetRegistry`],
//! [`PermissionChecker`], [`RunLedgerStore`], and [`FingerprintStore`].
//!
//! **Access rules:**
//! - Orchestrating process: read-write via [`Storage::open`]
//! - Status pollers in other processes: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kbflow_shared::{
    Action, Dataset, DatasetId, DatasetRef, DatasetRegistry, Fingerprint, FingerprintStore,
    ItemId, KbflowError, Permission, PermissionChecker, Principal, ProcessingUnit, ProgressDelta,
    Provenance, Result, RunError, RunId, RunLedgerEntry, RunLedgerStore, RunStatus,
};
use libsql::{Connection, Database, params};
use tracing::{debug, warn};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn db_err(e: libsql::Error) -> KbflowError {
    KbflowError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KbflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for status polling).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        KbflowError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(KbflowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Permission grants
    // -----------------------------------------------------------------------

    /// Grant `action` on a dataset to `principal` (idempotent).
    pub async fn grant(
        &self,
        dataset_id: DatasetId,
        principal: &Principal,
        action: Action,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO dataset_permissions (dataset_id, principal, action)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(dataset_id, principal, action) DO NOTHING",
                params![dataset_id.to_string(), principal.as_str(), action.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Revoke `action` on a dataset from `principal`.
    pub async fn revoke(
        &self,
        dataset_id: DatasetId,
        principal: &Principal,
        action: Action,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM dataset_permissions
                 WHERE dataset_id = ?1 AND principal = ?2 AND action = ?3",
                params![dataset_id.to_string(), principal.as_str(), action.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn query_items(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<ProcessingUnit>> {
        let mut rows = self.conn.query(sql, params).await.map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_unit(&row)?);
        }
        Ok(results)
    }

    async fn query_entry(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Option<RunLedgerEntry>> {
        let mut rows = self.conn.query(sql, params).await.map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[async_trait]
impl PermissionChecker for Storage {
    async fn check(
        &self,
        principal: &Principal,
        dataset_id: DatasetId,
        action: Action,
    ) -> Result<Permission> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM dataset_permissions
                 WHERE dataset_id = ?1 AND principal = ?2 AND action = ?3",
                params![dataset_id.to_string(), principal.as_str(), action.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(_) => Ok(Permission::Allowed),
            None => Ok(Permission::Denied(format!(
                "no {action} grant for this principal"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Datasets
// ---------------------------------------------------------------------------

#[async_trait]
impl DatasetRegistry for Storage {
    async fn resolve(&self, reference: &DatasetRef) -> Result<Option<DatasetId>> {
        let mut rows = match reference {
            DatasetRef::Id(id) => self
                .conn
                .query("SELECT id FROM datasets WHERE id = ?1", params![id.to_string()])
                .await
                .map_err(db_err)?,
            DatasetRef::Name(name) => self
                .conn
                .query("SELECT id FROM datasets WHERE name = ?1", params![name.as_str()])
                .await
                .map_err(db_err)?,
        };

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(parse_id(&row.get::<String>(0).map_err(db_err)?)?)),
            None => Ok(None),
        }
    }

    async fn create_if_absent(&self, name: &str, owner: &Principal) -> Result<DatasetId> {
        self.check_writable()?;
        if let Some(existing) = self.resolve(&DatasetRef::name(name)).await? {
            return Ok(existing);
        }

        let id = DatasetId::new();
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn
            .execute(
                "INSERT INTO datasets (id, name, owner, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO NOTHING",
                params![id.to_string(), name, owner.as_str(), now.as_str(), now.as_str()],
            )
            .await
            .map_err(db_err)?;

        if inserted == 0 {
            // Lost a race with another writer; use theirs.
            return self
                .resolve(&DatasetRef::name(name))
                .await?
                .ok_or_else(|| KbflowError::Storage(format!("dataset '{name}' vanished")));
        }

        for action in Action::ALL {
            self.grant(id, owner, action).await?;
        }
        debug!(%id, name, owner = %owner, "created dataset");
        Ok(id)
    }

    async fn get_dataset(&self, dataset_id: DatasetId) -> Result<Option<Dataset>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, owner, created_at, last_run_id FROM datasets WHERE id = ?1",
                params![dataset_id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(Dataset {
                id: parse_id(&row.get::<String>(0).map_err(db_err)?)?,
                name: row.get::<String>(1).map_err(db_err)?,
                owner: row.get::<String>(2).map_err(db_err)?,
                created_at: parse_time(&row.get::<String>(3).map_err(db_err)?)?,
                last_run_id: match row.get::<String>(4).ok() {
                    Some(s) => Some(parse_id(&s)?),
                    None => None,
                },
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn list_owned(&self, principal: &Principal) -> Result<Vec<DatasetId>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM datasets WHERE owner = ?1 ORDER BY created_at, rowid",
                params![principal.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(parse_id(&row.get::<String>(0).map_err(db_err)?)?);
        }
        Ok(results)
    }

    async fn add_item(
        &self,
        dataset_id: DatasetId,
        payload: serde_json::Value,
    ) -> Result<ProcessingUnit> {
        self.check_writable()?;
        let unit = ProcessingUnit::new(dataset_id, ItemId::new(), payload);
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO data_items (id, dataset_id, payload_json, fingerprint, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(dataset_id, fingerprint) DO NOTHING",
                params![
                    unit.provenance.source_item_id.to_string(),
                    dataset_id.to_string(),
                    unit.payload.to_string(),
                    unit.fingerprint.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;

        // Return the stored row so duplicates report the original item id.
        self.query_items(
            "SELECT id, dataset_id, payload_json, fingerprint FROM data_items
             WHERE dataset_id = ?1 AND fingerprint = ?2",
            params![dataset_id.to_string(), unit.fingerprint.as_str()],
        )
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| KbflowError::Storage("inserted item not found".into()))
    }

    async fn list_items(&self, dataset_id: DatasetId) -> Result<Vec<ProcessingUnit>> {
        self.query_items(
            "SELECT id, dataset_id, payload_json, fingerprint FROM data_items
             WHERE dataset_id = ?1 ORDER BY rowid",
            params![dataset_id.to_string()],
        )
        .await
    }

    async fn list_unprocessed_items(
        &self,
        dataset_id: DatasetId,
        pipeline_name: &str,
    ) -> Result<Vec<ProcessingUnit>> {
        self.query_items(
            "SELECT d.id, d.dataset_id, d.payload_json, d.fingerprint FROM data_items d
             WHERE d.dataset_id = ?1 AND NOT EXISTS (
                 SELECT 1 FROM item_pipeline_status s
                 WHERE s.dataset_id = d.dataset_id AND s.item_id = d.id AND s.pipeline_name = ?2
             )
             ORDER BY d.rowid",
            params![dataset_id.to_string(), pipeline_name],
        )
        .await
    }

    async fn mark_items_completed(
        &self,
        dataset_id: DatasetId,
        pipeline_name: &str,
        item_ids: &[ItemId],
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        for item_id in item_ids {
            self.conn
                .execute(
                    "INSERT INTO item_pipeline_status (dataset_id, item_id, pipeline_name, completed_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(dataset_id, item_id, pipeline_name) DO UPDATE SET
                       completed_at = excluded.completed_at",
                    params![
                        dataset_id.to_string(),
                        item_id.to_string(),
                        pipeline_name,
                        now.as_str(),
                    ],
                )
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn set_last_run(&self, dataset_id: DatasetId, run_id: RunId) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE datasets SET last_run_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![run_id.to_string(), now.as_str(), dataset_id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run ledger
// ---------------------------------------------------------------------------

const ENTRY_COLUMNS: &str = "run_id, dataset_id, pipeline_name, status, started_at, updated_at, \
     completed_at, error_json, processed_count, skipped_count";

#[async_trait]
impl RunLedgerStore for Storage {
    async fn open_entry(&self, dataset_id: DatasetId, pipeline_name: &str) -> Result<RunId> {
        self.check_writable()?;
        let run_id = RunId::new();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO pipeline_runs (run_id, dataset_id, pipeline_name, status, started_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id.to_string(),
                    dataset_id.to_string(),
                    pipeline_name,
                    RunStatus::Started.as_str(),
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(run_id)
    }

    async fn begin_processing(&self, run_id: RunId) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE pipeline_runs SET status = ?1, updated_at = ?2
                 WHERE run_id = ?3 AND status = ?4",
                params![
                    RunStatus::Processing.as_str(),
                    now.as_str(),
                    run_id.to_string(),
                    RunStatus::Started.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            warn!(%run_id, "begin_processing ignored: run is not in started state");
        }
        Ok(())
    }

    async fn append_progress(&self, run_id: RunId, delta: ProgressDelta) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE pipeline_runs SET
                   processed_count = processed_count + ?1,
                   skipped_count = skipped_count + ?2,
                   updated_at = ?3
                 WHERE run_id = ?4 AND status IN ('started', 'processing')",
                params![
                    delta.processed as i64,
                    delta.skipped as i64,
                    now.as_str(),
                    run_id.to_string(),
                ],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            warn!(%run_id, "progress ignored: run is terminal or unknown");
        }
        Ok(())
    }

    async fn close(
        &self,
        run_id: RunId,
        status: RunStatus,
        error: Option<RunError>,
    ) -> Result<()> {
        self.check_writable()?;
        if !status.is_terminal() {
            return Err(KbflowError::validation(format!(
                "cannot close run {run_id} with non-terminal status {status}"
            )));
        }
        let error_json = match &error {
            Some(e) => Some(
                serde_json::to_string(e)
                    .map_err(|e| KbflowError::Storage(format!("encode run error: {e}")))?,
            ),
            None => None,
        };
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE pipeline_runs SET status = ?1, updated_at = ?2, completed_at = ?2, error_json = ?3
                 WHERE run_id = ?4 AND status IN ('started', 'processing')",
                params![status.as_str(), now.as_str(), error_json, run_id.to_string()],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            warn!(%run_id, %status, "close ignored: run is terminal or unknown");
        }
        Ok(())
    }

    async fn get_entry(&self, run_id: RunId) -> Result<Option<RunLedgerEntry>> {
        self.query_entry(
            &format!("SELECT {ENTRY_COLUMNS} FROM pipeline_runs WHERE run_id = ?1"),
            params![run_id.to_string()],
        )
        .await
    }

    async fn latest_for_dataset(&self, dataset_id: DatasetId) -> Result<Option<RunLedgerEntry>> {
        self.query_entry(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM pipeline_runs WHERE dataset_id = ?1
                 ORDER BY rowid DESC LIMIT 1"
            ),
            params![dataset_id.to_string()],
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Task fingerprints
// ---------------------------------------------------------------------------

#[async_trait]
impl FingerprintStore for Storage {
    async fn is_completed(
        &self,
        dataset_id: DatasetId,
        task_name: &str,
        fingerprint: &Fingerprint,
    ) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM task_fingerprints
                 WHERE dataset_id = ?1 AND task_name = ?2 AND fingerprint = ?3",
                params![dataset_id.to_string(), task_name, fingerprint.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.next().await.map_err(db_err)?.is_some())
    }

    async fn record_completed(
        &self,
        dataset_id: DatasetId,
        task_name: &str,
        fingerprints: &[Fingerprint],
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        for fingerprint in fingerprints {
            self.conn
                .execute(
                    "INSERT INTO task_fingerprints (dataset_id, task_name, fingerprint, recorded_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(dataset_id, task_name, fingerprint) DO NOTHING",
                    params![
                        dataset_id.to_string(),
                        task_name,
                        fingerprint.as_str(),
                        now.as_str(),
                    ],
                )
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_id<T: std::str::FromStr<Err = uuid::Error>>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|e| KbflowError::Storage(format!("invalid id '{s}': {e}")))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| KbflowError::Storage(format!("invalid date: {e}")))
}

/// Convert a `data_items` row to a [`ProcessingUnit`].
fn row_to_unit(row: &libsql::Row) -> Result<ProcessingUnit> {
    let payload_json = row.get::<String>(2).map_err(db_err)?;
    Ok(ProcessingUnit {
        payload: serde_json::from_str(&payload_json)
            .map_err(|e| KbflowError::Storage(format!("invalid payload json: {e}")))?,
        fingerprint: Fingerprint::from_hex(row.get::<String>(3).map_err(db_err)?),
        provenance: Provenance {
            source_item_id: parse_id(&row.get::<String>(0).map_err(db_err)?)?,
            dataset_id: parse_id(&row.get::<String>(1).map_err(db_err)?)?,
        },
    })
}

/// Convert a `pipeline_runs` row to a [`RunLedgerEntry`].
fn row_to_entry(row: &libsql::Row) -> Result<RunLedgerEntry> {
    Ok(RunLedgerEntry {
        run_id: parse_id(&row.get::<String>(0).map_err(db_err)?)?,
        dataset_id: parse_id(&row.get::<String>(1).map_err(db_err)?)?,
        pipeline_name: row.get::<String>(2).map_err(db_err)?,
        status: row.get::<String>(3).map_err(db_err)?.parse()?,
        started_at: parse_time(&row.get::<String>(4).map_err(db_err)?)?,
        updated_at: parse_time(&row.get::<String>(5).map_err(db_err)?)?,
        completed_at: match row.get::<String>(6).ok() {
            Some(s) => Some(parse_time(&s)?),
            None => None,
        },
        error: match row.get::<String>(7).ok() {
            Some(s) => Some(
                serde_json::from_str(&s)
                    .map_err(|e| KbflowError::Storage(format!("invalid error json: {e}")))?,
            ),
            None => None,
        },
        processed_count: row.get::<i64>(8).map_err(db_err)? as u64,
        skipped_count: row.get::<i64>(9).map_err(db_err)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("kbflow_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("kbflow_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn dataset_create_resolve_and_grants() {
        let storage = test_storage().await;
        let alice = Principal::new("alice");
        let bob = Principal::new("bob");

        let id = storage.create_if_absent("docs", &alice).await.expect("create");
        let again = storage.create_if_absent("docs", &bob).await.expect("reuse");
        assert_eq!(id, again);

        assert_eq!(storage.resolve(&DatasetRef::name("docs")).await.unwrap(), Some(id));
        assert_eq!(storage.resolve(&DatasetRef::Id(id)).await.unwrap(), Some(id));
        assert_eq!(
            storage.resolve(&DatasetRef::Id(DatasetId::new())).await.unwrap(),
            None
        );

        let dataset = storage.get_dataset(id).await.unwrap().expect("dataset");
        assert_eq!(dataset.name, "docs");
        assert_eq!(dataset.owner, "alice");
        assert!(dataset.last_run_id.is_none());

        assert_eq!(
            storage.check(&alice, id, Action::Write).await.unwrap(),
            Permission::Allowed
        );
        assert!(matches!(
            storage.check(&bob, id, Action::Write).await.unwrap(),
            Permission::Denied(_)
        ));

        storage.grant(id, &bob, Action::Write).await.unwrap();
        assert_eq!(
            storage.check(&bob, id, Action::Write).await.unwrap(),
            Permission::Allowed
        );
        storage.revoke(id, &bob, Action::Write).await.unwrap();
        assert!(matches!(
            storage.check(&bob, id, Action::Write).await.unwrap(),
            Permission::Denied(_)
        ));

        assert_eq!(storage.list_owned(&alice).await.unwrap(), vec![id]);
        assert!(storage.list_owned(&bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn items_keep_order_and_dedupe() {
        let storage = test_storage().await;
        let id = storage
            .create_if_absent("docs", &Principal::new("alice"))
            .await
            .unwrap();

        let a = storage.add_item(id, json!("a")).await.unwrap();
        let b = storage.add_item(id, json!("b")).await.unwrap();
        let dup = storage.add_item(id, json!("a")).await.unwrap();
        storage.add_item(id, json!({"text": "c"})).await.unwrap();

        assert_eq!(dup.provenance.source_item_id, a.provenance.source_item_id);
        let items = storage.list_items(id).await.unwrap();
        let payloads: Vec<_> = items.iter().map(|u| u.payload.clone()).collect();
        assert_eq!(payloads, vec![json!("a"), json!("b"), json!({"text": "c"})]);
        assert_eq!(items[1], b);

        storage
            .mark_items_completed(id, "cognify", &[a.provenance.source_item_id])
            .await
            .unwrap();
        let pending = storage.list_unprocessed_items(id, "cognify").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].payload, json!("b"));
        // Other pipelines are unaffected.
        assert_eq!(storage.list_unprocessed_items(id, "other").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn ledger_lifecycle() {
        let storage = test_storage().await;
        let dataset_id = DatasetId::new();
        let run_id = storage.open_entry(dataset_id, "cognify").await.expect("open run");

        let entry = storage.get_entry(run_id).await.unwrap().expect("entry");
        assert_eq!(entry.status, RunStatus::Started);
        assert_eq!(entry.pipeline_name, "cognify");

        storage.begin_processing(run_id).await.unwrap();
        storage
            .append_progress(run_id, ProgressDelta { processed: 3, skipped: 1 })
            .await
            .unwrap();
        storage
            .append_progress(run_id, ProgressDelta { processed: 2, skipped: 0 })
            .await
            .unwrap();
        storage.close(run_id, RunStatus::Completed, None).await.unwrap();

        let entry = storage.get_entry(run_id).await.unwrap().unwrap();
        assert_eq!(entry.status, RunStatus::Completed);
        assert_eq!(entry.processed_count, 5);
        assert_eq!(entry.skipped_count, 1);
        assert!(entry.completed_at.is_some());

        let latest = storage.latest_for_dataset(dataset_id).await.unwrap().unwrap();
        assert_eq!(latest.run_id, run_id);
    }

    #[tokio::test]
    async fn terminal_entries_never_change() {
        let storage = test_storage().await;
        let run_id = storage.open_entry(DatasetId::new(), "p").await.unwrap();
        let error = RunError {
            kind: "task_execution".into(),
            task: Some("extract".into()),
            message: "boom".into(),
        };
        storage
            .close(run_id, RunStatus::Errored, Some(error.clone()))
            .await
            .unwrap();

        storage.close(run_id, RunStatus::Completed, None).await.unwrap();
        storage
            .append_progress(run_id, ProgressDelta { processed: 9, skipped: 9 })
            .await
            .unwrap();
        storage.begin_processing(run_id).await.unwrap();

        let entry = storage.get_entry(run_id).await.unwrap().unwrap();
        assert_eq!(entry.status, RunStatus::Errored);
        assert_eq!(entry.error, Some(error));
        assert_eq!(entry.processed_count, 0);
    }

    #[tokio::test]
    async fn close_rejects_non_terminal_status() {
        let storage = test_storage().await;
        let run_id = storage.open_entry(DatasetId::new(), "p").await.unwrap();
        assert!(storage.close(run_id, RunStatus::Processing, None).await.is_err());
    }

    #[tokio::test]
    async fn fingerprints_scoped_by_task() {
        let storage = test_storage().await;
        let dataset_id = DatasetId::new();
        let fp = Fingerprint::of(&json!("a"));

        assert!(!storage.is_completed(dataset_id, "chunk", &fp).await.unwrap());
        storage
            .record_completed(dataset_id, "chunk", &[fp.clone(), fp.clone()])
            .await
            .unwrap();
        assert!(storage.is_completed(dataset_id, "chunk", &fp).await.unwrap());
        assert!(!storage.is_completed(dataset_id, "extract", &fp).await.unwrap());
        assert!(!storage.is_completed(DatasetId::new(), "chunk", &fp).await.unwrap());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("kbflow_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        let dataset_id = rw.create_if_absent("docs", &Principal::new("a")).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.open_entry(dataset_id, "p").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
        assert!(ro.get_dataset(dataset_id).await.unwrap().is_some());
    }
}
