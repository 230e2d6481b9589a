//! SQL migration definitions for the kbflow database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: datasets, permissions, data items, pipeline runs",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Datasets (names are globally unique)
CREATE TABLE IF NOT EXISTS datasets (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    owner       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    last_run_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_datasets_owner ON datasets(owner);

-- Per-principal grants
CREATE TABLE IF NOT EXISTS dataset_permissions (
    dataset_id TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    principal  TEXT NOT NULL,
    action     TEXT NOT NULL,
    PRIMARY KEY (dataset_id, principal, action)
);

-- Source items; rowid gives insertion order
CREATE TABLE IF NOT EXISTS data_items (
    id           TEXT PRIMARY KEY,
    dataset_id   TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    payload_json TEXT NOT NULL,
    fingerprint  TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    UNIQUE(dataset_id, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_data_items_dataset ON data_items(dataset_id);

-- Items completed per pipeline
CREATE TABLE IF NOT EXISTS item_pipeline_status (
    dataset_id    TEXT NOT NULL,
    item_id       TEXT NOT NULL REFERENCES data_items(id) ON DELETE CASCADE,
    pipeline_name TEXT NOT NULL,
    completed_at  TEXT NOT NULL,
    PRIMARY KEY (dataset_id, item_id, pipeline_name)
);

-- Run ledger
CREATE TABLE IF NOT EXISTS pipeline_runs (
    run_id          TEXT PRIMARY KEY,
    dataset_id      TEXT NOT NULL,
    pipeline_name   TEXT NOT NULL,
    status          TEXT NOT NULL,
    started_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    completed_at    TEXT,
    error_json      TEXT,
    processed_count INTEGER NOT NULL DEFAULT 0,
    skipped_count   INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_pipeline_runs_dataset ON pipeline_runs(dataset_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Task fingerprints for incremental skip",
            sql: r#"
CREATE TABLE IF NOT EXISTS task_fingerprints (
    dataset_id  TEXT NOT NULL,
    task_name   TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (dataset_id, task_name, fingerprint)
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
