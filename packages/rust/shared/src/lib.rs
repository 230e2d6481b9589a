//! Shared types, error model, configuration, and collaborator contracts for kbflow.
//!
//! This crate is the foundation depended on by all other kbflow crates.
//! It provides:
//! - [`KbflowError`], the unified error type
//! - Domain types ([`ProcessingUnit`], [`RunLedgerEntry`], [`DatasetRef`], ...)
//! - Configuration ([`AppConfig`], config loading)
//! - Collaborator traits ([`DatasetRegistry`], [`RunLedgerStore`], ...)

pub mod config;
pub mod contracts;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, LedgerConfig, StorageConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from, validate_config,
};
pub use contracts::{DatasetRegistry, FingerprintStore, PermissionChecker, RunLedgerStore};
pub use error::{KbflowError, Result, StepError};
pub use types::{
    Action, Dataset, DatasetId, DatasetRef, Fingerprint, ItemId, Params, Permission, Principal,
    ProcessingUnit, ProgressDelta, Provenance, RunError, RunId, RunLedgerEntry, RunResult,
    RunStatus,
};
