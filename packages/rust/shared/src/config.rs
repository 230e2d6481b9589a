//! Application configuration for kbflow.
//!
//! User config lives at `~/.kbflow/kbflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KbflowError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "kbflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".kbflow";

// ---------------------------------------------------------------------------
// Config structs (matching kbflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Run defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Storage location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Run ledger tuning.
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Batch size for built-in steps that accept batches.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Skip already-converged items unless overridden.
    #[serde(default)]
    pub incremental: bool,

    /// Execution mode: "blocking" or "background".
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Principal used when the CLI is not given one.
    #[serde(default = "default_principal")]
    pub principal: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            incremental: false,
            mode: default_mode(),
            principal: default_principal(),
        }
    }
}

fn default_batch_size() -> usize {
    1
}
fn default_mode() -> String {
    "blocking".into()
}
fn default_principal() -> String {
    "local".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the libSQL database holding datasets and the run ledger.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.kbflow/kbflow.db".into()
}

impl StorageConfig {
    /// `db_path` with a leading `~/` expanded to the home directory.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match self.db_path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir().ok_or_else(|| {
                    KbflowError::config("could not determine home directory")
                })?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.db_path)),
        }
    }
}

/// `[ledger]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Capacity of the single-writer queue used by background runs.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Units drained between progress writes.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            progress_interval: default_progress_interval(),
        }
    }
}

fn default_queue_capacity() -> usize {
    64
}
fn default_progress_interval() -> u64 {
    32
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.kbflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| KbflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.kbflow/kbflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| KbflowError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| KbflowError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject values the engine cannot run with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.defaults.batch_size == 0 {
        return Err(KbflowError::config("defaults.batch_size must be at least 1"));
    }
    if config.ledger.queue_capacity == 0 {
        return Err(KbflowError::config("ledger.queue_capacity must be at least 1"));
    }
    if config.ledger.progress_interval == 0 {
        return Err(KbflowError::config(
            "ledger.progress_interval must be at least 1",
        ));
    }
    match config.defaults.mode.as_str() {
        "blocking" | "background" => Ok(()),
        other => Err(KbflowError::config(format!(
            "defaults.mode must be 'blocking' or 'background', got '{other}'"
        ))),
    }
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| KbflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| KbflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| KbflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("db_path"));
        assert!(toml_str.contains("progress_interval"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.batch_size, 1);
        assert_eq!(parsed.ledger.queue_capacity, 64);
        assert_eq!(parsed.defaults.mode, "blocking");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
incremental = true

[storage]
db_path = "/tmp/kbflow.db"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert!(config.defaults.incremental);
        assert_eq!(config.defaults.batch_size, 1);
        assert_eq!(
            config.storage.resolved_db_path().unwrap(),
            PathBuf::from("/tmp/kbflow.db")
        );
        assert_eq!(config.ledger.progress_interval, 32);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.defaults.batch_size = 0;
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.defaults.mode = "eventually".into();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("eventually"));
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join(format!("kbflow_cfg_{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&path, "[ledger]\nqueue_capacity = 8\n").unwrap();
        let config = load_config_from(&path).expect("load");
        assert_eq!(config.ledger.queue_capacity, 8);
        let _ = std::fs::remove_file(&path);
    }
}
