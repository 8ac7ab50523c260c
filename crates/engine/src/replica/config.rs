//! Replica configuration via `replica.toml`
//!
//! On first open a default `replica.toml` is written to the replica work
//! directory. To change settings, edit the file and reopen the replica.

use replistate_core::{StateError, StateResult};
use replistate_durability::DurabilityMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the replica work directory.
pub const CONFIG_FILE_NAME: &str = "replica.toml";

/// Replica configuration loaded from `replica.toml`.
///
/// # Example
///
/// ```toml
/// durability = "strict"
/// default_timeout_ms = 4000
/// checkpoint_threshold = 1000
/// enable_incremental_backups = true
/// max_incremental_backup_records = 100000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Log durability: `"strict"` or `"batched"`.
    #[serde(default = "default_durability_str")]
    pub durability: String,
    /// Timeout for internal lock waits, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Committed transactions between automatic checkpoints; 0 disables them.
    #[serde(default = "default_checkpoint_threshold")]
    pub checkpoint_threshold: u64,
    /// Keep the log back to the last backup so incrementals can chain.
    #[serde(default = "default_true")]
    pub enable_incremental_backups: bool,
    /// Most log records a single incremental backup may carry.
    #[serde(default = "default_max_incremental_records")]
    pub max_incremental_backup_records: usize,
}

fn default_durability_str() -> String {
    "strict".to_string()
}

fn default_timeout_ms() -> u64 {
    4000
}

fn default_checkpoint_threshold() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_max_incremental_records() -> usize {
    100_000
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            durability: default_durability_str(),
            default_timeout_ms: default_timeout_ms(),
            checkpoint_threshold: default_checkpoint_threshold(),
            enable_incremental_backups: default_true(),
            max_incremental_backup_records: default_max_incremental_records(),
        }
    }
}

impl ReplicaConfig {
    /// Parse the durability string into a `DurabilityMode`.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"strict"` or `"batched"`.
    pub fn durability_mode(&self) -> StateResult<DurabilityMode> {
        match self.durability.as_str() {
            "strict" => Ok(DurabilityMode::Strict),
            "batched" => Ok(DurabilityMode::batched()),
            other => Err(StateError::invalid_operation(format!(
                "Invalid durability mode '{}' in {}. Expected \"strict\" or \"batched\".",
                other, CONFIG_FILE_NAME
            ))),
        }
    }

    /// Lock wait timeout as a `Duration`.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Replica configuration
#
# Log durability: "strict" (default) or "batched"
#   "strict"  = fsync every commit
#   "batched" = fsync every 100ms or 1000 records, may lose the last batch on crash
durability = "strict"

# Timeout for internal lock waits in milliseconds (default: 4000)
default_timeout_ms = 4000

# Committed transactions between automatic checkpoints (default: 1000, 0 disables)
checkpoint_threshold = 1000

# Keep log records back to the last backup so incremental backups can chain
enable_incremental_backups = true

# Upper bound on log records carried by one incremental backup
max_incremental_backup_records = 100000
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> StateResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ReplicaConfig = toml::from_str(&content).map_err(|e| {
            StateError::invalid_operation(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.durability_mode()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> StateResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> StateResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            StateError::Serialization(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
