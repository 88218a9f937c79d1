//! Branch configuration via `tessel.toml`
//!
//! Every setting is fixed at branch creation. Walkers may override the
//! branch's default granularity for themselves.

use crate::error::{TesselError, TesselResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name
pub const CONFIG_FILE_NAME: &str = "tessel.toml";

/// Default number of recycled set buffers kept per branch
pub const DEFAULT_MAX_POOLED_SETS: usize = 8;

/// How commits are validated against maps appended after their snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictDetection {
    /// Reject if a later map wrote an object this transaction read
    #[default]
    ReadWriteConflicts,
    /// Reject only if a later map wrote an object this transaction wrote
    WriteWriteConflicts,
    /// Never reject; later commits simply overwrite
    LastWriteWins,
}

/// When appended maps become acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Maps stay speculative until every acknowledger confirmed them
    #[default]
    Full,
    /// Maps are acknowledged at append; acknowledgers are only notified
    Eventual,
}

/// How much history a walker is guaranteed to observe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// May skip intermediate states; converges to the latest acknowledged one
    #[default]
    Coalesce,
    /// Visits every map exactly once, in commit order
    All,
}

/// Branch configuration loaded from `tessel.toml`.
///
/// # Example
///
/// ```toml
/// conflict_detection = "read_write_conflicts"
/// consistency = "full"
/// granularity = "coalesce"
/// max_pooled_sets = 8
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    /// Conflict detection policy
    #[serde(default)]
    pub conflict_detection: ConflictDetection,
    /// Acknowledgment mode
    #[serde(default)]
    pub consistency: Consistency,
    /// Default walker granularity
    #[serde(default)]
    pub granularity: Granularity,
    /// Recycled set buffers kept on the branch free list
    #[serde(default = "default_max_pooled_sets")]
    pub max_pooled_sets: usize,
}

fn default_max_pooled_sets() -> usize {
    DEFAULT_MAX_POOLED_SETS
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            conflict_detection: ConflictDetection::default(),
            consistency: Consistency::default(),
            granularity: Granularity::default(),
            max_pooled_sets: DEFAULT_MAX_POOLED_SETS,
        }
    }
}

impl BranchConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the conflict detection policy
    pub fn with_conflict_detection(mut self, conflict_detection: ConflictDetection) -> Self {
        self.conflict_detection = conflict_detection;
        self
    }

    /// Set the consistency mode
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Set the default walker granularity
    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// Set the free-list capacity
    pub fn with_max_pooled_sets(mut self, max_pooled_sets: usize) -> Self {
        self.max_pooled_sets = max_pooled_sets;
        self
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tessel branch configuration
#
# Conflict detection: "read_write_conflicts" (default), "write_write_conflicts"
# or "last_write_wins"
conflict_detection = "read_write_conflicts"

# Consistency: "full" (default) keeps commits speculative until every
# acknowledger confirmed them, "eventual" acknowledges at append
consistency = "full"

# Default walker granularity: "coalesce" (default) or "all"
granularity = "coalesce"

# Recycled transaction set buffers kept per branch
max_pooled_sets = 8
"#
    }

    /// Parse config from TOML text.
    pub fn from_toml_str(content: &str) -> TesselResult<Self> {
        toml::from_str(content)
            .map_err(|e| TesselError::config(format!("Failed to parse branch config: {}", e)))
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> TesselResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            TesselError::config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> TesselResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> TesselResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TesselError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
