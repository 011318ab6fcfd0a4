//! Configuration parsing and management.
//!
//! This module handles parsing of ledger configuration files (TOML) covering
//! retry policy bounds, lease allocator bounds, head-scan page size, and the
//! per-scope workflow-id ranges used by the allocators.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Errors that can occur during configuration handling.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize the configuration.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Configuration validation failed.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// The workflow-id range available to one device scope.
///
/// Candidate ids outside the range are an id-space exhaustion or
/// misconfiguration signal and fail the owning request fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeIdRange {
    /// The first workflow id handed out when a device+scope has no records.
    #[serde(default = "default_min_workflow_id")]
    pub min_workflow_id: u64,

    /// Inclusive upper bound of the scope's id space.
    #[serde(default = "default_max_workflow_id")]
    pub max_workflow_id: u64,
}

const fn default_min_workflow_id() -> u64 {
    100
}

const fn default_max_workflow_id() -> u64 {
    9_999_999
}

impl Default for ScopeIdRange {
    fn default() -> Self {
        Self {
            min_workflow_id: default_min_workflow_id(),
            max_workflow_id: default_max_workflow_id(),
        }
    }
}

impl ScopeIdRange {
    /// Returns true if `workflow_id` lies inside the range.
    #[must_use]
    pub const fn contains(&self, workflow_id: u64) -> bool {
        workflow_id >= self.min_workflow_id && workflow_id <= self.max_workflow_id
    }
}

/// Top-level ledger configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Retry bounds for request handlers (scan allocation + insert loop).
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Retry bounds for the lease-counter allocator.
    #[serde(default)]
    pub lease: RetryPolicy,

    /// Scan settings for paginated head-index queries.
    #[serde(default)]
    pub scan: ScanConfig,

    /// Per-scope workflow-id ranges; scopes not listed here use
    /// `ScopeIdRange::default()`.
    #[serde(default)]
    pub scopes: BTreeMap<String, ScopeIdRange>,
}

/// Pagination settings for head-index scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Rows fetched per head-index page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

const fn default_page_size() -> usize {
    64
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Returns the workflow-id range for a scope, falling back to the
    /// default range for scopes with no explicit entry.
    #[must_use]
    pub fn scope_range(&self, scope: &str) -> ScopeIdRange {
        self.scopes.get(scope).copied().unwrap_or_default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` for inverted scope ranges, a zero
    /// scan page size, or zero retry bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (scope, range) in &self.scopes {
            if range.min_workflow_id > range.max_workflow_id {
                return Err(ConfigError::Validation(format!(
                    "scope {scope}: min_workflow_id {} exceeds max_workflow_id {}",
                    range.min_workflow_id, range.max_workflow_id
                )));
            }
        }
        if self.scan.page_size == 0 {
            return Err(ConfigError::Validation(
                "scan.page_size must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 || self.lease.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry bounds must allow at least one attempt".to_string(),
            ));
        }
        Ok(())
    }
}
