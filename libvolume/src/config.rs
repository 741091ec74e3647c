//! Engine configuration.
//!
//! Environment variables:
//! - `LIBVOLUME_REMOTE`: name of the hypervisor remote, used in log context.
//!   Defaults to `local`.
//! - `LIBVOLUME_CLUSTERED`: set to `1` when the remote is a cluster.
//!   Defaults to `0`.
//! - `LIBVOLUME_CLUSTER_MEMBERS`: comma-separated member names that targets
//!   are checked against.  Empty disables the check.
//! - `LIBVOLUME_DETACH_ON_DELETE`: set to `1` to drop device references when
//!   a volume is deleted or replaced instead of failing with `ResourceBusy`.
//!   Defaults to `0`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::VolumeError;

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub remote: String,
    pub clustered: bool,
    pub cluster_members: Vec<String>,
    pub detach_on_delete: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote: "local".to_owned(),
            clustered: false,
            cluster_members: Vec::new(),
            detach_on_delete: false,
        }
    }
}

impl EngineConfig {
    /// Read the configuration from `LIBVOLUME_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            remote: lookup("LIBVOLUME_REMOTE")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.remote),
            clustered: lookup("LIBVOLUME_CLUSTERED")
                .map(|v| v == "1")
                .unwrap_or(defaults.clustered),
            cluster_members: lookup("LIBVOLUME_CLUSTER_MEMBERS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or(defaults.cluster_members),
            detach_on_delete: lookup("LIBVOLUME_DETACH_ON_DELETE")
                .map(|v| v == "1")
                .unwrap_or(defaults.detach_on_delete),
        }
    }

    /// Load the configuration from a JSON file.  A missing file yields the
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, VolumeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            VolumeError::InvalidArgument(format!("read config {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            VolumeError::InvalidArgument(format!("parse config {}: {e}", path.display()))
        })
    }
}
