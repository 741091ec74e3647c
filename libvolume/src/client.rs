//! Outbound hypervisor API seam.
//!
//! The engine never talks to the hypervisor itself.  It decides *which* calls
//! to make and *in what order*, and hands them to a [`VolumeApi`]
//! implementation, which owns transport, timeouts and retries.  Connection and
//! deployment facts are passed explicitly on every call through a
//! [`ServerContext`] rather than held as ambient global state.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::VolumeError;
use crate::identity::VolumeIdentity;
use crate::scope::RequestScope;
use crate::types::{VolumePatch, VolumeSpec};

/// The abstract API operations issued by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ApiAction {
    Create,
    Read,
    Update,
    Delete,
}

impl fmt::Display for ApiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Facts about the hypervisor deployment the engine is talking to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerContext {
    /// Name of the remote.  Recorded as the `remote` field of every engine
    /// transition span.
    #[serde(default)]
    pub remote: String,
    /// Whether the deployment is a multi-node cluster.
    #[serde(default)]
    pub clustered: bool,
    /// Known cluster members.  Empty means "not checked".
    #[serde(default)]
    pub members: BTreeSet<String>,
}

impl ServerContext {
    pub fn standalone(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            clustered: false,
            members: BTreeSet::new(),
        }
    }

    pub fn clustered<I, S>(remote: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            remote: remote.into(),
            clustered: true,
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            remote: config.remote.clone(),
            clustered: config.clustered,
            members: config.cluster_members.iter().cloned().collect(),
        }
    }
}

/// Hypervisor storage-volume API.
///
/// Every call is keyed by a [`VolumeIdentity`] and carries the
/// [`RequestScope`] (API path plus project/target parameters) resolved for it.
/// Implementations report their own failures as
/// [`VolumeError::Upstream`].
#[async_trait]
pub trait VolumeApi: Send + Sync {
    /// Create the volume described by `spec`.
    async fn create_volume(
        &self,
        ctx: &ServerContext,
        scope: &RequestScope,
        spec: &VolumeSpec,
    ) -> Result<(), VolumeError>;

    /// Fetch the observed state of a volume.  `Ok(None)` means the hypervisor
    /// has no such volume.
    async fn read_volume(
        &self,
        ctx: &ServerContext,
        scope: &RequestScope,
        identity: &VolumeIdentity,
    ) -> Result<Option<VolumeSpec>, VolumeError>;

    /// Apply a partial update to an existing volume.
    async fn update_volume(
        &self,
        ctx: &ServerContext,
        scope: &RequestScope,
        identity: &VolumeIdentity,
        patch: &VolumePatch,
    ) -> Result<(), VolumeError>;

    /// Delete a volume.
    async fn delete_volume(
        &self,
        ctx: &ServerContext,
        scope: &RequestScope,
        identity: &VolumeIdentity,
    ) -> Result<(), VolumeError>;
}
