//! In-memory hypervisor backend.
//!
//! [`MemoryBackend`] implements [`VolumeApi`] over a concurrent map and
//! mimics how the hypervisor stores volumes:
//!
//! - server-side default config keys are filled in on create,
//! - desired config keys with empty values are never stored,
//! - updates are merged into the stored volume,
//! - missing volumes read back as `None`.
//!
//! Failures can be injected per [`ApiAction`] and every issued call is logged,
//! which is what the lifecycle tests use to check call order.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::client::{ApiAction, ServerContext, VolumeApi};
use crate::error::VolumeError;
use crate::identity::VolumeIdentity;
use crate::scope::RequestScope;
use crate::types::{VolumePatch, VolumeSpec};

/// Concrete [`VolumeApi`] backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    volumes: DashMap<VolumeIdentity, VolumeSpec>,
    /// Known pools.  Empty disables the pool existence check.
    pools: DashSet<String>,
    /// Config keys the server adds to every new volume unless set.
    server_defaults: BTreeMap<String, String>,
    /// Number of upcoming calls of each action that fail.
    faults: Mutex<HashMap<ApiAction, u32>>,
    calls: Mutex<Vec<(ApiAction, VolumeIdentity)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept volumes in the given pools.
    pub fn with_pools<I, S>(self, pools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for pool in pools {
            self.pools.insert(pool.into());
        }
        self
    }

    /// Add `key=value` to every created volume that does not set `key`.
    pub fn with_server_default(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.server_defaults.insert(key.into(), value.into());
        self
    }

    /// Make the next call of `action` fail with an upstream error.
    pub fn fail_next(&self, action: ApiAction) {
        *self.faults.lock().entry(action).or_insert(0) += 1;
    }

    /// Calls issued so far, in order.
    pub fn calls(&self) -> Vec<(ApiAction, VolumeIdentity)> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Store a volume directly, as if created outside the engine.
    pub fn insert(&self, spec: VolumeSpec) {
        self.volumes.insert(spec.identity.clone(), spec);
    }

    /// Remove a volume directly, as if deleted outside the engine.
    pub fn remove(&self, identity: &VolumeIdentity) -> Option<VolumeSpec> {
        self.volumes.remove(identity).map(|(_, spec)| spec)
    }

    pub fn get(&self, identity: &VolumeIdentity) -> Option<VolumeSpec> {
        self.volumes.get(identity).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Log the call and consume an injected fault, if any.
    fn enter(&self, action: ApiAction, identity: &VolumeIdentity) -> Result<(), VolumeError> {
        self.calls.lock().push((action, identity.clone()));
        let mut faults = self.faults.lock();
        if let Some(remaining) = faults.get_mut(&action)
            && *remaining > 0
        {
            *remaining -= 1;
            debug!(%action, volume = %identity, "injected failure");
            return Err(VolumeError::upstream(action, identity, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeApi for MemoryBackend {
    #[instrument(skip_all, fields(volume = %spec.identity, url = %scope.url()))]
    async fn create_volume(
        &self,
        _ctx: &ServerContext,
        scope: &RequestScope,
        spec: &VolumeSpec,
    ) -> Result<(), VolumeError> {
        let identity = &spec.identity;
        self.enter(ApiAction::Create, identity)?;

        if !self.pools.is_empty() && !self.pools.contains(&identity.pool) {
            return Err(VolumeError::upstream(
                ApiAction::Create,
                identity,
                format!("storage pool {:?} not found", identity.pool),
            ));
        }

        let mut stored = spec.clone();
        stored.config.retain(|_, v| !v.is_empty());
        for (key, value) in &self.server_defaults {
            stored
                .config
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        stored.description = stored.description.filter(|d| !d.is_empty());

        match self.volumes.entry(identity.clone()) {
            Entry::Occupied(_) => Err(VolumeError::upstream(
                ApiAction::Create,
                identity,
                "volume already exists",
            )),
            Entry::Vacant(slot) => {
                slot.insert(stored);
                info!("volume created");
                Ok(())
            }
        }
    }

    async fn read_volume(
        &self,
        _ctx: &ServerContext,
        _scope: &RequestScope,
        identity: &VolumeIdentity,
    ) -> Result<Option<VolumeSpec>, VolumeError> {
        self.enter(ApiAction::Read, identity)?;
        Ok(self.get(identity))
    }

    #[instrument(skip_all, fields(volume = %identity, url = %scope.url()))]
    async fn update_volume(
        &self,
        _ctx: &ServerContext,
        scope: &RequestScope,
        identity: &VolumeIdentity,
        patch: &VolumePatch,
    ) -> Result<(), VolumeError> {
        self.enter(ApiAction::Update, identity)?;
        let mut stored = self.volumes.get_mut(identity).ok_or_else(|| {
            VolumeError::upstream(ApiAction::Update, identity, "volume not found")
        })?;
        stored.apply_patch(patch);
        info!(set = patch.set.len(), unset = patch.unset.len(), "volume updated");
        Ok(())
    }

    #[instrument(skip_all, fields(volume = %identity, url = %scope.url()))]
    async fn delete_volume(
        &self,
        _ctx: &ServerContext,
        scope: &RequestScope,
        identity: &VolumeIdentity,
    ) -> Result<(), VolumeError> {
        self.enter(ApiAction::Delete, identity)?;
        if self.volumes.remove(identity).is_none() {
            return Err(VolumeError::upstream(
                ApiAction::Delete,
                identity,
                "volume not found",
            ));
        }
        info!("volume deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ServerContext {
        ServerContext::standalone("local")
    }

    fn scope(id: &VolumeIdentity) -> RequestScope {
        RequestScope::resolve(&ctx(), id).unwrap()
    }

    #[tokio::test]
    async fn create_fills_server_defaults() {
        let backend = MemoryBackend::new().with_server_default("block.filesystem", "ext4");
        let id = VolumeIdentity::new("pool1", "vol1");
        let spec = VolumeSpec::new(id.clone())
            .with_config("size", "1GiB")
            .with_config("snapshots.expiry", "");

        backend.create_volume(&ctx(), &scope(&id), &spec).await.unwrap();

        let stored = backend
            .read_volume(&ctx(), &scope(&id), &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.config["size"], "1GiB");
        assert_eq!(stored.config["block.filesystem"], "ext4");
        assert!(!stored.config.contains_key("snapshots.expiry"));
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let backend = MemoryBackend::new();
        let id = VolumeIdentity::new("pool1", "vol1");
        let spec = VolumeSpec::new(id.clone());
        backend.create_volume(&ctx(), &scope(&id), &spec).await.unwrap();
        let err = backend
            .create_volume(&ctx(), &scope(&id), &spec)
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::Upstream { action: ApiAction::Create, .. }));
    }

    #[tokio::test]
    async fn unknown_pool_fails() {
        let backend = MemoryBackend::new().with_pools(["default"]);
        let id = VolumeIdentity::new("pool1", "vol1");
        let result = backend
            .create_volume(&ctx(), &scope(&id), &VolumeSpec::new(id.clone()))
            .await;
        assert!(result.is_err());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let backend = MemoryBackend::new();
        let id = VolumeIdentity::new("pool1", "vol1");
        backend.fail_next(ApiAction::Read);
        assert!(backend.read_volume(&ctx(), &scope(&id), &id).await.is_err());
        assert!(backend
            .read_volume(&ctx(), &scope(&id), &id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            backend.calls(),
            vec![(ApiAction::Read, id.clone()), (ApiAction::Read, id)]
        );
    }

    #[tokio::test]
    async fn update_and_delete_missing_volume_fail() {
        let backend = MemoryBackend::new();
        let id = VolumeIdentity::new("pool1", "vol1");
        assert!(backend
            .update_volume(&ctx(), &scope(&id), &id, &VolumePatch::default())
            .await
            .is_err());
        assert!(backend.delete_volume(&ctx(), &scope(&id), &id).await.is_err());
    }
}
