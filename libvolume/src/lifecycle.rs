//! Volume lifecycle state machine.
//!
//! ```text
//! Absent --create--> Creating --> Present --update--> Updating --> Present
//! Present --delete--> Deleting --> Absent
//! Absent --import--> Importing --> Present
//! ```
//!
//! [`ReconcileEngine`] drives these transitions through a [`VolumeApi`].  At
//! most one transition runs per [`VolumeIdentity`]; a second one fails fast
//! with [`VolumeError::TransitionInProgress`].  Observed state is written to
//! the record table only when a transition finishes, so an abandoned
//! (dropped) transition leaves the previous state in place.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::attachment::AttachmentManager;
use crate::client::{ApiAction, ServerContext, VolumeApi};
use crate::config::EngineConfig;
use crate::error::VolumeError;
use crate::identity::VolumeIdentity;
use crate::reconcile::{self, Action, ReconcileResult};
use crate::scope::RequestScope;
use crate::types::VolumeSpec;

/// Lifecycle state of a volume as seen by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeState {
    Absent,
    Creating,
    Present,
    Updating,
    Deleting,
    Importing,
}

/// Marks an identity as busy until dropped.
struct TransitionGuard<'a> {
    in_flight: &'a DashMap<VolumeIdentity, VolumeState>,
    identity: VolumeIdentity,
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.identity);
    }
}

/// Attach the attempted action and volume to errors a client did not already
/// report as upstream failures.
fn in_context(e: VolumeError, action: ApiAction, identity: &VolumeIdentity) -> VolumeError {
    match e {
        VolumeError::Upstream { .. } => e,
        other => VolumeError::upstream(action, identity, other),
    }
}

/// Reconciles desired volume specs against a hypervisor.
pub struct ReconcileEngine<A> {
    api: Arc<A>,
    ctx: ServerContext,
    config: EngineConfig,
    attachments: Arc<AttachmentManager>,
    /// Last observed state of every `Present` volume.
    present: DashMap<VolumeIdentity, VolumeSpec>,
    in_flight: DashMap<VolumeIdentity, VolumeState>,
}

impl<A: VolumeApi> ReconcileEngine<A> {
    pub fn new(api: Arc<A>, config: EngineConfig) -> Self {
        Self {
            api,
            ctx: ServerContext::from_config(&config),
            config,
            attachments: Arc::new(AttachmentManager::new()),
            present: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Share an attachment registry with other engines.
    pub fn with_attachments(mut self, attachments: Arc<AttachmentManager>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_context(mut self, ctx: ServerContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn attachments(&self) -> &Arc<AttachmentManager> {
        &self.attachments
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    pub fn state(&self, identity: &VolumeIdentity) -> VolumeState {
        if let Some(state) = self.in_flight.get(identity) {
            return *state;
        }
        if self.present.contains_key(identity) {
            VolumeState::Present
        } else {
            VolumeState::Absent
        }
    }

    /// Last observed state of a `Present` volume.
    pub fn observed(&self, identity: &VolumeIdentity) -> Option<VolumeSpec> {
        self.present.get(identity).map(|r| r.clone())
    }

    /// Identities of all `Present` volumes.
    pub fn volumes(&self) -> Vec<VolumeIdentity> {
        let mut ids: Vec<_> = self.present.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn begin(
        &self,
        identity: &VolumeIdentity,
        state: VolumeState,
    ) -> Result<TransitionGuard<'_>, VolumeError> {
        match self.in_flight.entry(identity.clone()) {
            Entry::Occupied(busy) => {
                debug!(volume = %identity, current = ?busy.get(), "transition rejected");
                Err(VolumeError::TransitionInProgress(identity.clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(TransitionGuard {
                    in_flight: &self.in_flight,
                    identity: identity.clone(),
                })
            }
        }
    }

    fn commit(&self, observed: VolumeSpec) {
        self.attachments.track(&observed.identity);
        self.present.insert(observed.identity.clone(), observed);
    }

    fn forget(&self, identity: &VolumeIdentity) {
        self.present.remove(identity);
        self.attachments.untrack(identity);
    }

    /// Read a volume and key the result by the identity it was read with,
    /// since the hypervisor does not echo project or target back.
    async fn read_observed(
        &self,
        scope: &RequestScope,
        identity: &VolumeIdentity,
    ) -> Result<Option<VolumeSpec>, VolumeError> {
        let observed = self
            .api
            .read_volume(&self.ctx, scope, identity)
            .await
            .map_err(|e| in_context(e, ApiAction::Read, identity))?;
        Ok(observed.map(|mut spec| {
            spec.identity = identity.clone();
            spec
        }))
    }

    /// `Absent -> Creating -> Present`.
    ///
    /// A volume that is already `Present` is left alone and reported as
    /// `noop`.  If the volume cannot be read back after a successful create it
    /// is deleted again and the transition ends `Absent`.
    #[instrument(skip_all, fields(remote = %self.ctx.remote, volume = %spec.identity))]
    pub async fn create(&self, spec: VolumeSpec) -> Result<ReconcileResult, VolumeError> {
        let identity = spec.identity.clone();
        let scope = RequestScope::resolve(&self.ctx, &identity)?;
        let _guard = self.begin(&identity, VolumeState::Creating)?;

        if self.present.contains_key(&identity) {
            debug!("volume already present, create is a no-op");
            return Ok(ReconcileResult::noop());
        }

        self.api
            .create_volume(&self.ctx, &scope, &spec)
            .await
            .map_err(|e| in_context(e, ApiAction::Create, &identity))
            .inspect_err(|e| warn!(error = %e, "create failed"))?;

        let read_back = match self.read_observed(&scope, &identity).await {
            Ok(Some(observed)) => Ok(observed),
            Ok(None) => Err(VolumeError::upstream(
                ApiAction::Read,
                &identity,
                "volume missing right after create",
            )),
            Err(e) => Err(e),
        };
        let observed = match read_back {
            Ok(observed) => observed,
            Err(e) => {
                warn!(error = %e, "read-back failed, rolling back create");
                if let Err(rollback) = self.api.delete_volume(&self.ctx, &scope, &identity).await {
                    warn!(error = %rollback, "rollback delete failed");
                }
                return Err(e);
            }
        };

        self.commit(observed);
        info!(url = %scope.url(), "volume present");
        Ok(ReconcileResult::create())
    }

    /// Read the observed state of a volume.
    ///
    /// For a `Present` volume the stored state is replaced; a volume that
    /// disappeared out of band drops to `Absent`.  Volumes the engine does not
    /// manage are read but not recorded.
    #[instrument(skip_all, fields(remote = %self.ctx.remote, volume = %identity))]
    pub async fn refresh(
        &self,
        identity: &VolumeIdentity,
    ) -> Result<Option<VolumeSpec>, VolumeError> {
        let scope = RequestScope::resolve(&self.ctx, identity)?;
        let _guard = self.begin(identity, self.state(identity))?;

        let observed = self.read_observed(&scope, identity).await?;
        let Some(previous) = self.observed(identity) else {
            return Ok(observed);
        };

        match &observed {
            None => {
                warn!("volume deleted outside of the engine");
                if self.attachments.is_attached(identity) {
                    warn!("device references remain on a deleted volume");
                }
                self.forget(identity);
            }
            Some(current) => {
                if current != &previous {
                    info!("observed state drifted");
                }
                self.commit(current.clone());
            }
        }
        Ok(observed)
    }

    /// Refresh, then compare `desired` against what was observed.
    pub async fn detect_drift(&self, desired: &VolumeSpec) -> Result<ReconcileResult, VolumeError> {
        let observed = self.refresh(&desired.identity).await?;
        Ok(reconcile::plan(desired, observed.as_ref()))
    }

    /// `Present -> Updating -> Present`.
    ///
    /// Sends only the changed mutable fields.  If the update call fails the
    /// stored state is untouched and the call may be retried.
    #[instrument(skip_all, fields(remote = %self.ctx.remote, volume = %desired.identity))]
    pub async fn update(&self, desired: VolumeSpec) -> Result<ReconcileResult, VolumeError> {
        let identity = desired.identity.clone();
        let scope = RequestScope::resolve(&self.ctx, &identity)?;
        let _guard = self.begin(&identity, VolumeState::Updating)?;

        let observed = self
            .observed(&identity)
            .ok_or_else(|| VolumeError::NotFound(identity.clone()))?;
        let result = reconcile::diff(&desired, &observed).into_result()?;
        match result.action {
            Action::Update => {}
            Action::Noop => return Ok(result),
            other => {
                return Err(VolumeError::InvalidArgument(format!(
                    "cannot update volume {identity} in place: plan is {other:?}"
                )));
            }
        }

        let patch = result.patch(&desired);
        debug!(fields = ?result.changed_fields, "updating volume");
        self.api
            .update_volume(&self.ctx, &scope, &identity, &patch)
            .await
            .map_err(|e| in_context(e, ApiAction::Update, &identity))
            .inspect_err(|e| warn!(error = %e, "update failed, keeping previous state"))?;

        let merged = match self.read_observed(&scope, &identity).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                warn!("volume vanished during update");
                self.forget(&identity);
                return Err(VolumeError::NotFound(identity));
            }
            Err(e) => {
                warn!(error = %e, "read-back failed, merging update locally");
                let mut merged = observed;
                merged.apply_patch(&patch);
                merged
            }
        };

        self.commit(merged);
        info!(changed = result.changed_fields.len(), "volume updated");
        Ok(result)
    }

    /// `Present -> Deleting -> Absent`.
    ///
    /// Fails with [`VolumeError::ResourceBusy`] while devices reference the
    /// volume, unless `detach` is set, in which case the references are
    /// dropped once the delete succeeds.  The volume cannot be attached while
    /// the delete is in flight.  Deleting an `Absent` volume is a `noop`.
    #[instrument(skip(self), fields(remote = %self.ctx.remote, volume = %identity))]
    pub async fn delete(
        &self,
        identity: &VolumeIdentity,
        detach: bool,
    ) -> Result<ReconcileResult, VolumeError> {
        let scope = RequestScope::resolve(&self.ctx, identity)?;
        let _guard = self.begin(identity, VolumeState::Deleting)?;

        if !self.present.contains_key(identity) {
            debug!("volume absent, delete is a no-op");
            return Ok(ReconcileResult::noop());
        }

        // No new references while the delete is in flight.
        self.attachments.untrack(identity);

        let attached = self.attachments.attachments_for(identity);
        if !attached.is_empty() && !detach {
            self.attachments.track(identity);
            return Err(VolumeError::ResourceBusy {
                volume: identity.clone(),
                devices: attached
                    .iter()
                    .map(|a| format!("{}/{}", a.instance, a.device_name))
                    .collect(),
            });
        }

        if let Err(e) = self.api.delete_volume(&self.ctx, &scope, identity).await {
            let e = in_context(e, ApiAction::Delete, identity);
            warn!(error = %e, "delete failed");
            self.attachments.track(identity);
            return Err(e);
        }

        if detach {
            self.attachments.detach_volume(identity);
        }
        self.forget(identity);
        info!("volume deleted");
        Ok(ReconcileResult::delete())
    }

    /// `Absent -> Importing -> Present` from an identifier such as
    /// `/pool1/vol1` or `myproj/pool1/vol1`.
    ///
    /// Importing a volume that is already `Present` refreshes it.
    #[instrument(skip(self), fields(remote = %self.ctx.remote))]
    pub async fn import(&self, raw_id: &str) -> Result<VolumeSpec, VolumeError> {
        let identity = VolumeIdentity::parse(raw_id)?;
        let scope = RequestScope::resolve(&self.ctx, &identity)?;
        let _guard = self.begin(&identity, VolumeState::Importing)?;

        let observed = self
            .read_observed(&scope, &identity)
            .await?
            .ok_or_else(|| VolumeError::NotFound(identity.clone()))?;

        self.commit(observed.clone());
        info!(volume = %identity, "volume imported");
        Ok(observed)
    }

    /// Converge one volume.
    ///
    /// `current` is the identity the volume is managed under, if any.  A
    /// change of name, pool or project is carried out as a delete of
    /// `current` followed by a create of `desired`; the delete honours
    /// [`EngineConfig::detach_on_delete`].  A replace onto a volume that is
    /// already `Present` fails with [`VolumeError::ReplaceConflict`] and
    /// deletes nothing.
    #[instrument(skip_all, fields(remote = %self.ctx.remote, volume = %desired.identity))]
    pub async fn apply(
        &self,
        current: Option<&VolumeIdentity>,
        desired: VolumeSpec,
    ) -> Result<ReconcileResult, VolumeError> {
        let Some(current) = current else {
            return self.create(desired).await;
        };

        let observed = self.observed(current);
        let planned = reconcile::plan(&desired, observed.as_ref()).into_result()?;
        match planned.action {
            Action::Noop => Ok(planned),
            Action::Create => self.create(desired).await,
            Action::Update => self.update(desired).await,
            Action::Replace => {
                let conflict = || VolumeError::ReplaceConflict {
                    from: current.clone(),
                    to: desired.identity.clone(),
                };
                if self.present.contains_key(&desired.identity) {
                    return Err(conflict());
                }
                info!(from = %current, fields = ?planned.changed_fields, "replacing volume");
                self.delete(current, self.config.detach_on_delete).await?;
                if self.create(desired.clone()).await?.is_noop() {
                    warn!(from = %current, "replacement appeared while replacing");
                    return Err(conflict());
                }
                Ok(planned)
            }
            Action::Delete => self.delete(current, self.config.detach_on_delete).await,
        }
    }
}
