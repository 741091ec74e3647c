//! Project and cluster-target scoping of API requests.

use serde::{Deserialize, Serialize};

use crate::client::ServerContext;
use crate::error::VolumeError;
use crate::identity::VolumeIdentity;

/// Where and how a request for one volume is addressed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestScope {
    pub project: String,
    /// Cluster member the request is routed to.
    pub target: Option<String>,
    /// API path of the volume in the `custom` collection, which holds every
    /// volume type.  No query string.
    pub path: String,
}

impl RequestScope {
    /// Resolve the scope of `identity` against the deployment in `ctx`.
    ///
    /// A target is only accepted on a clustered deployment and, when the
    /// member list is known, only if it names a member.
    pub fn resolve(ctx: &ServerContext, identity: &VolumeIdentity) -> Result<Self, VolumeError> {
        identity.validate()?;

        if let Some(target) = &identity.target {
            if !ctx.clustered {
                return Err(VolumeError::InvalidTarget {
                    target: target.clone(),
                    reason: "deployment is not clustered".into(),
                });
            }
            if !ctx.members.is_empty() && !ctx.members.contains(target) {
                return Err(VolumeError::InvalidTarget {
                    target: target.clone(),
                    reason: "not a cluster member".into(),
                });
            }
        }

        Ok(Self {
            project: identity.project.clone(),
            target: identity.target.clone(),
            path: format!(
                "/1.0/storage-pools/{}/volumes/custom/{}",
                identity.pool, identity.name
            ),
        })
    }

    /// Query parameters: `project` (omitted for the default project) and
    /// `target`.
    pub fn query(&self) -> Vec<(&'static str, &str)> {
        let mut query = Vec::with_capacity(2);
        if self.project != crate::identity::DEFAULT_PROJECT {
            query.push(("project", self.project.as_str()));
        }
        if let Some(target) = &self.target {
            query.push(("target", target.as_str()));
        }
        query
    }

    /// Path plus query string.
    pub fn url(&self) -> String {
        let query = self.query();
        if query.is_empty() {
            return self.path.clone();
        }
        let params: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{}?{}", self.path, params.join("&"))
    }
}
