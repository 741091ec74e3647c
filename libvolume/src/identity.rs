//! Composite volume identity and its string codec.
//!
//! A storage volume is addressed by `(project, pool, name, target)`.  The
//! string form is what operators type when importing an existing volume:
//!
//! ```text
//! /<pool>/<name>[/<target>]              volume in the "default" project
//! <project>/<pool>/<name>[/<target>]     volume in an explicit project
//! ```
//!
//! [`VolumeIdentity::parse`] and the [`Display`](fmt::Display) impl are
//! inverses: `parse(&id.to_string()) == Ok(id)` for every valid identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VolumeError;

/// Project used when none is given.
pub const DEFAULT_PROJECT: &str = "default";

fn default_project() -> String {
    DEFAULT_PROJECT.to_owned()
}

/// Structured key of a storage volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeIdentity {
    /// Project the volume lives in.
    #[serde(default = "default_project")]
    pub project: String,
    /// Storage pool holding the volume.
    pub pool: String,
    /// Volume name, unique within `(project, pool)`.
    pub name: String,
    /// Cluster member the volume is pinned to, on clustered deployments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl VolumeIdentity {
    /// Identity of `name` in `pool` within the default project.
    pub fn new(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: default_project(),
            pool: pool.into(),
            name: name.into(),
            target: None,
        }
    }

    /// Place the volume in `project`.  An empty project means the default one.
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        let project = project.into();
        self.project = if project.is_empty() {
            default_project()
        } else {
            project
        };
        self
    }

    /// Pin the volume to a cluster member.  An empty target clears it.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        let target = target.into();
        self.target = (!target.is_empty()).then_some(target);
        self
    }

    pub fn is_default_project(&self) -> bool {
        self.project == DEFAULT_PROJECT
    }

    /// Check the invariants the string codec relies on.
    pub fn validate(&self) -> Result<(), VolumeError> {
        let segments = [
            ("project", Some(self.project.as_str())),
            ("pool", Some(self.pool.as_str())),
            ("name", Some(self.name.as_str())),
            ("target", self.target.as_deref()),
        ];
        for (field, value) in segments {
            match value {
                Some("") => {
                    return Err(VolumeError::InvalidArgument(format!(
                        "volume {field} must not be empty"
                    )));
                }
                Some(v) if v.contains('/') => {
                    return Err(VolumeError::InvalidArgument(format!(
                        "volume {field} {v:?} must not contain '/'"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Parse an import identifier.
    ///
    /// Accepted forms are `/<pool>/<name>`, `/<pool>/<name>/<target>`,
    /// `<project>/<pool>/<name>` and `<project>/<pool>/<name>/<target>`.
    pub fn parse(raw: &str) -> Result<Self, VolumeError> {
        let (explicit_project, rest) = match raw.strip_prefix('/') {
            Some(rest) => (false, rest),
            None => (true, raw),
        };

        let segments: Vec<&str> = rest.split('/').collect();
        if !(2..=4).contains(&segments.len()) {
            return Err(VolumeError::malformed(
                raw,
                format!("expected 2 to 4 segments, found {}", segments.len()),
            ));
        }
        if let Some(pos) = segments.iter().position(|s| s.is_empty()) {
            return Err(VolumeError::malformed(
                raw,
                format!("segment {} is empty", pos + 1),
            ));
        }

        match (explicit_project, segments.as_slice()) {
            (false, [pool, name]) => Ok(Self::new(*pool, *name)),
            (false, [pool, name, target]) => Ok(Self::new(*pool, *name).with_target(*target)),
            (true, [project, pool, name]) => Ok(Self::new(*pool, *name).with_project(*project)),
            (true, [project, pool, name, target]) => Ok(Self::new(*pool, *name)
                .with_project(*project)
                .with_target(*target)),
            (true, [_, _]) => Err(VolumeError::malformed(
                raw,
                "default-project identifiers must start with '/'",
            )),
            _ => Err(VolumeError::malformed(
                raw,
                "default-project identifiers take the form /<pool>/<name>[/<target>]",
            )),
        }
    }
}

impl fmt::Display for VolumeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_default_project() {
            f.write_str(&self.project)?;
        }
        write!(f, "/{}/{}", self.pool, self.name)?;
        if let Some(target) = &self.target {
            write!(f, "/{target}")?;
        }
        Ok(())
    }
}

impl FromStr for VolumeIdentity {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
