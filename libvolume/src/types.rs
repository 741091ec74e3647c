//! Core volume types: desired/observed volume specs and update payloads.
//!
//! These types form the data model shared by the reconciler, the lifecycle
//! engine and [`VolumeApi`](crate::client::VolumeApi) implementations.  They
//! are all [`Serialize`]/[`Deserialize`] so desired state can be fed in by a
//! configuration front end as JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::VolumeIdentity;

// ---------------------------------------------------------------------------
// Volume type & content type
// ---------------------------------------------------------------------------

/// Kind of storage volume.  Only operator-managed custom volumes are handled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeType {
    #[default]
    Custom,
    CustomIso,
}

impl VolumeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Custom => "custom",
            Self::CustomIso => "custom-iso",
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk representation of a volume.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// Filesystem-backed directory.
    #[default]
    Filesystem,
    /// Raw block device.
    Block,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Volume spec
// ---------------------------------------------------------------------------

/// Desired or observed configuration of a storage volume.
///
/// On the desired side, `config` lists only the keys the operator manages and
/// an empty value asks for the key to be unset; `description: None` leaves the
/// description unmanaged.  On the observed side both hold whatever the
/// hypervisor reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSpec {
    #[serde(flatten)]
    pub identity: VolumeIdentity,
    #[serde(default, rename = "type")]
    pub volume_type: VolumeType,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Driver-specific settings, e.g. `size` or `zfs.remove_snapshots`.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl VolumeSpec {
    /// A custom filesystem volume with no managed config.
    pub fn new(identity: VolumeIdentity) -> Self {
        Self {
            identity,
            volume_type: VolumeType::default(),
            content_type: ContentType::default(),
            description: None,
            config: BTreeMap::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_type(mut self, volume_type: VolumeType) -> Self {
        self.volume_type = volume_type;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Apply an update payload in place, the way the hypervisor merges a
    /// partial update into the stored volume.
    pub fn apply_patch(&mut self, patch: &VolumePatch) {
        for key in &patch.unset {
            self.config.remove(key);
        }
        self.config
            .extend(patch.set.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(description) = &patch.description {
            self.description = (!description.is_empty()).then(|| description.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Update payload
// ---------------------------------------------------------------------------

/// Partial update sent with `UpdateVolume`.  Only fields the reconciler found
/// to differ are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumePatch {
    /// Config keys to set or overwrite.
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    /// Config keys to remove.
    #[serde(default)]
    pub unset: BTreeSet<String>,
    /// New description; an empty string clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl VolumePatch {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty() && self.description.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_from_json() {
        let spec: VolumeSpec =
            serde_json::from_str(r#"{"pool":"pool1","name":"vol1"}"#).expect("deserialize");
        assert_eq!(spec.identity, VolumeIdentity::new("pool1", "vol1"));
        assert_eq!(spec.volume_type, VolumeType::Custom);
        assert_eq!(spec.content_type, ContentType::Filesystem);
        assert!(spec.config.is_empty());
    }

    #[test]
    fn spec_json_names() {
        let spec: VolumeSpec = serde_json::from_str(
            r#"{"project":"p","pool":"pool1","name":"vol1","target":"node-2",
                "type":"custom-iso","content_type":"block","config":{"size":"1GiB"}}"#,
        )
        .expect("deserialize");
        assert_eq!(spec.identity.project, "p");
        assert_eq!(spec.identity.target.as_deref(), Some("node-2"));
        assert_eq!(spec.volume_type, VolumeType::CustomIso);
        assert_eq!(spec.content_type, ContentType::Block);
        assert_eq!(spec.config["size"], "1GiB");
    }

    #[test]
    fn apply_patch_merges() {
        let mut spec = VolumeSpec::new(VolumeIdentity::new("pool1", "vol1"))
            .with_config("size", "1GiB")
            .with_config("snapshots.expiry", "1d")
            .with_description("old");
        let patch = VolumePatch {
            set: BTreeMap::from([("size".into(), "2GiB".into())]),
            unset: BTreeSet::from(["snapshots.expiry".into()]),
            description: Some(String::new()),
        };
        spec.apply_patch(&patch);
        assert_eq!(spec.config, BTreeMap::from([("size".into(), "2GiB".into())]));
        assert_eq!(spec.description, None);
    }

    #[test]
    fn display_names() {
        assert_eq!(VolumeType::CustomIso.to_string(), "custom-iso");
        assert_eq!(ContentType::Block.to_string(), "block");
    }
}
