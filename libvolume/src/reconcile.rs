//! Desired-versus-observed attribute reconciliation.
//!
//! Every volume field is classified in [`FIELD_POLICIES`]; [`diff`] walks the
//! table and turns the differences it finds into a single
//! [`ReconcileResult`].
//!
//! | field | mutability | on mismatch |
//! |---|---|---|
//! | `name`, `pool`, `project` | immutable | `replace` |
//! | `content_type`, `type` | immutable after create | `ImmutableFieldChanged` |
//! | `target` | scoping only | `ImmutableFieldChanged` |
//! | `config.*`, `description` | mutable | `update` |
//!
//! Config keys the desired spec does not mention are left alone.  A desired
//! key with an empty value asks for the key to be removed.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::VolumeError;
use crate::types::{VolumePatch, VolumeSpec};

const CONFIG_PREFIX: &str = "config.";

/// What the engine has to do to converge a volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Noop,
    Update,
    Replace,
    Create,
    Delete,
}

/// How a field may change over the life of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// Part of the identity; a change means a different volume.
    Immutable,
    /// Chosen at create time, fixed afterwards.
    ImmutableAfterCreate,
    /// Addresses the volume but is not content; must always match.
    ScopingOnly,
    /// Updatable in place.
    Mutable,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldPolicy {
    pub field: &'static str,
    pub mutability: Mutability,
}

/// Classification of every reconciled field.
pub const FIELD_POLICIES: &[FieldPolicy] = &[
    FieldPolicy {
        field: "name",
        mutability: Mutability::Immutable,
    },
    FieldPolicy {
        field: "pool",
        mutability: Mutability::Immutable,
    },
    FieldPolicy {
        field: "project",
        mutability: Mutability::Immutable,
    },
    FieldPolicy {
        field: "content_type",
        mutability: Mutability::ImmutableAfterCreate,
    },
    FieldPolicy {
        field: "type",
        mutability: Mutability::ImmutableAfterCreate,
    },
    FieldPolicy {
        field: "target",
        mutability: Mutability::ScopingOnly,
    },
    FieldPolicy {
        field: "config",
        mutability: Mutability::Mutable,
    },
    FieldPolicy {
        field: "description",
        mutability: Mutability::Mutable,
    },
];

/// Look up the policy of a field name as it appears in
/// [`ReconcileResult::changed_fields`].  `config.<key>` maps to `config`.
pub fn mutability(field: &str) -> Option<Mutability> {
    let field = if field.starts_with(CONFIG_PREFIX) {
        "config"
    } else {
        field
    };
    FIELD_POLICIES
        .iter()
        .find(|p| p.field == field)
        .map(|p| p.mutability)
}

/// Output of one reconciliation pass.  Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileResult {
    pub action: Action,
    /// Differing fields; config entries are named `config.<key>`.
    pub changed_fields: BTreeSet<String>,
    pub error: Option<VolumeError>,
}

impl ReconcileResult {
    fn with_action(action: Action) -> Self {
        Self {
            action,
            changed_fields: BTreeSet::new(),
            error: None,
        }
    }

    pub fn noop() -> Self {
        Self::with_action(Action::Noop)
    }

    pub fn create() -> Self {
        Self::with_action(Action::Create)
    }

    pub fn delete() -> Self {
        Self::with_action(Action::Delete)
    }

    pub fn is_noop(&self) -> bool {
        self.action == Action::Noop && self.error.is_none()
    }

    /// Turn an error result into `Err`.
    pub fn into_result(self) -> Result<Self, VolumeError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }

    /// Build the update payload for the changed mutable fields of `desired`.
    /// Fields of any other class are skipped.
    pub fn patch(&self, desired: &VolumeSpec) -> VolumePatch {
        let mut patch = VolumePatch::default();
        for field in &self.changed_fields {
            if mutability(field) != Some(Mutability::Mutable) {
                continue;
            }
            if let Some(key) = field.strip_prefix(CONFIG_PREFIX) {
                match desired.config.get(key).map(String::as_str) {
                    Some("") | None => {
                        patch.unset.insert(key.to_owned());
                    }
                    Some(value) => {
                        patch.set.insert(key.to_owned(), value.to_owned());
                    }
                }
            } else if field == "description" {
                patch.description = Some(desired.description.clone().unwrap_or_default());
            }
        }
        patch
    }
}

/// Plan the action for `desired` given what is currently observed.
///
/// A volume that does not exist yet is created with its immutable-after-create
/// fields taken as-is.
pub fn plan(desired: &VolumeSpec, observed: Option<&VolumeSpec>) -> ReconcileResult {
    match observed {
        None => ReconcileResult::create(),
        Some(observed) => diff(desired, observed),
    }
}

/// Compare desired against the observed state of an existing volume.
pub fn diff(desired: &VolumeSpec, observed: &VolumeSpec) -> ReconcileResult {
    let mut replace = BTreeSet::new();
    let mut immutable = BTreeSet::new();
    let mut mutable = BTreeSet::new();

    for policy in FIELD_POLICIES {
        let changed = changed_entries(policy.field, desired, observed);
        if changed.is_empty() {
            continue;
        }
        match policy.mutability {
            Mutability::Immutable => replace.extend(changed),
            Mutability::ImmutableAfterCreate | Mutability::ScopingOnly => {
                immutable.extend(changed)
            }
            Mutability::Mutable => mutable.extend(changed),
        }
    }

    if !replace.is_empty() {
        return ReconcileResult {
            action: Action::Replace,
            changed_fields: replace,
            error: None,
        };
    }

    if let Some(field) = first_in_policy_order(&immutable) {
        return ReconcileResult {
            action: Action::Noop,
            error: Some(VolumeError::ImmutableFieldChanged {
                volume: observed.identity.clone(),
                field: field.to_owned(),
            }),
            changed_fields: immutable,
        };
    }

    if mutable.is_empty() {
        return ReconcileResult::noop();
    }
    ReconcileResult {
        action: Action::Update,
        changed_fields: mutable,
        error: None,
    }
}

fn first_in_policy_order(fields: &BTreeSet<String>) -> Option<&'static str> {
    FIELD_POLICIES
        .iter()
        .map(|p| p.field)
        .find(|f| fields.contains(*f))
}

fn changed_entries(field: &str, desired: &VolumeSpec, observed: &VolumeSpec) -> Vec<String> {
    let (d, o) = (&desired.identity, &observed.identity);
    let differs = match field {
        "name" => d.name != o.name,
        "pool" => d.pool != o.pool,
        "project" => d.project != o.project,
        "target" => d.target != o.target,
        "content_type" => desired.content_type != observed.content_type,
        "type" => desired.volume_type != observed.volume_type,
        "description" => desired
            .description
            .as_deref()
            .is_some_and(|want| want != observed.description.as_deref().unwrap_or("")),
        "config" => return changed_config_keys(desired, observed),
        _ => false,
    };
    if differs {
        vec![field.to_owned()]
    } else {
        Vec::new()
    }
}

fn changed_config_keys(desired: &VolumeSpec, observed: &VolumeSpec) -> Vec<String> {
    desired
        .config
        .iter()
        .filter(|(key, want)| {
            let have = observed.config.get(*key);
            if want.is_empty() {
                have.is_some()
            } else {
                have != Some(*want)
            }
        })
        .map(|(key, _)| format!("{CONFIG_PREFIX}{key}"))
        .collect()
}
