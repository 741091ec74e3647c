//! Volume reconciliation error types.
//!
//! Every failure in the `libvolume` crate is a [`VolumeError`].  It derives
//! [`thiserror::Error`] and also [`Serialize`]/[`Deserialize`] so a
//! [`ReconcileResult`](crate::reconcile::ReconcileResult) carrying an error
//! can be reported by callers as structured data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ApiAction;
use crate::identity::VolumeIdentity;

/// Unified error type for volume reconciliation.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum VolumeError {
    /// An identifier string did not match the import grammar.
    #[error("malformed volume identifier {raw:?}: {reason}")]
    MalformedIdentifier {
        /// The raw identifier as supplied by the caller.
        raw: String,
        /// Which rule the identifier broke.
        reason: String,
    },

    /// An immutable-after-create field differs on an existing volume.
    #[error("volume {volume}: field {field} cannot be changed after creation")]
    ImmutableFieldChanged {
        /// The volume being reconciled.
        volume: VolumeIdentity,
        /// Name of the offending field.
        field: String,
    },

    /// An attachment referenced a volume that is not tracked.
    #[error("unknown volume {0}")]
    UnknownVolume(VolumeIdentity),

    /// The `(instance, device)` slot already holds another volume.
    #[error("device {device} on instance {instance} is already attached to volume {attached}")]
    DuplicateDevice {
        /// Instance owning the device block.
        instance: String,
        /// Device name within the instance.
        device: String,
        /// The volume currently holding the slot.
        attached: VolumeIdentity,
    },

    /// The volume cannot be deleted while devices still reference it.
    #[error("volume {volume} is in use by {} device(s): {}", devices.len(), devices.join(", "))]
    ResourceBusy {
        /// The volume that was to be deleted.
        volume: VolumeIdentity,
        /// `instance/device` pairs still referencing the volume.
        devices: Vec<String>,
    },

    /// The hypervisor reports no such volume.
    #[error("volume {0} not found")]
    NotFound(VolumeIdentity),

    /// The API client returned an error; passed through opaquely.
    #[error("{action} of volume {volume} failed: {reason}")]
    Upstream {
        /// The API call that was attempted.
        action: ApiAction,
        /// The volume the call was keyed by.
        volume: VolumeIdentity,
        /// Message reported by the client.
        reason: String,
    },

    /// A replace would land on a volume that already exists.
    #[error("cannot replace volume {from} with {to}: {to} already exists")]
    ReplaceConflict {
        /// The volume that was to be replaced.
        from: VolumeIdentity,
        /// The replacement, already present.
        to: VolumeIdentity,
    },

    /// Another transition for the same volume has not finished yet.
    #[error("a transition for volume {0} is already in progress")]
    TransitionInProgress(VolumeIdentity),

    /// A cluster target cannot be used in the current deployment.
    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget {
        /// The requested cluster member.
        target: String,
        /// Why the target was rejected.
        reason: String,
    },

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Discriminant of [`VolumeError`] without its context payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedIdentifier,
    ImmutableFieldChanged,
    UnknownVolume,
    DuplicateDevice,
    ResourceBusy,
    NotFound,
    UpstreamFailure,
    ReplaceConflict,
    TransitionInProgress,
    InvalidTarget,
    InvalidArgument,
}

impl VolumeError {
    /// Create a [`VolumeError::MalformedIdentifier`].
    pub fn malformed(raw: &str, reason: impl Into<String>) -> Self {
        Self::MalformedIdentifier {
            raw: raw.to_owned(),
            reason: reason.into(),
        }
    }

    /// Wrap an API client failure with the action and volume it was keyed by.
    pub fn upstream<E: std::fmt::Display>(
        action: ApiAction,
        volume: &VolumeIdentity,
        e: E,
    ) -> Self {
        Self::Upstream {
            action,
            volume: volume.clone(),
            reason: e.to_string(),
        }
    }

    /// Create a [`VolumeError::InvalidArgument`] from anything that
    /// implements [`std::fmt::Display`].
    pub fn invalid<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidArgument(e.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedIdentifier { .. } => ErrorKind::MalformedIdentifier,
            Self::ImmutableFieldChanged { .. } => ErrorKind::ImmutableFieldChanged,
            Self::UnknownVolume(_) => ErrorKind::UnknownVolume,
            Self::DuplicateDevice { .. } => ErrorKind::DuplicateDevice,
            Self::ResourceBusy { .. } => ErrorKind::ResourceBusy,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Upstream { .. } => ErrorKind::UpstreamFailure,
            Self::ReplaceConflict { .. } => ErrorKind::ReplaceConflict,
            Self::TransitionInProgress(_) => ErrorKind::TransitionInProgress,
            Self::InvalidTarget { .. } => ErrorKind::InvalidTarget,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vol() -> VolumeIdentity {
        VolumeIdentity::new("pool1", "vol1")
    }

    #[test]
    fn error_display() {
        let err = VolumeError::NotFound(vol());
        assert_eq!(err.to_string(), "volume /pool1/vol1 not found");

        let err = VolumeError::ResourceBusy {
            volume: vol(),
            devices: vec!["inst1/data".into(), "inst2/data".into()],
        };
        assert_eq!(
            err.to_string(),
            "volume /pool1/vol1 is in use by 2 device(s): inst1/data, inst2/data"
        );

        let err = VolumeError::ReplaceConflict {
            from: vol(),
            to: VolumeIdentity::new("pool2", "vol1"),
        };
        assert_eq!(
            err.to_string(),
            "cannot replace volume /pool1/vol1 with /pool2/vol1: /pool2/vol1 already exists"
        );
    }

    #[test]
    fn upstream_keeps_context() {
        let err = VolumeError::upstream(ApiAction::Update, &vol(), "connection reset");
        assert_eq!(err.kind(), ErrorKind::UpstreamFailure);
        assert_eq!(
            err.to_string(),
            "update of volume /pool1/vol1 failed: connection reset"
        );
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = VolumeError::ImmutableFieldChanged {
            volume: vol(),
            field: "content_type".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: VolumeError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err, de);
        assert_eq!(de.kind(), ErrorKind::ImmutableFieldChanged);
    }
}
