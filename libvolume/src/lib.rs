//! # libvolume — storage-volume reconciliation for hypervisors
//!
//! `libvolume` converges declaratively described storage volumes against a
//! container/VM hypervisor.  Callers hand it a desired [`VolumeSpec`]; the
//! engine works out which API calls bring the live volume in line, issues
//! them through a [`VolumeApi`] implementation and keeps track of which
//! instance devices reference which volume.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`identity`] | [`VolumeIdentity`] and its `project/pool/name/target` string codec. |
//! | [`types`] | Data model: `VolumeSpec`, `VolumeType`, `ContentType`, `VolumePatch`. |
//! | [`error`] | [`VolumeError`] enum covering all failure modes. |
//! | [`reconcile`] | Field classification table and desired-vs-observed diff. |
//! | [`attachment`] | [`AttachmentManager`] — volume ↔ instance device references. |
//! | [`lifecycle`] | [`ReconcileEngine`] — create, read, update, delete, import. |
//! | [`scope`] | Project and cluster-target scoping of API requests. |
//! | [`client`] | [`VolumeApi`] trait and the explicit [`ServerContext`] handle. |
//! | [`config`] | [`EngineConfig`] loaded from the environment or JSON. |
//! | [`backend`] | In-memory `VolumeApi` implementation. |

pub mod attachment;
pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod reconcile;
pub mod scope;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use attachment::{AttachmentManager, AttachmentRef, InstanceDevice};
pub use client::{ApiAction, ServerContext, VolumeApi};
pub use config::EngineConfig;
pub use error::{ErrorKind, VolumeError};
pub use identity::VolumeIdentity;
pub use lifecycle::{ReconcileEngine, VolumeState};
pub use reconcile::{Action, ReconcileResult};
pub use scope::RequestScope;
pub use types::*;
