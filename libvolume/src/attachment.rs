//! Volume-to-instance device attachments.
//!
//! An instance owns its device blocks; a volume never owns the devices that
//! point at it.  [`AttachmentManager`] only keeps non-owning
//! [`AttachmentRef`]s, looked up by volume identity and by
//! `(instance, device_name)`, so it can validate references and tell the
//! lifecycle engine whether a volume is still in use.  It never touches
//! instance state: the only thing it hands to the instance side is the disk
//! device property map built by [`AttachmentRef::properties`].

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::VolumeError;
use crate::identity::VolumeIdentity;

/// Device type of a storage volume attached to an instance.
pub const DISK_DEVICE: &str = "disk";

/// A named reference from an instance device to a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentRef {
    pub volume: VolumeIdentity,
    pub device_name: String,
    pub instance: String,
    /// Mount point inside the instance, e.g. `/mnt`.
    pub mount_path: String,
}

impl AttachmentRef {
    pub fn new(
        volume: VolumeIdentity,
        instance: impl Into<String>,
        device_name: impl Into<String>,
        mount_path: impl Into<String>,
    ) -> Self {
        Self {
            volume,
            device_name: device_name.into(),
            instance: instance.into(),
            mount_path: mount_path.into(),
        }
    }

    /// Device property payload consumed by the instance's device config.
    pub fn properties(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("path".to_owned(), self.mount_path.clone()),
            ("pool".to_owned(), self.volume.pool.clone()),
            ("source".to_owned(), self.volume.name.clone()),
        ])
    }

    /// The full `disk` device block for this reference.
    pub fn device_block(&self) -> InstanceDevice {
        InstanceDevice {
            name: self.device_name.clone(),
            device_type: DISK_DEVICE.to_owned(),
            properties: self.properties(),
        }
    }

    fn slot(&self) -> String {
        format!("{}/{}", self.instance, self.device_name)
    }
}

/// A device block as carried by an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceDevice {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

type DeviceSlots = BTreeMap<String, AttachmentRef>;

/// Registry of tracked volumes and the device references pointing at them.
///
/// # Thread safety
///
/// Volumes and instances live in concurrent maps.  Each instance's device
/// slots sit behind their own mutex, so the `(instance, device_name)`
/// uniqueness check of [`attach`](Self::attach) is atomic per instance while
/// attaches to different instances proceed in parallel.
#[derive(Debug, Default)]
pub struct AttachmentManager {
    volumes: DashSet<VolumeIdentity>,
    instances: DashMap<String, Arc<Mutex<DeviceSlots>>>,
}

impl AttachmentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a volume so it can be attached.
    pub fn track(&self, volume: &VolumeIdentity) {
        self.volumes.insert(volume.clone());
    }

    /// Stop tracking a volume.  Existing references are not touched, but no
    /// new ones can be added until the volume is tracked again.
    pub fn untrack(&self, volume: &VolumeIdentity) {
        self.volumes.remove(volume);
    }

    pub fn is_tracked(&self, volume: &VolumeIdentity) -> bool {
        self.volumes.contains(volume)
    }

    fn slots(&self, instance: &str) -> Arc<Mutex<DeviceSlots>> {
        // Clone the Arc out so the map shard is not held while locking.
        Arc::clone(self.instances.entry(instance.to_owned()).or_default().value())
    }

    fn all_slots(&self) -> Vec<Arc<Mutex<DeviceSlots>>> {
        self.instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Record that `attachment.instance` mounts `attachment.volume` as device
    /// `attachment.device_name`.
    ///
    /// Attaching the same volume to the same slot again succeeds and updates
    /// the mount path.
    pub fn attach(&self, attachment: AttachmentRef) -> Result<(), VolumeError> {
        if attachment.instance.is_empty() || attachment.device_name.is_empty() {
            return Err(VolumeError::InvalidArgument(
                "instance and device name must not be empty".into(),
            ));
        }
        if !self.is_tracked(&attachment.volume) {
            return Err(VolumeError::UnknownVolume(attachment.volume));
        }

        let slots = self.slots(&attachment.instance);
        let mut slots = slots.lock();
        // Checked again under the slot lock so an attach cannot interleave
        // with the untrack-then-scan of a delete.
        if !self.is_tracked(&attachment.volume) {
            return Err(VolumeError::UnknownVolume(attachment.volume));
        }
        if let Some(existing) = slots.get(&attachment.device_name)
            && existing.volume != attachment.volume
        {
            return Err(VolumeError::DuplicateDevice {
                instance: attachment.instance,
                device: attachment.device_name,
                attached: existing.volume.clone(),
            });
        }

        info!(
            volume = %attachment.volume,
            slot = %attachment.slot(),
            path = %attachment.mount_path,
            "volume attached",
        );
        slots.insert(attachment.device_name.clone(), attachment);
        Ok(())
    }

    /// Attach from an instance's `disk` device block.
    ///
    /// The volume is looked up by the instance's project and the device's
    /// `pool` and `source` properties among tracked volumes; a tracked volume
    /// pinned to a cluster target matches regardless of its target.  The
    /// device block carries no target, so several tracked volumes differing
    /// only by target are rejected as ambiguous.
    pub fn attach_device(
        &self,
        instance: &str,
        project: &str,
        device: &InstanceDevice,
    ) -> Result<AttachmentRef, VolumeError> {
        if device.device_type != DISK_DEVICE {
            return Err(VolumeError::InvalidArgument(format!(
                "device {} has type {:?}, expected {DISK_DEVICE:?}",
                device.name, device.device_type
            )));
        }
        let property = |key: &str| {
            device
                .properties
                .get(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    VolumeError::InvalidArgument(format!(
                        "device {} is missing property {key:?}",
                        device.name
                    ))
                })
        };
        let pool = property("pool")?;
        let source = property("source")?;
        let path = property("path")?;

        let wanted = VolumeIdentity::new(pool.as_str(), source.as_str()).with_project(project);
        let mut matches: Vec<VolumeIdentity> = self
            .volumes
            .iter()
            .filter(|v| v.project == wanted.project && v.pool == wanted.pool && v.name == wanted.name)
            .map(|v| v.key().clone())
            .collect();
        if matches.len() > 1 {
            matches.sort();
            let candidates: Vec<String> = matches.iter().map(ToString::to_string).collect();
            return Err(VolumeError::InvalidArgument(format!(
                "device {} matches several volumes on different targets: {}",
                device.name,
                candidates.join(", ")
            )));
        }
        let volume = matches.pop().unwrap_or(wanted);

        let attachment = AttachmentRef::new(volume, instance, device.name.as_str(), path.as_str());
        self.attach(attachment.clone())?;
        Ok(attachment)
    }

    /// Remove the reference held by `(instance, device_name)`.
    ///
    /// Idempotent: an absent reference is not an error and returns `None`.
    pub fn detach(&self, instance: &str, device_name: &str) -> Option<AttachmentRef> {
        let slots = self.instances.get(instance).map(|e| Arc::clone(e.value()))?;
        let removed = slots.lock().remove(device_name);
        drop(slots);

        // Drop the instance entry once it is empty and nobody else holds it.
        self.instances.remove_if(instance, |_, s| {
            Arc::strong_count(s) == 1 && s.lock().is_empty()
        });

        match &removed {
            Some(attachment) => {
                info!(volume = %attachment.volume, slot = %attachment.slot(), "volume detached")
            }
            None => debug!(%instance, %device_name, "nothing attached, detach is a no-op"),
        }
        removed
    }

    /// Remove every reference to `volume`.
    pub fn detach_volume(&self, volume: &VolumeIdentity) -> Vec<AttachmentRef> {
        let mut removed = Vec::new();
        for slots in self.all_slots() {
            slots.lock().retain(|_, attachment| {
                if &attachment.volume == volume {
                    removed.push(attachment.clone());
                    false
                } else {
                    true
                }
            });
        }
        for attachment in &removed {
            info!(volume = %attachment.volume, slot = %attachment.slot(), "volume detached");
        }
        removed
    }

    /// All references pointing at `volume`, ordered by instance and device.
    pub fn attachments_for(&self, volume: &VolumeIdentity) -> Vec<AttachmentRef> {
        let mut found: Vec<AttachmentRef> = self
            .all_slots()
            .iter()
            .flat_map(|slots| {
                slots
                    .lock()
                    .values()
                    .filter(|a| &a.volume == volume)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        found.sort_by(|a, b| (&a.instance, &a.device_name).cmp(&(&b.instance, &b.device_name)));
        found
    }

    pub fn is_attached(&self, volume: &VolumeIdentity) -> bool {
        self.all_slots()
            .iter()
            .any(|slots| slots.lock().values().any(|a| &a.volume == volume))
    }

    /// Device property map for `attachment`, after checking that the volume
    /// it points at is tracked.
    pub fn resolve(
        &self,
        attachment: &AttachmentRef,
    ) -> Result<BTreeMap<String, String>, VolumeError> {
        if !self.is_tracked(&attachment.volume) {
            return Err(VolumeError::UnknownVolume(attachment.volume.clone()));
        }
        Ok(attachment.properties())
    }

    /// Disk device blocks currently recorded for `instance`, by device name.
    pub fn devices(&self, instance: &str) -> Vec<InstanceDevice> {
        let Some(slots) = self.instances.get(instance).map(|e| Arc::clone(e.value())) else {
            return Vec::new();
        };
        let slots = slots.lock();
        slots.values().map(AttachmentRef::device_block).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn vol(name: &str) -> VolumeIdentity {
        VolumeIdentity::new("pool1", name)
    }

    fn manager_with(volumes: &[&str]) -> AttachmentManager {
        let mgr = AttachmentManager::new();
        for name in volumes {
            mgr.track(&vol(name));
        }
        mgr
    }

    #[test]
    fn resolve_property_map() {
        let mgr = manager_with(&["vol1"]);
        let attachment = AttachmentRef::new(vol("vol1"), "inst1", "data", "/mnt");
        mgr.attach(attachment.clone()).unwrap();

        let props = mgr.resolve(&attachment).unwrap();
        assert_eq!(
            props,
            BTreeMap::from([
                ("path".to_owned(), "/mnt".to_owned()),
                ("pool".to_owned(), "pool1".to_owned()),
                ("source".to_owned(), "vol1".to_owned()),
            ])
        );

        let devices = mgr.devices("inst1");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "data");
        assert_eq!(devices[0].device_type, "disk");
        assert_eq!(devices[0].properties, props);
    }

    #[test]
    fn unknown_volume_rejected() {
        let mgr = manager_with(&[]);
        let err = mgr
            .attach(AttachmentRef::new(vol("vol1"), "inst1", "data", "/mnt"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownVolume);
        assert!(mgr.resolve(&AttachmentRef::new(vol("vol1"), "i", "d", "/")).is_err());
    }

    #[test]
    fn duplicate_device_rejected() {
        let mgr = manager_with(&["vol1", "vol2"]);
        mgr.attach(AttachmentRef::new(vol("vol1"), "inst1", "data", "/mnt"))
            .unwrap();
        let err = mgr
            .attach(AttachmentRef::new(vol("vol2"), "inst1", "data", "/mnt"))
            .unwrap_err();
        assert!(matches!(
            err,
            VolumeError::DuplicateDevice { ref attached, .. } if attached == &vol("vol1")
        ));

        // Same device name on another instance is a different slot.
        mgr.attach(AttachmentRef::new(vol("vol2"), "inst2", "data", "/mnt"))
            .unwrap();
    }

    #[test]
    fn reattach_same_volume_updates_path() {
        let mgr = manager_with(&["vol1"]);
        mgr.attach(AttachmentRef::new(vol("vol1"), "inst1", "data", "/mnt"))
            .unwrap();
        mgr.attach(AttachmentRef::new(vol("vol1"), "inst1", "data", "/srv"))
            .unwrap();
        let attached = mgr.attachments_for(&vol("vol1"));
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].mount_path, "/srv");
    }

    #[test]
    fn detach_is_idempotent() {
        let mgr = manager_with(&["vol1"]);
        mgr.attach(AttachmentRef::new(vol("vol1"), "inst1", "data", "/mnt"))
            .unwrap();

        assert!(mgr.detach("inst1", "data").is_some());
        assert!(!mgr.is_attached(&vol("vol1")));
        assert!(mgr.detach("inst1", "data").is_none());
        assert!(mgr.detach("never-seen", "data").is_none());
        assert!(!mgr.is_attached(&vol("vol1")));
        assert!(mgr.devices("inst1").is_empty());
    }

    #[test]
    fn detach_volume_drops_every_reference() {
        let mgr = manager_with(&["vol1", "vol2"]);
        mgr.attach(AttachmentRef::new(vol("vol1"), "inst1", "a", "/a"))
            .unwrap();
        mgr.attach(AttachmentRef::new(vol("vol1"), "inst2", "b", "/b"))
            .unwrap();
        mgr.attach(AttachmentRef::new(vol("vol2"), "inst1", "c", "/c"))
            .unwrap();

        let removed = mgr.detach_volume(&vol("vol1"));
        assert_eq!(removed.len(), 2);
        assert!(!mgr.is_attached(&vol("vol1")));
        assert!(mgr.is_attached(&vol("vol2")));
    }

    #[test]
    fn attach_from_device_block() {
        let mgr = AttachmentManager::new();
        let targeted = VolumeIdentity::new("pool1", "vol1")
            .with_project("proj")
            .with_target("node-2");
        mgr.track(&targeted);

        let device = InstanceDevice {
            name: "volume1".into(),
            device_type: "disk".into(),
            properties: BTreeMap::from([
                ("path".into(), "/mnt".into()),
                ("pool".into(), "pool1".into()),
                ("source".into(), "vol1".into()),
            ]),
        };
        let attachment = mgr.attach_device("inst1", "proj", &device).unwrap();
        assert_eq!(attachment.volume, targeted);
        assert_eq!(attachment.properties(), device.properties);

        // Wrong project does not resolve.
        let err = mgr.attach_device("inst2", "other", &device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownVolume);

        let nic = InstanceDevice {
            device_type: "nic".into(),
            ..device
        };
        assert_eq!(
            mgr.attach_device("inst1", "proj", &nic).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn device_block_matching_several_targets_is_ambiguous() {
        let mgr = AttachmentManager::new();
        for node in ["node-1", "node-2"] {
            mgr.track(&VolumeIdentity::new("pool1", "vol1").with_target(node));
        }
        let device = InstanceDevice {
            name: "data".into(),
            device_type: "disk".into(),
            properties: BTreeMap::from([
                ("path".into(), "/mnt".into()),
                ("pool".into(), "pool1".into()),
                ("source".into(), "vol1".into()),
            ]),
        };

        let err = mgr.attach_device("inst1", "default", &device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("/pool1/vol1/node-1"));
        assert!(err.to_string().contains("/pool1/vol1/node-2"));
        assert!(mgr.devices("inst1").is_empty());

        mgr.untrack(&VolumeIdentity::new("pool1", "vol1").with_target("node-1"));
        let attachment = mgr.attach_device("inst1", "default", &device).unwrap();
        assert_eq!(attachment.volume.target.as_deref(), Some("node-2"));
    }

    #[test]
    fn attach_after_untrack_is_unknown() {
        let mgr = manager_with(&["vol1"]);
        mgr.untrack(&vol("vol1"));
        let err = mgr
            .attach(AttachmentRef::new(vol("vol1"), "inst1", "data", "/mnt"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownVolume);
        assert!(mgr.devices("inst1").is_empty());
    }

    #[test]
    fn concurrent_attaches_to_one_slot() {
        let names: Vec<String> = (0..16).map(|i| format!("vol{i}")).collect();
        let mgr = AttachmentManager::new();
        for name in &names {
            mgr.track(&vol(name));
        }

        let successes = std::thread::scope(|s| {
            let handles: Vec<_> = names
                .iter()
                .map(|name| {
                    let mgr = &mgr;
                    s.spawn(move || {
                        mgr.attach(AttachmentRef::new(vol(name), "inst1", "data", "/mnt"))
                            .is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });
        assert_eq!(successes, 1);
        assert_eq!(mgr.devices("inst1").len(), 1);
    }
}
