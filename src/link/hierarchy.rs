//! Hub, device and feature-set hierarchy
//!
//! A [`HierarchySnapshot`] is the result of one successful hierarchy fetch. It
//! is only consumed transiently (hub registration and reconciliation) and is
//! never persisted.
//!
//! Snapshots are assembled with [`HierarchyBuilder`]. Only
//! [`HierarchyBuilder::finish`] produces a *complete* snapshot; reconciliation
//! refuses anything else, so a fetch that was interrupted half-way can never
//! cause registry records to be pruned. The completeness and empty-confirmed
//! markers are never serialized; a deserialized snapshot is always partial.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A Link Plus hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hub {
    pub id: String,
    pub name: String,
    pub product_code: Option<String>,
    /// Name of the structure (home) the hub belongs to.
    pub structure: Option<String>,
}

impl Hub {
    /// Name used for the hub's device record: `"{hub} {structure}"` when the
    /// structure is known.
    ///
    /// # Examples
    ///
    /// ```
    /// use lightwave_smart::link::hierarchy::Hub;
    ///
    /// let hub = Hub {
    ///     id: "hub-1".to_string(),
    ///     name: "Link Plus".to_string(),
    ///     product_code: Some("L2".to_string()),
    ///     structure: Some("Home".to_string()),
    /// };
    /// assert_eq!(hub.display_name(), "Link Plus Home");
    /// ```
    pub fn display_name(&self) -> String {
        match self.structure.as_deref().filter(|s| !s.is_empty()) {
            Some(structure) => format!("{} {}", self.name, structure),
            None => self.name.clone(),
        }
    }
}

/// A physical device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub product_code: String,
    /// Second-generation hardware.
    pub gen2: bool,
    /// Hub the device is paired with.
    pub link: Option<String>,
}

/// A group of features (switch, dimmer, sensor...) belonging to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub id: String,
    pub device_id: String,
    pub name: String,
}

/// Everything one hierarchy fetch returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchySnapshot {
    hubs: BTreeMap<String, Hub>,
    devices: BTreeMap<String, Device>,
    featuresets: BTreeMap<String, FeatureSet>,
    /// Feature-sets reported without their device. Not exposed as
    /// feature-sets, but their identifiers still count as present.
    #[serde(default)]
    orphans: BTreeSet<String>,
    #[serde(skip)]
    complete: bool,
    #[serde(skip)]
    empty_confirmed: bool,
}

impl HierarchySnapshot {
    pub fn hubs(&self) -> impl Iterator<Item = &Hub> {
        self.hubs.values()
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn featuresets(&self) -> impl Iterator<Item = &FeatureSet> {
        self.featuresets.values()
    }

    /// Whether `identifier` was reported by the fetch, as a hub, device or
    /// feature-set (orphaned feature-sets included).
    pub fn contains(&self, identifier: &str) -> bool {
        self.hubs.contains_key(identifier)
            || self.devices.contains_key(identifier)
            || self.featuresets.contains_key(identifier)
            || self.orphans.contains(identifier)
    }

    /// Every identifier in the snapshot.
    pub fn identifiers(&self) -> BTreeSet<&str> {
        self.hubs
            .keys()
            .chain(self.devices.keys())
            .chain(self.featuresets.keys())
            .chain(self.orphans.iter())
            .map(String::as_str)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
            && self.devices.is_empty()
            && self.featuresets.is_empty()
            && self.orphans.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Marks an empty snapshot as a deliberate "nothing left" answer, which
    /// allows reconciliation to prune every record.
    pub fn confirm_empty(mut self) -> Self {
        self.empty_confirmed = true;
        self
    }

    pub fn is_empty_confirmed(&self) -> bool {
        self.empty_confirmed
    }
}

/// Incrementally assembles a [`HierarchySnapshot`].
///
/// # Examples
///
/// ```
/// use lightwave_smart::link::hierarchy::{Device, FeatureSet, HierarchyBuilder};
///
/// let snapshot = HierarchyBuilder::new()
///     .device(Device {
///         id: "dev-1".to_string(),
///         name: "Kitchen".to_string(),
///         product_code: "L21".to_string(),
///         gen2: true,
///         link: None,
///     })
///     .featureset(FeatureSet {
///         id: "fs-1".to_string(),
///         device_id: "dev-1".to_string(),
///         name: "Kitchen light".to_string(),
///     })
///     .finish();
///
/// assert!(snapshot.is_complete());
/// assert!(snapshot.contains("fs-1"));
/// ```
#[derive(Debug, Default)]
pub struct HierarchyBuilder {
    snapshot: HierarchySnapshot,
}

impl HierarchyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hub(mut self, hub: Hub) -> Self {
        self.snapshot.hubs.insert(hub.id.clone(), hub);
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.snapshot.devices.insert(device.id.clone(), device);
        self
    }

    pub fn featureset(mut self, featureset: FeatureSet) -> Self {
        self.snapshot
            .featuresets
            .insert(featureset.id.clone(), featureset);
        self
    }

    /// Completes the snapshot.
    ///
    /// Feature-sets whose device is unknown are set aside as orphans (their
    /// identifiers stay present) and device links to unknown hubs are
    /// cleared, both with a warning.
    pub fn finish(mut self) -> HierarchySnapshot {
        let devices = &self.snapshot.devices;
        let orphans = &mut self.snapshot.orphans;
        self.snapshot.featuresets.retain(|id, fs| {
            let known = devices.contains_key(&fs.device_id);
            if !known {
                tracing::warn!("Feature-set {} belongs to unknown device {}", id, fs.device_id);
                orphans.insert(id.clone());
            }
            known
        });

        let hubs = &self.snapshot.hubs;
        for device in self.snapshot.devices.values_mut() {
            if let Some(link) = device.link.as_deref() {
                if !hubs.contains_key(link) {
                    tracing::warn!("Device {} links to unknown hub {}", device.id, link);
                    device.link = None;
                }
            }
        }

        self.snapshot.complete = true;
        self.snapshot
    }

    /// Returns what has been assembled so far without completing it.
    pub fn partial(self) -> HierarchySnapshot {
        self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, link: Option<&str>) -> Device {
        Device {
            id: id.to_string(),
            name: id.to_string(),
            product_code: "L21".to_string(),
            gen2: true,
            link: link.map(str::to_string),
        }
    }

    fn hub(id: &str, structure: Option<&str>) -> Hub {
        Hub {
            id: id.to_string(),
            name: "Link Plus".to_string(),
            product_code: Some("L2".to_string()),
            structure: structure.map(str::to_string),
        }
    }

    #[test]
    fn test_hub_display_name_without_structure() {
        assert_eq!(hub("h", None).display_name(), "Link Plus");
        assert_eq!(hub("h", Some("")).display_name(), "Link Plus");
    }

    #[test]
    fn test_finish_keeps_orphan_identifiers_present() {
        let snapshot = HierarchyBuilder::new()
            .device(device("d1", None))
            .featureset(FeatureSet {
                id: "fs-orphan".to_string(),
                device_id: "missing".to_string(),
                name: "x".to_string(),
            })
            .finish();

        assert_eq!(snapshot.featuresets().count(), 0);
        assert!(snapshot.contains("fs-orphan"));
        assert!(snapshot.identifiers().contains("fs-orphan"));
        assert!(snapshot.contains("d1"));
    }

    #[test]
    fn test_orphans_alone_are_not_empty() {
        let snapshot = HierarchyBuilder::new()
            .featureset(FeatureSet {
                id: "fs-orphan".to_string(),
                device_id: "missing".to_string(),
                name: "x".to_string(),
            })
            .finish();

        assert!(!snapshot.is_empty());
    }

    #[test]
    fn test_deserialized_snapshot_is_partial() {
        let finished = HierarchyBuilder::new()
            .device(device("d1", None))
            .finish()
            .confirm_empty();
        let value = serde_json::to_value(&finished).unwrap();
        assert!(value.get("complete").is_none());

        let restored: HierarchySnapshot = serde_json::from_value(value).unwrap();
        assert!(restored.contains("d1"));
        assert!(!restored.is_complete());
        assert!(!restored.is_empty_confirmed());

        let forged: HierarchySnapshot =
            serde_json::from_value(serde_json::json!({
                "hubs": {}, "devices": {}, "featuresets": {},
                "complete": true, "empty_confirmed": true
            }))
            .unwrap();
        assert!(!forged.is_complete());
        assert!(!forged.is_empty_confirmed());
    }

    #[test]
    fn test_finish_clears_unknown_links() {
        let snapshot = HierarchyBuilder::new()
            .hub(hub("h1", None))
            .device(device("d1", Some("h1")))
            .device(device("d2", Some("gone")))
            .finish();

        let links: Vec<_> = snapshot.devices().map(|d| d.link.clone()).collect();
        assert_eq!(links, vec![Some("h1".to_string()), None]);
    }

    #[test]
    fn test_partial_is_not_complete() {
        let snapshot = HierarchyBuilder::new().device(device("d1", None)).partial();
        assert!(!snapshot.is_complete());
    }

    #[test]
    fn test_identifiers_cover_all_levels() {
        let snapshot = HierarchyBuilder::new()
            .hub(hub("h1", None))
            .device(device("d1", Some("h1")))
            .featureset(FeatureSet {
                id: "fs1".to_string(),
                device_id: "d1".to_string(),
                name: "x".to_string(),
            })
            .finish();

        assert_eq!(
            snapshot.identifiers(),
            BTreeSet::from(["h1", "d1", "fs1"])
        );
    }

    #[test]
    fn test_confirm_empty() {
        let snapshot = HierarchyBuilder::new().finish();
        assert!(snapshot.is_empty());
        assert!(!snapshot.is_empty_confirmed());
        assert!(snapshot.confirm_empty().is_empty_confirmed());
    }
}
