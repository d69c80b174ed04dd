//! The persistent volume claim a group protects.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::resource::{constants, group::ObjectMeta};

/// A persistent volume claim as seen by the controller.
///
/// The claim spec stays an opaque payload; the controller only ever touches
/// `volumeName` and `dataSource` in it and passes the rest through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeClaim {
    /// Object metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// The claim spec, passed through as declared or observed.
    #[serde(default)]
    pub spec: Value,
}

impl VolumeClaim {
    /// Creates a claim owned by this controller.
    ///
    /// # Arguments
    ///
    /// * `namespace` - The namespace to create the claim in.
    /// * `name` - The claim name.
    /// * `spec` - The claim spec.
    /// * `annotations` - Additional annotations; the ownership tag is stamped
    ///   on top of them.
    #[must_use]
    pub fn managed(
        namespace: &str,
        name: &str,
        spec: Value,
        mut annotations: BTreeMap<String, String>,
    ) -> Self {
        let _ = annotations.insert(
            constants::MANAGED_BY_ANNOTATION.to_string(),
            constants::MANAGER_NAME.to_string(),
        );
        Self {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
                annotations,
                resource_version: None,
            },
            spec,
        }
    }

    /// Whether the claim carries this controller's ownership tag.
    #[must_use]
    pub fn managed_by_us(&self) -> bool {
        self.metadata
            .annotations
            .get(constants::MANAGED_BY_ANNOTATION)
            .is_some_and(|manager| manager == constants::MANAGER_NAME)
    }

    /// Points the claim spec at a snapshot to hydrate the volume from.
    pub fn set_data_source(&mut self, snapshot_name: &str) {
        set_data_source(&mut self.spec, snapshot_name);
    }
}

/// Points a claim spec at a snapshot to hydrate the volume from.
pub fn set_data_source(spec: &mut Value, snapshot_name: &str) {
    if !spec.is_object() {
        *spec = json!({});
    }
    if let Some(spec) = spec.as_object_mut() {
        let _ = spec.insert(
            "dataSource".to_string(),
            json!({
                "apiGroup": constants::SNAPSHOT_API_GROUP,
                "kind": "VolumeSnapshot",
                "name": snapshot_name,
            }),
        );
    }
}

/// Removes the bound volume name from a claim spec, so the spec stays usable
/// for provisioning a fresh volume after a restore.
pub fn clear_volume_name(spec: &mut Value) {
    if let Some(spec) = spec.as_object_mut() {
        let _ = spec.remove("volumeName");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn managed_claims_carry_the_ownership_tag() {
        let claim = VolumeClaim::managed("prod", "db", json!({}), BTreeMap::new());
        assert!(claim.managed_by_us());
        assert_eq!(claim.metadata.namespace, "prod");
    }

    #[test]
    fn foreign_claims_are_not_ours() {
        let mut claim = VolumeClaim::managed("prod", "db", json!({}), BTreeMap::new());
        let _ = claim.metadata.annotations.insert(
            constants::MANAGED_BY_ANNOTATION.to_string(),
            "someone-else".to_string(),
        );
        assert!(!claim.managed_by_us());
    }

    #[test]
    fn data_source_points_at_the_snapshot() {
        let mut claim = VolumeClaim::managed(
            "prod",
            "db",
            json!({ "storageClassName": "fast" }),
            BTreeMap::new(),
        );
        claim.set_data_source("db-1710000000");
        assert_eq!(
            claim.spec,
            json!({
                "storageClassName": "fast",
                "dataSource": {
                    "apiGroup": "snapshot.storage.k8s.io",
                    "kind": "VolumeSnapshot",
                    "name": "db-1710000000",
                }
            })
        );
    }

    #[test]
    fn clearing_the_volume_name_leaves_the_rest() {
        let mut spec = json!({ "volumeName": "pv-123", "storageClassName": "fast" });
        clear_volume_name(&mut spec);
        assert_eq!(spec, json!({ "storageClassName": "fast" }));
    }
}
