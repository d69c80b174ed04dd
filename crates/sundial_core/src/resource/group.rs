//! The `SnapshotGroup` custom resource.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::resource::constants;

/// Object identity and annotations, the subset of platform metadata the
/// controller works with.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name, unique within a namespace.
    #[serde(default)]
    pub name: String,

    /// Namespace the object lives in.
    #[serde(default)]
    pub namespace: String,

    /// Free-form string annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Platform-assigned version, echoed back on updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// A user-declared intent object pairing a volume claim with a retention
/// policy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotGroup {
    /// Object metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// The declared intent.
    #[serde(default)]
    pub spec: SnapshotGroupSpec,
}

/// Spec of a [`SnapshotGroup`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotGroupSpec {
    /// The volume claim to protect, either referenced by name or embedded as
    /// a spec to provision.
    #[serde(default, rename = "persistentVolumeClaim")]
    pub claim: VolumeClaimRef,

    /// The retention policy, one entry per interval.
    #[serde(default)]
    pub schedule: Vec<SnapshotSchedule>,

    /// Template applied to the spec of every snapshot created for this group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<SnapshotTemplate>,
}

/// Reference to the volume claim a group protects.
///
/// Exactly one of `claim_name` and `spec` is meaningful: a name adopts an
/// existing claim, a spec provisions one under the group's own name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimRef {
    /// Name of a pre-existing claim to protect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,

    /// Claim spec to provision when no existing claim is named.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_json::Value>,
}

/// One retention rule: snapshot every `every`, keep the last `keep` of them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSchedule {
    /// Interval string, see [`crate::interval::parse_interval`].
    #[serde(default)]
    pub every: String,

    /// How many snapshots of this interval to retain.
    #[serde(default)]
    pub keep: u32,
}

/// Snapshot spec template carried by the group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotTemplate {
    /// Spec fields merged into every snapshot created for the group.
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl SnapshotGroup {
    /// Returns the group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Returns the group namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Returns the name of the claim this group protects, falling back to the
    /// group's own name when the spec does not reference one.
    #[must_use]
    pub fn claim_name(&self) -> &str {
        self.spec
            .claim
            .claim_name
            .as_deref()
            .unwrap_or(&self.metadata.name)
    }

    /// Whether the spec references a pre-existing claim by name.
    #[must_use]
    pub fn names_existing_claim(&self) -> bool {
        self.spec.claim.claim_name.is_some()
    }

    /// Returns the requested restore point, if a non-empty restore annotation
    /// is present.
    #[must_use]
    pub fn restore_target(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(constants::RESTORE_ANNOTATION)
            .map(String::as_str)
            .filter(|target| !target.is_empty())
    }
}
