//! Snapshots as this controller sees them, and the codec that moves them
//! across the platform boundary.
//!
//! The platform's snapshot API has several versions with subtly different
//! field layouts, so snapshot payloads cross the boundary as structured
//! JSON and are translated here; nothing outside this module inspects the
//! raw payload.

use std::{cmp::Ordering, collections::BTreeMap};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::{
    error::{ErrorKind, SundialError, SundialResult},
    resource::{constants, group::SnapshotGroup},
};

/// The snapshot API version spoken by the platform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde_derive::Serialize, serde_derive::Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum SnapshotApiVersion {
    /// The alpha API, which references the claim through a generic
    /// `{name, kind}` source object.
    #[cfg_attr(feature = "clap", value(name = "v1alpha1"))]
    V1Alpha1,

    /// The beta API, which references the claim through
    /// `persistentVolumeClaimName`.
    #[default]
    #[cfg_attr(feature = "clap", value(name = "v1beta1"))]
    V1Beta1,
}

impl SnapshotApiVersion {
    /// Returns the `apiVersion` value for snapshot payloads.
    #[must_use]
    pub fn api_version(self) -> &'static str {
        match self {
            Self::V1Alpha1 => "snapshot.storage.k8s.io/v1alpha1",
            Self::V1Beta1 => "snapshot.storage.k8s.io/v1beta1",
        }
    }

    /// Returns the bare version string, as used in API paths.
    #[must_use]
    pub fn version(self) -> &'static str {
        match self {
            Self::V1Alpha1 => "v1alpha1",
            Self::V1Beta1 => "v1beta1",
        }
    }
}

/// A snapshot owned by this controller, parsed out of its annotations.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupSnapshot {
    /// Namespace of the snapshot.
    pub namespace: String,

    /// Name of the snapshot, `<group>-<unix-seconds>`.
    pub name: String,

    /// The `SnapshotGroup` this snapshot belongs to.
    pub group: String,

    /// Creation time at the controller's clock.
    pub timestamp: DateTime<Utc>,

    /// The interval buckets this snapshot currently satisfies.
    pub intervals: Vec<String>,

    /// The restore point this snapshot was taken as a failsafe for, if any.
    pub restore: Option<String>,

    /// The raw platform payload the snapshot was parsed from.
    pub handle: Value,
}

impl GroupSnapshot {
    /// Whether this snapshot exists only as a restore failsafe and plays no
    /// part in retention.
    #[must_use]
    pub fn is_restore_only(&self) -> bool {
        self.restore.is_some() && self.intervals.is_empty()
    }

    /// Ordering used everywhere snapshots are listed: newest first, ties
    /// broken by name.
    #[must_use]
    pub fn listing_order(a: &Self, b: &Self) -> Ordering {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.name.cmp(&b.name))
    }
}

fn annotations_of(payload: &Value) -> Option<&Map<String, Value>> {
    payload
        .get("metadata")?
        .get("annotations")?
        .as_object()
}

fn annotation<'p>(annotations: &'p Map<String, Value>, key: &str) -> Option<&'p str> {
    annotations.get(key).and_then(Value::as_str)
}

/// Composes the source object binding a snapshot to its claim.
///
/// The alpha API uses a generic object reference here instead of the named
/// claim field; this shape difference is the whole reason payloads stay
/// untyped at the boundary.
fn claim_source(version: SnapshotApiVersion, claim_name: &str) -> Value {
    match version {
        SnapshotApiVersion::V1Alpha1 => json!({
            "name": claim_name,
            "kind": "PersistentVolumeClaim",
        }),
        SnapshotApiVersion::V1Beta1 => json!({
            "persistentVolumeClaimName": claim_name,
        }),
    }
}

/// Builds the platform payload for a new snapshot of the given group.
///
/// The spec starts from the group's snapshot template and gets its source
/// bound to the group's claim; annotations are written as passed.
///
/// # Arguments
///
/// * `version` - The snapshot API version to encode for.
/// * `group` - The group the snapshot belongs to.
/// * `name` - The snapshot name.
/// * `annotations` - The full annotation set to write.
#[must_use]
pub fn encode_snapshot(
    version: SnapshotApiVersion,
    group: &SnapshotGroup,
    name: &str,
    annotations: &BTreeMap<String, String>,
) -> Value {
    let mut spec = group
        .spec
        .template
        .as_ref()
        .map(|template| template.spec.clone())
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({}));

    if let Some(spec) = spec.as_object_mut() {
        let _ = spec.insert("source".to_string(), claim_source(version, group.claim_name()));
    }

    json!({
        "apiVersion": version.api_version(),
        "kind": "VolumeSnapshot",
        "metadata": {
            "namespace": group.namespace(),
            "name": name,
            "annotations": annotations,
        },
        "spec": spec,
    })
}

/// Parses a platform snapshot payload into the controller's view of it.
///
/// Returns `None` for snapshots this controller does not own (missing or
/// foreign ownership tag, or no group back-reference). Returns an error for
/// owned snapshots whose timestamp annotation cannot be parsed; those are
/// skipped by callers, never deleted.
pub fn decode_snapshot(payload: &Value) -> Option<SundialResult<GroupSnapshot>> {
    let annotations = annotations_of(payload)?;

    if annotation(annotations, constants::MANAGED_BY_ANNOTATION) != Some(constants::MANAGER_NAME) {
        return None;
    }
    let group = annotation(annotations, constants::GROUP_ANNOTATION)?.to_string();

    let metadata = payload.get("metadata")?;
    let name = metadata.get("name").and_then(Value::as_str)?.to_string();
    let namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let timestamp = annotation(annotations, constants::TIMESTAMP_ANNOTATION).unwrap_or_default();
    let timestamp = match timestamp
        .parse::<i64>()
        .ok()
        .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
    {
        Some(timestamp) => timestamp,
        None => {
            return Some(Err(SundialError::new(
                ErrorKind::InvalidInput,
                "Snapshot carries an unparseable timestamp annotation.",
            )
            .attach_context("snapshot", name)
            .attach_context("timestamp", timestamp)))
        }
    };

    let intervals = annotation(annotations, constants::INTERVALS_ANNOTATION)
        .unwrap_or_default()
        .split(constants::INTERVALS_SEPARATOR)
        .filter(|interval| !interval.is_empty())
        .map(ToString::to_string)
        .collect();

    let restore = annotation(annotations, constants::RESTORE_ANNOTATION)
        .filter(|restore| !restore.is_empty())
        .map(ToString::to_string);

    Some(Ok(GroupSnapshot {
        namespace,
        name,
        group,
        timestamp,
        intervals,
        restore,
        handle: payload.clone(),
    }))
}

/// Whether the platform has marked a snapshot payload ready to use.
#[must_use]
pub fn snapshot_ready(payload: &Value) -> bool {
    payload
        .get("status")
        .and_then(|status| status.get("readyToUse"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Best-effort name of a payload, for log lines about undecodable snapshots.
#[must_use]
pub fn payload_name(payload: &Value) -> &str {
    payload
        .get("metadata")
        .and_then(|metadata| metadata.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("<unnamed>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn group() -> SnapshotGroup {
        serde_json::from_value(json!({
            "metadata": { "name": "db", "namespace": "prod" },
            "spec": {
                "persistentVolumeClaim": { "spec": {} },
                "schedule": [ { "every": "hour", "keep": 2 } ],
                "template": { "spec": { "volumeSnapshotClassName": "csi" } }
            }
        }))
        .unwrap()
    }

    fn annotations(timestamp: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (constants::MANAGED_BY_ANNOTATION.into(), constants::MANAGER_NAME.into()),
            (constants::GROUP_ANNOTATION.into(), "db".into()),
            (constants::TIMESTAMP_ANNOTATION.into(), timestamp.into()),
            (constants::INTERVALS_ANNOTATION.into(), "hour, day".into()),
        ])
    }

    #[test]
    fn round_trips_through_the_payload() {
        let payload = encode_snapshot(
            SnapshotApiVersion::V1Beta1,
            &group(),
            "db-1710000000",
            &annotations("1710000000"),
        );
        let snapshot = decode_snapshot(&payload).unwrap().unwrap();

        assert_eq!(snapshot.name, "db-1710000000");
        assert_eq!(snapshot.namespace, "prod");
        assert_eq!(snapshot.group, "db");
        assert_eq!(snapshot.timestamp.timestamp(), 1_710_000_000);
        assert_eq!(snapshot.intervals, vec!["hour".to_string(), "day".to_string()]);
        assert_eq!(snapshot.restore, None);
        assert!(!snapshot.is_restore_only());
    }

    #[rstest]
    #[case(SnapshotApiVersion::V1Beta1, json!({ "persistentVolumeClaimName": "db" }))]
    #[case(
        SnapshotApiVersion::V1Alpha1,
        json!({ "name": "db", "kind": "PersistentVolumeClaim" })
    )]
    fn binds_the_source_per_api_version(#[case] version: SnapshotApiVersion, #[case] source: Value) {
        let payload = encode_snapshot(version, &group(), "db-1", &annotations("1"));
        assert_eq!(payload["spec"]["source"], source);
        assert_eq!(payload["apiVersion"], version.api_version());
        // the template spec survives alongside the source
        assert_eq!(payload["spec"]["volumeSnapshotClassName"], "csi");
    }

    #[test]
    fn foreign_snapshots_are_invisible() {
        let mut annotations = annotations("1710000000");
        let _ = annotations.insert(constants::MANAGED_BY_ANNOTATION.into(), "velero".into());
        let payload = encode_snapshot(SnapshotApiVersion::V1Beta1, &group(), "db-1", &annotations);
        assert!(decode_snapshot(&payload).is_none());

        // no annotations at all
        assert!(decode_snapshot(&json!({ "metadata": { "name": "x" } })).is_none());
    }

    #[test]
    fn unparseable_timestamps_are_errors_not_skips() {
        let payload = encode_snapshot(
            SnapshotApiVersion::V1Beta1,
            &group(),
            "db-oops",
            &annotations("not-a-number"),
        );
        let err = decode_snapshot(&payload).unwrap().unwrap_err();
        assert!(err.to_string().contains("db-oops"));
    }

    #[test]
    fn restore_snapshots_decode_as_restore_only() {
        let mut annotations = annotations("1710000000");
        let _ = annotations.remove(constants::INTERVALS_ANNOTATION);
        let _ = annotations.insert(constants::RESTORE_ANNOTATION.into(), "1700000000".into());
        let payload = encode_snapshot(SnapshotApiVersion::V1Beta1, &group(), "db-1", &annotations);
        let snapshot = decode_snapshot(&payload).unwrap().unwrap();
        assert_eq!(snapshot.restore.as_deref(), Some("1700000000"));
        assert!(snapshot.is_restore_only());
    }

    #[test]
    fn readiness_follows_the_status_field() {
        let mut payload = encode_snapshot(
            SnapshotApiVersion::V1Beta1,
            &group(),
            "db-1",
            &annotations("1"),
        );
        assert!(!snapshot_ready(&payload));
        payload["status"] = json!({ "readyToUse": true });
        assert!(snapshot_ready(&payload));
    }

    #[test]
    fn listing_order_is_newest_first_then_name() {
        let payload = encode_snapshot(
            SnapshotApiVersion::V1Beta1,
            &group(),
            "db-2",
            &annotations("2"),
        );
        let older = decode_snapshot(&payload).unwrap().unwrap();
        let payload = encode_snapshot(
            SnapshotApiVersion::V1Beta1,
            &group(),
            "db-5",
            &annotations("5"),
        );
        let newer = decode_snapshot(&payload).unwrap().unwrap();

        assert_eq!(GroupSnapshot::listing_order(&newer, &older), Ordering::Less);

        let mut twin = older.clone();
        twin.name = "db-0".into();
        assert_eq!(GroupSnapshot::listing_order(&twin, &older), Ordering::Less);
    }
}
