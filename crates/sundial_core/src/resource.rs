//! Data model of the platform objects the controller reads and writes.
//!
//! The only state the controller persists lives in annotations on the
//! snapshots it creates; everything in here either models those annotations
//! or the objects that carry them.

pub mod claim;
pub mod group;
pub mod snapshot;

pub use claim::VolumeClaim;
pub use group::{ObjectMeta, SnapshotGroup, SnapshotGroupSpec, SnapshotSchedule, SnapshotTemplate, VolumeClaimRef};
pub use snapshot::{decode_snapshot, encode_snapshot, snapshot_ready, GroupSnapshot, SnapshotApiVersion};

/// Well-known names shared between the controller and the platform objects it owns.
pub mod constants {
    /// API group of the `SnapshotGroup` custom resource.
    pub const API_GROUP: &str = "sundial.fairwinds.com";

    /// API version of the `SnapshotGroup` custom resource.
    pub const API_VERSION: &str = "v1beta1";

    /// Plural resource name of the `SnapshotGroup` custom resource.
    pub const GROUP_PLURAL: &str = "snapshotgroups";

    /// API group of the platform's volume snapshot resource.
    pub const SNAPSHOT_API_GROUP: &str = "snapshot.storage.k8s.io";

    /// Contains the name of the `SnapshotGroup` a snapshot belongs to.
    pub const GROUP_ANNOTATION: &str = "sundial.fairwinds.com/group";

    /// Contains the intervals a snapshot currently satisfies.
    pub const INTERVALS_ANNOTATION: &str = "sundial.fairwinds.com/intervals";

    /// Contains the creation time of a snapshot as decimal Unix seconds.
    pub const TIMESTAMP_ANNOTATION: &str = "sundial.fairwinds.com/timestamp";

    /// Contains the restore point of a `SnapshotGroup` or failsafe snapshot.
    pub const RESTORE_ANNOTATION: &str = "sundial.fairwinds.com/restore";

    /// Ownership tag; objects lacking it are invisible to the controller.
    pub const MANAGED_BY_ANNOTATION: &str = "app.kubernetes.io/managed-by";

    /// Value of the ownership tag written by this controller.
    pub const MANAGER_NAME: &str = "sundial";

    /// Separator used when joining intervals into a single annotation value.
    pub const INTERVALS_SEPARATOR: &str = ", ";
}
