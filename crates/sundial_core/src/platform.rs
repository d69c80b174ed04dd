//! The capability interface the engine uses to talk to the orchestration
//! platform.
//!
//! The engine never constructs a client itself; it is handed something
//! implementing [`Platform`] and reads the external state fresh on every
//! reconcile pass.

use std::sync::Arc;

use serde_json::Value;

#[cfg(test)]
use mockall::mock;

use crate::{
    error::SundialResult,
    resource::{SnapshotApiVersion, SnapshotGroup, VolumeClaim},
};

/// Operations the reconciliation engine needs from the platform.
///
/// Implementations signal missing objects, write conflicts and timeouts via
/// the error codes in [`crate::error::codes`]; the engine and the work queue
/// branch on those, not on implementation-specific error types.
pub trait Platform: Send + Sync + 'static {
    /// Returns a human-readable description of the platform endpoint.
    fn location(&self) -> String;

    /// The snapshot API version this platform speaks.
    fn snapshot_version(&self) -> SnapshotApiVersion {
        SnapshotApiVersion::default()
    }

    /// Lists all `SnapshotGroup` objects across namespaces.
    fn list_groups(&self) -> SundialResult<Vec<SnapshotGroup>>;

    /// Persists an updated `SnapshotGroup`, returning the stored object.
    fn update_group(&self, group: &SnapshotGroup) -> SundialResult<SnapshotGroup>;

    /// Fetches a volume claim.
    ///
    /// # Errors
    ///
    /// * Signals a missing claim with the `not-found` error code.
    fn get_claim(&self, namespace: &str, name: &str) -> SundialResult<VolumeClaim>;

    /// Creates a volume claim, returning the stored object.
    fn create_claim(&self, claim: &VolumeClaim) -> SundialResult<VolumeClaim>;

    /// Deletes a volume claim.
    fn delete_claim(&self, namespace: &str, name: &str) -> SundialResult<()>;

    /// Lists all volume snapshot payloads in a namespace, owned or not.
    fn list_snapshots(&self, namespace: &str) -> SundialResult<Vec<Value>>;

    /// Fetches a single volume snapshot payload.
    fn get_snapshot(&self, namespace: &str, name: &str) -> SundialResult<Value>;

    /// Creates a volume snapshot, returning the stored payload.
    ///
    /// # Errors
    ///
    /// * Signals an already existing name with the `conflict` error code.
    fn create_snapshot(&self, namespace: &str, payload: Value) -> SundialResult<Value>;

    /// Deletes a volume snapshot.
    fn delete_snapshot(&self, namespace: &str, name: &str) -> SundialResult<()>;
}

impl<P: Platform> Platform for Arc<P> {
    fn location(&self) -> String {
        self.as_ref().location()
    }

    fn snapshot_version(&self) -> SnapshotApiVersion {
        self.as_ref().snapshot_version()
    }

    fn list_groups(&self) -> SundialResult<Vec<SnapshotGroup>> {
        self.as_ref().list_groups()
    }

    fn update_group(&self, group: &SnapshotGroup) -> SundialResult<SnapshotGroup> {
        self.as_ref().update_group(group)
    }

    fn get_claim(&self, namespace: &str, name: &str) -> SundialResult<VolumeClaim> {
        self.as_ref().get_claim(namespace, name)
    }

    fn create_claim(&self, claim: &VolumeClaim) -> SundialResult<VolumeClaim> {
        self.as_ref().create_claim(claim)
    }

    fn delete_claim(&self, namespace: &str, name: &str) -> SundialResult<()> {
        self.as_ref().delete_claim(namespace, name)
    }

    fn list_snapshots(&self, namespace: &str) -> SundialResult<Vec<Value>> {
        self.as_ref().list_snapshots(namespace)
    }

    fn get_snapshot(&self, namespace: &str, name: &str) -> SundialResult<Value> {
        self.as_ref().get_snapshot(namespace, name)
    }

    fn create_snapshot(&self, namespace: &str, payload: Value) -> SundialResult<Value> {
        self.as_ref().create_snapshot(namespace, payload)
    }

    fn delete_snapshot(&self, namespace: &str, name: &str) -> SundialResult<()> {
        self.as_ref().delete_snapshot(namespace, name)
    }
}

#[cfg(test)]
mock! {
    pub Platform {}

    impl Platform for Platform {
        fn location(&self) -> String;
        fn snapshot_version(&self) -> SnapshotApiVersion;
        fn list_groups(&self) -> SundialResult<Vec<SnapshotGroup>>;
        fn update_group(&self, group: &SnapshotGroup) -> SundialResult<SnapshotGroup>;
        fn get_claim(&self, namespace: &str, name: &str) -> SundialResult<VolumeClaim>;
        fn create_claim(&self, claim: &VolumeClaim) -> SundialResult<VolumeClaim>;
        fn delete_claim(&self, namespace: &str, name: &str) -> SundialResult<()>;
        fn list_snapshots(&self, namespace: &str) -> SundialResult<Vec<Value>>;
        fn get_snapshot(&self, namespace: &str, name: &str) -> SundialResult<Value>;
        fn create_snapshot(&self, namespace: &str, payload: Value) -> SundialResult<Value>;
        fn delete_snapshot(&self, namespace: &str, name: &str) -> SundialResult<()>;
    }
}
