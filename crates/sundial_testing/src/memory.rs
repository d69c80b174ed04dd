//! An in-memory [`Platform`] with just enough behavior to reconcile against:
//! objects live in maps, writes are counted, and error codes match what the
//! real platform reports.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::{json, Value};

use sundial_core::{
    codes, ErrorKind, Platform, SnapshotApiVersion, SnapshotGroup, Status, SundialError,
    SundialResult, VolumeClaim,
};

#[derive(Debug, Default)]
struct State {
    groups: BTreeMap<(String, String), SnapshotGroup>,
    claims: BTreeMap<(String, String), VolumeClaim>,
    snapshots: BTreeMap<(String, String), Value>,
    auto_ready: bool,
    mutations: u64,
}

/// An in-process fake of the orchestration platform.
///
/// Freshly created snapshots are marked ready immediately unless
/// [`MemoryPlatform::auto_ready`] turned that off; [`MemoryPlatform::set_ready`]
/// then flips them by hand.
#[derive(Debug)]
pub struct MemoryPlatform {
    version: SnapshotApiVersion,
    state: Mutex<State>,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(kind: &str, namespace: &str, name: &str) -> Box<SundialError> {
    SundialError::new(ErrorKind::Platform, "Object not found.")
        .attach_context("kind", kind)
        .attach_context("namespace", namespace)
        .attach_context("name", name)
        .attach_error_code(codes::NOT_FOUND)
        .attach_status(Status::Temporary)
}

fn conflict(kind: &str, namespace: &str, name: &str) -> Box<SundialError> {
    SundialError::new(ErrorKind::Platform, "Object already exists.")
        .attach_context("kind", kind)
        .attach_context("namespace", namespace)
        .attach_context("name", name)
        .attach_error_code(codes::CONFLICT)
        .attach_status(Status::Temporary)
}

impl MemoryPlatform {
    /// Creates an empty platform speaking the beta snapshot API.
    #[must_use]
    pub fn new() -> Self {
        Self::with_version(SnapshotApiVersion::V1Beta1)
    }

    /// Creates an empty platform speaking the given snapshot API version.
    #[must_use]
    pub fn with_version(version: SnapshotApiVersion) -> Self {
        Self {
            version,
            state: Mutex::new(State {
                auto_ready: true,
                ..State::default()
            }),
        }
    }

    /// Controls whether new snapshots become ready on creation.
    pub fn auto_ready(&self, enabled: bool) {
        self.state.lock().unwrap().auto_ready = enabled;
    }

    /// Inserts or replaces a group.
    pub fn upsert_group(&self, group: SnapshotGroup) {
        let key = (group.namespace().to_string(), group.name().to_string());
        let _ = self.state.lock().unwrap().groups.insert(key, group);
    }

    /// Removes a group, returning the last stored object.
    pub fn remove_group(&self, namespace: &str, name: &str) -> Option<SnapshotGroup> {
        self.state
            .lock()
            .unwrap()
            .groups
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Seeds a claim as-is, without stamping any ownership.
    pub fn insert_claim(&self, claim: VolumeClaim) {
        let key = (
            claim.metadata.namespace.clone(),
            claim.metadata.name.clone(),
        );
        let _ = self.state.lock().unwrap().claims.insert(key, claim);
    }

    /// Returns a stored claim.
    #[must_use]
    pub fn claim(&self, namespace: &str, name: &str) -> Option<VolumeClaim> {
        self.state
            .lock()
            .unwrap()
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Returns a stored snapshot payload.
    #[must_use]
    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Returns the names of all snapshots in a namespace, sorted.
    #[must_use]
    pub fn snapshot_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Flips the readiness of a stored snapshot.
    pub fn set_ready(&self, namespace: &str, name: &str, ready: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(payload) = state
            .snapshots
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            payload["status"] = json!({ "readyToUse": ready });
        }
    }

    /// Number of writes (creates, updates, deletes) seen so far.
    #[must_use]
    pub fn mutations(&self) -> u64 {
        self.state.lock().unwrap().mutations
    }
}

impl Platform for MemoryPlatform {
    fn location(&self) -> String {
        "memory".to_string()
    }

    fn snapshot_version(&self) -> SnapshotApiVersion {
        self.version
    }

    fn list_groups(&self) -> SundialResult<Vec<SnapshotGroup>> {
        Ok(self.state.lock().unwrap().groups.values().cloned().collect())
    }

    fn update_group(&self, group: &SnapshotGroup) -> SundialResult<SnapshotGroup> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        let key = (group.namespace().to_string(), group.name().to_string());
        let _ = state.groups.insert(key, group.clone());
        Ok(group.clone())
    }

    fn get_claim(&self, namespace: &str, name: &str) -> SundialResult<VolumeClaim> {
        self.claim(namespace, name)
            .ok_or_else(|| not_found("PersistentVolumeClaim", namespace, name))
    }

    fn create_claim(&self, claim: &VolumeClaim) -> SundialResult<VolumeClaim> {
        let key = (
            claim.metadata.namespace.clone(),
            claim.metadata.name.clone(),
        );
        let mut state = self.state.lock().unwrap();
        if state.claims.contains_key(&key) {
            return Err(conflict("PersistentVolumeClaim", &key.0, &key.1));
        }
        state.mutations += 1;
        let _ = state.claims.insert(key, claim.clone());
        Ok(claim.clone())
    }

    fn delete_claim(&self, namespace: &str, name: &str) -> SundialResult<()> {
        let mut state = self.state.lock().unwrap();
        match state
            .claims
            .remove(&(namespace.to_string(), name.to_string()))
        {
            Some(_) => {
                state.mutations += 1;
                Ok(())
            }
            None => Err(not_found("PersistentVolumeClaim", namespace, name)),
        }
    }

    fn list_snapshots(&self, namespace: &str) -> SundialResult<Vec<Value>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, payload)| payload.clone())
            .collect())
    }

    fn get_snapshot(&self, namespace: &str, name: &str) -> SundialResult<Value> {
        self.snapshot(namespace, name)
            .ok_or_else(|| not_found("VolumeSnapshot", namespace, name))
    }

    fn create_snapshot(&self, namespace: &str, payload: Value) -> SundialResult<Value> {
        let name = payload
            .get("metadata")
            .and_then(|metadata| metadata.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SundialError::new(ErrorKind::Internal, "Snapshot payload carries no name.")
            })?
            .to_string();

        let key = (namespace.to_string(), name.clone());
        let mut state = self.state.lock().unwrap();
        if state.snapshots.contains_key(&key) {
            return Err(conflict("VolumeSnapshot", namespace, &name));
        }

        let mut stored = payload;
        if state.auto_ready {
            stored["status"] = json!({ "readyToUse": true });
        }
        state.mutations += 1;
        let _ = state.snapshots.insert(key, stored.clone());
        Ok(stored)
    }

    fn delete_snapshot(&self, namespace: &str, name: &str) -> SundialResult<()> {
        let mut state = self.state.lock().unwrap();
        match state
            .snapshots
            .remove(&(namespace.to_string(), name.to_string()))
        {
            Some(_) => {
                state.mutations += 1;
                Ok(())
            }
            None => Err(not_found("VolumeSnapshot", namespace, name)),
        }
    }
}
