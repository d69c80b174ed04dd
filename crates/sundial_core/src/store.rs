//! CRUD over the platform's snapshot resource, filtered to the snapshots
//! this controller owns.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error};

use crate::{
    error::{codes, ErrorKind, SundialError, SundialResult},
    platform::Platform,
    resource::{
        constants as annotations,
        snapshot::{decode_snapshot, encode_snapshot, payload_name, snapshot_ready},
        GroupSnapshot, SnapshotGroup,
    },
};

pub(crate) mod constants {
    use std::time::Duration;

    /// Cadence of the snapshot readiness poll.
    pub(crate) const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);
}

/// Access to the snapshots belonging to a `SnapshotGroup`.
///
/// All annotation stamping and payload translation happens here; callers see
/// [`GroupSnapshot`]s only.
#[derive(Debug)]
pub struct SnapshotStore<P> {
    platform: P,
}

impl<P: Platform> SnapshotStore<P> {
    /// Creates a store on top of the given platform.
    pub const fn new(platform: P) -> Self {
        Self { platform }
    }

    /// Returns the underlying platform.
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    /// Lists the snapshots owned by this controller for the given group,
    /// newest first.
    ///
    /// Snapshots of other owners or other groups are invisible. An owned
    /// snapshot with an unparseable timestamp is skipped with an error log;
    /// it is never considered for deletion.
    pub fn list(&self, group: &SnapshotGroup) -> SundialResult<Vec<GroupSnapshot>> {
        let payloads = self.platform.list_snapshots(group.namespace())?;

        let mut snapshots = Vec::new();
        for payload in payloads {
            match decode_snapshot(&payload) {
                None => {}
                Some(Err(err)) => {
                    error!("skipping snapshot {}: {err}", payload_name(&payload));
                }
                Some(Ok(snapshot)) => {
                    if snapshot.group == group.name() {
                        snapshots.push(snapshot);
                    }
                }
            }
        }
        snapshots.sort_unstable_by(GroupSnapshot::listing_order);

        debug!(
            "found {} snapshots for SnapshotGroup {}/{}",
            snapshots.len(),
            group.namespace(),
            group.name()
        );
        Ok(snapshots)
    }

    /// Fetches one snapshot owned by this controller.
    ///
    /// # Errors
    ///
    /// * If the snapshot does not exist, or exists but is not ours.
    pub fn get(&self, namespace: &str, name: &str) -> SundialResult<GroupSnapshot> {
        let payload = self.platform.get_snapshot(namespace, name)?;
        decode_snapshot(&payload).ok_or_else(|| {
            SundialError::new(
                ErrorKind::Platform,
                "Snapshot exists but is not managed by this controller.",
            )
            .attach_context("namespace", namespace)
            .attach_context("snapshot", name)
        })?
    }

    /// Creates a snapshot for the given group.
    ///
    /// The name is composed as `<group>-<unix-seconds>` from the current
    /// clock; `timestamp`, ownership and group back-reference annotations are
    /// stamped automatically and the caller only supplies the annotations
    /// specific to its purpose (`intervals` or `restore`). The snapshot
    /// source is bound to the group's claim.
    ///
    /// # Errors
    ///
    /// * With the `conflict` code if the composed name already exists.
    pub fn create(
        &self,
        group: &SnapshotGroup,
        annotations: BTreeMap<String, String>,
    ) -> SundialResult<GroupSnapshot> {
        let timestamp = Utc::now().timestamp();
        let name = format!("{}-{timestamp}", group.name());

        let mut annotations = annotations;
        let _ = annotations.insert(
            annotations::TIMESTAMP_ANNOTATION.to_string(),
            timestamp.to_string(),
        );
        let _ = annotations.insert(
            annotations::MANAGED_BY_ANNOTATION.to_string(),
            annotations::MANAGER_NAME.to_string(),
        );
        let _ = annotations.insert(
            annotations::GROUP_ANNOTATION.to_string(),
            group.name().to_string(),
        );

        let payload = encode_snapshot(
            self.platform.snapshot_version(),
            group,
            &name,
            &annotations,
        );
        let stored = self.platform.create_snapshot(group.namespace(), payload)?;

        decode_snapshot(&stored).ok_or_else(|| {
            SundialError::new(
                ErrorKind::Internal,
                "Platform returned a snapshot without our annotations.",
            )
            .attach_context("snapshot", name)
        })?
    }

    /// Deletes one snapshot.
    pub fn delete(&self, namespace: &str, name: &str) -> SundialResult<()> {
        self.platform.delete_snapshot(namespace, name)?;
        debug!("deleted snapshot {namespace}/{name}");
        Ok(())
    }

    /// Waits until the platform marks a snapshot ready to use.
    ///
    /// Polls once per second. The wait ends early when the stop channel
    /// signals shutdown.
    ///
    /// # Errors
    ///
    /// * With the `timeout` code when the timeout elapses first.
    /// * With the `cancelled` code when the stop signal arrives first.
    pub fn wait_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
        stop: &Receiver<()>,
    ) -> SundialResult<GroupSnapshot> {
        let deadline = Instant::now() + timeout;

        loop {
            let payload = self.platform.get_snapshot(namespace, name)?;
            if snapshot_ready(&payload) {
                return self.get(namespace, name);
            }

            if Instant::now() >= deadline {
                return Err(SundialError::new(
                    ErrorKind::Timeout,
                    "Snapshot was not ready to use within the timeout.",
                )
                .attach_context("snapshot", name)
                .attach_context("timeout", format!("{timeout:?}"))
                .attach_error_code(codes::TIMEOUT));
            }

            match stop.recv_timeout(constants::READY_POLL_INTERVAL) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(SundialError::new(
                        ErrorKind::Multithreading,
                        "Shutdown requested while waiting for snapshot readiness.",
                    )
                    .attach_context("snapshot", name)
                    .attach_error_code(codes::CANCELLED));
                }
            }
        }
    }
}
