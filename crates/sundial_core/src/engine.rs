//! The reconciliation engine: one entry point per task kind, each a complete
//! recipe bringing the observed state toward the declared intent.
//!
//! The engine keeps no state of its own. Every pass re-reads the snapshot
//! list and the claim from the platform and decides from what it observed;
//! concurrent modifications surface as platform conflicts which the work
//! queue's retry machinery absorbs.

use std::collections::BTreeMap;

use chrono::Utc;
use crossbeam_channel::Receiver;
use derive_setters::Setters;
use itertools::Itertools;
use log::{debug, info, warn};
use serde_derive::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::{
    error::{codes, ErrorKind, SundialError, SundialResult},
    platform::Platform,
    resource::{
        claim::{clear_volume_name, VolumeClaim},
        constants as annotations,
        SnapshotGroup,
    },
    scheduler::plan,
    store::SnapshotStore,
};

pub(crate) mod constants {
    use std::time::Duration;

    /// Default bound on the failsafe-snapshot readiness wait.
    pub(crate) const DEFAULT_SNAPSHOT_READY_TIMEOUT: Duration = Duration::from_secs(60);
}

/// Options for the reconciliation engine.
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into)]
#[non_exhaustive]
pub struct EngineOptions {
    /// How long a restore waits for its failsafe snapshot to become ready
    /// before proceeding anyway
    #[cfg_attr(
        feature = "clap",
        clap(long, value_name = "DURATION", default_value = "1m")
    )]
    #[serde_as(as = "DisplayFromStr")]
    pub snapshot_ready_timeout: humantime::Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            snapshot_ready_timeout: constants::DEFAULT_SNAPSHOT_READY_TIMEOUT.into(),
        }
    }
}

/// Reconciles `SnapshotGroup`s against the platform.
#[derive(Debug)]
pub struct Engine<P> {
    store: SnapshotStore<P>,
    options: EngineOptions,
    stop: Receiver<()>,
}

impl<P: Platform> Engine<P> {
    /// Creates an engine.
    ///
    /// # Arguments
    ///
    /// * `platform` - The platform to reconcile against.
    /// * `options` - Engine options.
    /// * `stop` - Channel signalling shutdown; bounded waits observe it.
    pub const fn new(platform: P, options: EngineOptions, stop: Receiver<()>) -> Self {
        Self {
            store: SnapshotStore::new(platform),
            options,
            stop,
        }
    }

    fn platform(&self) -> &P {
        self.store.platform()
    }

    /// Runs one backup reconcile pass for a group.
    ///
    /// Ensures the claim exists (provisioning or adopting it), prunes
    /// snapshots that fell out of retention and creates at most one new
    /// snapshot carrying every stale interval.
    ///
    /// # Errors
    ///
    /// * [`crate::error::codes::CLAIM_NOT_FOUND`] - If the group names a claim that does not exist.
    /// * [`crate::error::codes::CLAIM_NOT_MANAGED`] - If the claim under the group's name belongs to someone else.
    /// * [`crate::error::codes::INVALID_INTERVAL`] - If the schedule cannot be parsed.
    pub fn backup(&self, group: &SnapshotGroup) -> SundialResult<()> {
        info!(
            "Reconciling SnapshotGroup {}/{}",
            group.namespace(),
            group.name()
        );

        let mut group = group.clone();
        self.ensure_claim(&mut group)?;

        let snapshots = self
            .store
            .list(&group)?
            .into_iter()
            .filter(|snapshot| !snapshot.is_restore_only())
            .collect();

        let plan = plan(&group.spec.schedule, snapshots, Utc::now())?;

        if !plan.to_delete.is_empty() {
            info!("Deleting {} expired snapshots", plan.to_delete.len());
        }
        for snapshot in &plan.to_delete {
            self.store.delete(&snapshot.namespace, &snapshot.name)?;
            info!("Deleted snapshot {}", snapshot.name);
        }

        if !plan.to_create.is_empty() {
            let intervals = plan
                .to_create
                .iter()
                .join(annotations::INTERVALS_SEPARATOR);
            let created = self.store.create(
                &group,
                BTreeMap::from([(annotations::INTERVALS_ANNOTATION.to_string(), intervals)]),
            )?;
            info!(
                "Created snapshot {} for intervals {}",
                created.name,
                created.intervals.iter().join(annotations::INTERVALS_SEPARATOR)
            );
        }

        Ok(())
    }

    /// Rebuilds the group's claim from the snapshot named by the restore
    /// annotation, taking a failsafe snapshot first.
    ///
    /// # Errors
    ///
    /// * [`crate::error::codes::INVALID_RESTORE`] - If the restore annotation is missing or empty.
    pub fn restore(&self, group: &SnapshotGroup) -> SundialResult<()> {
        let Some(target) = group.restore_target() else {
            return Err(SundialError::new(
                ErrorKind::Restore,
                "SnapshotGroup has no usable restore annotation.",
            )
            .attach_context("namespace", group.namespace())
            .attach_context("group", group.name())
            .attach_error_code(codes::INVALID_RESTORE));
        };
        info!(
            "Restoring SnapshotGroup {}/{} to {target}",
            group.namespace(),
            group.name()
        );

        self.ensure_failsafe(group, target)?;

        match self.platform().delete_claim(group.namespace(), group.claim_name()) {
            Ok(()) => debug!("Deleted claim {}", group.claim_name()),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let mut spec = group
            .spec
            .claim
            .spec
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));
        clear_volume_name(&mut spec);
        let mut claim = VolumeClaim::managed(
            group.namespace(),
            group.claim_name(),
            spec,
            BTreeMap::from([(
                annotations::RESTORE_ANNOTATION.to_string(),
                target.to_string(),
            )]),
        );
        claim.set_data_source(&format!("{}-{target}", group.name()));

        let _ = self.platform().create_claim(&claim)?;
        info!(
            "Restored claim {}/{} from snapshot {}-{target}",
            group.namespace(),
            group.claim_name(),
            group.name()
        );
        Ok(())
    }

    /// Handles a deleted group. Snapshots outlive their group so operators
    /// can still restore after an accidental deletion, so this only logs.
    pub fn on_delete(&self, group: &SnapshotGroup) -> SundialResult<()> {
        info!(
            "SnapshotGroup {}/{} was deleted. Taking no action; its snapshots remain and can be cleaned up manually if they are no longer needed.",
            group.namespace(),
            group.name()
        );
        Ok(())
    }

    /// Makes sure the claim the group protects exists, and mirrors its
    /// observed spec back into the group.
    ///
    /// A claim declared by name is adopted as found, read-only if it carries
    /// someone else's ownership tag. A claim under the group's own name must
    /// be ours; when it does not exist it is provisioned from the declared
    /// spec.
    fn ensure_claim(&self, group: &mut SnapshotGroup) -> SundialResult<()> {
        let namespace = group.namespace().to_string();
        let claim_name = group.claim_name().to_string();

        match self.platform().get_claim(&namespace, &claim_name) {
            Ok(claim) => {
                if !group.names_existing_claim() && !claim.managed_by_us() {
                    return Err(SundialError::new(
                        ErrorKind::Claim,
                        "Claim exists but is not managed by this controller.",
                    )
                    .attach_context("namespace", namespace)
                    .attach_context("claim", claim_name)
                    .attach_error_code(codes::CLAIM_NOT_MANAGED)
                    .attach_status(crate::error::Status::Persistent));
                }
                if group.names_existing_claim() && !claim.managed_by_us() {
                    debug!("Adopting unmanaged claim {namespace}/{claim_name} read-only");
                }
                self.mirror_claim_spec(group, &claim)
            }
            Err(err) if err.is_not_found() => {
                if group.names_existing_claim() {
                    return Err(SundialError::new(
                        ErrorKind::Claim,
                        "Claim referenced by the SnapshotGroup does not exist.",
                    )
                    .attach_context("namespace", namespace)
                    .attach_context("claim", claim_name)
                    .attach_error_code(codes::CLAIM_NOT_FOUND));
                }
                info!("Claim {namespace}/{claim_name} not found, creating it");
                let spec = group
                    .spec
                    .claim
                    .spec
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({}));
                let claim = VolumeClaim::managed(&namespace, &claim_name, spec, BTreeMap::new());
                let _ = self.platform().create_claim(&claim)?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Copies the observed claim spec into the group, dropping the bound
    /// volume name so the claim can be provisioned afresh after a restore.
    fn mirror_claim_spec(
        &self,
        group: &mut SnapshotGroup,
        claim: &VolumeClaim,
    ) -> SundialResult<()> {
        let mut observed = claim.spec.clone();
        clear_volume_name(&mut observed);

        if group.spec.claim.spec.as_ref() == Some(&observed) {
            return Ok(());
        }
        group.spec.claim.spec = Some(observed);
        *group = self.platform().update_group(group)?;
        debug!(
            "Updated claim spec of SnapshotGroup {}/{}",
            group.namespace(),
            group.name()
        );
        Ok(())
    }

    /// Creates the failsafe snapshot for a restore, unless one already
    /// exists for this restore point, and waits for it to become ready.
    ///
    /// A readiness timeout is logged and swallowed: the snapshot driver may
    /// still finish asynchronously, and blocking the restore forever is
    /// worse than proceeding.
    fn ensure_failsafe(&self, group: &SnapshotGroup, target: &str) -> SundialResult<()> {
        let existing = self.store.list(group)?;
        if existing
            .iter()
            .any(|snapshot| snapshot.restore.as_deref() == Some(target))
        {
            debug!("Failsafe snapshot already exists for restore point {target}");
            return Ok(());
        }

        info!("Creating failsafe snapshot for restore point {target}");
        let created = self.store.create(
            group,
            BTreeMap::from([(
                annotations::RESTORE_ANNOTATION.to_string(),
                target.to_string(),
            )]),
        )?;

        match self.store.wait_ready(
            &created.namespace,
            &created.name,
            *self.options.snapshot_ready_timeout,
            &self.stop,
        ) {
            Ok(_) => Ok(()),
            Err(err) if err.is_timeout() => {
                warn!(
                    "Failsafe snapshot {} was not ready after {}; proceeding with the restore anyway",
                    created.name, self.options.snapshot_ready_timeout
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MockPlatform;
    use crate::resource::SnapshotSchedule;
    use crossbeam_channel::bounded;

    fn engine(platform: MockPlatform) -> (Engine<MockPlatform>, crossbeam_channel::Sender<()>) {
        let (stop_tx, stop_rx) = bounded(0);
        (Engine::new(platform, EngineOptions::default(), stop_rx), stop_tx)
    }

    fn group(claim_name: Option<&str>) -> SnapshotGroup {
        let mut group = SnapshotGroup::default();
        group.metadata.name = "web".to_string();
        group.metadata.namespace = "default".to_string();
        group.spec.claim.claim_name = claim_name.map(ToString::to_string);
        group.spec.schedule.push(SnapshotSchedule {
            every: "hour".to_string(),
            keep: 1,
        });
        group
    }

    fn not_found() -> Box<SundialError> {
        SundialError::new(ErrorKind::Platform, "no such object").attach_error_code(codes::NOT_FOUND)
    }

    #[test]
    fn a_missing_named_claim_is_claim_not_found() {
        let mut platform = MockPlatform::new();
        let _ = platform
            .expect_get_claim()
            .returning(|_, _| Err(not_found()));
        let (engine, _stop) = engine(platform);

        let err = engine.backup(&group(Some("pre-existing"))).unwrap_err();
        assert!(err.is_code(codes::CLAIM_NOT_FOUND));
    }

    #[test]
    fn a_foreign_claim_under_our_name_is_claim_not_managed() {
        let mut platform = MockPlatform::new();
        let _ = platform.expect_get_claim().returning(|namespace, name| {
            let mut claim =
                VolumeClaim::managed(namespace, name, serde_json::json!({}), BTreeMap::new());
            let _ = claim.metadata.annotations.insert(
                annotations::MANAGED_BY_ANNOTATION.to_string(),
                "someone-else".to_string(),
            );
            Ok(claim)
        });
        let (engine, _stop) = engine(platform);

        let err = engine.backup(&group(None)).unwrap_err();
        assert!(err.is_code(codes::CLAIM_NOT_MANAGED));
        assert!(err.is_temporary());
    }

    #[test]
    fn a_restore_without_a_target_is_invalid() {
        // no expectations: the engine must not touch the platform
        let (engine, _stop) = engine(MockPlatform::new());

        let err = engine.restore(&group(None)).unwrap_err();
        assert!(err.is_code(codes::INVALID_RESTORE));
    }

    #[test]
    fn deleting_a_group_touches_nothing() {
        // no expectations: any platform call would panic the mock
        let (engine, _stop) = engine(MockPlatform::new());
        engine.on_delete(&group(None)).unwrap();
    }
}
