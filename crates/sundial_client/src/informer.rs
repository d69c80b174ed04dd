//! A polling informer: lists the platform's groups on a fixed cadence and
//! turns the differences into [`GroupEvent`]s.
//!
//! Survivors are re-delivered as `Updated` on every pass even when nothing
//! changed; that re-delivery is what keeps retention moving without the
//! controller owning a timer.

use std::collections::HashMap;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use derive_setters::Setters;
use log::{debug, warn};
use serde_derive::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use sundial_core::{
    ErrorKind, GroupEvent, Platform, SnapshotGroup, SundialError, SundialResult,
};

pub(super) mod constants {
    use std::time::Duration;

    /// Default listing cadence.
    pub(super) const DEFAULT_RESYNC: Duration = Duration::from_secs(30);
}

/// Options for the group informer.
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into)]
#[non_exhaustive]
pub struct InformerOptions {
    /// How often to re-list the groups; survivors are re-delivered on every
    /// pass, so this is also the retention heartbeat
    #[cfg_attr(
        feature = "clap",
        clap(long, value_name = "DURATION", default_value = "30s")
    )]
    #[serde_as(as = "DisplayFromStr")]
    pub resync: humantime::Duration,
}

impl Default for InformerOptions {
    fn default() -> Self {
        Self {
            resync: constants::DEFAULT_RESYNC.into(),
        }
    }
}

/// Watches the platform's group listing from a background thread.
#[derive(Debug)]
pub struct GroupInformer<P> {
    platform: P,
    options: InformerOptions,
}

impl<P: Platform> GroupInformer<P> {
    /// Creates an informer over the given platform.
    pub const fn new(platform: P, options: InformerOptions) -> Self {
        Self { platform, options }
    }

    /// Starts the informer thread.
    ///
    /// The first complete listing is delivered as `Added` events followed by
    /// one `Synced` marker; after that every pass emits `Added`, `Updated`
    /// or `Deleted` per group. The thread exits when the stop channel
    /// signals shutdown or the receiver is dropped.
    ///
    /// # Errors
    ///
    /// * If the informer thread cannot be spawned.
    pub fn spawn(
        self,
        stop: Receiver<()>,
    ) -> SundialResult<(Receiver<GroupEvent>, JoinHandle<()>)> {
        let (events, receiver) = unbounded();
        let handle = thread::Builder::new()
            .name("sundial-informer".to_string())
            .spawn(move || self.run(&events, &stop))
            .map_err(|err| {
                SundialError::with_source(
                    ErrorKind::Multithreading,
                    "Failed to spawn the informer thread.",
                    err,
                )
            })?;
        Ok((receiver, handle))
    }

    fn run(&self, events: &Sender<GroupEvent>, stop: &Receiver<()>) {
        let mut cache: HashMap<(String, String), SnapshotGroup> = HashMap::new();
        let mut synced = false;

        loop {
            match self.platform.list_groups() {
                Ok(groups) => {
                    if !deliver(&mut cache, groups, events) {
                        return;
                    }
                    if !synced {
                        synced = true;
                        if events.send(GroupEvent::Synced).is_err() {
                            return;
                        }
                    }
                }
                // the next pass retries; the cache stays as it was
                Err(err) => warn!("Listing snapshot groups failed: {err}"),
            }

            match stop.recv_timeout(*self.options.resync) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("informer exiting");
                    return;
                }
            }
        }
    }
}

/// Diffs one listing against the cache and emits the resulting events.
///
/// Returns `false` once the receiving side is gone.
fn deliver(
    cache: &mut HashMap<(String, String), SnapshotGroup>,
    observed: Vec<SnapshotGroup>,
    events: &Sender<GroupEvent>,
) -> bool {
    let mut next = HashMap::with_capacity(observed.len());

    for group in observed {
        let key = (group.namespace().to_string(), group.name().to_string());
        let event = match cache.remove(&key) {
            None => GroupEvent::Added(group.clone()),
            Some(old) => GroupEvent::Updated {
                old,
                new: group.clone(),
            },
        };
        let _ = next.insert(key, group);
        if events.send(event).is_err() {
            return false;
        }
    }

    for (_, gone) in cache.drain() {
        if events.send(GroupEvent::Deleted(gone)).is_err() {
            return false;
        }
    }

    *cache = next;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crossbeam_channel::bounded;
    use sundial_testing::MemoryPlatform;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn group(name: &str) -> SnapshotGroup {
        let mut group = SnapshotGroup::default();
        group.metadata.name = name.to_string();
        group.metadata.namespace = "default".to_string();
        group
    }

    #[test]
    fn lists_diff_into_events() {
        let platform = Arc::new(MemoryPlatform::new());
        platform.upsert_group(group("web"));

        let (stop_tx, stop_rx) = bounded(0);
        let informer = GroupInformer::new(
            Arc::clone(&platform),
            InformerOptions::default().resync(Duration::from_millis(10)),
        );
        let (events, handle) = informer.spawn(stop_rx).unwrap();

        // initial listing: one Added, then the sync marker
        assert!(matches!(
            events.recv_timeout(RECV_TIMEOUT).unwrap(),
            GroupEvent::Added(added) if added.name() == "web"
        ));
        assert!(matches!(
            events.recv_timeout(RECV_TIMEOUT).unwrap(),
            GroupEvent::Synced
        ));

        // survivors are re-delivered as updates on the next pass
        assert!(matches!(
            events.recv_timeout(RECV_TIMEOUT).unwrap(),
            GroupEvent::Updated { old, new }
                if old.name() == "web" && new.name() == "web"
        ));

        // removal surfaces as Deleted
        let _ = platform.remove_group("default", "web");
        loop {
            match events.recv_timeout(RECV_TIMEOUT).unwrap() {
                GroupEvent::Updated { .. } => {}
                GroupEvent::Deleted(gone) => {
                    assert_eq!(gone.name(), "web");
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        drop(stop_tx);
        handle.join().unwrap();
    }
}
