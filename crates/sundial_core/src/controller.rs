//! The controller: turns group events into queued tasks and drives the
//! reconcile workers.

use std::{
    any::Any,
    hash::{Hash, Hasher},
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Instant,
};

use crossbeam_channel::{select, Receiver};
use derive_setters::Setters;
use log::{debug, error, info, trace, warn};
use serde_derive::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::{
    engine::Engine,
    error::{codes, ErrorKind, SundialError, SundialResult},
    platform::Platform,
    queue::{RateLimiter, WorkQueue},
    resource::SnapshotGroup,
};

pub(crate) mod constants {
    use std::time::Duration;

    /// Default number of reconcile workers.
    pub(crate) const DEFAULT_WORKERS: usize = 1;

    /// Default bound on waiting for the initial group listing.
    pub(crate) const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(60);
}

/// Change notifications delivered by the group informer.
///
/// How the informer watches the platform is its own business; the controller
/// only consumes this stream. `Updated` is also re-delivered periodically
/// for unchanged groups, which is what keeps retention moving without any
/// timer of our own.
#[derive(Clone, Debug)]
pub enum GroupEvent {
    /// The initial listing is complete.
    Synced,

    /// A group appeared.
    Added(SnapshotGroup),

    /// A group changed, or is being re-delivered on a resync pass.
    Updated {
        /// The previously observed object.
        old: SnapshotGroup,
        /// The currently observed object.
        new: SnapshotGroup,
    },

    /// A group vanished; carries the last observed object.
    Deleted(SnapshotGroup),
}

/// What to do with a group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Task {
    /// Run a retention pass, creating and pruning snapshots.
    #[display("backup")]
    Backup,

    /// Rebuild the claim from the snapshot at the given restore point.
    #[display("restore to {target}")]
    Restore {
        /// The restore point, a Unix-seconds timestamp string.
        target: String,
    },

    /// The group is gone; log and move on.
    #[display("delete")]
    Delete,
}

/// One queued unit of work: the observed group and what to do with it.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkItem {
    /// The group as observed when the event fired.
    pub group: SnapshotGroup,

    /// The task to run.
    pub task: Task,
}

// Group specs are JSON documents without non-finite numbers, so the derived
// partial equality is total.
impl Eq for WorkItem {}

impl Hash for WorkItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Identity fields only; equality still decides on collision.
        self.group.namespace().hash(state);
        self.group.name().hash(state);
        std::mem::discriminant(&self.task).hash(state);
        if let Task::Restore { target } = &self.task {
            target.hash(state);
        }
    }
}

impl WorkItem {
    /// Namespace of the group this item concerns.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.group.namespace()
    }

    /// Name of the group this item concerns.
    #[must_use]
    pub fn name(&self) -> &str {
        self.group.name()
    }
}

/// Decides which task an observed change maps to.
///
/// A restore runs only when the restore annotation transitioned to a
/// different non-empty value; everything else, including the periodic
/// resync re-delivery, is a backup pass.
#[must_use]
pub fn classify(old: Option<&SnapshotGroup>, new: &SnapshotGroup) -> Task {
    let Some(old) = old else {
        return Task::Backup;
    };
    if let Some(target) = new.restore_target() {
        if old.restore_target() != Some(target) {
            return Task::Restore {
                target: target.to_string(),
            };
        }
    }
    Task::Backup
}

/// Options for the controller.
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into)]
#[non_exhaustive]
pub struct ControllerOptions {
    /// Number of parallel reconcile workers
    #[cfg_attr(feature = "clap", clap(long, value_name = "N", default_value = "1"))]
    pub workers: usize,

    /// How long to wait for the initial group listing before giving up
    #[cfg_attr(
        feature = "clap",
        clap(long, value_name = "DURATION", default_value = "1m")
    )]
    #[serde_as(as = "DisplayFromStr")]
    pub sync_timeout: humantime::Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            workers: constants::DEFAULT_WORKERS,
            sync_timeout: constants::DEFAULT_SYNC_TIMEOUT.into(),
        }
    }
}

/// Watches group events and dispatches reconcile tasks to workers.
#[derive(Debug)]
pub struct Controller<P> {
    engine: Arc<Engine<P>>,
    queue: Arc<WorkQueue<WorkItem>>,
    options: ControllerOptions,
}

impl<P: Platform> Controller<P> {
    /// Creates a controller around the given engine.
    pub fn new(engine: Engine<P>, options: ControllerOptions) -> Self {
        Self {
            engine: Arc::new(engine),
            queue: Arc::new(WorkQueue::new(RateLimiter::controller())),
            options,
        }
    }

    /// Runs the controller until the stop channel signals shutdown.
    ///
    /// Waits for the event source to deliver its initial listing, then
    /// launches the workers and pumps events into the queue. On shutdown the
    /// queue is closed and in-flight work drains before returning.
    ///
    /// # Errors
    ///
    /// * If the initial listing does not complete within the sync timeout.
    /// * If a worker thread cannot be spawned.
    pub fn run(&self, events: &Receiver<GroupEvent>, stop: &Receiver<()>) -> SundialResult<()> {
        info!("Starting controller");
        if !self.wait_for_sync(events, stop)? {
            return Ok(());
        }

        info!("Starting {} workers", self.options.workers);
        let workers = self.spawn_workers()?;

        loop {
            select! {
                recv(events) -> event => match event {
                    Ok(event) => self.handle_event(event),
                    Err(_) => {
                        warn!("Event source closed, shutting down");
                        break;
                    }
                },
                recv(stop) -> _ => {
                    info!("Stop signal received, shutting down");
                    break;
                }
            }
        }

        self.queue.shut_down();
        for worker in workers {
            if worker.join().is_err() {
                error!("a worker exited abnormally");
            }
        }
        info!("All workers drained");
        Ok(())
    }

    /// Blocks until the event source reports its initial listing complete.
    ///
    /// Events arriving before the sync marker are enqueued as usual, they
    /// just will not be worked on yet. Returns `false` when shutdown was
    /// requested while waiting.
    fn wait_for_sync(
        &self,
        events: &Receiver<GroupEvent>,
        stop: &Receiver<()>,
    ) -> SundialResult<bool> {
        debug!("Waiting for the initial group listing");
        let deadline = Instant::now() + *self.options.sync_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            select! {
                recv(events) -> event => match event {
                    Ok(GroupEvent::Synced) => return Ok(true),
                    Ok(event) => self.handle_event(event),
                    Err(_) => {
                        return Err(SundialError::new(
                            ErrorKind::Controller,
                            "Event source closed before the initial listing completed.",
                        ))
                    }
                },
                recv(stop) -> _ => return Ok(false),
                default(remaining) => {
                    return Err(SundialError::new(
                        ErrorKind::Timeout,
                        "Initial group listing did not complete in time.",
                    )
                    .attach_context("timeout", self.options.sync_timeout.to_string())
                    .attach_error_code(codes::TIMEOUT))
                }
            }
        }
    }

    fn spawn_workers(&self) -> SundialResult<Vec<JoinHandle<()>>> {
        let mut workers = Vec::with_capacity(self.options.workers);
        for index in 0..self.options.workers {
            let engine = Arc::clone(&self.engine);
            let queue = Arc::clone(&self.queue);
            let spawned = thread::Builder::new()
                .name(format!("sundial-worker-{index}"))
                .spawn(move || worker_loop(&engine, &queue));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    self.queue.shut_down();
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(SundialError::with_source(
                        ErrorKind::Multithreading,
                        "Failed to spawn a worker thread.",
                        err,
                    ));
                }
            }
        }
        Ok(workers)
    }

    fn handle_event(&self, event: GroupEvent) {
        match event {
            GroupEvent::Synced => {}
            GroupEvent::Added(group) => {
                trace!("ADD SnapshotGroup {}/{}", group.namespace(), group.name());
                self.queue.add(WorkItem {
                    task: classify(None, &group),
                    group,
                });
            }
            GroupEvent::Updated { old, new } => {
                trace!("UPDATE SnapshotGroup {}/{}", new.namespace(), new.name());
                let task = classify(Some(&old), &new);
                self.queue.add(WorkItem { group: new, task });
            }
            GroupEvent::Deleted(group) => {
                trace!("DELETE SnapshotGroup {}/{}", group.namespace(), group.name());
                self.queue.add(WorkItem {
                    task: Task::Delete,
                    group,
                });
            }
        }
    }
}

fn worker_loop<P: Platform>(engine: &Engine<P>, queue: &WorkQueue<WorkItem>) {
    while let Some(item) = queue.get() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_task(engine, &item)));
        queue.done(&item);

        match outcome {
            Ok(Ok(())) => {
                queue.forget(&item);
                info!(
                    "Successfully synced {}/{} ({})",
                    item.namespace(),
                    item.name(),
                    item.task
                );
            }
            Ok(Err(err)) => {
                queue.add_rate_limited(item.clone());
                warn!(
                    "Error syncing {}/{} ({}), requeuing (retry {}): {err}",
                    item.namespace(),
                    item.name(),
                    item.task,
                    queue.retries(&item)
                );
            }
            Err(payload) => {
                report_panic(&item, payload.as_ref());
                queue.add_rate_limited(item.clone());
            }
        }
    }
    debug!("worker exiting");
}

fn run_task<P: Platform>(engine: &Engine<P>, item: &WorkItem) -> SundialResult<()> {
    match &item.task {
        Task::Backup => engine.backup(&item.group),
        Task::Restore { .. } => engine.restore(&item.group),
        Task::Delete => engine.on_delete(&item.group),
    }
}

/// The worker boundary's crash handler: report and carry on.
fn report_panic(item: &WorkItem, payload: &(dyn Any + Send)) {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload");
    error!(
        "panic while reconciling {}/{} ({}): {message}",
        item.namespace(),
        item.name(),
        item.task
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::constants as annotations;
    use std::collections::hash_map::DefaultHasher;

    fn group(name: &str, restore: Option<&str>) -> SnapshotGroup {
        let mut group = SnapshotGroup::default();
        group.metadata.name = name.to_string();
        group.metadata.namespace = "default".to_string();
        if let Some(restore) = restore {
            let _ = group
                .metadata
                .annotations
                .insert(annotations::RESTORE_ANNOTATION.to_string(), restore.to_string());
        }
        group
    }

    #[test]
    fn adds_are_always_backups() {
        assert_eq!(classify(None, &group("web", None)), Task::Backup);
        // even with a restore annotation already present
        assert_eq!(classify(None, &group("web", Some("123"))), Task::Backup);
    }

    #[test]
    fn updates_restore_only_on_annotation_transitions() {
        let plain = group("web", None);
        let restoring = group("web", Some("123"));
        let restoring_elsewhere = group("web", Some("456"));

        assert_eq!(
            classify(Some(&plain), &restoring),
            Task::Restore {
                target: "123".into()
            }
        );
        assert_eq!(
            classify(Some(&restoring), &restoring_elsewhere),
            Task::Restore {
                target: "456".into()
            }
        );
        // unchanged annotation: resync re-delivery, back to backups
        assert_eq!(classify(Some(&restoring), &restoring), Task::Backup);
        // annotation removed
        assert_eq!(classify(Some(&restoring), &plain), Task::Backup);
    }

    #[test]
    fn empty_restore_annotations_do_not_trigger() {
        let plain = group("web", None);
        let empty = group("web", Some(""));
        assert_eq!(classify(Some(&plain), &empty), Task::Backup);
    }

    fn hash_of(item: &WorkItem) -> u64 {
        let mut hasher = DefaultHasher::new();
        item.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn equal_work_items_hash_equally() {
        let a = WorkItem {
            group: group("web", None),
            task: Task::Backup,
        };
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let restore = WorkItem {
            group: group("web", Some("123")),
            task: Task::Restore {
                target: "123".into(),
            },
        };
        assert_ne!(a, restore);
        assert_ne!(hash_of(&a), hash_of(&restore));
    }
}
