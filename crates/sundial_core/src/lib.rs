/*!
A library implementing scheduled snapshotting and point-in-time restore of
persistent volume claims, driven by `SnapshotGroup` intent objects.

# Overview

Users declare a [`SnapshotGroup`] naming a volume claim and a retention
policy of overlapping interval/keep pairs ("every hour keep 24, every day
keep 7"). The [`Controller`] watches group events, classifies them into
[`Task`]s and feeds a deduplicating, rate-limited [`WorkQueue`] whose
workers call into the [`Engine`]. Each backup pass lists the snapshots this
controller owns, asks the pure retention [`plan`] which intervals are stale
and which snapshots have aged out, and applies the answer through the
[`SnapshotStore`]. A restore annotation on the group rebuilds the claim
from a prior snapshot, protected by a failsafe snapshot taken first.

The platform is reached exclusively through the [`Platform`] capability
trait; the engine holds no state of its own and re-reads the world on every
pass. The only persisted state are the annotations on the snapshots.

# Example - reconcile a group against an in-memory platform

```rust
use std::sync::Arc;

use sundial_core::{Engine, EngineOptions, SnapshotGroup, SnapshotSchedule};
use sundial_testing::MemoryPlatform;

let platform = Arc::new(MemoryPlatform::new());
let (_stop, stop_rx) = crossbeam_channel::bounded(0);

let mut group = SnapshotGroup::default();
group.metadata.name = "web".to_string();
group.metadata.namespace = "default".to_string();
group.spec.schedule.push(SnapshotSchedule {
    every: "hour".to_string(),
    keep: 3,
});

let engine = Engine::new(Arc::clone(&platform), EngineOptions::default(), stop_rx);
engine.backup(&group).unwrap();

// the claim was provisioned and the first snapshot exists
assert!(platform.claim("default", "web").is_some());
assert_eq!(platform.snapshot_names("default").len(), 1);
```

# Crate features

- **cli** - Derives `clap` parsers on the `*Options` types so binaries can
  take them straight from the command line. *This feature is disabled by
  default*.
*/

pub(crate) mod controller;
pub(crate) mod engine;
pub(crate) mod error;
pub(crate) mod interval;
pub(crate) mod platform;
pub(crate) mod queue;
/// Models of the platform objects the controller owns or observes
pub mod resource;
pub(crate) mod scheduler;
pub(crate) mod store;

// sundial_core Public API
pub use crate::{
    controller::{classify, Controller, ControllerOptions, GroupEvent, Task, WorkItem},
    engine::{Engine, EngineOptions},
    error::{codes, ErrorKind, Severity, Status, SundialError, SundialResult},
    interval::parse_interval,
    platform::Platform,
    queue::{ItemExponentialBackoff, RateLimiter, TokenBucket, WorkQueue},
    resource::{
        constants, decode_snapshot, encode_snapshot, snapshot_ready, GroupSnapshot, ObjectMeta,
        SnapshotApiVersion, SnapshotGroup, SnapshotGroupSpec, SnapshotSchedule, SnapshotTemplate,
        VolumeClaim, VolumeClaimRef,
    },
    scheduler::{plan, SnapshotPlan},
    store::SnapshotStore,
};
