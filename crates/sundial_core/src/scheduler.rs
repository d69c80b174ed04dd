//! Retention planning: which intervals need a fresh snapshot, and which
//! snapshots have aged out.
//!
//! [`plan`] is a pure function over the observed snapshot set; it is the only
//! place the retention policy is encoded.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use log::trace;

use crate::{
    error::SundialResult,
    interval::parse_interval,
    resource::{GroupSnapshot, SnapshotSchedule},
};

/// The outcome of one retention pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SnapshotPlan {
    /// The intervals whose most recent snapshot is missing or stale. One new
    /// snapshot carrying all of them satisfies every entry.
    pub to_create: Vec<String>,

    /// Snapshots whose retention budget is filled by more recent snapshots
    /// for every interval they carry.
    pub to_delete: Vec<GroupSnapshot>,
}

impl SnapshotPlan {
    /// Whether the pass found nothing to do.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty()
    }
}

/// Decides which intervals need a new snapshot and which snapshots to delete.
///
/// Snapshots that exist only as restore failsafes (non-empty restore point,
/// no intervals) are exempt from retention and never part of the plan.
/// Intervals a snapshot carries that are no longer scheduled contribute to
/// neither keep accounting nor creation; such a snapshot survives only if
/// another of its intervals is still in budget. Duplicate schedule entries
/// for the same interval collapse, last one wins.
///
/// # Arguments
///
/// * `schedules` - The group's declared retention policy.
/// * `snapshots` - The observed snapshots; any order.
/// * `now` - The evaluation time.
///
/// # Errors
///
/// * If a scheduled interval string cannot be parsed. The schedule will not
///   resolve until the user fixes the `SnapshotGroup`.
pub fn plan(
    schedules: &[SnapshotSchedule],
    snapshots: Vec<GroupSnapshot>,
    now: DateTime<Utc>,
) -> SundialResult<SnapshotPlan> {
    let mut durations: BTreeMap<&str, Duration> = BTreeMap::new();
    let mut budgets: BTreeMap<&str, u32> = BTreeMap::new();
    let mut needs_creation: BTreeMap<&str, bool> = BTreeMap::new();

    for schedule in schedules {
        let every = schedule.every.as_str();
        let _ = durations.insert(every, parse_interval(every)?);
        // Keep one extra snapshot so the full range stays covered, e.g. with
        // "every 1 year, keep 2" on 1/1/2020 we hold 1/1/2020, 1/1/2019 and
        // 1/1/2018: two whole years of history.
        let _ = budgets.insert(every, schedule.keep + 1);
        let _ = needs_creation.insert(every, true);
    }

    let mut snapshots = snapshots;
    snapshots.sort_unstable_by(GroupSnapshot::listing_order);

    let mut counts: BTreeMap<&str, u32> = BTreeMap::new();
    let mut to_delete = Vec::new();

    for snapshot in snapshots {
        if snapshot.is_restore_only() {
            continue;
        }
        trace!("checking snapshot {}", snapshot.name);

        let mut keep = false;
        for interval in &snapshot.intervals {
            let Some((&every, &budget)) = budgets.get_key_value(interval.as_str()) else {
                continue;
            };
            let count = counts.entry(every).or_insert(0);
            if *count == 0 {
                // This is the most recent snapshot for the interval. If its
                // successor is already due, it no longer covers the bucket:
                // demote it one slot and leave the interval marked for
                // creation.
                let next_due = snapshot.timestamp + durations[every];
                if next_due < now {
                    trace!("  stale for interval {every}");
                    *count += 1;
                } else {
                    let _ = needs_creation.insert(every, false);
                }
            }
            *count += 1;
            if *count <= budget {
                keep = true;
            }
        }

        if !keep {
            to_delete.push(snapshot);
        }
    }

    let to_create = needs_creation
        .into_iter()
        .filter_map(|(interval, needed)| needed.then(|| interval.to_string()))
        .collect();

    Ok(SnapshotPlan { to_create, to_delete })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;
    use serde_json::Value;

    fn at(unix: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(unix, 0).unwrap()
    }

    fn snapshot(name: &str, timestamp: DateTime<Utc>, intervals: &[&str]) -> GroupSnapshot {
        GroupSnapshot {
            namespace: "default".into(),
            name: name.into(),
            group: "web".into(),
            timestamp,
            intervals: intervals.iter().map(ToString::to_string).collect(),
            restore: None,
            handle: Value::Null,
        }
    }

    fn schedule(every: &str, keep: u32) -> SnapshotSchedule {
        SnapshotSchedule {
            every: every.into(),
            keep,
        }
    }

    const BASE: i64 = 1_700_000_000;

    /// Five minutely snapshots with the newest already a minute and a half
    /// old: the bucket is stale, so a new snapshot is due and the oldest
    /// falls out of the `keep + 1` budget.
    #[test]
    fn evicts_beyond_the_budget_and_refreshes_a_stale_head() {
        let snapshots: Vec<_> = (0..5)
            .map(|i| snapshot(&format!("web-{i}"), at(BASE - 240 + i * 60), &["minute"]))
            .collect();
        let now = at(BASE + 90);

        let result = plan(&[schedule("minute", 4)], snapshots.clone(), now).unwrap();

        assert_eq!(result.to_create, vec!["minute".to_string()]);
        assert_eq!(result.to_delete, vec![snapshots[0].clone()]);
    }

    /// Same set evaluated while the newest snapshot still covers its bucket:
    /// steady state, nothing to do.
    #[test]
    fn a_covered_bucket_is_a_noop() {
        let snapshots: Vec<_> = (0..5)
            .map(|i| snapshot(&format!("web-{i}"), at(BASE - 240 + i * 60), &["minute"]))
            .collect();
        let now = at(BASE + 30);

        let result = plan(&[schedule("minute", 4)], snapshots, now).unwrap();

        assert!(result.is_noop());
    }

    #[test]
    fn an_empty_snapshot_set_wants_every_interval() {
        let result = plan(
            &[schedule("hour", 3), schedule("day", 7)],
            Vec::new(),
            at(BASE),
        )
        .unwrap();

        assert_eq!(result.to_create, vec!["day".to_string(), "hour".to_string()]);
        assert!(result.to_delete.is_empty());
    }

    #[test]
    fn an_empty_schedule_deletes_everything() {
        let snapshots = vec![
            snapshot("web-0", at(BASE), &["hour"]),
            snapshot("web-1", at(BASE - 3600), &["hour", "day"]),
        ];

        let result = plan(&[], snapshots.clone(), at(BASE + 10)).unwrap();

        assert!(result.to_create.is_empty());
        assert_eq!(result.to_delete.len(), snapshots.len());
    }

    /// One snapshot can satisfy several schedule rows; a fresh one carrying
    /// both intervals covers both buckets.
    #[test]
    fn one_snapshot_covers_multiple_intervals() {
        let snapshots = vec![snapshot("web-0", at(BASE), &["hour", "day"])];

        let result = plan(
            &[schedule("hour", 2), schedule("day", 1)],
            snapshots,
            at(BASE + 60),
        )
        .unwrap();

        assert!(result.is_noop());
    }

    /// A snapshot is kept as long as any of its intervals is still in
    /// budget, even when another interval it carries has aged out.
    #[test]
    fn a_single_in_budget_interval_keeps_the_snapshot() {
        let snapshots = vec![
            snapshot("web-2", at(BASE), &["hour"]),
            snapshot("web-1", at(BASE - 3600), &["hour", "day"]),
            snapshot("web-0", at(BASE - 7200), &["hour", "day"]),
        ];

        // hour budget = 1 + 1 = 2, so web-0 overflows it; its day interval
        // (budget 3) still holds it.
        let result = plan(
            &[schedule("hour", 1), schedule("day", 2)],
            snapshots,
            at(BASE + 60),
        )
        .unwrap();

        assert!(result.to_delete.is_empty());
    }

    /// Intervals dropped from the schedule stop counting: a snapshot
    /// carrying only such intervals is deleted.
    #[test]
    fn unscheduled_intervals_do_not_protect() {
        let snapshots = vec![
            snapshot("web-1", at(BASE), &["hour"]),
            snapshot("web-0", at(BASE - 60), &["minute"]),
        ];

        let result = plan(&[schedule("hour", 1)], snapshots.clone(), at(BASE + 60)).unwrap();

        assert_eq!(result.to_delete, vec![snapshots[1].clone()]);
        // and they never show up in the create set either
        assert!(result.to_create.is_empty());
    }

    #[test]
    fn duplicate_schedule_entries_collapse_last_wins() {
        let snapshots: Vec<_> = (0..3)
            .map(|i| snapshot(&format!("web-{i}"), at(BASE - i * 3600), &["hour"]))
            .collect();

        // keep 5 first, then keep 0: budget is 0 + 1 = 1
        let result = plan(
            &[schedule("hour", 5), schedule("hour", 0)],
            snapshots,
            at(BASE + 60),
        )
        .unwrap();

        assert_eq!(result.to_delete.len(), 2);
    }

    #[test]
    fn restore_failsafes_are_exempt_from_retention() {
        let mut failsafe = snapshot("web-failsafe", at(BASE - 50), &[]);
        failsafe.restore = Some("1690000000".into());
        let snapshots = vec![snapshot("web-1", at(BASE), &["hour"]), failsafe];

        let result = plan(&[schedule("hour", 0)], snapshots, at(BASE + 60)).unwrap();

        assert!(result.to_delete.is_empty());
    }

    #[test]
    fn a_bad_schedule_interval_fails_the_whole_plan() {
        let err = plan(&[schedule("fortnight", 1)], Vec::new(), at(BASE)).unwrap_err();
        assert!(err.is_code(crate::error::codes::INVALID_INTERVAL));
    }

    /// The stale-head demotion slides the window: the oldest snapshot is
    /// evicted even though the replacement has not been created yet.
    #[rstest]
    #[case(1, 2)]
    #[case(2, 3)]
    #[case(4, 5)]
    fn stale_head_demotes_into_the_budget(#[case] keep: u32, #[case] total: i64) {
        let snapshots: Vec<_> = (0..total)
            .map(|i| snapshot(&format!("web-{i}"), at(BASE - i * 3600), &["hour"]))
            .collect();

        let result = plan(&[schedule("hour", keep)], snapshots, at(BASE + 7200)).unwrap();

        assert_eq!(result.to_create, vec!["hour".to_string()]);
        // budget keep+1, head demoted one slot, so exactly one falls out
        assert_eq!(result.to_delete.len(), 1);
        assert_eq!(result.to_delete[0].name, format!("web-{}", total - 1));
    }

    proptest! {
        /// Planning is deterministic: the same inputs produce the same plan.
        #[test]
        fn plan_is_pure(offsets in prop::collection::vec(0i64..10_000, 0..20), keep in 0u32..5) {
            let snapshots: Vec<_> = offsets
                .iter()
                .enumerate()
                .map(|(i, offset)| snapshot(&format!("web-{i}"), at(BASE - offset), &["hour"]))
                .collect();
            let schedules = [schedule("hour", keep)];
            let now = at(BASE + 60);

            let first = plan(&schedules, snapshots.clone(), now).unwrap();
            let second = plan(&schedules, snapshots, now).unwrap();
            prop_assert_eq!(first, second);
        }

        /// Restore failsafes never end up in the delete set, and deletions
        /// are always drawn from the input.
        #[test]
        fn failsafes_survive_any_schedule(
            offsets in prop::collection::vec(0i64..10_000, 1..20),
            keep in 0u32..3,
        ) {
            let mut snapshots: Vec<_> = offsets
                .iter()
                .enumerate()
                .map(|(i, offset)| snapshot(&format!("web-{i}"), at(BASE - offset), &["minute"]))
                .collect();
            let mut failsafe = snapshot("web-failsafe", at(BASE), &[]);
            failsafe.restore = Some("123".into());
            snapshots.push(failsafe);

            let result = plan(&[schedule("minute", keep)], snapshots.clone(), at(BASE + 30)).unwrap();

            prop_assert!(result.to_delete.iter().all(|s| s.name != "web-failsafe"));
            for deleted in &result.to_delete {
                prop_assert!(snapshots.contains(deleted));
            }
        }
    }
}
