//! Staypoint segmentation.
//!
//! Labelled events are walked per user in time order. A run ends whenever the
//! user, the calendar day (in the configured zone) or the stop label changes.
//! Noise rows (`-1`) never belong to a run. Each run becomes one
//! [`StaypointInterval`] with ids handed out in discovery order.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use log::{info, warn};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::oracle::{StopLabel, NOISE_LABEL};
use crate::{GeoPoint, SegmentationStrategy};

/// One event with its resolved location and oracle label.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledEvent {
    /// Position of the event in the original input
    pub record_index: usize,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub label: StopLabel,
    pub location: GeoPoint,
}

/// A time interval during which a user is inferred to be stationary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaypointInterval {
    /// Discovery-order id, starting at 1
    pub staypoint_id: u64,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stop_label: StopLabel,
    /// Location of the first event in the run
    pub location: GeoPoint,
    pub event_count: usize,
}

impl StaypointInterval {
    /// Whether `t` lies within `[started_at, finished_at]`.
    pub fn contains(&self, t: &DateTime<Utc>) -> bool {
        self.started_at <= *t && *t <= self.finished_at
    }

    pub fn duration_seconds(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }
}

/// Segmentation result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segmentation {
    /// Intervals in id order (per user, ascending `started_at` for contiguous runs)
    pub intervals: Vec<StaypointInterval>,
    /// Staypoint id per input event, aligned with the input slice
    pub assignments: Vec<Option<u64>>,
}

/// Event indices (into the input slice) forming one run.
type Run = Vec<usize>;

fn day_of(event: &LabeledEvent, zone: &Tz) -> NaiveDate {
    event.timestamp.with_timezone(zone).date_naive()
}

/// Maximal contiguous runs over one user's time-sorted events.
///
/// An event at the same instant as the open run's latest event joins that
/// run whatever its label, so no two runs of a user share an instant.
fn contiguous_runs(events: &[LabeledEvent], order: &[usize], zone: &Tz) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    // Open run with its (day, label) key and latest timestamp
    let mut current: Option<(Run, (NaiveDate, StopLabel), DateTime<Utc>)> = None;

    for &idx in order {
        let event = &events[idx];
        if event.label == NOISE_LABEL {
            if let Some((run, _, _)) = current.take() {
                runs.push(run);
            }
            continue;
        }

        let key = (day_of(event, zone), event.label);
        let joins = matches!(
            &current,
            Some((_, open_key, last)) if *open_key == key || *last == event.timestamp
        );
        if joins {
            if let Some((run, _, last)) = current.as_mut() {
                run.push(idx);
                *last = event.timestamp;
            }
        } else {
            if let Some((run, _, _)) = current.take() {
                runs.push(run);
            }
            current = Some((vec![idx], key, event.timestamp));
        }
    }

    if let Some((run, _, _)) = current {
        runs.push(run);
    }
    runs
}

/// One group per (day, label), ordered by first appearance.
fn daily_groups(events: &[LabeledEvent], order: &[usize], zone: &Tz) -> Vec<Run> {
    let mut slots: HashMap<(NaiveDate, StopLabel), usize> = HashMap::new();
    let mut groups: Vec<Run> = Vec::new();

    for &idx in order {
        let event = &events[idx];
        if event.label == NOISE_LABEL {
            continue;
        }
        let key = (day_of(event, zone), event.label);
        let slot = *slots.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(idx);
    }
    groups
}

/// Segment labelled events into staypoint intervals.
///
/// Events may arrive in any order; they are sorted by
/// `(user_id, timestamp, label)` first, so the same events always yield the same
/// intervals and ids.
pub fn segment_staypoints(
    events: &[LabeledEvent],
    zone: &Tz,
    strategy: SegmentationStrategy,
) -> Segmentation {
    if events.is_empty() {
        return Segmentation::default();
    }

    let mut order: Vec<usize> = (0..events.len()).collect();
    order.sort_by(|&a, &b| {
        events[a]
            .user_id
            .cmp(&events[b].user_id)
            .then(events[a].timestamp.cmp(&events[b].timestamp))
            .then(events[a].label.cmp(&events[b].label))
    });

    // Split the sorted order into per-user slices
    let mut users: Vec<&[usize]> = Vec::new();
    let mut start = 0;
    for i in 1..=order.len() {
        if i == order.len() || events[order[i]].user_id != events[order[start]].user_id {
            users.push(&order[start..i]);
            start = i;
        }
    }

    let segment_user = |user_order: &&[usize]| -> Vec<Run> {
        match strategy {
            SegmentationStrategy::ContiguousRuns => contiguous_runs(events, user_order, zone),
            SegmentationStrategy::DailyGrouping => daily_groups(events, user_order, zone),
        }
    };

    #[cfg(feature = "parallel")]
    let runs_per_user: Vec<Vec<Run>> = users.par_iter().map(segment_user).collect();

    #[cfg(not(feature = "parallel"))]
    let runs_per_user: Vec<Vec<Run>> = users.iter().map(segment_user).collect();

    // Ids are handed out sequentially so they do not depend on scheduling
    let mut intervals = Vec::new();
    let mut assignments = vec![None; events.len()];
    let mut next_id: u64 = 1;
    for run in runs_per_user.into_iter().flatten() {
        let first = &events[run[0]];
        let mut started_at = first.timestamp;
        let mut finished_at = first.timestamp;
        for &idx in &run {
            started_at = started_at.min(events[idx].timestamp);
            finished_at = finished_at.max(events[idx].timestamp);
            assignments[idx] = Some(next_id);
        }

        intervals.push(StaypointInterval {
            staypoint_id: next_id,
            user_id: first.user_id.clone(),
            started_at,
            finished_at,
            stop_label: first.label,
            location: first.location,
            event_count: run.len(),
        });
        next_id += 1;
    }

    if strategy == SegmentationStrategy::DailyGrouping {
        warn!("[Staypoints] Daily grouping merges same-day revisits; intervals may overlap");
    }
    info!(
        "[Staypoints] {} events from {} users -> {} staypoints",
        events.len(),
        users.len(),
        intervals.len()
    );

    Segmentation {
        intervals,
        assignments,
    }
}
