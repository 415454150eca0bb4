//! Interval back-assignment.
//!
//! Propagates staypoint ids from aggregated intervals back onto the
//! fine-grained event stream. Events the segmenter placed in a run keep that
//! run's id. Any other event that starts an interval opens a candidate; the
//! latest candidate is carried forward through the user's time-sorted stream
//! and kept only while the event is not past the candidate's `finished_at`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::debug;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::staypoints::StaypointInterval;

/// What back-assignment needs from an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEvent {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    /// Run the segmenter already placed this event in
    pub staypoint_id: Option<u64>,
}

/// Assign an optional staypoint id to every event.
///
/// The result is aligned with `events`. An event receives an id only if
/// `started_at <= timestamp <= finished_at` for that id's interval. An
/// event's own run always wins; for events outside any run, two intervals
/// starting at the same instant resolve to the higher id.
pub fn assign_staypoints(events: &[TimedEvent], intervals: &[StaypointInterval]) -> Vec<Option<u64>> {
    let mut starts: HashMap<(&str, DateTime<Utc>), u64> = HashMap::with_capacity(intervals.len());
    let mut finished: HashMap<u64, DateTime<Utc>> = HashMap::with_capacity(intervals.len());
    for interval in intervals {
        let slot = starts
            .entry((interval.user_id.as_str(), interval.started_at))
            .or_insert(interval.staypoint_id);
        *slot = (*slot).max(interval.staypoint_id);
        finished.insert(interval.staypoint_id, interval.finished_at);
    }

    let mut order: Vec<usize> = (0..events.len()).collect();
    order.sort_by(|&a, &b| {
        events[a]
            .user_id
            .cmp(&events[b].user_id)
            .then(events[a].timestamp.cmp(&events[b].timestamp))
    });

    let mut users: Vec<&[usize]> = Vec::new();
    let mut start = 0;
    for i in 1..=order.len() {
        if i == order.len() || events[order[i]].user_id != events[order[start]].user_id {
            users.push(&order[start..i]);
            start = i;
        }
    }

    let assign_user = |user_order: &&[usize]| -> Vec<(usize, Option<u64>)> {
        let mut candidate: Option<u64> = None;
        user_order
            .iter()
            .map(|&idx| {
                let event = &events[idx];
                if let Some(id) = event.staypoint_id {
                    candidate = Some(id);
                } else if let Some(&id) = starts.get(&(event.user_id.as_str(), event.timestamp)) {
                    candidate = Some(id);
                }
                let kept = candidate.filter(|id| {
                    finished
                        .get(id)
                        .map_or(false, |finished_at| event.timestamp <= *finished_at)
                });
                (idx, kept)
            })
            .collect()
    };

    #[cfg(feature = "parallel")]
    let per_user: Vec<Vec<(usize, Option<u64>)>> = users.par_iter().map(assign_user).collect();

    #[cfg(not(feature = "parallel"))]
    let per_user: Vec<Vec<(usize, Option<u64>)>> = users.iter().map(assign_user).collect();

    let mut assigned = vec![None; events.len()];
    for (idx, id) in per_user.into_iter().flatten() {
        assigned[idx] = id;
    }

    debug!(
        "[BackAssign] {}/{} events inside a staypoint",
        assigned.iter().filter(|a| a.is_some()).count(),
        events.len()
    );
    assigned
}
