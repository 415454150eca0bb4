//! Timestamp normalization and per-user trace assembly.
//!
//! The stop-clustering oracle consumes one `(lat, lon, unix_timestamp)`
//! sequence per user, ascending in time. Users are emitted in id order so the
//! flattened label stream is reproducible.

use std::collections::BTreeMap;

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{MobilityError, Result};
use crate::GeoPoint;

/// Naive layouts accepted for text timestamps, tried in order.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y%m%d%H%M%S",
];

/// Event time as delivered: either epoch seconds or text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Epoch(i64),
    Text(String),
}

impl RawTimestamp {
    fn display(&self) -> String {
        match self {
            RawTimestamp::Epoch(secs) => secs.to_string(),
            RawTimestamp::Text(text) => text.clone(),
        }
    }
}

/// Drop a stray trailing fractional-zero marker (`"... 10:00:00.0"`).
fn strip_fraction_marker(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(dot) = trimmed.rfind('.') {
        let tail = &trimmed[dot + 1..];
        if !tail.is_empty() && tail.bytes().all(|b| b == b'0') {
            return &trimmed[..dot];
        }
    }
    trimmed
}

fn parse_failure(raw: &RawTimestamp, message: &str) -> MobilityError {
    MobilityError::TimestampParseFailure {
        raw: raw.display(),
        message: message.to_string(),
    }
}

/// Normalize a raw timestamp to UTC.
///
/// Text with an explicit offset (RFC 3339) is taken as-is; naive text is
/// interpreted in `zone`. Ambiguous local times (DST fold) resolve to the
/// earlier instant; local times inside a DST gap are rejected.
pub fn parse_timestamp(raw: &RawTimestamp, zone: &Tz) -> Result<DateTime<Utc>> {
    let text = match raw {
        RawTimestamp::Epoch(secs) => {
            return Utc
                .timestamp_opt(*secs, 0)
                .single()
                .ok_or_else(|| parse_failure(raw, "epoch out of range"));
        }
        RawTimestamp::Text(text) => strip_fraction_marker(text),
    };

    if text.is_empty() {
        return Err(parse_failure(raw, "empty timestamp"));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return match zone.from_local_datetime(&naive) {
                LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
                LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
                LocalResult::None => Err(parse_failure(raw, "local time does not exist in zone")),
            };
        }
    }

    if text.bytes().all(|b| b.is_ascii_digit()) && text.len() <= 12 {
        if let Ok(secs) = text.parse::<i64>() {
            return parse_timestamp(&RawTimestamp::Epoch(secs), zone);
        }
    }

    Err(parse_failure(raw, "unrecognized format"))
}

/// A resolved event ready for trace assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct TracePoint {
    /// Position of the event in the original input
    pub record_index: usize,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub location: GeoPoint,
}

/// One oracle input row: field order is latitude, longitude, unix time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceFix {
    pub latitude: f64,
    pub longitude: f64,
    pub unix_timestamp: i64,
}

impl TraceFix {
    /// The fix as the `[lat, lon, unix_timestamp]` triple the oracle expects.
    pub fn as_triple(&self) -> [f64; 3] {
        [self.latitude, self.longitude, self.unix_timestamp as f64]
    }
}

/// Time-sorted sequence of fixes for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct UserTrace {
    pub user_id: String,
    pub fixes: Vec<TraceFix>,
    /// Original record index of each fix, aligned with `fixes`
    pub record_indices: Vec<usize>,
    /// Full-precision timestamp of each fix, aligned with `fixes`
    pub timestamps: Vec<DateTime<Utc>>,
}

impl UserTrace {
    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }
}

fn build_trace(user_id: String, mut points: Vec<TracePoint>) -> UserTrace {
    // Stable: equal timestamps keep input order
    points.sort_by_key(|p| p.timestamp);

    let fixes = points
        .iter()
        .map(|p| TraceFix {
            latitude: p.location.latitude,
            longitude: p.location.longitude,
            unix_timestamp: p.timestamp.timestamp(),
        })
        .collect();
    let record_indices = points.iter().map(|p| p.record_index).collect();
    let timestamps = points.iter().map(|p| p.timestamp).collect();

    UserTrace {
        user_id,
        fixes,
        record_indices,
        timestamps,
    }
}

/// Group points by user (users in id order) and sort each group by time.
pub fn assemble_traces(points: Vec<TracePoint>) -> Vec<UserTrace> {
    let mut by_user: BTreeMap<String, Vec<TracePoint>> = BTreeMap::new();
    for point in points {
        by_user.entry(point.user_id.clone()).or_default().push(point);
    }

    #[cfg(feature = "parallel")]
    let traces: Vec<UserTrace> = by_user
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(user_id, points)| build_trace(user_id, points))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let traces: Vec<UserTrace> = by_user
        .into_iter()
        .map(|(user_id, points)| build_trace(user_id, points))
        .collect();

    traces
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Lisbon;

    fn text(s: &str) -> RawTimestamp {
        RawTimestamp::Text(s.to_string())
    }

    fn point(idx: usize, user: &str, secs: i64) -> TracePoint {
        TracePoint {
            record_index: idx,
            user_id: user.to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            location: GeoPoint::new(38.7 + idx as f64 * 0.001, -9.1),
        }
    }

    #[test]
    fn test_parse_strips_fraction_marker() {
        // February: Lisbon is on UTC
        let dt = parse_timestamp(&text("2024-02-10 09:30:00.0"), &Lisbon).unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 2, 10, 9, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_uses_zone_for_naive_times() {
        // July: Lisbon is UTC+1
        let dt = parse_timestamp(&text("2024-07-10 09:30:00"), &Lisbon).unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 7, 10, 8, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_rfc3339_and_epoch() {
        let dt = parse_timestamp(&text("2024-02-10T09:30:00+02:00"), &Lisbon).unwrap();
        assert_eq!(dt.timestamp(), Utc.with_ymd_and_hms(2024, 2, 10, 7, 30, 0).unwrap().timestamp());

        let epoch = parse_timestamp(&RawTimestamp::Epoch(1_707_557_400), &Lisbon).unwrap();
        assert_eq!(epoch.timestamp(), 1_707_557_400);
        let epoch_text = parse_timestamp(&text("1707557400"), &Lisbon).unwrap();
        assert_eq!(epoch, epoch_text);
    }

    #[test]
    fn test_parse_failure_is_reported() {
        let err = parse_timestamp(&text("tomorrow-ish"), &Lisbon).unwrap_err();
        assert!(matches!(err, MobilityError::TimestampParseFailure { .. }));
        assert!(parse_timestamp(&text("   "), &Lisbon).is_err());
        // 01:30 on the spring-forward night does not exist in Lisbon
        assert!(parse_timestamp(&text("2024-03-31 01:30:00"), &Lisbon).is_err());
    }

    #[test]
    fn test_assemble_sorts_per_user() {
        let points = vec![
            point(0, "b", 300),
            point(1, "a", 200),
            point(2, "b", 100),
            point(3, "a", 100),
        ];
        let traces = assemble_traces(points);
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].user_id, "a");
        assert_eq!(traces[0].record_indices, vec![3, 1]);
        assert_eq!(traces[1].user_id, "b");
        assert_eq!(traces[1].record_indices, vec![2, 0]);
        assert_eq!(traces[1].fixes[0].unix_timestamp, 100);
    }

    #[test]
    fn test_assemble_ties_keep_input_order() {
        let points = vec![point(0, "a", 50), point(1, "a", 50), point(2, "a", 10)];
        let traces = assemble_traces(points);
        assert_eq!(traces[0].record_indices, vec![2, 0, 1]);
    }

    #[test]
    fn test_fix_triple_order() {
        let fix = TraceFix {
            latitude: 38.7,
            longitude: -9.1,
            unix_timestamp: 42,
        };
        assert_eq!(fix.as_triple(), [38.7, -9.1, 42.0]);
    }
}
