//! Contract with the external stop-clustering oracle.
//!
//! The oracle sees one time-sorted `(lat, lon, unix_timestamp)` sequence per
//! user and returns one integer label per fix, flattened in the same
//! user-then-time order. `-1` marks noise.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{MobilityError, Result};
use crate::traces::UserTrace;

/// Oracle-assigned stop label.
pub type StopLabel = i64;

/// Label for points that belong to no stay.
pub const NOISE_LABEL: StopLabel = -1;

/// Parameters forwarded to the clustering oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDetectionParams {
    /// Max roaming distance within a stay (meters)
    pub r1: f64,
    /// Max distance between stay locations merged into one stop (meters)
    pub r2: f64,
    /// Label stays observed only once
    pub label_singleton: bool,
    /// Minimum stay duration (seconds)
    pub min_staying_time: i64,
    /// Maximum gap between consecutive fixes of a stay (seconds)
    pub max_time_between: i64,
    /// Minimum fixes per stay
    pub min_size: usize,
}

impl Default for StopDetectionParams {
    fn default() -> Self {
        Self {
            r1: 20.0,
            r2: 20.0,
            label_singleton: true,
            min_staying_time: 600,
            max_time_between: 86_400,
            min_size: 2,
        }
    }
}

/// External stop-clustering oracle.
pub trait StopDetector {
    /// Label every fix of every trace, flattened in input order.
    fn fit_predict(&self, traces: &[UserTrace], params: &StopDetectionParams) -> Vec<StopLabel>;
}

/// Plain closures are oracles too (parameters are ignored).
impl<F> StopDetector for F
where
    F: Fn(&[UserTrace]) -> Vec<StopLabel>,
{
    fn fit_predict(&self, traces: &[UserTrace], _params: &StopDetectionParams) -> Vec<StopLabel> {
        self(traces)
    }
}

/// Split a flat label list back onto the traces it was computed for.
///
/// Fails with `OracleContractViolation` when the label count does not match
/// the number of fixes; downstream alignment is undefined in that case.
pub fn align_labels(traces: &[UserTrace], labels: &[StopLabel]) -> Result<Vec<Vec<StopLabel>>> {
    let expected: usize = traces.iter().map(UserTrace::len).sum();
    if labels.len() != expected {
        warn!(
            "[Oracle] Contract violation: {} labels for {} fixes",
            labels.len(),
            expected
        );
        return Err(MobilityError::OracleContractViolation {
            user_id: None,
            expected,
            actual: labels.len(),
        });
    }

    let mut aligned = Vec::with_capacity(traces.len());
    let mut offset = 0;
    for trace in traces {
        aligned.push(labels[offset..offset + trace.len()].to_vec());
        offset += trace.len();
    }

    let noise = labels.iter().filter(|&&l| l == NOISE_LABEL).count();
    debug!(
        "[Oracle] Aligned {} labels over {} traces ({} noise)",
        labels.len(),
        traces.len(),
        noise
    );
    Ok(aligned)
}

/// Check nested per-user labels against their traces and flatten them.
///
/// For oracles that answer per user rather than with one flat list.
pub fn flatten_nested(traces: &[UserTrace], nested: Vec<Vec<StopLabel>>) -> Result<Vec<StopLabel>> {
    if nested.len() != traces.len() {
        return Err(MobilityError::OracleContractViolation {
            user_id: None,
            expected: traces.len(),
            actual: nested.len(),
        });
    }
    for (trace, labels) in traces.iter().zip(&nested) {
        if labels.len() != trace.len() {
            return Err(MobilityError::OracleContractViolation {
                user_id: Some(trace.user_id.clone()),
                expected: trace.len(),
                actual: labels.len(),
            });
        }
    }
    Ok(nested.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traces::TraceFix;
    use chrono::{TimeZone, Utc};

    fn trace(user: &str, n: usize) -> UserTrace {
        UserTrace {
            user_id: user.to_string(),
            fixes: (0..n)
                .map(|i| TraceFix {
                    latitude: 38.7,
                    longitude: -9.1,
                    unix_timestamp: i as i64,
                })
                .collect(),
            record_indices: (0..n).collect(),
            timestamps: (0..n)
                .map(|i| Utc.timestamp_opt(i as i64, 0).unwrap())
                .collect(),
        }
    }

    #[test]
    fn test_align_labels() {
        let traces = vec![trace("a", 2), trace("b", 3)];
        let aligned = align_labels(&traces, &[1, 1, -1, 2, 2]).unwrap();
        assert_eq!(aligned, vec![vec![1, 1], vec![-1, 2, 2]]);
    }

    #[test]
    fn test_align_labels_count_mismatch() {
        let traces = vec![trace("a", 2), trace("b", 3)];
        let err = align_labels(&traces, &[1, 1, 2]).unwrap_err();
        assert_eq!(
            err,
            MobilityError::OracleContractViolation {
                user_id: None,
                expected: 5,
                actual: 3
            }
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_flatten_nested_names_user() {
        let traces = vec![trace("a", 2), trace("b", 3)];
        let err = flatten_nested(&traces, vec![vec![1, 1], vec![2, 2]]).unwrap_err();
        assert!(matches!(
            err,
            MobilityError::OracleContractViolation { user_id: Some(ref u), .. } if u == "b"
        ));
        let flat = flatten_nested(&traces, vec![vec![1, 1], vec![2, 2, 2]]).unwrap();
        assert_eq!(flat, vec![1, 1, 2, 2, 2]);
    }

    #[test]
    fn test_closure_oracle() {
        let oracle = |traces: &[UserTrace]| -> Vec<StopLabel> {
            traces.iter().flat_map(|t| t.fixes.iter().map(|_| 7)).collect()
        };
        let traces = vec![trace("a", 3)];
        let labels = oracle.fit_predict(&traces, &StopDetectionParams::default());
        assert_eq!(labels, vec![7, 7, 7]);
    }
}
