//! # Mobility Pipeline
//!
//! End-to-end orchestration:
//!
//! 1. Normalize towers and build one clipped coverage sector per tower
//! 2. Resolve one deterministic point per event
//! 3. Assemble per-user traces and hand them to the stop-clustering oracle
//! 4. Segment labelled events into staypoint intervals
//! 5. Back-assign staypoint ids onto the original event stream, including
//!    events that were timed but could not be placed
//!
//! Per-record failures (bad timestamps, unknown cells, unresolvable
//! coverage) are collected in the run report. Only oracle contract
//! violations and invalid configuration abort a run.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use geo::Polygon;
use log::{info, warn};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::backassign::{assign_staypoints, TimedEvent};
use crate::error::{MobilityError, OptionExt, Result};
use crate::exclusion::ExclusionGeometry;
use crate::oracle::{align_labels, StopDetector, StopLabel, NOISE_LABEL};
use crate::resolve::{resolve_point, Placement};
use crate::sector::dedup_towers;
use crate::staypoints::{segment_staypoints, LabeledEvent, StaypointInterval};
use crate::traces::{assemble_traces, parse_timestamp, TracePoint};
use crate::{CallEventRecord, GeoPoint, PipelineConfig, RawTower, Shape, Tower};

/// A tower together with its clipped coverage.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageSector {
    pub tower: Tower,
    /// Coverage in projected meters; `Empty` when clipping removed everything
    pub shape: Shape,
}

impl CoverageSector {
    pub fn cell_id(&self) -> &str {
        &self.tower.cell_id
    }

    pub fn is_resolvable(&self) -> bool {
        !self.shape.is_empty()
    }
}

/// One input event with everything the pipeline derived for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    /// Position in the original input
    pub record_index: usize,
    pub unique_id: String,
    pub cell_id: String,
    /// Normalized time, `None` when the raw value could not be parsed
    pub timestamp: Option<DateTime<Utc>>,
    /// Resolved longitude/latitude, `None` when unresolved
    pub location: Option<GeoPoint>,
    pub placement: Option<Placement>,
    pub stop_label: Option<StopLabel>,
    pub staypoint_id: Option<u64>,
}

/// A record the pipeline could not carry through, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub record_index: usize,
    pub reason: MobilityError,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub towers: usize,
    pub unresolvable_towers: usize,
    pub events: usize,
    pub resolved_events: usize,
    pub rejected_events: usize,
    pub centroid_fallbacks: usize,
    pub users: usize,
    pub staypoints: usize,
    pub assigned_events: usize,
}

/// Per-record outcomes of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Records dropped from trace assembly
    pub rejected: Vec<RejectedRecord>,
    /// Recovered problems (malformed azimuths, centroid fallbacks)
    pub warnings: Vec<MobilityError>,
    pub stats: RunStats,
}

/// Everything a run produces.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// One entry per distinct `cell_id`, in first-seen order
    pub coverage: Vec<CoverageSector>,
    /// One entry per input event, in input order
    pub events: Vec<ProcessedEvent>,
    /// Staypoint intervals in id order
    pub staypoints: Vec<StaypointInterval>,
    pub report: RunReport,
}

/// Per-event resolution outcome before trace assembly.
enum Resolution {
    Resolved {
        timestamp: DateTime<Utc>,
        location: GeoPoint,
        placement: Placement,
    },
    Rejected {
        timestamp: Option<DateTime<Utc>>,
        reason: MobilityError,
    },
}

/// The CDR-to-staypoint pipeline. Holds the configuration and the shared,
/// read-only exclusion geometry.
#[derive(Debug, Clone)]
pub struct MobilityPipeline {
    config: PipelineConfig,
    exclusion: ExclusionGeometry,
}

impl MobilityPipeline {
    /// Create a pipeline with an exclusion geometry already in projected meters.
    pub fn new(config: PipelineConfig, exclusion: ExclusionGeometry) -> Self {
        Self { config, exclusion }
    }

    /// Create a pipeline from exclusion polygons in lon/lat.
    pub fn with_geographic_exclusion(config: PipelineConfig, polygons: &[Polygon<f64>]) -> Result<Self> {
        config.validate()?;
        let exclusion = ExclusionGeometry::from_geographic(polygons, &config.projection);
        Ok(Self::new(config, exclusion))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn exclusion(&self) -> &ExclusionGeometry {
        &self.exclusion
    }

    /// Build one clipped coverage sector per distinct tower.
    ///
    /// Returns the sectors plus any recovered bearing warnings.
    pub fn build_coverage(&self, towers: &[RawTower]) -> (Vec<CoverageSector>, Vec<MobilityError>) {
        let start = Instant::now();
        let unique = dedup_towers(towers);

        let build = |raw: &&RawTower| -> (CoverageSector, Vec<MobilityError>) {
            let (tower, warnings) = Tower::from_raw(raw, self.config.default_radius_m);
            let sector = tower.raw_sector(&self.config.projection, self.config.arc_points);
            let shape = self.exclusion.clip(&sector);
            (CoverageSector { tower, shape }, warnings)
        };

        #[cfg(feature = "parallel")]
        let built: Vec<(CoverageSector, Vec<MobilityError>)> = unique.par_iter().map(build).collect();

        #[cfg(not(feature = "parallel"))]
        let built: Vec<(CoverageSector, Vec<MobilityError>)> = unique.iter().map(build).collect();

        let mut coverage = Vec::with_capacity(built.len());
        let mut warnings = Vec::new();
        for (sector, tower_warnings) in built {
            if !sector.is_resolvable() {
                warn!("[Pipeline] Cell {} has no coverage after clipping", sector.cell_id());
            }
            coverage.push(sector);
            warnings.extend(tower_warnings);
        }

        info!(
            "[Pipeline] Built {} coverage sectors ({} unresolvable) in {}ms",
            coverage.len(),
            coverage.iter().filter(|c| !c.is_resolvable()).count(),
            start.elapsed().as_millis()
        );
        (coverage, warnings)
    }

    fn resolve_event(&self, event: &CallEventRecord, coverage: &HashMap<&str, &CoverageSector>) -> Resolution {
        let timestamp = match parse_timestamp(&event.timestamp, &self.config.timezone) {
            Ok(t) => t,
            Err(reason) => return Resolution::Rejected { timestamp: None, reason },
        };

        let resolved = coverage
            .get(event.cell_id.as_str())
            .copied()
            .ok_or_unknown_cell(&event.cell_id)
            .and_then(|sector| {
                resolve_point(
                    &event.unique_id,
                    &event.cell_id,
                    &sector.shape,
                    self.config.max_sampling_attempts,
                )
            });

        match resolved {
            Ok(point) => Resolution::Resolved {
                timestamp,
                location: point.to_geographic(&self.config.projection),
                placement: point.placement,
            },
            Err(reason) => Resolution::Rejected {
                timestamp: Some(timestamp),
                reason,
            },
        }
    }

    /// Run the whole pipeline.
    ///
    /// `detector` labels the assembled traces. A label count that does not
    /// match the traces aborts with `OracleContractViolation`.
    pub fn run<D>(&self, events: &[CallEventRecord], towers: &[RawTower], detector: &D) -> Result<PipelineOutput>
    where
        D: StopDetector + ?Sized,
    {
        self.config.validate()?;
        let run_start = Instant::now();
        info!(
            "[Pipeline] Starting run: {} events, {} tower rows",
            events.len(),
            towers.len()
        );

        // Coverage
        let (coverage, mut warnings) = self.build_coverage(towers);
        let coverage_map: HashMap<&str, &CoverageSector> =
            coverage.iter().map(|c| (c.cell_id(), c)).collect();

        // Point resolution
        let resolve_start = Instant::now();
        #[cfg(feature = "parallel")]
        let resolutions: Vec<Resolution> = events
            .par_iter()
            .map(|event| self.resolve_event(event, &coverage_map))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let resolutions: Vec<Resolution> = events
            .iter()
            .map(|event| self.resolve_event(event, &coverage_map))
            .collect();

        let mut processed = Vec::with_capacity(events.len());
        let mut rejected = Vec::new();
        let mut trace_points = Vec::with_capacity(events.len());
        for (record_index, (event, resolution)) in events.iter().zip(resolutions).enumerate() {
            let mut row = ProcessedEvent {
                record_index,
                unique_id: event.unique_id.clone(),
                cell_id: event.cell_id.clone(),
                timestamp: None,
                location: None,
                placement: None,
                stop_label: None,
                staypoint_id: None,
            };
            match resolution {
                Resolution::Resolved {
                    timestamp,
                    location,
                    placement,
                } => {
                    if placement == Placement::CentroidFallback {
                        warnings.push(MobilityError::SamplingExhausted {
                            unique_id: event.unique_id.clone(),
                            cell_id: event.cell_id.clone(),
                            attempts: self.config.max_sampling_attempts,
                        });
                    }
                    row.timestamp = Some(timestamp);
                    row.location = Some(location);
                    row.placement = Some(placement);
                    trace_points.push(TracePoint {
                        record_index,
                        user_id: event.unique_id.clone(),
                        timestamp,
                        location,
                    });
                }
                Resolution::Rejected { timestamp, reason } => {
                    row.timestamp = timestamp;
                    rejected.push(RejectedRecord {
                        record_index,
                        reason,
                    });
                }
            }
            processed.push(row);
        }
        info!(
            "[Pipeline] Resolved {}/{} events ({} rejected) in {}ms",
            trace_points.len(),
            events.len(),
            rejected.len(),
            resolve_start.elapsed().as_millis()
        );

        // Oracle
        let traces = assemble_traces(trace_points);
        let labels = detector.fit_predict(&traces, &self.config.stop_detection);
        let aligned = align_labels(&traces, &labels)?;

        let mut labelled = Vec::with_capacity(labels.len());
        for (trace, trace_labels) in traces.iter().zip(&aligned) {
            for (i, &label) in trace_labels.iter().enumerate() {
                let record_index = trace.record_indices[i];
                let fix = &trace.fixes[i];
                processed[record_index].stop_label = Some(label);
                labelled.push(LabeledEvent {
                    record_index,
                    user_id: trace.user_id.clone(),
                    timestamp: trace.timestamps[i],
                    label,
                    location: GeoPoint::new(fix.latitude, fix.longitude),
                });
            }
        }

        // Segmentation and back-assignment
        let segmentation = segment_staypoints(&labelled, &self.config.timezone, self.config.segmentation);
        let mut own_run: Vec<Option<u64>> = vec![None; processed.len()];
        for (event, run) in labelled.iter().zip(&segmentation.assignments) {
            if let Some(slot) = own_run.get_mut(event.record_index) {
                *slot = *run;
            }
        }

        // Every timed row takes part except noise, which never joins a staypoint
        let (timed_rows, timed): (Vec<usize>, Vec<TimedEvent>) = processed
            .iter()
            .filter(|row| row.stop_label != Some(NOISE_LABEL))
            .filter_map(|row| {
                row.timestamp.map(|timestamp| {
                    let event = TimedEvent {
                        user_id: row.unique_id.clone(),
                        timestamp,
                        staypoint_id: own_run[row.record_index],
                    };
                    (row.record_index, event)
                })
            })
            .unzip();
        let assigned = assign_staypoints(&timed, &segmentation.intervals);
        for (&record_index, staypoint_id) in timed_rows.iter().zip(&assigned) {
            processed
                .get_mut(record_index)
                .ok_or_internal("timed event outside input range")?
                .staypoint_id = *staypoint_id;
        }

        let stats = RunStats {
            towers: coverage.len(),
            unresolvable_towers: coverage.iter().filter(|c| !c.is_resolvable()).count(),
            events: events.len(),
            resolved_events: labelled.len(),
            rejected_events: rejected.len(),
            centroid_fallbacks: warnings
                .iter()
                .filter(|w| matches!(w, MobilityError::SamplingExhausted { .. }))
                .count(),
            users: traces.len(),
            staypoints: segmentation.intervals.len(),
            assigned_events: assigned.iter().filter(|a| a.is_some()).count(),
        };

        info!(
            "[Pipeline] Run complete in {}ms: {} users, {} staypoints, {} events assigned",
            run_start.elapsed().as_millis(),
            stats.users,
            stats.staypoints,
            stats.assigned_events
        );

        Ok(PipelineOutput {
            coverage,
            events: processed,
            staypoints: segmentation.intervals,
            report: RunReport {
                rejected,
                warnings,
                stats,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traces::{RawTimestamp, UserTrace};

    fn tower(id: &str, lat: f64, lon: f64) -> RawTower {
        RawTower {
            cell_id: id.to_string(),
            longitude: lon,
            latitude: lat,
            azimuth_min: Some("0".to_string()),
            azimuth_max: Some("120".to_string()),
            radius: Some(500.0),
        }
    }

    fn record(user: &str, ts: &str, cell: &str) -> CallEventRecord {
        CallEventRecord {
            unique_id: user.to_string(),
            timestamp: RawTimestamp::Text(ts.to_string()),
            cell_id: cell.to_string(),
        }
    }

    fn constant_oracle(label: StopLabel) -> impl Fn(&[UserTrace]) -> Vec<StopLabel> {
        move |traces: &[UserTrace]| traces.iter().flat_map(|t| t.fixes.iter().map(|_| label)).collect()
    }

    #[test]
    fn test_rejected_records_are_reported() {
        let pipeline = MobilityPipeline::new(PipelineConfig::default(), ExclusionGeometry::empty());
        let towers = vec![tower("c1", 38.72, -9.14)];
        let events = vec![
            record("u", "2024-02-10 09:00:00", "c1"),
            record("u", "not a time", "c1"),
            record("u", "2024-02-10 10:00:00", "missing"),
        ];
        let out = pipeline.run(&events, &towers, &constant_oracle(1)).unwrap();

        assert_eq!(out.report.stats.resolved_events, 1);
        assert_eq!(out.report.rejected.len(), 2);
        assert!(matches!(
            out.report.rejected[0].reason,
            MobilityError::TimestampParseFailure { .. }
        ));
        assert_eq!(
            out.report.rejected[1].reason,
            MobilityError::UnknownCell {
                cell_id: "missing".to_string()
            }
        );
        assert!(out.events[1].location.is_none());
        assert!(out.events[2].timestamp.is_some());
        assert_eq!(out.events[0].staypoint_id, Some(1));
    }

    #[test]
    fn test_oracle_mismatch_aborts() {
        let pipeline = MobilityPipeline::new(PipelineConfig::default(), ExclusionGeometry::empty());
        let towers = vec![tower("c1", 38.72, -9.14)];
        let events = vec![
            record("u", "2024-02-10 09:00:00", "c1"),
            record("u", "2024-02-10 09:30:00", "c1"),
        ];
        let short = |_: &[UserTrace]| -> Vec<StopLabel> { vec![1] };
        let err = pipeline.run(&events, &towers, &short).unwrap_err();
        assert!(matches!(err, MobilityError::OracleContractViolation { .. }));
    }

    #[test]
    fn test_noise_events_get_no_staypoint() {
        let pipeline = MobilityPipeline::new(PipelineConfig::default(), ExclusionGeometry::empty());
        let towers = vec![tower("c1", 38.72, -9.14)];
        let events = vec![
            record("u", "2024-02-10 09:00:00", "c1"),
            record("u", "2024-02-10 09:30:00", "c1"),
        ];
        let out = pipeline.run(&events, &towers, &constant_oracle(NOISE_LABEL)).unwrap();
        assert!(out.staypoints.is_empty());
        assert!(out.events.iter().all(|e| e.staypoint_id.is_none()));
        assert!(out.events.iter().all(|e| e.stop_label == Some(NOISE_LABEL)));
    }

    #[test]
    fn test_build_coverage_dedups_and_warns() {
        let pipeline = MobilityPipeline::new(PipelineConfig::default(), ExclusionGeometry::empty());
        let mut bad = tower("c2", 38.73, -9.15);
        bad.azimuth_min = Some("north".to_string());
        let towers = vec![tower("c1", 38.72, -9.14), bad, tower("c1", 0.0, 0.0)];
        let (coverage, warnings) = pipeline.build_coverage(&towers);
        assert_eq!(coverage.len(), 2);
        assert_eq!(coverage[0].tower.location, GeoPoint::new(38.72, -9.14));
        assert_eq!(warnings.len(), 1);
        assert!(coverage.iter().all(|c| c.is_resolvable()));
    }

    #[test]
    fn test_invalid_config_aborts() {
        let config = PipelineConfig {
            arc_points: 1,
            ..PipelineConfig::default()
        };
        let pipeline = MobilityPipeline::new(config, ExclusionGeometry::empty());
        let err = pipeline.run(&[], &[], &constant_oracle(1)).unwrap_err();
        assert!(matches!(err, MobilityError::InvalidConfig { .. }));
    }
}
