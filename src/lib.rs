//! # CDR Staypoints
//!
//! Turns antenna-level mobile network events (CDRs) into plausible,
//! privacy-preserving points and aggregates per-user point sequences into
//! staypoint intervals.
//!
//! This library provides:
//! - Directional sector geometry from antenna bearings
//! - Exclusion-zone clipping (water and other non-traversable area)
//! - Reproducible pseudo-random point placement per (user, cell)
//! - Per-user trace assembly for an external stop-clustering oracle
//! - Contiguous-run staypoint segmentation and interval back-assignment
//!
//! ## Features
//!
//! - **`parallel`** - Per-tower, per-event and per-user work runs on rayon
//!
//! ## Quick Start
//!
//! ```rust
//! use cdr_staypoints::{
//!     CallEventRecord, ExclusionGeometry, MobilityPipeline, PipelineConfig, RawTimestamp,
//!     RawTower, UserTrace,
//! };
//!
//! let towers = vec![RawTower {
//!     cell_id: "cell-1".to_string(),
//!     longitude: -9.1393,
//!     latitude: 38.7223,
//!     azimuth_min: Some("30".to_string()),
//!     azimuth_max: Some("150".to_string()),
//!     radius: None,
//! }];
//! let events = vec![CallEventRecord {
//!     unique_id: "user-1".to_string(),
//!     timestamp: RawTimestamp::Text("2024-02-10 09:00:00.0".to_string()),
//!     cell_id: "cell-1".to_string(),
//! }];
//!
//! let pipeline = MobilityPipeline::new(PipelineConfig::default(), ExclusionGeometry::empty());
//! // Every point is its own stop in this toy oracle
//! let oracle = |traces: &[UserTrace]| -> Vec<i64> {
//!     traces.iter().flat_map(|t| t.fixes.iter()).map(|_| 0).collect()
//! };
//! let output = pipeline.run(&events, &towers, &oracle).unwrap();
//! assert_eq!(output.staypoints.len(), 1);
//! assert_eq!(output.events[0].staypoint_id, Some(1));
//! ```

use chrono_tz::Tz;
use geo::{Area, Centroid, Coord, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{MobilityError, OptionExt, Result};

// Geographic <-> metric projection
pub mod projection;
pub use projection::TransverseMercator;

// Antenna sector geometry
pub mod sector;
pub use sector::{angular_span, build_sector, dedup_towers, telecom_to_math, SectorSpan};

// Exclusion-zone clipping
pub mod exclusion;
pub use exclusion::ExclusionGeometry;

// Deterministic point placement
pub mod resolve;
pub use resolve::{resolve_point, seed_for, Placement, ResolvedPoint};

// Timestamp normalization and per-user traces
pub mod traces;
pub use traces::{assemble_traces, parse_timestamp, RawTimestamp, TraceFix, TracePoint, UserTrace};

// Stop-clustering oracle contract
pub mod oracle;
pub use oracle::{align_labels, flatten_nested, StopDetectionParams, StopDetector, StopLabel, NOISE_LABEL};

// Staypoint segmentation
pub mod staypoints;
pub use staypoints::{segment_staypoints, LabeledEvent, Segmentation, StaypointInterval};

// Interval back-assignment
pub mod backassign;
pub use backassign::{assign_staypoints, TimedEvent};

// End-to-end orchestration
pub mod pipeline;
pub use pipeline::{
    CoverageSector, MobilityPipeline, PipelineOutput, ProcessedEvent, RejectedRecord, RunReport,
    RunStats,
};

// Persistable tables and GeoJSON export
pub mod output;
pub use output::{coverage_to_geojson, CoverageRow, EventRow, StaypointRow};

// ============================================================================
// Core Types
// ============================================================================

/// A geographic coordinate with latitude and longitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new geographic point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Tower metadata as it arrives from the network file.
///
/// Bearings are kept as text because the source column mixes numbers,
/// blanks and placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTower {
    pub cell_id: String,
    pub longitude: f64,
    pub latitude: f64,
    pub azimuth_min: Option<String>,
    pub azimuth_max: Option<String>,
    /// Per-tower coverage radius override in meters
    pub radius: Option<f64>,
}

/// A normalized tower with numeric bearings and a resolved radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tower {
    pub cell_id: String,
    pub location: GeoPoint,
    /// Telecom bearing, degrees clockwise from north
    pub azimuth_min: f64,
    /// Telecom bearing, degrees clockwise from north
    pub azimuth_max: f64,
    /// Coverage radius in meters
    pub radius: f64,
}

/// A single network event. Immutable input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEventRecord {
    /// Subscriber / device identifier
    pub unique_id: String,
    pub timestamp: RawTimestamp,
    /// Foreign key into the tower table
    pub cell_id: String,
}

/// Coverage geometry in projected meters.
///
/// Multipolygons never survive construction: they collapse to their largest
/// part, and anything without area becomes `Empty`.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Polygon(Polygon<f64>),
    Empty,
}

impl Shape {
    /// Wrap a polygon, treating zero-area polygons as empty.
    pub fn from_polygon(polygon: Polygon<f64>) -> Self {
        if polygon.exterior().0.len() < 4 || polygon.unsigned_area() <= 0.0 {
            Shape::Empty
        } else {
            Shape::Polygon(polygon)
        }
    }

    /// Collapse a multipolygon to its largest-area part.
    ///
    /// On equal areas the first part wins.
    pub fn from_multi(multi: MultiPolygon<f64>) -> Self {
        let mut best: Option<(f64, Polygon<f64>)> = None;
        for part in multi {
            let area = part.unsigned_area();
            if best.as_ref().map_or(true, |(best_area, _)| area > *best_area) {
                best = Some((area, part));
            }
        }
        match best {
            Some((_, polygon)) => Shape::from_polygon(polygon),
            None => Shape::Empty,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Shape::Empty)
    }

    pub fn as_polygon(&self) -> Option<&Polygon<f64>> {
        match self {
            Shape::Polygon(p) => Some(p),
            Shape::Empty => None,
        }
    }

    /// Area in square meters (0 when empty).
    pub fn area(&self) -> f64 {
        match self {
            Shape::Polygon(p) => p.unsigned_area(),
            Shape::Empty => 0.0,
        }
    }

    /// Centroid of the shape, if it has one.
    pub fn centroid(&self) -> Option<Coord> {
        match self {
            Shape::Polygon(p) => p.centroid().map(|c| c.0),
            Shape::Empty => None,
        }
    }
}

/// How staypoint runs are formed from labelled events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentationStrategy {
    /// Maximal contiguous runs of same (user, day, label)
    ContiguousRuns,
    /// One staypoint per (user, day, label) regardless of contiguity.
    /// Revisits on the same day merge, so intervals may overlap.
    DailyGrouping,
}

/// Configuration for the whole pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Coverage radius for towers without an override.
    /// Default: 1000.0 meters
    pub default_radius_m: f64,

    /// Points sampled along each sector arc.
    /// Default: 60
    pub arc_points: usize,

    /// Rejection-sampling attempts before falling back to the centroid.
    /// Default: 50
    pub max_sampling_attempts: u32,

    /// Metric projection used for all geometry.
    /// Default: PT-TM06 / ETRS89 (EPSG:3763)
    pub projection: TransverseMercator,

    /// Zone that defines calendar days for segmentation and naive timestamps.
    /// Default: Europe/Lisbon
    pub timezone: Tz,

    /// Default: contiguous runs
    pub segmentation: SegmentationStrategy,

    /// Parameters handed to the stop-clustering oracle.
    pub stop_detection: StopDetectionParams,
}

impl PipelineConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.default_radius_m.is_finite() || self.default_radius_m <= 0.0 {
            return Err(MobilityError::InvalidConfig {
                message: format!("default radius must be positive, got {}", self.default_radius_m),
            });
        }
        if self.arc_points < 2 {
            return Err(MobilityError::InvalidConfig {
                message: format!("need at least 2 arc points, got {}", self.arc_points),
            });
        }
        if self.max_sampling_attempts == 0 {
            return Err(MobilityError::InvalidConfig {
                message: "max sampling attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_radius_m: 1000.0,
            arc_points: sector::DEFAULT_ARC_POINTS,
            max_sampling_attempts: resolve::DEFAULT_MAX_ATTEMPTS,
            projection: TransverseMercator::pt_tm06(),
            timezone: chrono_tz::Europe::Lisbon,
            segmentation: SegmentationStrategy::ContiguousRuns,
            stop_detection: StopDetectionParams::default(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    #[test]
    fn test_geo_point_validation() {
        assert!(GeoPoint::new(38.7223, -9.1393).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, 181.0).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_shape_from_multi_picks_largest() {
        let small = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)];
        let big = polygon![(x: 10.0, y: 10.0), (x: 15.0, y: 10.0), (x: 15.0, y: 15.0), (x: 10.0, y: 15.0)];
        let shape = Shape::from_multi(MultiPolygon::new(vec![small, big.clone()]));
        assert_eq!(shape.as_polygon(), Some(&big));
        assert!((shape.area() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_shape_empty_cases() {
        assert!(Shape::from_multi(MultiPolygon::new(vec![])).is_empty());
        let flat = polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 2.0, y: 0.0)];
        assert!(Shape::from_polygon(flat).is_empty());
        assert_eq!(Shape::Empty.centroid(), None);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.arc_points, 60);
        assert_eq!(config.max_sampling_attempts, 50);
    }

    #[test]
    fn test_invalid_config() {
        let config = PipelineConfig {
            default_radius_m: -1.0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MobilityError::InvalidConfig { .. })
        ));
    }
}
