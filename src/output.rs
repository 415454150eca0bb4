//! Persistable output tables.
//!
//! Flat, serde-serializable rows for the three intermediate outputs (tower
//! coverage keyed by `cell_id`, the augmented event stream, staypoints keyed
//! by id) plus a GeoJSON export of the coverage sectors in lon/lat.

use chrono::{DateTime, Utc};
use geo::{LineString, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::oracle::StopLabel;
use crate::pipeline::{CoverageSector, PipelineOutput, ProcessedEvent};
use crate::projection::TransverseMercator;
use crate::staypoints::StaypointInterval;
use crate::Shape;

/// One row of the tower-to-polygon table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageRow {
    pub cell_id: String,
    pub longitude: f64,
    pub latitude: f64,
    pub azimuth_min: f64,
    pub azimuth_max: f64,
    pub radius: f64,
    /// Clipped coverage area in square meters
    pub area_m2: f64,
    /// Exterior ring as `[lon, lat]` pairs; empty when unresolvable
    pub exterior: Vec<[f64; 2]>,
}

/// One row of the augmented event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub unique_id: String,
    pub cell_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub stop_label: Option<StopLabel>,
    pub staypoint_id: Option<u64>,
}

/// One row of the staypoint table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaypointRow {
    pub staypoint_id: u64,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub stop_label: StopLabel,
    pub longitude: f64,
    pub latitude: f64,
}

fn ring_pairs(ring: &LineString<f64>) -> Vec<[f64; 2]> {
    ring.coords().map(|c| [c.x, c.y]).collect()
}

fn lon_lat_rings(polygon: &Polygon<f64>, projection: &TransverseMercator) -> Vec<Vec<[f64; 2]>> {
    let geographic = projection.inverse_polygon(polygon);
    let mut rings = vec![ring_pairs(geographic.exterior())];
    rings.extend(geographic.interiors().iter().map(ring_pairs));
    rings
}

impl CoverageRow {
    pub fn from_sector(sector: &CoverageSector, projection: &TransverseMercator) -> Self {
        let exterior = match &sector.shape {
            Shape::Polygon(p) => lon_lat_rings(p, projection).swap_remove(0),
            _ => Vec::new(),
        };
        Self {
            cell_id: sector.tower.cell_id.clone(),
            longitude: sector.tower.location.longitude,
            latitude: sector.tower.location.latitude,
            azimuth_min: sector.tower.azimuth_min,
            azimuth_max: sector.tower.azimuth_max,
            radius: sector.tower.radius,
            area_m2: sector.shape.area(),
            exterior,
        }
    }
}

impl From<&ProcessedEvent> for EventRow {
    fn from(event: &ProcessedEvent) -> Self {
        Self {
            unique_id: event.unique_id.clone(),
            cell_id: event.cell_id.clone(),
            timestamp: event.timestamp,
            longitude: event.location.map(|l| l.longitude),
            latitude: event.location.map(|l| l.latitude),
            stop_label: event.stop_label,
            staypoint_id: event.staypoint_id,
        }
    }
}

impl From<&StaypointInterval> for StaypointRow {
    fn from(sp: &StaypointInterval) -> Self {
        Self {
            staypoint_id: sp.staypoint_id,
            user_id: sp.user_id.clone(),
            started_at: sp.started_at,
            finished_at: sp.finished_at,
            duration_seconds: sp.duration_seconds(),
            stop_label: sp.stop_label,
            longitude: sp.location.longitude,
            latitude: sp.location.latitude,
        }
    }
}

impl PipelineOutput {
    /// Tower-to-polygon table keyed by `cell_id`.
    pub fn coverage_table(&self, projection: &TransverseMercator) -> Vec<CoverageRow> {
        self.coverage
            .iter()
            .map(|c| CoverageRow::from_sector(c, projection))
            .collect()
    }

    /// Event stream with resolved lon/lat and staypoint ids, in input order.
    pub fn event_table(&self) -> Vec<EventRow> {
        self.events.iter().map(EventRow::from).collect()
    }

    /// Staypoint table in id order.
    pub fn staypoint_table(&self) -> Vec<StaypointRow> {
        self.staypoints.iter().map(StaypointRow::from).collect()
    }
}

/// Coverage sectors as a GeoJSON FeatureCollection in lon/lat.
///
/// Unresolvable sectors are kept with a `null` geometry.
pub fn coverage_to_geojson(coverage: &[CoverageSector], projection: &TransverseMercator) -> Value {
    let features: Vec<Value> = coverage
        .iter()
        .map(|sector| {
            let geometry = match &sector.shape {
                Shape::Polygon(p) => {
                    json!({ "type": "Polygon", "coordinates": lon_lat_rings(p, projection) })
                }
                Shape::Empty => Value::Null,
            };
            json!({
                "type": "Feature",
                "geometry": geometry,
                "properties": {
                    "cell_id": sector.tower.cell_id,
                    "azimuth_min": sector.tower.azimuth_min,
                    "azimuth_max": sector.tower.azimuth_max,
                    "radius": sector.tower.radius,
                    "area_m2": sector.shape.area(),
                },
            })
        })
        .collect();

    json!({ "type": "FeatureCollection", "features": features })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExclusionGeometry, MobilityPipeline, PipelineConfig, RawTower};

    fn towers() -> Vec<RawTower> {
        vec![RawTower {
            cell_id: "c1".to_string(),
            longitude: -9.14,
            latitude: 38.72,
            azimuth_min: None,
            azimuth_max: None,
            radius: Some(300.0),
        }]
    }

    #[test]
    fn test_geojson_feature_collection() {
        let config = PipelineConfig::default();
        let pipeline = MobilityPipeline::new(config.clone(), ExclusionGeometry::empty());
        let (coverage, _) = pipeline.build_coverage(&towers());
        let geojson = coverage_to_geojson(&coverage, &config.projection);

        assert_eq!(geojson["type"], "FeatureCollection");
        let feature = &geojson["features"][0];
        assert_eq!(feature["properties"]["cell_id"], "c1");
        assert_eq!(feature["geometry"]["type"], "Polygon");

        let ring = feature["geometry"]["coordinates"][0].as_array().unwrap();
        let first = ring[0].as_array().unwrap();
        let lon = first[0].as_f64().unwrap();
        let lat = first[1].as_f64().unwrap();
        // Within a few hundred meters of the tower
        assert!((lon + 9.14).abs() < 0.01);
        assert!((lat - 38.72).abs() < 0.01);
    }

    #[test]
    fn test_coverage_row_for_empty_sector() {
        let config = PipelineConfig::default();
        let pipeline = MobilityPipeline::new(config.clone(), ExclusionGeometry::empty());
        let (mut coverage, _) = pipeline.build_coverage(&towers());
        coverage[0].shape = Shape::Empty;

        let row = CoverageRow::from_sector(&coverage[0], &config.projection);
        assert!(row.exterior.is_empty());
        assert_eq!(row.area_m2, 0.0);
        let geojson = coverage_to_geojson(&coverage, &config.projection);
        assert!(geojson["features"][0]["geometry"].is_null());
    }
}
