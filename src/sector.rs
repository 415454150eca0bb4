//! Antenna sector geometry.
//!
//! Converts telecom bearings (0° = north, clockwise) into a mathematical
//! angular span (0° = east, counter-clockwise) and builds the coverage
//! polygon in projected meters.

use std::collections::HashSet;

use geo::{ConvexHull, Coord, LineString, MultiPoint, Point, Polygon};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::MobilityError;
use crate::projection::TransverseMercator;
use crate::{GeoPoint, RawTower, Tower};

/// Default number of points sampled along the sector arc.
pub const DEFAULT_ARC_POINTS: usize = 60;

/// Angular span in mathematical convention (degrees, counter-clockwise from east).
///
/// `end_deg >= start_deg` always holds; spans that cross the 0°/360° wrap
/// carry an `end_deg` above 360.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectorSpan {
    pub start_deg: f64,
    pub end_deg: f64,
}

impl SectorSpan {
    /// The omnidirectional span.
    pub fn full_circle() -> Self {
        Self {
            start_deg: 0.0,
            end_deg: 360.0,
        }
    }

    /// Opening angle in degrees.
    pub fn width(&self) -> f64 {
        self.end_deg - self.start_deg
    }

    pub fn is_full_circle(&self) -> bool {
        self.width() >= 360.0
    }
}

/// Convert a telecom bearing into a mathematical angle.
pub fn telecom_to_math(telecom_deg: f64) -> f64 {
    (90.0 - telecom_deg).rem_euclid(360.0)
}

/// Parse a raw bearing value. Missing, blank, non-numeric and non-finite
/// values are `None`.
pub fn parse_bearing(raw: Option<&str>) -> Option<f64> {
    let value = raw?.trim();
    if value.is_empty() {
        return None;
    }
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Resolve an azimuth pair into the mathematical span the sector covers.
///
/// A `(0, 0)` pair means omnidirectional or unknown and yields the full circle.
pub fn angular_span(azimuth_min: f64, azimuth_max: f64) -> SectorSpan {
    if azimuth_min == 0.0 && azimuth_max == 0.0 {
        return SectorSpan::full_circle();
    }

    let start = telecom_to_math(azimuth_min);
    let mut end = telecom_to_math(azimuth_max);
    if end < start {
        end += 360.0;
    }
    SectorSpan {
        start_deg: start,
        end_deg: end,
    }
}

/// Evenly spaced angles (inclusive of both ends) across the span, in radians.
fn linspace_radians(span: &SectorSpan, count: usize) -> Vec<f64> {
    let start = span.start_deg.to_radians();
    let end = span.end_deg.to_radians();
    match count {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (count - 1) as f64;
            (0..count).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Build the coverage polygon for a sector centred on a projected point.
///
/// Openings up to 180° (and the full circle) are the convex hull of the centre
/// plus the arc samples. Wider openings are emitted as the explicit pie ring
/// so the polygon stays inside the licensed opening.
pub fn build_sector(center: Coord, span: &SectorSpan, radius_m: f64, arc_points: usize) -> Polygon<f64> {
    let arc: Vec<Coord> = linspace_radians(span, arc_points)
        .into_iter()
        .map(|a| Coord {
            x: center.x + radius_m * a.cos(),
            y: center.y + radius_m * a.sin(),
        })
        .collect();

    if span.width() > 180.0 && !span.is_full_circle() {
        let mut ring = Vec::with_capacity(arc.len() + 2);
        ring.push(center);
        ring.extend(arc);
        ring.push(center);
        return Polygon::new(LineString::new(ring), vec![]);
    }

    let mut points: Vec<Point<f64>> = Vec::with_capacity(arc.len() + 1);
    points.push(Point::from(center));
    points.extend(arc.into_iter().map(Point::from));
    MultiPoint::new(points).convex_hull()
}

impl Tower {
    /// Normalize a raw tower row, defaulting bad bearings to 0 and missing
    /// radii to `default_radius_m`.
    ///
    /// Returns the tower plus one `MalformedAzimuth` warning per bearing that
    /// was present but unparseable.
    pub fn from_raw(raw: &RawTower, default_radius_m: f64) -> (Tower, Vec<MobilityError>) {
        let mut warnings = Vec::new();
        let mut bearing = |value: &Option<String>| -> f64 {
            match parse_bearing(value.as_deref()) {
                Some(v) => v,
                None => {
                    if let Some(text) = value.as_deref() {
                        if !text.trim().is_empty() {
                            warnings.push(MobilityError::MalformedAzimuth {
                                cell_id: raw.cell_id.clone(),
                                raw: text.to_string(),
                            });
                        }
                    }
                    0.0
                }
            }
        };
        let azimuth_min = bearing(&raw.azimuth_min);
        let azimuth_max = bearing(&raw.azimuth_max);

        let radius = raw
            .radius
            .filter(|r| r.is_finite() && *r > 0.0)
            .unwrap_or(default_radius_m);

        let tower = Tower {
            cell_id: raw.cell_id.clone(),
            location: GeoPoint::new(raw.latitude, raw.longitude),
            azimuth_min,
            azimuth_max,
            radius,
        };
        (tower, warnings)
    }

    /// Mathematical span covered by this tower.
    pub fn span(&self) -> SectorSpan {
        angular_span(self.azimuth_min, self.azimuth_max)
    }

    /// Raw (unclipped) coverage polygon in projected meters.
    pub fn raw_sector(&self, projection: &TransverseMercator, arc_points: usize) -> Polygon<f64> {
        let center = projection.forward(&self.location);
        let span = self.span();
        debug!(
            "[Sector] cell {} span {:.1}..{:.1} radius {:.0}m",
            self.cell_id, span.start_deg, span.end_deg, self.radius
        );
        build_sector(center, &span, self.radius, arc_points)
    }
}

/// Keep the first row seen for each `cell_id`, preserving input order.
pub fn dedup_towers(rows: &[RawTower]) -> Vec<&RawTower> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(rows.len());
    let mut kept = Vec::new();
    for row in rows {
        if seen.insert(row.cell_id.as_str()) {
            kept.push(row);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{Area, Contains};

    fn origin() -> Coord {
        Coord { x: 0.0, y: 0.0 }
    }

    /// Back-convert a math angle to a telecom bearing in [0, 360).
    fn math_to_telecom(math_deg: f64) -> f64 {
        (90.0 - math_deg).rem_euclid(360.0)
    }

    fn bearing_point(bearing_deg: f64, dist: f64) -> Point<f64> {
        let a = telecom_to_math(bearing_deg).to_radians();
        Point::new(dist * a.cos(), dist * a.sin())
    }

    #[test]
    fn test_telecom_to_math() {
        assert_eq!(telecom_to_math(0.0), 90.0);
        assert_eq!(telecom_to_math(90.0), 0.0);
        assert_eq!(telecom_to_math(180.0), 270.0);
        assert_eq!(telecom_to_math(270.0), 180.0);
        assert_eq!(telecom_to_math(360.0), 90.0);
    }

    #[test]
    fn test_omni_pair_is_full_circle() {
        let span = angular_span(0.0, 0.0);
        assert!(span.is_full_circle());

        let poly = build_sector(origin(), &span, 1000.0, DEFAULT_ARC_POINTS);
        let circle = std::f64::consts::PI * 1000.0 * 1000.0;
        // 60-gon inscribed in the circle covers >99% of it
        assert!(poly.unsigned_area() > circle * 0.99);
        assert!(poly.contains(&bearing_point(0.0, 900.0)));
        assert!(poly.contains(&bearing_point(135.0, 900.0)));
        assert!(poly.contains(&bearing_point(270.0, 900.0)));
    }

    #[test]
    fn test_span_wraps_monotonically() {
        // North-facing sector 330..30 crosses the wrap in telecom space
        let span = angular_span(330.0, 30.0);
        assert_eq!(span.start_deg, 120.0);
        assert_eq!(span.end_deg, 60.0 + 360.0);
        // Telecom 330..30 is 60° wide, but after conversion the span walks
        // counter-clockwise, covering the complementary 300°
        assert!(span.end_deg >= span.start_deg);
    }

    #[test]
    fn test_span_back_converts_to_bearings() {
        for (lo, hi) in [(10.0, 80.0), (90.0, 150.0), (200.0, 340.0), (300.0, 20.0)] {
            let span = angular_span(lo, hi);
            let back_start = math_to_telecom(span.start_deg);
            let back_end = math_to_telecom(span.end_deg);
            assert!((back_start - lo).abs() < 1e-9, "{} vs {}", back_start, lo);
            assert!((back_end - hi).abs() < 1e-9, "{} vs {}", back_end, hi);
        }
    }

    #[test]
    fn test_narrow_sector_contains_its_bearings() {
        let span = angular_span(120.0, 60.0);
        // 120 -> -30 (330), 60 -> 30: 60° opening, convex hull path
        assert!(span.width() <= 180.0);
        let poly = build_sector(origin(), &span, 1000.0, DEFAULT_ARC_POINTS);
        assert!(poly.contains(&bearing_point(90.0, 500.0)));
        assert!(poly.contains(&bearing_point(70.0, 500.0)));
        assert!(!poly.contains(&bearing_point(270.0, 500.0)));
    }

    #[test]
    fn test_wide_sector_stays_inside_opening() {
        // Bearing 10 -> 80 math, bearing 80 -> 10 (+360 = 370): 290° opening
        let span = angular_span(10.0, 80.0);
        assert!(span.width() > 180.0);
        let poly = build_sector(origin(), &span, 1000.0, DEFAULT_ARC_POINTS);

        // Bearing 45 is outside the opening; a hull would have swallowed it
        assert!(!poly.contains(&bearing_point(45.0, 100.0)));
        assert!(poly.contains(&bearing_point(225.0, 500.0)));
        let pie = std::f64::consts::PI * 1000.0 * 1000.0 * 290.0 / 360.0;
        assert!(poly.unsigned_area() < pie);
        assert!(poly.unsigned_area() > pie * 0.98);
    }

    #[test]
    fn test_parse_bearing() {
        assert_eq!(parse_bearing(Some("45")), Some(45.0));
        assert_eq!(parse_bearing(Some(" 12.5 ")), Some(12.5));
        assert_eq!(parse_bearing(Some("n/a")), None);
        assert_eq!(parse_bearing(Some("NaN")), None);
        assert_eq!(parse_bearing(Some("")), None);
        assert_eq!(parse_bearing(None), None);
    }

    #[test]
    fn test_from_raw_defaults() {
        let raw = RawTower {
            cell_id: "c1".to_string(),
            longitude: -9.14,
            latitude: 38.72,
            azimuth_min: Some("abc".to_string()),
            azimuth_max: None,
            radius: None,
        };
        let (tower, warnings) = Tower::from_raw(&raw, 1000.0);
        assert_eq!(tower.azimuth_min, 0.0);
        assert_eq!(tower.azimuth_max, 0.0);
        assert_eq!(tower.radius, 1000.0);
        assert!(tower.span().is_full_circle());
        assert_eq!(warnings.len(), 1);
        assert!(matches!(warnings[0], MobilityError::MalformedAzimuth { .. }));
    }

    #[test]
    fn test_dedup_towers_keeps_first() {
        let row = |id: &str, az: &str| RawTower {
            cell_id: id.to_string(),
            longitude: 0.0,
            latitude: 0.0,
            azimuth_min: Some(az.to_string()),
            azimuth_max: None,
            radius: None,
        };
        let rows = vec![row("a", "10"), row("b", "20"), row("a", "30")];
        let kept = dedup_towers(&rows);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].azimuth_min.as_deref(), Some("10"));
    }
}
