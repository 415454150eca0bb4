//! Transverse Mercator projection between WGS84-style geographic coordinates
//! and a local metric plane.
//!
//! Uses the Krüger n-series to fourth order, which stays well below a
//! millimetre of error within a few thousand kilometres of the central
//! meridian. The default parameters are PT-TM06 / ETRS89 (EPSG:3763).
//!
//! Both directions are pure functions of their inputs, so a point that was
//! placed deterministically in projected space stays deterministic after
//! reprojection.

use geo::{Coord, LineString, Polygon};
use serde::{Deserialize, Serialize};

use crate::GeoPoint;

/// GRS80 semi-major axis (meters)
const GRS80_A: f64 = 6_378_137.0;
/// GRS80 inverse flattening
const GRS80_INV_F: f64 = 298.257_222_101;

/// Transverse Mercator parameters for one projected coordinate system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransverseMercator {
    /// Latitude of natural origin (degrees)
    pub lat_origin: f64,
    /// Longitude of natural origin / central meridian (degrees)
    pub lon_origin: f64,
    /// Scale factor at natural origin
    pub scale: f64,
    /// False easting (meters)
    pub false_easting: f64,
    /// False northing (meters)
    pub false_northing: f64,
    /// Ellipsoid semi-major axis (meters)
    pub semi_major_axis: f64,
    /// Ellipsoid inverse flattening
    pub inverse_flattening: f64,
}

impl TransverseMercator {
    /// PT-TM06 / ETRS89 (EPSG:3763), the metric system used for mainland Portugal.
    pub fn pt_tm06() -> Self {
        Self {
            lat_origin: 39.668_258_333_333_33,
            lon_origin: -8.133_108_333_333_33,
            scale: 1.0,
            false_easting: 0.0,
            false_northing: 0.0,
            semi_major_axis: GRS80_A,
            inverse_flattening: GRS80_INV_F,
        }
    }

    /// A local projection centred on an arbitrary origin (GRS80, unit scale).
    pub fn centred_on(origin: GeoPoint) -> Self {
        Self {
            lat_origin: origin.latitude,
            lon_origin: origin.longitude,
            ..Self::pt_tm06()
        }
    }

    fn series(&self) -> Series {
        Series::new(self.semi_major_axis, self.inverse_flattening)
    }

    /// Project a geographic point to planar meters (x = easting, y = northing).
    pub fn forward(&self, point: &GeoPoint) -> Coord {
        let s = self.series();
        let (xi, eta) = s.conformal_xi_eta(
            point.latitude.to_radians(),
            (point.longitude - self.lon_origin).to_radians(),
        );

        let mut easting = eta;
        let mut northing = xi;
        for (j, alpha) in s.alpha.iter().enumerate() {
            let k = 2.0 * (j as f64 + 1.0);
            easting += alpha * (k * xi).cos() * (k * eta).sinh();
            northing += alpha * (k * xi).sin() * (k * eta).cosh();
        }

        Coord {
            x: self.false_easting + self.scale * s.rectifying_radius * easting,
            y: self.false_northing + self.scale * (s.rectifying_radius * northing)
                - self.scale * s.meridian_arc(self.lat_origin.to_radians()),
        }
    }

    /// Unproject planar meters back to a geographic point.
    pub fn inverse(&self, coord: &Coord) -> GeoPoint {
        let s = self.series();
        let m0 = self.scale * s.meridian_arc(self.lat_origin.to_radians());
        let xi_p = (coord.y - self.false_northing + m0) / (self.scale * s.rectifying_radius);
        let eta_p = (coord.x - self.false_easting) / (self.scale * s.rectifying_radius);

        let mut xi = xi_p;
        let mut eta = eta_p;
        for (j, beta) in s.beta.iter().enumerate() {
            let k = 2.0 * (j as f64 + 1.0);
            xi -= beta * (k * xi_p).sin() * (k * eta_p).cosh();
            eta -= beta * (k * xi_p).cos() * (k * eta_p).sinh();
        }

        let chi = (xi.sin() / eta.cosh()).asin();
        let mut phi = chi;
        for (j, delta) in s.delta.iter().enumerate() {
            let k = 2.0 * (j as f64 + 1.0);
            phi += delta * (k * chi).sin();
        }
        let lambda = eta.sinh().atan2(xi.cos());

        GeoPoint::new(phi.to_degrees(), self.lon_origin + lambda.to_degrees())
    }

    /// Project every vertex of a geographic polygon (x = lon, y = lat).
    pub fn forward_polygon(&self, polygon: &Polygon<f64>) -> Polygon<f64> {
        let ring = |ls: &LineString<f64>| -> LineString<f64> {
            ls.coords()
                .map(|c| self.forward(&GeoPoint::new(c.y, c.x)))
                .collect()
        };
        Polygon::new(
            ring(polygon.exterior()),
            polygon.interiors().iter().map(ring).collect(),
        )
    }

    /// Unproject every vertex of a planar polygon to lon/lat.
    pub fn inverse_polygon(&self, polygon: &Polygon<f64>) -> Polygon<f64> {
        let ring = |ls: &LineString<f64>| -> LineString<f64> {
            ls.coords()
                .map(|c| {
                    let p = self.inverse(c);
                    Coord {
                        x: p.longitude,
                        y: p.latitude,
                    }
                })
                .collect()
        };
        Polygon::new(
            ring(polygon.exterior()),
            polygon.interiors().iter().map(ring).collect(),
        )
    }
}

impl Default for TransverseMercator {
    fn default() -> Self {
        Self::pt_tm06()
    }
}

/// Ellipsoid-derived series coefficients.
struct Series {
    eccentricity: f64,
    rectifying_radius: f64,
    alpha: [f64; 4],
    beta: [f64; 4],
    delta: [f64; 4],
}

impl Series {
    fn new(a: f64, inverse_flattening: f64) -> Self {
        let f = 1.0 / inverse_flattening;
        let n = f / (2.0 - f);
        let n2 = n * n;
        let n3 = n2 * n;
        let n4 = n3 * n;

        Self {
            eccentricity: (f * (2.0 - f)).sqrt(),
            rectifying_radius: a / (1.0 + n) * (1.0 + n2 / 4.0 + n4 / 64.0),
            alpha: [
                n / 2.0 - 2.0 * n2 / 3.0 + 5.0 * n3 / 16.0 + 41.0 * n4 / 180.0,
                13.0 * n2 / 48.0 - 3.0 * n3 / 5.0 + 557.0 * n4 / 1440.0,
                61.0 * n3 / 240.0 - 103.0 * n4 / 140.0,
                49561.0 * n4 / 161_280.0,
            ],
            beta: [
                n / 2.0 - 2.0 * n2 / 3.0 + 37.0 * n3 / 96.0 - n4 / 360.0,
                n2 / 48.0 + n3 / 15.0 - 437.0 * n4 / 1440.0,
                17.0 * n3 / 480.0 - 37.0 * n4 / 840.0,
                4397.0 * n4 / 161_280.0,
            ],
            delta: [
                2.0 * n - 2.0 * n2 / 3.0 - 2.0 * n3 + 116.0 * n4 / 45.0,
                7.0 * n2 / 3.0 - 8.0 * n3 / 5.0 - 227.0 * n4 / 45.0,
                56.0 * n3 / 15.0 - 136.0 * n4 / 35.0,
                4279.0 * n4 / 630.0,
            ],
        }
    }

    /// Gauss-Schreiber coordinates (xi', eta') on the conformal sphere.
    fn conformal_xi_eta(&self, phi: f64, d_lambda: f64) -> (f64, f64) {
        let e = self.eccentricity;
        let t = (phi.sin().atanh() - e * (e * phi.sin()).atanh()).sinh();
        let xi = t.atan2(d_lambda.cos());
        let eta = (d_lambda.sin() / (1.0 + t * t).sqrt()).atanh();
        (xi, eta)
    }

    /// Unscaled meridian arc length from the equator to `phi`.
    fn meridian_arc(&self, phi: f64) -> f64 {
        let (xi, _) = self.conformal_xi_eta(phi, 0.0);
        let mut arc = xi;
        for (j, alpha) in self.alpha.iter().enumerate() {
            let k = 2.0 * (j as f64 + 1.0);
            arc += alpha * (k * xi).sin();
        }
        self.rectifying_radius * arc
    }
}
