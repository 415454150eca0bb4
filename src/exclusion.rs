//! Exclusion-zone clipping.
//!
//! Non-traversable area (rivers, lakes, sea) is reprojected, unioned once per
//! run and subtracted from every raw sector. Each sector keeps only its
//! largest remaining fragment.

use std::time::Instant;

use geo::{Area, BooleanOps, BoundingRect, MultiPolygon, Polygon};
use log::info;
use rstar::{RTree, RTreeObject, AABB};

use crate::projection::TransverseMercator;
use crate::Shape;

/// Envelope of one part of the unioned exclusion geometry.
#[derive(Debug, Clone)]
struct ExclusionPart {
    index: usize,
    min: [f64; 2],
    max: [f64; 2],
}

impl RTreeObject for ExclusionPart {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.min, self.max)
    }
}

/// Unioned exclusion area in projected meters, shared read-only by all towers.
#[derive(Debug, Clone)]
pub struct ExclusionGeometry {
    union: MultiPolygon<f64>,
    index: RTree<ExclusionPart>,
}

impl ExclusionGeometry {
    /// No exclusion: sectors pass through unchanged.
    pub fn empty() -> Self {
        Self {
            union: MultiPolygon::new(vec![]),
            index: RTree::new(),
        }
    }

    /// Union polygons that are already in projected meters.
    pub fn from_projected(polygons: Vec<Polygon<f64>>) -> Self {
        let start = Instant::now();
        let input_count = polygons.len();
        let union = polygons
            .into_iter()
            .filter(|p| p.unsigned_area() > 0.0)
            .fold(MultiPolygon::new(vec![]), |acc, p| acc.union(&p));

        let parts: Vec<ExclusionPart> = union
            .iter()
            .enumerate()
            .filter_map(|(index, poly)| {
                let rect = poly.bounding_rect()?;
                Some(ExclusionPart {
                    index,
                    min: [rect.min().x, rect.min().y],
                    max: [rect.max().x, rect.max().y],
                })
            })
            .collect();

        info!(
            "[Exclusion] Unioned {} polygons into {} parts ({:.0} m²) in {}ms",
            input_count,
            union.0.len(),
            union.unsigned_area(),
            start.elapsed().as_millis()
        );

        Self {
            union,
            index: RTree::bulk_load(parts),
        }
    }

    /// Reproject geographic polygons (x = lon, y = lat) and union them.
    pub fn from_geographic(polygons: &[Polygon<f64>], projection: &TransverseMercator) -> Self {
        Self::from_projected(
            polygons
                .iter()
                .map(|p| projection.forward_polygon(p))
                .collect(),
        )
    }

    /// The unioned exclusion area.
    pub fn geometry(&self) -> &MultiPolygon<f64> {
        &self.union
    }

    pub fn is_empty(&self) -> bool {
        self.union.0.is_empty()
    }

    /// Subtract the exclusion area from a raw sector and keep the largest
    /// remaining fragment.
    ///
    /// Only exclusion parts whose envelopes touch the sector take part in the
    /// difference; parts of a union are disjoint, so the result matches
    /// subtracting the whole union.
    ///
    /// The boolean ops snap vertices, so the result can stray past the raw
    /// sector by float noise, tens of square centimetres on a kilometre sector.
    pub fn clip(&self, sector: &Polygon<f64>) -> Shape {
        let Some(rect) = sector.bounding_rect() else {
            return Shape::Empty;
        };
        let envelope = AABB::from_corners(
            [rect.min().x, rect.min().y],
            [rect.max().x, rect.max().y],
        );

        let candidates: Vec<Polygon<f64>> = self
            .index
            .locate_in_envelope_intersecting(&envelope)
            .map(|part| self.union.0[part.index].clone())
            .collect();

        if candidates.is_empty() {
            return Shape::from_polygon(sector.clone());
        }

        Shape::from_multi(sector.difference(&MultiPolygon::new(candidates)))
    }
}

impl Default for ExclusionGeometry {
    fn default() -> Self {
        Self::empty()
    }
}
