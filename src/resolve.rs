//! Deterministic point placement inside a coverage polygon.
//!
//! Every `(unique_id, cell_id)` pair owns its own generator, seeded from a
//! stable hash of the pair. The same pair always lands on the same point no
//! matter the process, host, thread or order in which events are resolved.

use geo::{BoundingRect, Contains, Coord, Point};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{MobilityError, OptionExt, Result};
use crate::projection::TransverseMercator;
use crate::{GeoPoint, Shape};

/// Rejection-sampling attempts before falling back to the centroid.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 50;

/// Seeds are reduced into the 32-bit range.
const SEED_MODULUS: u64 = 1 << 32;

/// How a point was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Accepted on the given (1-based) sampling attempt
    Sampled { attempt: u32 },
    /// Every attempt missed; the polygon centroid was used
    CentroidFallback,
}

/// A resolved event location in projected meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPoint {
    pub x: f64,
    pub y: f64,
    pub placement: Placement,
}

impl ResolvedPoint {
    pub fn coord(&self) -> Coord {
        Coord {
            x: self.x,
            y: self.y,
        }
    }

    /// Reproject to longitude/latitude for storage.
    pub fn to_geographic(&self, projection: &TransverseMercator) -> GeoPoint {
        projection.inverse(&self.coord())
    }
}

/// Stable seed for a `(unique_id, cell_id)` pair.
///
/// SHA-256 over the length-prefixed id followed by the cell id; the first
/// eight digest bytes (big-endian) are reduced modulo 2^32.
pub fn seed_for(unique_id: &str, cell_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update((unique_id.len() as u64).to_be_bytes());
    hasher.update(unique_id.as_bytes());
    hasher.update(cell_id.as_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) % SEED_MODULUS
}

/// Place one reproducible point for `(unique_id, cell_id)` inside `shape`.
///
/// Draws up to `max_attempts` uniform points in the bounding box and returns
/// the first one strictly inside the polygon; otherwise returns the centroid.
/// Empty coverage is `UnresolvableGeometry`.
pub fn resolve_point(
    unique_id: &str,
    cell_id: &str,
    shape: &Shape,
    max_attempts: u32,
) -> Result<ResolvedPoint> {
    let polygon = match shape {
        Shape::Empty => {
            return Err(MobilityError::UnresolvableGeometry {
                cell_id: cell_id.to_string(),
            })
        }
        Shape::Polygon(polygon) => polygon,
    };

    let rect = polygon.bounding_rect().ok_or_unresolvable(cell_id)?;
    let (min, max) = (rect.min(), rect.max());

    // Fresh generator per call: no state leaks between events
    let mut rng = ChaCha20Rng::seed_from_u64(seed_for(unique_id, cell_id));
    for attempt in 1..=max_attempts {
        let x = min.x + (max.x - min.x) * rng.gen::<f64>();
        let y = min.y + (max.y - min.y) * rng.gen::<f64>();
        if polygon.contains(&Point::new(x, y)) {
            return Ok(ResolvedPoint {
                x,
                y,
                placement: Placement::Sampled { attempt },
            });
        }
    }

    let centroid = shape.centroid().ok_or_unresolvable(cell_id)?;
    Ok(ResolvedPoint {
        x: centroid.x,
        y: centroid.y,
        placement: Placement::CentroidFallback,
    })
}
