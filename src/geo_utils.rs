//! # Geographic Utilities
//!
//! Distance engine and small geometric helpers used by the alerting pipeline
//! and by route synthesis.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_km`] | Great-circle distance between two points in kilometers |
//! | [`path_length_km`] | Total length of a waypoint sequence |
//! | [`path_bounds`] | Bounding box of a waypoint sequence |
//! | [`frame_bounds`] | Padded bounding box for framing a route on the map |
//! | [`round_km`] | Round a distance to two decimals for display |
//! | [`nearest`] | Rank candidates by distance from a center point |
//!
//! ## Example
//!
//! ```rust
//! use proximity_guard::{GeoPoint, geo_utils};
//!
//! let home = GeoPoint::new(19.0760, 72.8777);  // Mumbai
//! let temple = GeoPoint::new(19.0760, 72.8877);
//!
//! let km = geo_utils::haversine_km(&home, &temple);
//! assert!((km - 1.05).abs() < 0.05);
//! ```
//!
//! ## Algorithm Notes
//!
//! The haversine formula assumes a spherical Earth with radius 6371 km:
//!
//! `h = sin²(Δlat/2) + cos(lat_a)·cos(lat_b)·sin²(Δlon/2)`,
//! `d = R · 2·atan2(√h, √(1−h))`.
//!
//! All functions expect WGS84 coordinates in degrees.

use geo::{BoundingRect, Coord, LineString};
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::{Bounds, GeoPoint};

/// Mean Earth radius used by the distance engine.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

// =============================================================================
// Distance Functions
// =============================================================================

/// Great-circle distance between two points in kilometers.
///
/// Symmetric, and exactly `0.0` for identical points. Callers are expected to
/// have filtered out absent or invalid coordinates.
///
/// # Example
///
/// ```rust
/// use proximity_guard::{GeoPoint, geo_utils};
///
/// let a = GeoPoint::new(51.5074, -0.1278);
/// let b = GeoPoint::new(48.8566, 2.3522);
/// assert_eq!(geo_utils::haversine_km(&a, &b), geo_utils::haversine_km(&b, &a));
/// ```
#[inline]
pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    // Rounding can push h marginally outside [0, 1] for antipodal points
    let h = h.clamp(0.0, 1.0);

    EARTH_RADIUS_KM * 2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Total length of a waypoint sequence in kilometers.
///
/// Empty or single-point sequences return 0.0.
pub fn path_length_km(points: &[GeoPoint]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| haversine_km(&w[0], &w[1]))
        .sum()
}

/// Round a distance to two decimals, the precision shown to users.
#[inline]
pub fn round_km(distance_km: f64) -> f64 {
    (distance_km * 100.0).round() / 100.0
}

// =============================================================================
// Bounding Box Functions
// =============================================================================

/// Bounding box of a waypoint sequence, or `None` when it is empty.
pub fn path_bounds(points: &[GeoPoint]) -> Option<Bounds> {
    let line: LineString<f64> = points
        .iter()
        .map(|p| Coord { x: p.longitude, y: p.latitude })
        .collect();

    line.bounding_rect().map(|rect| Bounds {
        min_lat: rect.min().y,
        max_lat: rect.max().y,
        min_lng: rect.min().x,
        max_lng: rect.max().x,
    })
}

/// Bounding box that frames a route on the map.
///
/// The span is scaled by `padding` around the center (1.3 leaves a margin so
/// the endpoints are not drawn on the screen edge).
pub fn frame_bounds(points: &[GeoPoint], padding: f64) -> Option<Bounds> {
    let bounds = path_bounds(points)?;
    let center = bounds.center();
    let half_lat = (bounds.max_lat - bounds.min_lat) * padding / 2.0;
    let half_lng = (bounds.max_lng - bounds.min_lng) * padding / 2.0;

    Some(Bounds {
        min_lat: center.latitude - half_lat,
        max_lat: center.latitude + half_lat,
        min_lng: center.longitude - half_lng,
        max_lng: center.longitude + half_lng,
    })
}

// =============================================================================
// Nearby Ranking
// =============================================================================

/// A ranked candidate returned by [`nearest`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct NearbyEntry {
    pub id: String,
    /// Distance from the query center, rounded to two decimals
    pub distance_km: f64,
}

/// A candidate point projected to a local plane for R-tree queries
#[derive(Debug, Clone, Copy)]
struct IndexedPoint {
    idx: usize,
    x: f64,
    y: f64,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.x, self.y])
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.x - point[0];
        let dy = self.y - point[1];
        dx * dx + dy * dy
    }
}

/// Rank candidates by distance from `center`, closest first, keeping `limit`.
///
/// Candidates with invalid coordinates are ignored. Longitudes are scaled by
/// `cos(center.latitude)` so the planar R-tree ordering tracks great-circle
/// ordering locally; the returned distances are haversine distances.
pub fn nearest(center: &GeoPoint, candidates: &[(String, GeoPoint)], limit: usize) -> Vec<NearbyEntry> {
    if limit == 0 || candidates.is_empty() {
        return Vec::new();
    }

    let scale = center.latitude.to_radians().cos().max(0.01);
    let indexed: Vec<IndexedPoint> = candidates
        .iter()
        .enumerate()
        .filter(|(_, (_, p))| p.is_valid())
        .map(|(idx, (_, p))| IndexedPoint {
            idx,
            x: p.longitude * scale,
            y: p.latitude,
        })
        .collect();

    let tree = RTree::bulk_load(indexed);

    // Over-fetch a little; the planar order can differ at the margin
    let shortlist: Vec<usize> = tree
        .nearest_neighbor_iter(&[center.longitude * scale, center.latitude])
        .take(limit.saturating_mul(2))
        .map(|p| p.idx)
        .collect();

    #[cfg(feature = "parallel")]
    let mut ranked: Vec<NearbyEntry> = {
        use rayon::prelude::*;
        shortlist
            .par_iter()
            .map(|&idx| rank_entry(center, &candidates[idx]))
            .collect()
    };

    #[cfg(not(feature = "parallel"))]
    let mut ranked: Vec<NearbyEntry> = shortlist
        .iter()
        .map(|&idx| rank_entry(center, &candidates[idx]))
        .collect();

    ranked.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
    ranked.truncate(limit);
    ranked
}

fn rank_entry(center: &GeoPoint, candidate: &(String, GeoPoint)) -> NearbyEntry {
    NearbyEntry {
        id: candidate.0.clone(),
        distance_km: round_km(haversine_km(center, &candidate.1)),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_haversine_same_point() {
        let p = GeoPoint::new(19.0760, 72.8777);
        assert_eq!(haversine_km(&p, &p), 0.0);
    }

    #[test]
    fn test_haversine_symmetric() {
        let pairs = [
            (GeoPoint::new(19.0760, 72.8777), GeoPoint::new(19.0760, 72.8877)),
            (GeoPoint::new(51.5074, -0.1278), GeoPoint::new(48.8566, 2.3522)),
            (GeoPoint::new(-33.8688, 151.2093), GeoPoint::new(40.7128, -74.0060)),
            (GeoPoint::new(0.0, 179.9), GeoPoint::new(0.0, -179.9)),
        ];
        for (a, b) in pairs {
            assert_eq!(haversine_km(&a, &b), haversine_km(&b, &a));
        }
    }

    #[test]
    fn test_haversine_known_value() {
        let a = GeoPoint::new(19.0760, 72.8777);
        let b = GeoPoint::new(19.0760, 72.8877);
        assert!(approx_eq(haversine_km(&a, &b), 1.05, 0.05));

        // London to Paris is approximately 344 km
        let london = GeoPoint::new(51.5074, -0.1278);
        let paris = GeoPoint::new(48.8566, 2.3522);
        assert!(approx_eq(haversine_km(&london, &paris), 343.5, 5.0));
    }

    #[test]
    fn test_haversine_antipodal_is_finite() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 180.0);
        let d = haversine_km(&a, &b);
        assert!(d.is_finite());
        assert!(approx_eq(d, std::f64::consts::PI * EARTH_RADIUS_KM, 1.0));
    }

    #[test]
    fn test_path_length() {
        assert_eq!(path_length_km(&[]), 0.0);
        assert_eq!(path_length_km(&[GeoPoint::new(19.0, 72.0)]), 0.0);

        let path = vec![
            GeoPoint::new(19.0760, 72.8777),
            GeoPoint::new(19.0760, 72.8827),
            GeoPoint::new(19.0760, 72.8877),
        ];
        let direct = haversine_km(&path[0], &path[2]);
        assert!(approx_eq(path_length_km(&path), direct, 1e-6));
    }

    #[test]
    fn test_round_km() {
        assert_eq!(round_km(1.23456), 1.23);
        assert_eq!(round_km(0.006), 0.01);
        assert_eq!(round_km(0.0), 0.0);
    }

    #[test]
    fn test_path_bounds() {
        assert!(path_bounds(&[]).is_none());

        let path = vec![
            GeoPoint::new(19.00, 72.80),
            GeoPoint::new(19.10, 72.90),
            GeoPoint::new(19.05, 72.85),
        ];
        let bounds = path_bounds(&path).unwrap();
        assert_eq!(bounds.min_lat, 19.00);
        assert_eq!(bounds.max_lat, 19.10);
        assert_eq!(bounds.min_lng, 72.80);
        assert_eq!(bounds.max_lng, 72.90);
    }

    #[test]
    fn test_frame_bounds_padding() {
        let path = vec![GeoPoint::new(19.0, 72.0), GeoPoint::new(19.1, 72.1)];
        let framed = frame_bounds(&path, 1.3).unwrap();
        assert!(approx_eq(framed.max_lat - framed.min_lat, 0.13, 1e-9));
        assert!(approx_eq(framed.center().latitude, 19.05, 1e-9));
    }

    #[test]
    fn test_nearest_orders_by_distance() {
        let center = GeoPoint::new(19.0760, 72.8777);
        let candidates = vec![
            ("far".to_string(), GeoPoint::new(19.2000, 72.8777)),
            ("near".to_string(), GeoPoint::new(19.0770, 72.8777)),
            ("mid".to_string(), GeoPoint::new(19.1000, 72.8777)),
            ("bogus".to_string(), GeoPoint::new(f64::NAN, 0.0)),
        ];

        let ranked = nearest(&center, &candidates, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].id, "near");
        assert_eq!(ranked[1].id, "mid");
        assert!(ranked[0].distance_km <= ranked[1].distance_km);
    }

    #[test]
    fn test_nearest_empty() {
        let center = GeoPoint::new(0.0, 0.0);
        assert!(nearest(&center, &[], 10).is_empty());
        assert!(nearest(&center, &[("a".into(), center)], 0).is_empty());
    }
}
