//! # Route Synthesis
//!
//! Produces a drawable path between two points. An external routing service
//! is tried first and its encoded polyline decoded; on any failure a
//! road-like path is synthesized locally so the map always has something to
//! show.
//!
//! ## Procedural fallback
//!
//! `n = clamp(round(d × points_per_km), min_points, max_points)` waypoints.
//! Interior point `i` sits at ratio `r = i / (n − 1)` on the straight line and
//! is pushed along the travel direction by `sin(2πr)·a(r)` and across it by
//! `cos(1.5πr)·a(r)·perpendicular_ratio`, where
//! `a(r) = curve_amplitude·(1 + sin(3πr))`, plus bounded jitter. The first and
//! last waypoints are the exact origin and destination.

use std::f64::consts::PI;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ProximityError, Result};
use crate::geo_utils::{frame_bounds, haversine_km, path_length_km};
use crate::{polyline, Bounds, GeoPoint};

/// Endpoint match tolerance for decoded polylines (their precision).
const POLYLINE_EPSILON: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum RouteSource {
    External,
    Synthesized,
}

/// A path for map display.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Route {
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    /// First is `origin`, last is `destination`
    pub waypoints: Vec<GeoPoint>,
    pub distance_km: f64,
    pub eta_minutes: f64,
    pub source: RouteSource,
    /// Padded box that frames the route on the map
    pub bounds: Option<Bounds>,
}

/// Configuration for route synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct RouteConfig {
    /// Waypoint density for synthesized routes.
    /// Default: 20 per km
    pub points_per_km: f64,

    /// Default: 15
    pub min_points: u32,

    /// Default: 50
    pub max_points: u32,

    /// Base curve amplitude in degrees.
    /// Default: 0.0008
    pub curve_amplitude: f64,

    /// Perpendicular offset as a fraction of the curve amplitude.
    /// Default: 0.6
    pub perpendicular_ratio: f64,

    /// Maximum random offset per axis in degrees. 0 disables jitter.
    /// Default: 0.0001
    pub jitter_degrees: f64,

    /// ETA heuristic (~24 km/h urban average).
    /// Default: 2.5 min/km
    pub minutes_per_km: f64,

    /// Span multiplier for the framing box.
    /// Default: 1.3
    pub frame_padding: f64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            points_per_km: 20.0,
            min_points: 15,
            max_points: 50,
            curve_amplitude: 0.0008,
            perpendicular_ratio: 0.6,
            jitter_degrees: 0.0001,
            minutes_per_km: 2.5,
            frame_padding: 1.3,
        }
    }
}

impl RouteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_points < 2 || self.min_points > self.max_points {
            return Err(ProximityError::ConfigValidation(format!(
                "need 2 <= min_points <= max_points, got {}..{}",
                self.min_points, self.max_points
            )));
        }
        if !self.points_per_km.is_finite() || self.points_per_km <= 0.0 {
            return Err(ProximityError::ConfigValidation(
                "points_per_km must be positive".to_string(),
            ));
        }
        let non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if !non_negative(self.jitter_degrees) || !non_negative(self.curve_amplitude) {
            return Err(ProximityError::ConfigValidation(
                "curve_amplitude and jitter_degrees must be non-negative".to_string(),
            ));
        }
        if !non_negative(self.minutes_per_km) || !(self.frame_padding.is_finite() && self.frame_padding >= 1.0) {
            return Err(ProximityError::ConfigValidation(
                "minutes_per_km must be non-negative and frame_padding at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Waypoint count for a route of `distance_km`. Never below 2, even for
    /// a config that fails [`validate`](Self::validate).
    pub fn waypoint_count(&self, distance_km: f64) -> usize {
        let wanted = (distance_km * self.points_per_km).round();
        let wanted = if wanted.is_finite() { wanted } else { f64::from(self.max_points) };
        // max/min rather than clamp: clamp panics when min_points > max_points
        let n = wanted.max(f64::from(self.min_points)).min(f64::from(self.max_points));
        (n as usize).max(2)
    }
}

// ============================================================================
// External Routing
// ============================================================================

/// Raw result of an external routing request.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteResponse {
    pub encoded_polyline: String,
    pub distance_meters: f64,
    pub duration_seconds: f64,
}

/// A road-aware routing backend.
#[async_trait]
pub trait RoutingService: Send + Sync {
    async fn request(&self, origin: GeoPoint, destination: GeoPoint) -> Result<RouteResponse>;
}

/// Build a route from an external response.
///
/// Rejects polylines with fewer than two points. Waypoints are pinned to the
/// exact origin and destination.
pub fn route_from_response(
    origin: GeoPoint,
    destination: GeoPoint,
    response: &RouteResponse,
    config: &RouteConfig,
) -> Result<Route> {
    let decoded = polyline::decode(&response.encoded_polyline)?;
    if decoded.len() < 2 {
        return Err(ProximityError::decode(format!(
            "route polyline has {} points",
            decoded.len()
        )));
    }

    let mut waypoints = Vec::with_capacity(decoded.len() + 2);
    if !same_point(&decoded[0], &origin) {
        waypoints.push(origin);
    }
    waypoints.extend_from_slice(&decoded);
    if let Some(first) = waypoints.first_mut() {
        if same_point(first, &origin) {
            *first = origin;
        }
    }
    match waypoints.last_mut() {
        Some(last) if same_point(last, &destination) => *last = destination,
        _ => waypoints.push(destination),
    }

    let distance_km = if response.distance_meters.is_finite() && response.distance_meters > 0.0 {
        response.distance_meters / 1000.0
    } else {
        path_length_km(&waypoints)
    };
    let eta_minutes = if response.duration_seconds.is_finite() && response.duration_seconds > 0.0 {
        response.duration_seconds / 60.0
    } else {
        distance_km * config.minutes_per_km
    };

    let bounds = frame_bounds(&waypoints, config.frame_padding);
    Ok(Route {
        origin,
        destination,
        waypoints,
        distance_km,
        eta_minutes,
        source: RouteSource::External,
        bounds,
    })
}

fn same_point(a: &GeoPoint, b: &GeoPoint) -> bool {
    (a.latitude - b.latitude).abs() <= POLYLINE_EPSILON
        && (a.longitude - b.longitude).abs() <= POLYLINE_EPSILON
}

// ============================================================================
// Procedural Synthesis
// ============================================================================

/// Synthesize a road-like route between two valid points.
///
/// # Example
///
/// ```rust
/// use proximity_guard::{GeoPoint, RouteConfig};
/// use proximity_guard::route::synthesize_route;
/// use rand::{rngs::StdRng, SeedableRng};
///
/// let origin = GeoPoint::new(19.0760, 72.8777);
/// let destination = GeoPoint::new(19.0896, 72.8656);
/// let route = synthesize_route(origin, destination, &RouteConfig::default(), &mut StdRng::seed_from_u64(7));
///
/// assert_eq!(route.waypoints.first(), Some(&origin));
/// assert_eq!(route.waypoints.last(), Some(&destination));
/// assert!((15..=50).contains(&route.waypoints.len()));
/// ```
pub fn synthesize_route<R: Rng + ?Sized>(
    origin: GeoPoint,
    destination: GeoPoint,
    config: &RouteConfig,
    rng: &mut R,
) -> Route {
    let distance_km = haversine_km(&origin, &destination);
    let n = config.waypoint_count(distance_km);

    // Unit travel direction in degree space, latitude first
    let d_lat = destination.latitude - origin.latitude;
    let d_lng = destination.longitude - origin.longitude;
    let len = (d_lat * d_lat + d_lng * d_lng).sqrt();
    let (u_lat, u_lng) = if len > f64::EPSILON {
        (d_lat / len, d_lng / len)
    } else {
        (1.0, 0.0)
    };
    let (p_lat, p_lng) = (-u_lng, u_lat);

    let mut waypoints = Vec::with_capacity(n);
    waypoints.push(origin);

    for i in 1..n - 1 {
        let r = i as f64 / (n - 1) as f64;
        let base_lat = origin.latitude + d_lat * r;
        let base_lng = origin.longitude + d_lng * r;

        let amplitude = config.curve_amplitude * (1.0 + (3.0 * PI * r).sin());
        let along = (2.0 * PI * r).sin() * amplitude;
        let across = (1.5 * PI * r).cos() * amplitude * config.perpendicular_ratio;

        let (j_lat, j_lng) = if config.jitter_degrees > 0.0 {
            let j = config.jitter_degrees;
            (rng.gen_range(-j..=j), rng.gen_range(-j..=j))
        } else {
            (0.0, 0.0)
        };

        waypoints.push(GeoPoint::new(
            (base_lat + along * u_lat + across * p_lat + j_lat).clamp(-90.0, 90.0),
            (base_lng + along * u_lng + across * p_lng + j_lng).clamp(-180.0, 180.0),
        ));
    }

    waypoints.push(destination);

    let bounds = frame_bounds(&waypoints, config.frame_padding);
    Route {
        origin,
        destination,
        waypoints,
        distance_km,
        eta_minutes: distance_km * config.minutes_per_km,
        source: RouteSource::Synthesized,
        bounds,
    }
}

// ============================================================================
// Synthesizer
// ============================================================================

/// External routing with procedural fallback.
pub struct RouteSynthesizer {
    config: RouteConfig,
    service: Option<Arc<dyn RoutingService>>,
}

impl RouteSynthesizer {
    /// Synthesizer with no external service; every route is procedural.
    pub fn new(config: RouteConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, service: None })
    }

    pub fn with_service(config: RouteConfig, service: Arc<dyn RoutingService>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            service: Some(service),
        })
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    /// Route between two points.
    ///
    /// Only invalid coordinates are an error. Service failures, malformed
    /// responses and undecodable polylines all fall back to synthesis.
    pub async fn get_route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<Route> {
        let origin = origin.validated()?;
        let destination = destination.validated()?;

        if let Some(service) = &self.service {
            match service.request(origin, destination).await {
                Ok(response) => match route_from_response(origin, destination, &response, &self.config) {
                    Ok(route) => {
                        info!(
                            "[RouteSynthesizer] External route: {} points, {:.2} km, {:.0} min",
                            route.waypoints.len(),
                            route.distance_km,
                            route.eta_minutes
                        );
                        return Ok(route);
                    }
                    Err(e) => warn!("[RouteSynthesizer] Rejecting external route: {}", e),
                },
                Err(e) => warn!("[RouteSynthesizer] Routing service failed: {}", e),
            }
        }

        let route = self.synthesize(origin, destination);
        debug!(
            "[RouteSynthesizer] Synthesized route: {} points, {:.2} km",
            route.waypoints.len(),
            route.distance_km
        );
        Ok(route)
    }

    /// Procedural route using the thread-local RNG.
    pub fn synthesize(&self, origin: GeoPoint, destination: GeoPoint) -> Route {
        synthesize_route(origin, destination, &self.config, &mut rand::thread_rng())
    }
}

// ============================================================================
// Route Holder
// ============================================================================

/// Identifies one route request issued through a [`RouteHolder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTicket(u64);

/// The route currently shown. A completion is kept only if no newer request
/// was issued (and no `clear`) since its ticket was taken.
#[derive(Debug, Default)]
pub struct RouteHolder {
    latest: u64,
    current: Option<Route>,
}

impl RouteHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a ticket for a new request, superseding any in flight.
    pub fn begin(&mut self) -> RouteTicket {
        self.latest += 1;
        RouteTicket(self.latest)
    }

    /// Offer a completed route. Returns false if the ticket was superseded.
    pub fn complete(&mut self, ticket: RouteTicket, route: Route) -> bool {
        if ticket.0 != self.latest {
            debug!(
                "[RouteHolder] Discarding superseded route (ticket {}, latest {})",
                ticket.0, self.latest
            );
            return false;
        }
        self.current = Some(route);
        true
    }

    pub fn current(&self) -> Option<&Route> {
        self.current.as_ref()
    }

    /// Drop the shown route and invalidate requests in flight.
    pub fn clear(&mut self) {
        self.latest += 1;
        self.current = None;
    }
}
