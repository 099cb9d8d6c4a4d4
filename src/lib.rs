//! # Proximity Guard
//!
//! Family proximity alerting and route synthesis for location-safety apps.
//!
//! This library provides:
//! - Great-circle distance and nearby ranking for linked contacts
//! - Presence classification (live / stale / offline) from reported positions
//! - Hysteresis-based proximity alerts with deduplicated notifications
//! - A bidirectional relationship graph written as atomic batches
//! - Route synthesis: external routes via polyline decoding, with a procedural fallback
//!
//! ## Features
//!
//! - **`parallel`** - Enable parallel nearby ranking with rayon
//! - **`http`** - Enable the HTTP routing service client
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use proximity_guard::{AlertTracker, ContactRef, ProximityConfig, SessionContext};
//!
//! let config = ProximityConfig::default();
//! let mut tracker = AlertTracker::new("owner-1", &config, SessionContext::new());
//! let asha = ContactRef::new("user-2", "Asha", "asha@example.com");
//!
//! let mut events = Vec::new();
//! for distance in [0.3, 0.6, 0.65, 0.2] {
//!     events.extend(tracker.evaluate(&asha, distance, 0));
//! }
//! // One alert when Asha crosses 500 m, one when she comes back
//! assert_eq!(events.len(), 2);
//! ```

use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{ProximityError, Result};

pub mod geo_utils;
pub use geo_utils::{haversine_km, NearbyEntry};

pub mod polyline;

pub mod presence;
pub use presence::{classify, Classification, Presence, TrackedEntity};

pub mod store;
pub use store::{AccountRecord, DocumentStore, MemoryStore, WriteBatch, WriteOp};

pub mod graph;
pub use graph::RelationshipGraph;

pub mod alert;
pub use alert::{AlertEvent, AlertRecord, AlertState, AlertTracker, SessionContext};

pub mod notify;
pub use notify::{
    Channel, DispatchOutcome, LogOnlyPush, NotificationDispatcher, NotificationKind,
    NotificationMessage, PushChannel, PushPriority, PushRequest,
};

pub mod location;
pub use location::{GeolocationProvider, PermissionStatus, WatchHandle, WatchOptions};

pub mod monitor;
pub use monitor::{ContactStatus, FamilyAnalysis, MonitorEvent, ProximityMonitor};

pub mod route;
pub use route::{Route, RouteConfig, RouteHolder, RouteResponse, RouteSource, RouteSynthesizer, RoutingService};

// HTTP routing service client
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{HttpRoutingService, RoutingServiceConfig};

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("ProximityGuardRust")
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A WGS84 coordinate with latitude and longitude in degrees.
///
/// # Example
/// ```
/// use proximity_guard::GeoPoint;
/// let point = GeoPoint::new(19.0760, 72.8777); // Mumbai
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
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

    /// Return the point, or an [`ProximityError::InvalidCoordinate`] error.
    pub fn validated(self) -> Result<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(ProximityError::InvalidCoordinate {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }
}

/// A position fix reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Position {
    pub point: GeoPoint,
    /// Horizontal accuracy in meters, when the provider reports one
    pub accuracy: Option<f64>,
    /// Capture time (Unix epoch milliseconds)
    pub captured_at: i64,
}

impl Position {
    /// Create a position without accuracy information.
    pub fn new(latitude: f64, longitude: f64, captured_at: i64) -> Self {
        Self {
            point: GeoPoint::new(latitude, longitude),
            accuracy: None,
            captured_at,
        }
    }
}

/// Bounding box, used to frame routes on the map.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Degenerate bounds around a single point.
    pub fn around(point: GeoPoint) -> Self {
        Self {
            min_lat: point.latitude,
            max_lat: point.latitude,
            min_lng: point.longitude,
            max_lng: point.longitude,
        }
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

/// Identity of an account as seen from the other side of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContactRef {
    pub id: String,
    pub display_name: String,
    pub email: String,
}

impl ContactRef {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            email: email.into(),
        }
    }
}

/// Configuration for proximity monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct ProximityConfig {
    /// Distance at or beyond which a contact is considered far away.
    /// Default: 0.5 km
    pub threshold_km: f64,

    /// A current position younger than this is live.
    /// Default: 120 seconds
    pub live_window_secs: u32,

    /// Number of contacts returned by nearby ranking.
    /// Default: 10
    pub nearby_limit: u32,

    /// Maximum entries kept in an account's notification log (newest kept).
    /// Default: 1000
    pub max_log_entries: u32,

    /// Maximum alert events kept for redelivery when the log write fails.
    /// Default: 100
    pub max_pending_dispatches: u32,

    /// Minimum time between watched position updates.
    /// Default: 20000 ms
    pub watch_min_interval_ms: u32,

    /// Minimum movement between watched position updates.
    /// Default: 10 m
    pub watch_min_distance_m: f64,

    /// Map center shown when the device location is unavailable (display only).
    /// Default: Mumbai (19.0760, 72.8777)
    pub default_latitude: f64,
    pub default_longitude: f64,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            threshold_km: 0.5,
            live_window_secs: 120,
            nearby_limit: 10,
            max_log_entries: 1000,
            max_pending_dispatches: 100,
            watch_min_interval_ms: 20_000,
            watch_min_distance_m: 10.0,
            default_latitude: 19.0760,
            default_longitude: 72.8777,
        }
    }
}

impl ProximityConfig {
    /// Live window in milliseconds.
    pub fn live_window_ms(&self) -> i64 {
        i64::from(self.live_window_secs) * 1000
    }

    /// Map center used when the device location is unavailable.
    pub fn default_location(&self) -> GeoPoint {
        GeoPoint::new(self.default_latitude, self.default_longitude)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if !self.threshold_km.is_finite() || self.threshold_km <= 0.0 {
            return Err(ProximityError::ConfigValidation(format!(
                "threshold_km must be positive, got {}",
                self.threshold_km
            )));
        }
        if self.live_window_secs == 0 {
            return Err(ProximityError::ConfigValidation(
                "live_window_secs must be positive".to_string(),
            ));
        }
        if self.max_log_entries == 0 {
            return Err(ProximityError::ConfigValidation(
                "max_log_entries must be positive".to_string(),
            ));
        }
        if !self.default_location().is_valid() {
            return Err(ProximityError::ConfigValidation(format!(
                "default location ({}, {}) is not a valid coordinate",
                self.default_latitude, self.default_longitude
            )));
        }
        Ok(())
    }
}

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// FFI Exports (only when feature enabled)
// ============================================================================

#[cfg(feature = "ffi")]
mod ffi {
    use super::*;
    use log::{debug, info};

    /// Great-circle distance in kilometers.
    #[uniffi::export]
    pub fn ffi_distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
        geo_utils::haversine_km(&a, &b)
    }

    /// Decode an encoded polyline from a routing response.
    #[uniffi::export]
    pub fn ffi_decode_polyline(encoded: String) -> std::result::Result<Vec<GeoPoint>, ProximityError> {
        init_logging();
        let points = polyline::decode(&encoded)?;
        debug!("[ProximityGuardRust] Decoded polyline into {} points", points.len());
        Ok(points)
    }

    /// Encode points as a polyline.
    #[uniffi::export]
    pub fn ffi_encode_polyline(points: Vec<GeoPoint>) -> String {
        polyline::encode(&points)
    }

    /// Classify a contact's presence from its current and last-known positions.
    #[uniffi::export]
    pub fn ffi_classify_presence(
        current: Option<Position>,
        last_known: Option<Position>,
        now_ms: i64,
        config: ProximityConfig,
    ) -> Classification {
        presence::classify(current.as_ref(), last_known.as_ref(), now_ms, config.live_window_ms())
    }

    /// Synthesize a road-like route without contacting a routing service.
    #[uniffi::export]
    pub fn ffi_synthesize_route(
        origin: GeoPoint,
        destination: GeoPoint,
        config: RouteConfig,
    ) -> std::result::Result<Route, ProximityError> {
        init_logging();
        config.validate()?;
        let origin = origin.validated()?;
        let destination = destination.validated()?;
        let route = route::synthesize_route(origin, destination, &config, &mut rand::thread_rng());
        info!(
            "[ProximityGuardRust] Synthesized route: {} points, {:.2} km, {:.0} min",
            route.waypoints.len(),
            route.distance_km,
            route.eta_minutes
        );
        Ok(route)
    }

    /// Route through the HTTP routing service, falling back to synthesis.
    #[cfg(feature = "http")]
    #[uniffi::export]
    pub fn ffi_get_route(
        service_config: RoutingServiceConfig,
        route_config: RouteConfig,
        origin: GeoPoint,
        destination: GeoPoint,
    ) -> std::result::Result<Route, ProximityError> {
        init_logging();
        http::get_route_blocking(service_config, route_config, origin, destination)
    }

    /// Get default proximity configuration.
    #[uniffi::export]
    pub fn default_proximity_config() -> ProximityConfig {
        init_logging();
        info!("[ProximityGuardRust] default_proximity_config called - Rust is active!");
        ProximityConfig::default()
    }

    /// Get default route configuration.
    #[uniffi::export]
    pub fn default_route_config() -> RouteConfig {
        RouteConfig::default()
    }
}

// ============================================================================
// Tests
// ============================================================================
