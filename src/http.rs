//! HTTP client for a directions-style routing API.
//!
//! This module provides the external [`RoutingService`] with:
//! - Connection pooling shared across requests
//! - Request pacing (spaces out request starts, shared 429 backoff)
//! - Concurrent multi-route requests with bounded concurrency
//! - Automatic retry with exponential backoff on 429 and transport errors

use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ProximityError, Result};
use crate::route::{RouteResponse, RoutingService};
use crate::GeoPoint;

/// Configuration for the HTTP routing service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct RoutingServiceConfig {
    /// Directions endpoint.
    /// Default: Google Directions JSON API
    pub base_url: String,

    pub api_key: String,

    /// Travel mode passed to the service.
    /// Default: "driving"
    pub mode: String,

    /// Per-request timeout.
    /// Default: 30 seconds
    pub timeout_secs: u64,

    /// Retries after a 429 or a transport error.
    /// Default: 3
    pub max_retries: u32,

    /// Requests in flight for [`HttpRoutingService::request_many`].
    /// Default: 8
    pub max_concurrency: u32,

    /// Minimum spacing between request starts.
    /// Default: 100 ms
    pub dispatch_interval_ms: u64,
}

impl Default for RoutingServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://maps.googleapis.com/maps/api/directions/json".to_string(),
            api_key: String::new(),
            mode: "driving".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            max_concurrency: 8,
            dispatch_interval_ms: 100,
        }
    }
}

impl RoutingServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(ProximityError::ConfigValidation(
                "base_url must not be empty".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ProximityError::ConfigValidation(
                "max_concurrency must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Response Parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    status: String,
    #[serde(default)]
    routes: Vec<DirectionsRoute>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DirectionsRoute {
    overview_polyline: OverviewPolyline,
    #[serde(default)]
    legs: Vec<DirectionsLeg>,
}

#[derive(Debug, Deserialize)]
struct OverviewPolyline {
    points: String,
}

#[derive(Debug, Deserialize)]
struct DirectionsLeg {
    distance: ValueField,
    duration: ValueField,
}

#[derive(Debug, Deserialize)]
struct ValueField {
    value: f64,
}

/// Validate a directions JSON body into a [`RouteResponse`].
///
/// Distance and duration are summed over the first route's legs.
pub fn parse_directions(body: &[u8]) -> Result<RouteResponse> {
    let data: DirectionsResponse = serde_json::from_slice(body)
        .map_err(|e| ProximityError::decode(format!("directions response: {}", e)))?;

    if data.status != "OK" {
        return Err(ProximityError::network(format!(
            "routing service returned {}{}",
            data.status,
            data.error_message
                .map(|m| format!(": {}", m))
                .unwrap_or_default()
        )));
    }

    let route = data
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| ProximityError::decode("directions response has no routes"))?;

    Ok(RouteResponse {
        encoded_polyline: route.overview_polyline.points,
        distance_meters: route.legs.iter().map(|l| l.distance.value).sum(),
        duration_seconds: route.legs.iter().map(|l| l.duration.value).sum(),
    })
}

fn format_point(p: &GeoPoint) -> String {
    format!("{:.6},{:.6}", p.latitude, p.longitude)
}

// ============================================================================
// Request Pacing
// ============================================================================

/// Why a request is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryCause {
    /// HTTP 429 from the service
    RateLimited,
    /// Connection, TLS or timeout error
    Transport,
}

/// Spaces out request starts and decides retry delays.
///
/// A 429 backs off every request sharing the pacer, not only the one that
/// was rejected: the next start slot is pushed past the backoff.
struct RequestPacer {
    interval: Duration,
    next_start: Mutex<Instant>,
    started: AtomicU32,
    rate_limited_streak: AtomicU32,
}

impl RequestPacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_start: Mutex::new(Instant::now()),
            started: AtomicU32::new(0),
            rate_limited_streak: AtomicU32::new(0),
        }
    }

    /// Reserve the next start slot and sleep until it. Returns the
    /// request's sequence number, starting at 1.
    async fn acquire(&self) -> u32 {
        let (wait, seq) = {
            let mut next = self.next_start.lock().await;
            let now = Instant::now();
            let start_at = (*next).max(now);
            *next = start_at + self.interval;
            let seq = self.started.fetch_add(1, Ordering::Relaxed) + 1;
            (start_at.saturating_duration_since(now), seq)
        };

        if wait > Duration::from_millis(5) {
            debug!("[Route #{}] Waiting {:?} for start slot", seq, wait);
            tokio::time::sleep(wait).await;
        }
        seq
    }

    /// Delay before retry number `attempt` (1-based).
    async fn retry_delay(&self, cause: RetryCause, attempt: u32) -> Duration {
        match cause {
            RetryCause::RateLimited => {
                let streak = self.rate_limited_streak.fetch_add(1, Ordering::Relaxed) + 1;
                // 1 s, 2 s, 4 s cap
                let backoff = Duration::from_millis(500 * (1 << streak.min(3)));
                let mut next = self.next_start.lock().await;
                *next = (*next).max(Instant::now() + backoff);
                warn!("[RequestPacer] Rate limited ({} in a row), backing off {:?}", streak, backoff);
                backoff
            }
            // 400 ms doubling, 6.4 s cap
            RetryCause::Transport => Duration::from_millis(200 * (1 << attempt.min(5))),
        }
    }

    fn record_success(&self) {
        self.rate_limited_streak.store(0, Ordering::Relaxed);
    }
}

// ============================================================================
// Routing Service
// ============================================================================

/// [`RoutingService`] over HTTP.
pub struct HttpRoutingService {
    client: Client,
    config: RoutingServiceConfig,
    pacer: Arc<RequestPacer>,
}

impl HttpRoutingService {
    pub fn new(config: RoutingServiceConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .pool_max_idle_per_host(config.max_concurrency as usize * 2)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProximityError::internal(format!("Failed to create HTTP client: {}", e)))?;

        let pacer = Arc::new(RequestPacer::new(Duration::from_millis(config.dispatch_interval_ms)));

        Ok(Self { client, config, pacer })
    }

    /// Fetch one route, retrying on 429 and transport errors.
    pub async fn fetch(&self, origin: GeoPoint, destination: GeoPoint) -> Result<RouteResponse> {
        let seq = self.pacer.acquire().await;
        let query = [
            ("origin", format_point(&origin)),
            ("destination", format_point(&destination)),
            ("mode", self.config.mode.clone()),
            ("key", self.config.api_key.clone()),
        ];

        let mut retries = 0;
        let req_start = Instant::now();

        loop {
            let response = self
                .client
                .get(&self.config.base_url)
                .query(&query)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        retries += 1;
                        if retries > self.config.max_retries {
                            return Err(ProximityError::network("Max retries exceeded (429)"));
                        }
                        let wait = self.pacer.retry_delay(RetryCause::RateLimited, retries).await;
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    self.pacer.record_success();

                    if !status.is_success() {
                        return Err(ProximityError::network(format!("HTTP {}", status)));
                    }

                    let bytes = resp
                        .bytes()
                        .await
                        .map_err(|e| ProximityError::network(format!("Body download error: {}", e)))?;
                    let parsed = parse_directions(&bytes)?;

                    info!(
                        "[Route #{}] {:.2} km, {:.0} s in {:?} ({} bytes)",
                        seq,
                        parsed.distance_meters / 1000.0,
                        parsed.duration_seconds,
                        req_start.elapsed(),
                        bytes.len()
                    );
                    return Ok(parsed);
                }
                Err(e) => {
                    retries += 1;
                    if retries > self.config.max_retries {
                        return Err(ProximityError::network(format!("Request error: {}", e)));
                    }

                    let wait = self.pacer.retry_delay(RetryCause::Transport, retries).await;
                    warn!("[Route #{}] Error: {}, retry {} after {:?}", seq, e, retries, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Fetch several routes concurrently. Results are in input order.
    pub async fn request_many(&self, pairs: Vec<(GeoPoint, GeoPoint)>) -> Vec<Result<RouteResponse>> {
        use futures::stream::{self, StreamExt};

        let total = pairs.len();
        let start = Instant::now();

        let results: Vec<Result<RouteResponse>> = stream::iter(pairs)
            .map(|(origin, destination)| self.fetch(origin, destination))
            .buffered(self.config.max_concurrency as usize)
            .collect()
            .await;

        let success_count = results.iter().filter(|r| r.is_ok()).count();
        info!(
            "[HttpRoutingService] DONE: {}/{} routes in {:.2}s",
            success_count,
            total,
            start.elapsed().as_secs_f64()
        );

        results
    }
}

#[async_trait]
impl RoutingService for HttpRoutingService {
    async fn request(&self, origin: GeoPoint, destination: GeoPoint) -> Result<RouteResponse> {
        self.fetch(origin, destination).await
    }
}

/// Synchronous wrapper for FFI - runs the async lookup on a tokio runtime
#[cfg(feature = "ffi")]
pub fn get_route_blocking(
    service_config: RoutingServiceConfig,
    route_config: crate::RouteConfig,
    origin: GeoPoint,
    destination: GeoPoint,
) -> Result<crate::Route> {
    use tokio::runtime::Builder;

    let rt = Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|e| ProximityError::internal(format!("Failed to create tokio runtime: {}", e)))?;

    let synthesizer = match HttpRoutingService::new(service_config) {
        Ok(service) => crate::RouteSynthesizer::with_service(route_config, Arc::new(service))?,
        Err(e) => {
            warn!("[HttpRoutingService] Falling back to synthesis only: {}", e);
            crate::RouteSynthesizer::new(route_config)?
        }
    };

    rt.block_on(synthesizer.get_route(origin, destination))
}
