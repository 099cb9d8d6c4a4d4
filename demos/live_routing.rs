//! Fetch a route from the directions service, falling back to synthesis.
//! Run with: ROUTING_API_KEY=... cargo run --example live_routing --features http

use std::sync::Arc;
use std::time::Instant;

use proximity_guard::{GeoPoint, HttpRoutingService, RouteConfig, RouteSource, RouteSynthesizer, RoutingServiceConfig};

#[tokio::main]
async fn main() {
    let api_key = std::env::var("ROUTING_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        println!("ROUTING_API_KEY not set; expect the synthesized fallback\n");
    }

    let service_config = RoutingServiceConfig {
        api_key,
        ..RoutingServiceConfig::default()
    };
    let service = match HttpRoutingService::new(service_config) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            eprintln!("Invalid routing config: {}", e);
            return;
        }
    };

    let origin = GeoPoint::new(19.0760, 72.8777);
    let destinations = [
        ("Bandra", GeoPoint::new(19.0544, 72.8402)),
        ("Powai", GeoPoint::new(19.1176, 72.9060)),
        ("Colaba", GeoPoint::new(18.9067, 72.8147)),
    ];

    // Batch lookup, rate limited and bounded in flight
    let start = Instant::now();
    let pairs: Vec<(GeoPoint, GeoPoint)> = destinations.iter().map(|(_, d)| (origin, *d)).collect();
    let responses = service.request_many(pairs).await;
    println!("Raw lookups ({:.0} ms):", start.elapsed().as_secs_f64() * 1000.0);
    for ((name, _), response) in destinations.iter().zip(&responses) {
        match response {
            Ok(r) => println!(
                "   {}: {} m, {} s, {} polyline chars",
                name,
                r.distance_meters,
                r.duration_seconds,
                r.encoded_polyline.len()
            ),
            Err(e) => println!("   {}: failed ({})", name, e),
        }
    }

    // Same lookups through the synthesizer, which never fails on service errors
    let synthesizer = RouteSynthesizer::with_service(RouteConfig::default(), service).expect("default config is valid");
    println!("\nRoutes:");
    for (name, destination) in destinations {
        match synthesizer.get_route(origin, destination).await {
            Ok(route) => {
                let source = match route.source {
                    RouteSource::External => "external",
                    RouteSource::Synthesized => "synthesized",
                };
                println!(
                    "   {}: {:.2} km, {:.0} min, {} points ({})",
                    name,
                    route.distance_km,
                    route.eta_minutes,
                    route.waypoints.len(),
                    source
                );
            }
            Err(e) => println!("   {}: {}", name, e),
        }
    }
}
