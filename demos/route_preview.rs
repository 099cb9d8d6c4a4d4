//! Procedural route synthesis and polyline handling.
//!
//! Run with: cargo run --example route_preview

use proximity_guard::polyline;
use proximity_guard::route::synthesize_route;
use proximity_guard::{GeoPoint, RouteConfig, RouteHolder, RouteSynthesizer};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn main() {
    let config = RouteConfig::default();
    let origin = GeoPoint::new(19.0760, 72.8777);
    let destination = GeoPoint::new(19.1136, 72.8697);

    println!("Route Preview\n");
    println!(
        "Config: {} points/km (min {}, max {}), {} min/km\n",
        config.points_per_km, config.min_points, config.max_points, config.minutes_per_km
    );

    // Seeded for a reproducible preview
    let mut rng = StdRng::seed_from_u64(7);
    let route = synthesize_route(origin, destination, &config, &mut rng);
    println!("1. Synthesized route:");
    println!("   Waypoints: {}", route.waypoints.len());
    println!("   Distance: {:.2} km", route.distance_km);
    println!("   ETA: {:.0} min", route.eta_minutes);
    if let Some(bounds) = route.bounds {
        println!(
            "   Bounds: lat {:.4}..{:.4}, lng {:.4}..{:.4}\n",
            bounds.min_lat, bounds.max_lat, bounds.min_lng, bounds.max_lng
        );
    }

    let encoded = polyline::encode(&route.waypoints);
    println!("2. Encoded polyline ({} chars):", encoded.len());
    println!("   {}...\n", &encoded[..encoded.len().min(48)]);

    let decoded = polyline::decode(&encoded).unwrap();
    println!("3. Decoded back: {} points\n", decoded.len());

    // The last request wins; older completions are dropped
    let synthesizer = RouteSynthesizer::new(config).expect("default config is valid");
    let mut holder = RouteHolder::new();
    let first = holder.begin();
    let second = holder.begin();
    let kept_first = holder.complete(first, synthesizer.synthesize(origin, destination));
    let kept_second = holder.complete(second, synthesizer.synthesize(origin, GeoPoint::new(19.0544, 72.8402)));
    println!("4. Overlapping requests:");
    println!("   First kept: {}, second kept: {}", kept_first, kept_second);
    if let Some(current) = holder.current() {
        println!("   Showing route to {:?}", current.destination);
    }
}
