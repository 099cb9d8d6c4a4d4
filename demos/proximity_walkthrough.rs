//! Walk one family through a proximity session.
//!
//! Run with: cargo run --example proximity_walkthrough

use std::sync::Arc;

use proximity_guard::{
    AccountRecord, ContactRef, DocumentStore, LogOnlyPush, MemoryStore, MonitorEvent, Position,
    ProximityConfig, ProximityMonitor, RelationshipGraph, SessionContext, WriteBatch, WriteOp,
};

const START: i64 = 1_700_000_000_000;

fn move_to(store: &MemoryStore, id: &str, lat: f64, lng: f64, at: i64) -> AccountRecord {
    let mut batch = WriteBatch::new();
    batch.push(WriteOp::SetLocation {
        account_id: id.to_string(),
        position: Position::new(lat, lng, at),
    });
    store.commit(batch).expect("location write");
    store.get(id).expect("read").expect("account exists")
}

fn main() {
    let store = Arc::new(MemoryStore::new());
    store.insert(AccountRecord::new("asha", "Asha", "asha@example.com")).unwrap();
    store.insert(AccountRecord::new("ravi", "Ravi", "ravi@example.com")).unwrap();
    store.insert(AccountRecord::new("meera", "Meera", "meera@example.com")).unwrap();

    let config = ProximityConfig::default();
    let graph = RelationshipGraph::new(store.clone(), &config);
    graph
        .add_edge("asha", &ContactRef::new("ravi", "Ravi", "ravi@example.com"), "Brother")
        .unwrap();
    graph
        .add_edge("asha", &ContactRef::new("meera", "Meera", "meera@example.com"), "Mother")
        .unwrap();

    println!("Proximity Walkthrough\n");
    println!("Threshold: {} km, live window: {} s\n", config.threshold_km, config.live_window_secs);

    // Ravi starts 1.1 km away, Meera has never shared a location
    move_to(&store, "ravi", 19.0860, 72.8777, START);

    // No push permission on this device: pushes are rejected, logs still land
    let mut monitor = ProximityMonitor::new(
        "asha",
        config.clone(),
        store.clone(),
        Arc::new(LogOnlyPush),
        SessionContext::new(),
    )
    .unwrap();

    println!("Map center before the first fix: {:?}\n", monitor.display_center());

    let steps: Vec<(&str, MonitorEvent, i64)> = vec![
        ("Asha's first fix", MonitorEvent::OwnPosition(Position::new(19.0760, 72.8777, START)), START),
        ("Ravi walks further", MonitorEvent::Snapshot(move_to(&store, "ravi", 19.0900, 72.8777, START + 60_000)), START + 60_000),
        ("Ravi comes back", MonitorEvent::Snapshot(move_to(&store, "ravi", 19.0765, 72.8777, START + 120_000)), START + 120_000),
        ("Ravi leaves again", MonitorEvent::Snapshot(move_to(&store, "ravi", 19.0820, 72.8777, START + 180_000)), START + 180_000),
    ];

    for (i, (label, event, at)) in steps.into_iter().enumerate() {
        let outcomes = monitor.handle(event, at);
        println!("{}. {}", i + 1, label);
        if outcomes.is_empty() {
            println!("   (no notification)");
        }
        for outcome in outcomes {
            println!("   {}: {}", outcome.owner_message.title, outcome.owner_message.body);
            if let Some(counterpart) = outcome.counterpart_message {
                println!("   -> Ravi's log: {}", counterpart.body);
            }
        }
        println!();
    }

    println!("Contacts (closest first):");
    for status in monitor.contacts(START + 180_000) {
        let distance = status
            .distance_km
            .map(|d| format!("{:.2} km", d))
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "   {} ({}) - {} - {:?} - {:?}",
            status.entity.display_name,
            status.entity.relationship.as_deref().unwrap_or("-"),
            distance,
            status.entity.presence,
            status.alert_state
        );
    }

    let analysis = monitor.analyze_far_contacts(START + 180_000).unwrap();
    println!("\nManual check: {} far away, {} nearby, {} offline", analysis.far_away.len(), analysis.nearby.len(), analysis.offline.len());
    if let Some(outcome) = analysis.notification {
        println!("   {}", outcome.owner_message.body);
    }

    let unread = monitor.dispatcher().unread("asha").unwrap();
    println!("\nAsha has {} unread notifications", unread.len());
}
