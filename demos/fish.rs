use geowatch::prelude::*;
use std::sync::Arc;

fn main() -> Result<()> {
    // Initialize logging (set RUST_LOG=debug to see query internals)
    env_logger::init();

    println!("=== geowatch - Fish Tank ===\n");

    let locations = LocationStore::new(Arc::new(MemoryStore::new()));

    let fish = [
        ("fish0", Location::new(-40.0, 159.0)),
        ("fish1", Location::new(90.0, 70.0)),
        ("fish2", Location::new(-46.0, 160.0)),
        ("fish3", Location::new(0.0, 0.0)),
    ];

    // Watch everything within 3000 km of fish2's starting spot
    let query = locations.query(QueryCriteria::new(fish[2].1, 3000.0))?;
    println!(
        "Watching {} km around {} (query {})\n",
        query.radius(),
        query.center(),
        query.id()
    );

    let _entered = query.on(QueryEventKind::KeyEntered, |event| {
        if let Some(e) = event.key_event() {
            println!("   {} entered the query. Hi {}!", e.key, e.key);
        }
    });
    let _exited = query.on(QueryEventKind::KeyExited, |event| {
        if let Some(key) = event.key() {
            println!("   {} left the query. Bye bye :(", key);
        }
    });
    let moved = query.on(QueryEventKind::KeyMoved, |event| {
        if let Some(e) = event.key_event() {
            let distance = e.distance.unwrap_or_default();
            println!("   {} moved within the query ({:.1} km from center)", e.key, distance);
        }
    });
    let _ready = query.on(QueryEventKind::Ready, |_| println!("   query is ready"));

    println!("*** Setting initial locations ***");
    locations.set_many(fish.iter().map(|(key, location)| (*key, Some(*location))))?;

    println!("\n*** Moving fish around ***");
    let moves = [
        ("fish0", Location::new(60.0, 80.0)),
        ("fish1", Location::new(-44.0, 170.0)),
        ("fish2", Location::new(-47.0, 150.0)),
        ("fish3", Location::new(-43.0, 145.0)),
        ("fish0", Location::new(-40.0, 150.0)),
    ];
    for (key, location) in moves {
        println!(" > {} swims to {}", key, location);
        locations.set(key, location)?;
    }

    println!("\n*** 'key_moved' callback cancelled ***");
    moved.cancel();
    locations.set("fish1", Location::new(-42.0, 155.0))?;

    println!("\n*** Shrinking the query to 500 km ***");
    query.update_criteria(QueryCriteria::radius(500.0))?;

    println!("\n*** fish3 is caught ***");
    locations.remove("fish3")?;

    let stats = query.stats();
    println!(
        "\nTracking {} fish, {} in the query, over {} range(s)",
        stats.tracked_entities, stats.in_query, stats.active_ranges
    );

    query.cancel();
    Ok(())
}
