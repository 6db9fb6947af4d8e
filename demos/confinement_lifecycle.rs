use cellblock::config::ConfinementConfig;
use cellblock::confinement::{
    ChannelSink, ConfinementRegistry, ConfinementService, ContainmentEnforcer, LaborProgressTracker,
    MemoryStore, PersistenceMirror, RetryPolicy,
};
use cellblock::script::{Script, ScriptRunner};
use cellblock::sim::SimWorld;
use cellblock::world::{BlockCoord, Location, WorldScheduler};
use std::sync::Arc;

const SCRIPT: &str = r#"
steps:
  - step: connect
    subject: 0b7d5c1e-5a52-4c1f-9f0e-3c2a9d4e7b11
    at: { world: world, x: 40.5, y: 64.0, z: 40.5 }
  - step: confine
    subject: 0b7d5c1e-5a52-4c1f-9f0e-3c2a9d4e7b11
    display_name: Alex
    cell: north
    staff: Moderator
    reason: griefing spawn
    duration_ms: 1000
    labor_required: 2
  - step: wait
    ms: 1500
  - step: status
    subject: 0b7d5c1e-5a52-4c1f-9f0e-3c2a9d4e7b11
  - step: action
    action: command
    subject: 0b7d5c1e-5a52-4c1f-9f0e-3c2a9d4e7b11
    line: /home
  - step: action
    action: move
    subject: 0b7d5c1e-5a52-4c1f-9f0e-3c2a9d4e7b11
    from: { world: world, x: 0.5, y: 64.0, z: 0.5 }
    to: { world: world, x: 30.5, y: 64.0, z: 0.5 }
  - step: wait
    ms: 500
  - step: action
    action: block_break
    subject: 0b7d5c1e-5a52-4c1f-9f0e-3c2a9d4e7b11
    coord: { world: world, x: 2, y: 64, z: 0 }
    material: COBBLESTONE
  - step: summary
  - step: action
    action: block_break
    subject: 0b7d5c1e-5a52-4c1f-9f0e-3c2a9d4e7b11
    coord: { world: world, x: 3, y: 64, z: 0 }
    material: COBBLESTONE
  - step: wait
    ms: 1000
  - step: status
    subject: 0b7d5c1e-5a52-4c1f-9f0e-3c2a9d4e7b11
"#;

#[tokio::main]
async fn main() {
    println!("Confinement Lifecycle Demo");
    println!("--------------------------");

    let mut config = ConfinementConfig::default();
    config
        .cells
        .insert("north".to_string(), Location::new("world", 0.5, 64.0, 0.5));
    config.spawners.insert(
        "north".to_string(),
        vec![BlockCoord::new("world", 2, 64, 0), BlockCoord::new("world", 3, 64, 0)],
    );
    config.release_anchor = Some(Location::new("world", 100.5, 70.0, 100.5));

    let store = Arc::new(MemoryStore::new());
    let registry = ConfinementRegistry::with_mirror(PersistenceMirror::new(
        store.clone(),
        RetryPolicy::default(),
    ));
    let (sink, mut events) = ChannelSink::new(32);

    let world = Arc::new(SimWorld::new());
    let (scheduler, world_loop) = WorldScheduler::new();
    let service =
        ConfinementService::new(config, world.clone(), scheduler, registry, Arc::new(sink));
    let labor = LaborProgressTracker::new(service.clone());
    let enforcer = ContainmentEnforcer::new(service.clone(), labor.clone());
    world.route_teleports_through(enforcer.clone());
    labor.restock();

    let world_task = tokio::spawn(world_loop.run());

    let script: Script = match serde_yaml::from_str(SCRIPT) {
        Ok(script) => script,
        Err(e) => {
            eprintln!("Bad demo script: {e}");
            return;
        }
    };
    let report = ScriptRunner::new(enforcer, world.clone()).run(&script).await;

    println!("\n--- Transcript ---");
    for line in &report.transcript {
        println!("{line}");
    }

    println!("\n--- Moderation events ---");
    while let Ok(event) = events.try_recv() {
        println!("{} for {}", event.name(), event.subject());
    }

    if let Some(mirror) = service.registry.mirror() {
        mirror.flush().await;
    }
    println!("\n--- Final state ---");
    println!("Confined subjects: {}", service.registry.len());
    println!("Durable rows: {}", store.len());
    println!("Displays left: {}", world.display_count());
    world_task.abort();
}
