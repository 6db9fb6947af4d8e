//! Shared fixtures for engine tests

use crate::config::ConfinementConfig;
use crate::confinement::{
    ConfineRequest, ConfinementRegistry, ConfinementService, ContainmentEnforcer,
    LaborProgressTracker, MemoryStore, MockNotificationSink, ModerationEvent, PersistenceMirror,
    RetryPolicy,
};
use crate::sim::SimWorld;
use crate::world::{BlockCoord, Location, SubjectId, WorldLoop, WorldScheduler};
use std::sync::{Arc, Mutex};

pub fn test_config() -> ConfinementConfig {
    let mut config = ConfinementConfig::default();
    config
        .cells
        .insert("north".to_string(), Location::new("world", 0.5, 64.0, 0.5));
    config
        .cells
        .insert("empty".to_string(), Location::new("world", 50.5, 64.0, 50.5));
    config.spawners.insert(
        "north".to_string(),
        vec![
            BlockCoord::new("world", 2, 64, 0),
            BlockCoord::new("world", 3, 64, 0),
        ],
    );
    config.release_anchor = Some(Location::new("world", 100.5, 70.0, 100.5));
    config
}

pub fn request(subject: SubjectId, cell: &str, duration_ms: u64, labor: u32) -> ConfineRequest {
    ConfineRequest {
        subject,
        display_name: "Alex".to_string(),
        cell: cell.to_string(),
        staff: "Admin".to_string(),
        reason: "griefing".to_string(),
        duration_ms,
        labor_required: labor,
    }
}

pub struct Fixture {
    pub service: ConfinementService,
    pub labor: LaborProgressTracker,
    pub enforcer: ContainmentEnforcer,
    pub world: Arc<SimWorld>,
    pub world_loop: WorldLoop,
    pub store: Arc<MemoryStore>,
    pub events: Arc<Mutex<Vec<ModerationEvent>>>,
}

impl Fixture {
    pub fn count_events(&self, matches: impl Fn(&ModerationEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| matches(e)).count()
    }

    /// Connect a subject standing at the cell anchor
    pub fn connect_at_cell(&self, subject: SubjectId, cell: &str) {
        let anchor = self.service.cells.cell_anchor(cell).unwrap();
        self.world.connect(subject, anchor);
    }
}

/// Full engine on a simulated world, with labor blocks stocked
pub fn fixture(config: ConfinementConfig) -> Fixture {
    let world = Arc::new(SimWorld::new());
    let (scheduler, world_loop) = WorldScheduler::new();
    let store = Arc::new(MemoryStore::new());
    let registry = ConfinementRegistry::with_mirror(PersistenceMirror::new(
        store.clone(),
        RetryPolicy::default(),
    ));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let mut notifier = MockNotificationSink::new();
    notifier
        .expect_emit()
        .returning(move |event| sink_events.lock().unwrap().push(event));

    let service = ConfinementService::new(
        config,
        world.clone(),
        scheduler,
        registry,
        Arc::new(notifier),
    );
    let labor = LaborProgressTracker::new(service.clone());
    labor.restock();
    let enforcer = ContainmentEnforcer::new(service.clone(), labor.clone());
    world.route_teleports_through(enforcer.clone());

    Fixture {
        service,
        labor,
        enforcer,
        world,
        world_loop,
        store,
        events,
    }
}
