//! In-memory world
//!
//! A [`World`] with no game server behind it. The binary replays scripts on
//! it and the engine tests drive it directly.

use crate::WORLD_TARGET;
use crate::confinement::{ContainmentEnforcer, InboundAction};
use crate::world::{BlockCoord, DisplayHandle, Location, Material, SubjectId, World};
use dashmap::{DashMap, DashSet};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::debug;
use uuid::Uuid;

/// A display spawned in the simulated world
#[derive(Debug, Clone, PartialEq)]
pub struct SimDisplay {
    pub anchor: Location,
    pub text: String,
    pub viewer: SubjectId,
}

pub struct SimWorld {
    positions: DashMap<SubjectId, Location>,
    loaded_regions: DashSet<(String, i32, i32)>,
    blocks: DashMap<BlockCoord, Material>,
    displays: DashMap<DisplayHandle, SimDisplay>,
    messages: DashMap<SubjectId, Vec<String>>,
    action_bars: DashMap<SubjectId, String>,
    forced_failures: AtomicU32,
    teleports: AtomicUsize,
    /// Chance that any teleport fails on its own
    flakiness: f64,
    teleport_hook: OnceLock<ContainmentEnforcer>,
    spawn: Location,
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl SimWorld {
    #[must_use]
    pub fn new() -> Self {
        Self {
            positions: DashMap::new(),
            loaded_regions: DashSet::new(),
            blocks: DashMap::new(),
            displays: DashMap::new(),
            messages: DashMap::new(),
            action_bars: DashMap::new(),
            forced_failures: AtomicU32::new(0),
            teleports: AtomicUsize::new(0),
            flakiness: 0.0,
            teleport_hook: OnceLock::new(),
            spawn: Location::new("world", 0.5, 80.0, 0.5),
        }
    }

    /// Make every teleport fail with probability `chance`
    #[must_use]
    pub fn with_flakiness(mut self, chance: f64) -> Self {
        self.flakiness = chance.clamp(0.0, 1.0);
        self
    }

    /// Route every teleport through the enforcer as an inbound action
    pub fn route_teleports_through(&self, enforcer: ContainmentEnforcer) {
        if self.teleport_hook.set(enforcer).is_err() {
            debug!(target: WORLD_TARGET, "Teleport hook already installed");
        }
    }

    pub fn connect(&self, subject: SubjectId, location: Location) {
        self.positions.insert(subject, location);
    }

    pub fn disconnect(&self, subject: SubjectId) {
        self.positions.remove(&subject);
    }

    pub fn position(&self, subject: SubjectId) -> Option<Location> {
        self.positions.get(&subject).map(|p| p.clone())
    }

    /// Move a connected subject without going through teleport
    pub fn set_position(&self, subject: SubjectId, location: Location) {
        if let Some(mut position) = self.positions.get_mut(&subject) {
            *position = location;
        }
    }

    /// Fail the next `count` teleports
    pub fn fail_next_teleports(&self, count: u32) {
        self.forced_failures.store(count, Ordering::SeqCst);
    }

    /// Successful teleports so far
    pub fn teleport_count(&self) -> usize {
        self.teleports.load(Ordering::SeqCst)
    }

    pub fn messages(&self, subject: SubjectId) -> Vec<String> {
        self.messages
            .get(&subject)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn last_action_bar(&self, subject: SubjectId) -> Option<String> {
        self.action_bars.get(&subject).map(|text| text.clone())
    }

    pub fn place_block(&self, coord: &BlockCoord, material: Material) {
        self.blocks.insert(coord.clone(), material);
    }

    pub fn clear_block(&self, coord: &BlockCoord) {
        self.blocks.remove(coord);
    }

    pub fn display_count(&self) -> usize {
        self.displays.len()
    }

    pub fn displays_for(&self, viewer: SubjectId) -> Vec<SimDisplay> {
        self.displays
            .iter()
            .filter(|entry| entry.viewer == viewer)
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn take_forced_failure(&self) -> bool {
        self.forced_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl World for SimWorld {
    fn is_online(&self, subject: SubjectId) -> bool {
        self.positions.contains_key(&subject)
    }

    fn load_region(&self, location: &Location) {
        self.loaded_regions.insert(location.block().region());
    }

    fn teleport(&self, subject: SubjectId, location: &Location) -> bool {
        if !self.is_online(subject) {
            debug!(target: WORLD_TARGET, subject = %subject, "Teleport of offline subject");
            return false;
        }
        let flaked = self.flakiness > 0.0 && rand::random::<f64>() < self.flakiness;
        if self.take_forced_failure() || flaked {
            debug!(target: WORLD_TARGET, subject = %subject, "Teleport failed");
            return false;
        }
        if !self.loaded_regions.contains(&location.block().region()) {
            debug!(
                target: WORLD_TARGET,
                subject = %subject,
                destination = %location,
                "Destination region not loaded"
            );
            return false;
        }
        if let Some(enforcer) = self.teleport_hook.get() {
            let action = InboundAction::Teleport {
                subject,
                to: location.clone(),
            };
            if !enforcer.dispatch(&action).is_allowed() {
                return false;
            }
        }

        self.positions.insert(subject, location.clone());
        self.teleports.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn block_at(&self, coord: &BlockCoord) -> Option<Material> {
        self.blocks.get(coord).map(|m| m.clone())
    }

    fn set_block(&self, coord: &BlockCoord, material: Option<&Material>) {
        match material {
            Some(material) => {
                self.blocks.insert(coord.clone(), material.clone());
            }
            None => {
                self.blocks.remove(coord);
            }
        }
    }

    fn spawn_display(&self, anchor: &Location, text: &str, viewer: SubjectId) -> DisplayHandle {
        let handle = DisplayHandle(Uuid::new_v4());
        self.displays.insert(
            handle,
            SimDisplay {
                anchor: anchor.clone(),
                text: text.to_string(),
                viewer,
            },
        );
        handle
    }

    fn remove_display(&self, handle: DisplayHandle) {
        self.displays.remove(&handle);
    }

    fn spawn_location(&self) -> Location {
        self.spawn.clone()
    }

    fn send_message(&self, subject: SubjectId, message: &str) {
        debug!(target: WORLD_TARGET, subject = %subject, message, "Message");
        self.messages
            .entry(subject)
            .or_default()
            .push(message.to_string());
    }

    fn send_action_bar(&self, subject: SubjectId, text: &str) {
        self.action_bars.insert(subject, text.to_string());
    }
}
