//! Per-viewer labor displays
//!
//! Each confined, online subject with a labor sentence sees a floating text
//! above every labor block of their cell. Nobody else sees it. A display
//! exists only while its viewer is confined and connected and the block under
//! it is present; all calls run on the world context.

use crate::config::DisplayConfig;
use crate::confinement::{CellDirectory, ConfinementRecord, ConfinementRegistry};
use crate::world::{BlockCoord, DisplayHandle, SubjectId, World};
use crate::WORLD_TARGET;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Fill the template lines for a record's labor progress
#[must_use]
pub fn render_text(lines: &[String], record: &ConfinementRecord) -> String {
    lines
        .iter()
        .map(|line| {
            line.replace("{completed}", &record.labor_progress.to_string())
                .replace("{required}", &record.labor_required.to_string())
                .replace("{percentage}", &record.labor_percentage().to_string())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tracks which display each viewer has at each labor coordinate
#[derive(Clone)]
pub struct VisibilitySubscriptionManager {
    world: Arc<dyn World>,
    registry: ConfinementRegistry,
    cells: CellDirectory,
    settings: DisplayConfig,
    by_coord: Arc<DashMap<BlockCoord, HashMap<SubjectId, DisplayHandle>>>,
    by_viewer: Arc<DashMap<SubjectId, HashSet<BlockCoord>>>,
}

impl VisibilitySubscriptionManager {
    pub fn new(
        world: Arc<dyn World>,
        registry: ConfinementRegistry,
        cells: CellDirectory,
        settings: DisplayConfig,
    ) -> Self {
        Self {
            world,
            registry,
            cells,
            settings,
            by_coord: Arc::new(DashMap::new()),
            by_viewer: Arc::new(DashMap::new()),
        }
    }

    /// Record that should be rendered at `coord` for `viewer`, if any
    fn eligible(&self, viewer: SubjectId, coord: &BlockCoord) -> Option<ConfinementRecord> {
        if !self.settings.enabled || !self.world.is_online(viewer) {
            return None;
        }
        let record = self.registry.get(viewer)?;
        if record.labor_required == 0 || !self.cells.is_spawner_of(&record.cell, coord) {
            return None;
        }
        let present = self.world.block_at(coord).as_ref() == Some(self.cells.labor_material());
        present.then_some(record)
    }

    /// Create or replace the viewer's display at `coord`
    ///
    /// Returns false, leaving any existing display alone, when the viewer
    /// is not eligible.
    pub fn show_for(&self, viewer: SubjectId, coord: &BlockCoord) -> bool {
        let Some(record) = self.eligible(viewer, coord) else {
            return false;
        };
        self.detach(viewer, coord);

        let text = render_text(&self.settings.lines, &record);
        let anchor = coord.display_anchor(self.settings.height_offset);
        let handle = self.world.spawn_display(&anchor, &text, viewer);

        self.by_coord
            .entry(coord.clone())
            .or_default()
            .insert(viewer, handle);
        self.by_viewer
            .entry(viewer)
            .or_default()
            .insert(coord.clone());
        debug!(target: WORLD_TARGET, viewer = %viewer, coord = %coord, "Display shown");
        true
    }

    /// Re-render the viewer's display at `coord`, or tear it down if the
    /// viewer is no longer eligible
    pub fn refresh_for(&self, viewer: SubjectId, coord: &BlockCoord) -> bool {
        if self.show_for(viewer, coord) {
            return true;
        }
        if self.detach(viewer, coord) {
            debug!(target: WORLD_TARGET, viewer = %viewer, coord = %coord, "Display torn down");
        }
        false
    }

    /// Show the viewer a display at every spawner of `cell`
    pub fn show_all_for(&self, viewer: SubjectId, cell: &str) -> usize {
        self.cells
            .spawners(cell)
            .iter()
            .filter(|coord| self.show_for(viewer, coord))
            .count()
    }

    /// Refresh every display the viewer has or should have
    pub fn refresh_all_for(&self, viewer: SubjectId) {
        let mut coords: HashSet<BlockCoord> = self
            .by_viewer
            .get(&viewer)
            .map(|set| set.clone())
            .unwrap_or_default();
        if let Some(record) = self.registry.get(viewer) {
            coords.extend(self.cells.spawners(&record.cell));
        }
        for coord in coords {
            self.refresh_for(viewer, &coord);
        }
    }

    /// Remove every display of a viewer
    pub fn remove_all_for(&self, viewer: SubjectId) -> usize {
        let Some((_, coords)) = self.by_viewer.remove(&viewer) else {
            return 0;
        };
        let mut removed = 0;
        for coord in coords {
            let handle = self
                .by_coord
                .get_mut(&coord)
                .and_then(|mut viewers| viewers.remove(&viewer));
            self.by_coord.remove_if(&coord, |_, viewers| viewers.is_empty());
            if let Some(handle) = handle {
                self.world.remove_display(handle);
                removed += 1;
            }
        }
        debug!(target: WORLD_TARGET, viewer = %viewer, removed, "Removed all displays of viewer");
        removed
    }

    /// Remove every viewer's display at `coord`
    pub fn remove_at(&self, coord: &BlockCoord) -> usize {
        let Some((_, viewers)) = self.by_coord.remove(coord) else {
            return 0;
        };
        for (viewer, handle) in &viewers {
            self.world.remove_display(*handle);
            if let Some(mut coords) = self.by_viewer.get_mut(viewer) {
                coords.remove(coord);
            }
            self.by_viewer.remove_if(viewer, |_, coords| coords.is_empty());
        }
        viewers.len()
    }

    /// Remove every display; used at shutdown
    pub fn remove_all(&self) -> usize {
        let coords: Vec<BlockCoord> = self.by_coord.iter().map(|e| e.key().clone()).collect();
        coords.iter().map(|coord| self.remove_at(coord)).sum()
    }

    pub fn count_for(&self, viewer: SubjectId) -> usize {
        self.by_viewer.get(&viewer).map_or(0, |coords| coords.len())
    }

    pub fn total_count(&self) -> usize {
        self.by_coord.iter().map(|e| e.value().len()).sum()
    }

    /// Drop the viewer's display at `coord`; true if one existed
    fn detach(&self, viewer: SubjectId, coord: &BlockCoord) -> bool {
        let handle = self
            .by_coord
            .get_mut(coord)
            .and_then(|mut viewers| viewers.remove(&viewer));
        let Some(handle) = handle else {
            return false;
        };
        self.by_coord.remove_if(coord, |_, viewers| viewers.is_empty());
        if let Some(mut coords) = self.by_viewer.get_mut(&viewer) {
            coords.remove(coord);
        }
        self.by_viewer.remove_if(&viewer, |_, coords| coords.is_empty());
        self.world.remove_display(handle);
        true
    }
}
