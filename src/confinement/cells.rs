//! Cell directory
//!
//! Named cell anchors and the labor spawner coordinates of each cell. Admin
//! edits go straight into the live maps and can be written back to the
//! configuration file with [`CellDirectory::save`].

use crate::ADMIN_TARGET;
use crate::config::ConfinementConfig;
use crate::confinement::{ConfinementError, ConfinementResult};
use crate::world::{BlockCoord, Location, Material};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Lookup of cells, spawners and release anchor
#[derive(Clone)]
pub struct CellDirectory {
    cells: Arc<DashMap<String, Location>>,
    spawners: Arc<DashMap<String, Vec<BlockCoord>>>,
    release_anchor: Arc<RwLock<Option<Location>>>,
    labor_material: Material,
    escape_radius: f64,
}

impl CellDirectory {
    /// Build the directory from loaded configuration
    pub fn from_config(config: &ConfinementConfig) -> Self {
        let cells = DashMap::new();
        for (name, anchor) in &config.cells {
            cells.insert(name.clone(), anchor.clone());
        }
        let spawners = DashMap::new();
        for (name, coords) in &config.spawners {
            let mut coords = coords.clone();
            coords.sort();
            coords.dedup();
            spawners.insert(name.clone(), coords);
        }
        Self {
            cells: Arc::new(cells),
            spawners: Arc::new(spawners),
            release_anchor: Arc::new(RwLock::new(config.release_anchor.clone())),
            labor_material: config.labor.block_type.clone(),
            escape_radius: config.escape_radius,
        }
    }

    pub fn cell_anchor(&self, cell: &str) -> Option<Location> {
        self.cells.get(cell).map(|c| c.clone())
    }

    /// Spawner coordinates of a cell, empty when it has none
    pub fn spawners(&self, cell: &str) -> Vec<BlockCoord> {
        self.spawners
            .get(cell)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn labor_material(&self) -> &Material {
        &self.labor_material
    }

    pub fn escape_radius(&self) -> f64 {
        self.escape_radius
    }

    /// Sorted cell names
    pub fn cell_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cells.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    /// Create or move a cell anchor
    pub fn set_cell(&self, cell: &str, anchor: Location) {
        info!(
            target: ADMIN_TARGET,
            cell = %cell,
            anchor = %anchor,
            event = "set_cell",
            "Cell anchor set"
        );
        self.cells.insert(cell.to_string(), anchor);
    }

    /// Delete a cell and its spawners
    ///
    /// # Errors
    /// Returns [`ConfinementError::CellNotFound`] if no such cell exists.
    pub fn remove_cell(&self, cell: &str) -> ConfinementResult<Location> {
        let (_, anchor) = self
            .cells
            .remove(cell)
            .ok_or_else(|| ConfinementError::CellNotFound(cell.to_string()))?;
        self.spawners.remove(cell);
        info!(target: ADMIN_TARGET, cell = %cell, event = "remove_cell", "Cell removed");
        Ok(anchor)
    }

    /// Register a labor spawner; returns false if it already existed
    ///
    /// # Errors
    /// Returns [`ConfinementError::CellNotFound`] if no such cell exists.
    pub fn add_spawner(&self, cell: &str, coord: BlockCoord) -> ConfinementResult<bool> {
        if !self.cells.contains_key(cell) {
            return Err(ConfinementError::CellNotFound(cell.to_string()));
        }
        let mut coords = self.spawners.entry(cell.to_string()).or_default();
        if coords.contains(&coord) {
            return Ok(false);
        }
        info!(
            target: ADMIN_TARGET,
            cell = %cell,
            coord = %coord,
            event = "add_spawner",
            "Labor spawner added"
        );
        coords.push(coord);
        coords.sort();
        Ok(true)
    }

    /// Unregister a labor spawner; returns false if it was not registered
    pub fn remove_spawner(&self, cell: &str, coord: &BlockCoord) -> bool {
        let Some(mut coords) = self.spawners.get_mut(cell) else {
            return false;
        };
        let before = coords.len();
        coords.retain(|c| c != coord);
        let removed = coords.len() != before;
        if removed {
            info!(
                target: ADMIN_TARGET,
                cell = %cell,
                coord = %coord,
                event = "remove_spawner",
                "Labor spawner removed"
            );
        }
        removed
    }

    pub fn is_spawner_of(&self, cell: &str, coord: &BlockCoord) -> bool {
        self.spawners
            .get(cell)
            .is_some_and(|coords| coords.contains(coord))
    }

    /// Cell owning a spawner coordinate, if any
    pub fn spawner_cell(&self, coord: &BlockCoord) -> Option<String> {
        self.spawners
            .iter()
            .find(|entry| entry.value().contains(coord))
            .map(|entry| entry.key().clone())
    }

    pub fn is_any_spawner(&self, coord: &BlockCoord) -> bool {
        self.spawner_cell(coord).is_some()
    }

    /// Every spawner coordinate of every cell
    pub fn all_spawners(&self) -> Vec<BlockCoord> {
        self.spawners
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    pub fn release_anchor(&self) -> Option<Location> {
        self.release_anchor
            .read()
            .map(|anchor| anchor.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn set_release_anchor(&self, anchor: Option<Location>) {
        info!(
            target: ADMIN_TARGET,
            anchor = ?anchor,
            event = "set_release_anchor",
            "Release anchor set"
        );
        match self.release_anchor.write() {
            Ok(mut guard) => *guard = anchor,
            Err(poisoned) => *poisoned.into_inner() = anchor,
        }
    }

    /// Copy the live cells, spawners and release anchor into `config`
    pub fn write_into(&self, config: &mut ConfinementConfig) {
        config.cells = self
            .cells
            .iter()
            .map(|c| (c.key().clone(), c.value().clone()))
            .collect::<BTreeMap<_, _>>();
        config.spawners = self
            .spawners
            .iter()
            .filter(|s| !s.value().is_empty())
            .map(|s| (s.key().clone(), s.value().clone()))
            .collect::<BTreeMap<_, _>>();
        config.release_anchor = self.release_anchor();
    }

    /// Persist admin edits into the configuration file at `path`
    ///
    /// # Errors
    /// Fails when the file cannot be written.
    pub async fn save(
        &self,
        base: &ConfinementConfig,
        path: impl AsRef<Path>,
    ) -> ConfinementResult<()> {
        let mut config = base.clone();
        // cells from cells_dir are now inline
        config.cells_dir = None;
        self.write_into(&mut config);
        config.save(path).await
    }
}
