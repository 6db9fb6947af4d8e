//! Engine configuration
//!
//! Loaded from one YAML file. Every field has a default, so an empty or
//! missing file yields a working (if cell-less) engine. Extra cells can be
//! dropped into `cells_dir` as one YAML file per cell.

use crate::confinement::{ConfinementError, ConfinementResult};
use crate::world::{BlockCoord, Location, Material};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Commands a confined subject may always run
pub const ALWAYS_ALLOWED_COMMANDS: [&str; 6] = ["jailstatus", "msg", "tell", "w", "reply", "r"];

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfinementConfig {
    /// How far a subject may stray from the cell anchor
    pub escape_radius: f64,
    pub allow_chat: bool,
    /// Allow block and entity interaction inside the cell
    pub allow_interactions: bool,
    /// Extra command verbs confined subjects may run
    pub allowed_commands: Vec<String>,
    /// Freeze the sentence clock while a subject is disconnected
    pub exclude_offline_time: bool,
    /// Where released subjects go; the world spawn when unset
    pub release_anchor: Option<Location>,
    pub cells: BTreeMap<String, Location>,
    /// Labor block coordinates per cell
    pub spawners: BTreeMap<String, Vec<BlockCoord>>,
    /// Directory of additional `*.yaml` cell files
    pub cells_dir: Option<PathBuf>,
    pub join_relocation_delay_ms: u64,
    pub sweep_interval_secs: u64,
    pub status_interval_ms: u64,
    pub relocation: RelocationConfig,
    pub labor: LaborConfig,
    pub display: DisplayConfig,
    pub persistence: PersistenceConfig,
}

impl Default for ConfinementConfig {
    fn default() -> Self {
        Self {
            escape_radius: 10.0,
            allow_chat: false,
            allow_interactions: false,
            allowed_commands: Vec::new(),
            exclude_offline_time: false,
            release_anchor: None,
            cells: BTreeMap::new(),
            spawners: BTreeMap::new(),
            cells_dir: None,
            join_relocation_delay_ms: 1000,
            sweep_interval_secs: 5,
            status_interval_ms: 1000,
            relocation: RelocationConfig::default(),
            labor: LaborConfig::default(),
            display: DisplayConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

/// Bounded-retry relocation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocationConfig {
    pub max_attempts: u32,
    /// Wait after requesting the destination region before teleporting
    pub settle_delay_ms: u64,
    /// Retry n waits n times this long
    pub backoff_unit_ms: u64,
    /// Lifetime of an armed expected-relocation flag
    pub guard_ttl_ms: u64,
    /// Delay after a teleport before the flag is force-cleared
    pub guard_clear_ms: u64,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            settle_delay_ms: 250,
            backoff_unit_ms: 1000,
            guard_ttl_ms: 1000,
            guard_clear_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaborConfig {
    pub enabled: bool,
    pub block_type: Material,
    pub respawn_delay_ms: u64,
    /// How long a coordinate where a subject placed a block stays unusable
    pub placement_quarantine_secs: u64,
    /// Period of the restock and quarantine pruning pass
    pub maintenance_interval_secs: u64,
}

impl Default for LaborConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_type: Material::canonical("COBBLESTONE"),
            respawn_delay_ms: 3000,
            placement_quarantine_secs: 30,
            maintenance_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub enabled: bool,
    /// Height above the labor block where the display floats
    pub height_offset: f64,
    /// Template lines; `{completed}`, `{required}` and `{percentage}` are filled in
    pub lines: Vec<String>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            height_offset: 1.5,
            lines: vec![
                "&b&lLABOR BLOCK &7(Break it!)".to_string(),
                "&fProgress: &e{completed}&7/&e{required}".to_string(),
            ],
        }
    }
}

/// Durable write retry tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 100,
        }
    }
}

/// One cell described in its own file under `cells_dir`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellFile {
    /// Cell name; the file stem when absent
    #[serde(default)]
    pub name: Option<String>,
    pub anchor: Location,
    #[serde(default)]
    pub spawners: Vec<BlockCoord>,
}

impl ConfinementConfig {
    /// Load configuration from a YAML file, using defaults when it is missing
    ///
    /// # Errors
    /// Fails when the file cannot be read or parsed, or fails validation.
    pub async fn load(path: impl AsRef<Path>) -> ConfinementResult<Self> {
        let path = path.as_ref();
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => Self::default(),
            Ok(content) => serde_yaml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {} not found, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(dir) = config.cells_dir.clone() {
            config.merge_cells_dir(&dir).await?;
        }
        config.validate()?;

        info!(
            cells = config.cells.len(),
            spawners = config.spawners.values().map(Vec::len).sum::<usize>(),
            "Loaded confinement configuration"
        );
        Ok(config)
    }

    /// Save configuration as YAML, creating parent directories
    ///
    /// # Errors
    /// Fails when the file cannot be written.
    pub async fn save(&self, path: impl AsRef<Path>) -> ConfinementResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_yaml::to_string(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Add cells from every `*.yaml` file in `dir`; inline cells win on conflict
    async fn merge_cells_dir(&mut self, dir: &Path) -> ConfinementResult<()> {
        let pattern = dir.join("*.yaml");
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern)
            .map_err(|e| ConfinementError::InvalidConfig(format!("cells_dir pattern: {e}")))?;

        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping unreadable cell file: {e}");
                    continue;
                }
            };
            let content = tokio::fs::read_to_string(&path).await?;
            let cell: CellFile = serde_yaml::from_str(&content)?;
            let name = cell.name.clone().unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            if self.cells.contains_key(&name) {
                warn!(
                    cell = %name,
                    "Cell defined inline and in {}, keeping inline",
                    path.display()
                );
                continue;
            }
            self.cells.insert(name.clone(), cell.anchor);
            if !cell.spawners.is_empty() {
                self.spawners.entry(name).or_default().extend(cell.spawners);
            }
        }
        Ok(())
    }

    /// Check value ranges and cross references
    ///
    /// # Errors
    /// Returns [`ConfinementError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> ConfinementResult<()> {
        if !self.escape_radius.is_finite() || self.escape_radius <= 0.0 {
            return Err(ConfinementError::InvalidConfig(format!(
                "escape_radius must be positive, got {}",
                self.escape_radius
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfinementError::InvalidConfig(
                "sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.relocation.max_attempts == 0 {
            return Err(ConfinementError::InvalidConfig(
                "relocation.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.persistence.max_attempts == 0 {
            return Err(ConfinementError::InvalidConfig(
                "persistence.max_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(cell) = self.spawners.keys().find(|c| !self.cells.contains_key(*c)) {
            return Err(ConfinementError::InvalidConfig(format!(
                "spawners defined for unknown cell {cell}"
            )));
        }
        Ok(())
    }

    /// Whether `verb` (with or without a leading `/`) may be run while confined
    #[must_use]
    pub fn is_command_allowed(&self, verb: &str) -> bool {
        let verb = verb.trim_start_matches('/');
        ALWAYS_ALLOWED_COMMANDS
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(verb))
            || self
                .allowed_commands
                .iter()
                .any(|allowed| allowed.trim_start_matches('/').eq_ignore_ascii_case(verb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfinementConfig::default();
        assert!((config.escape_radius - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.labor.block_type.name(), "COBBLESTONE");
        assert_eq!(config.labor.respawn_delay_ms, 3000);
        assert_eq!(config.relocation.max_attempts, 5);
        assert_eq!(config.persistence.base_backoff_ms, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r"
escape_radius: 6.5
labor:
  block_type: stone
cells:
  north:
    world: world
    x: 10.5
    y: 64.0
    z: -3.5
spawners:
  north:
    - { world: world, x: 12, y: 64, z: -3 }
";
        let config: ConfinementConfig = serde_yaml::from_str(yaml).unwrap();
        assert!((config.escape_radius - 6.5).abs() < f64::EPSILON);
        assert_eq!(config.labor.block_type.name(), "STONE");
        assert_eq!(config.labor.respawn_delay_ms, 3000);
        assert_eq!(config.spawners["north"].len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_material_rejected() {
        let yaml = "labor:\n  block_type: \"not a block\"\n";
        assert!(serde_yaml::from_str::<ConfinementConfig>(yaml).is_err());
    }

    #[test]
    fn test_validate_rejects_orphan_spawners() {
        let mut config = ConfinementConfig::default();
        config
            .spawners
            .insert("ghost".to_string(), vec![BlockCoord::new("world", 0, 64, 0)]);
        assert!(matches!(
            config.validate(),
            Err(ConfinementError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_command_allow_list() {
        let config = ConfinementConfig {
            allowed_commands: vec!["/rules".to_string()],
            ..ConfinementConfig::default()
        };
        assert!(config.is_command_allowed("/msg"));
        assert!(config.is_command_allowed("JAILSTATUS"));
        assert!(config.is_command_allowed("rules"));
        assert!(!config.is_command_allowed("/spawn"));
        assert!(!config.is_command_allowed("/msgall"));
    }

    #[tokio::test]
    async fn test_load_missing_file_and_cells_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfinementConfig::load(dir.path().join("absent.yaml"))
            .await
            .unwrap();
        assert!(config.cells.is_empty());

        let cells_dir = dir.path().join("cells");
        tokio::fs::create_dir_all(&cells_dir).await.unwrap();
        tokio::fs::write(
            cells_dir.join("south.yaml"),
            "anchor: { world: world, x: 0.5, y: 70.0, z: 0.5 }\n\
             spawners:\n  - { world: world, x: 2, y: 70, z: 0 }\n",
        )
        .await
        .unwrap();

        let path = dir.path().join("cellblock.yaml");
        let written = ConfinementConfig {
            cells_dir: Some(cells_dir),
            ..ConfinementConfig::default()
        };
        written.save(&path).await.unwrap();

        let loaded = ConfinementConfig::load(&path).await.unwrap();
        assert!(loaded.cells.contains_key("south"));
        assert_eq!(loaded.spawners["south"].len(), 1);
    }
}
