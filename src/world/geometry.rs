//! Positions, block coordinates and block materials
//!
//! These are the value types the engine exchanges with the host world. They
//! carry no behavior beyond distance math and validation.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique id of a moderated player account
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From,
)]
#[serde(transparent)]
pub struct SubjectId(pub Uuid);

impl SubjectId {
    /// Create a random subject id
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// A precise position inside a named world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub yaw: f32,
    #[serde(default)]
    pub pitch: f32,
}

impl Location {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
            yaw: 0.0,
            pitch: 0.0,
        }
    }

    /// Euclidean distance, infinite when the worlds differ
    #[must_use]
    pub fn distance(&self, other: &Location) -> f64 {
        if self.world != other.world {
            return f64::INFINITY;
        }
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// The block this position falls in
    #[must_use]
    pub fn block(&self) -> BlockCoord {
        BlockCoord {
            world: self.world.clone(),
            x: self.x.floor() as i32,
            y: self.y.floor() as i32,
            z: self.z.floor() as i32,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({:.1}, {:.1}, {:.1})",
            self.world, self.x, self.y, self.z
        )
    }
}

/// Integer block coordinate inside a named world
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{world}[{x}, {y}, {z}]")]
pub struct BlockCoord {
    pub world: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockCoord {
    pub fn new(world: impl Into<String>, x: i32, y: i32, z: i32) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }

    /// Center of the block lifted by `height`, where status displays float
    #[must_use]
    pub fn display_anchor(&self, height: f64) -> Location {
        Location::new(
            self.world.clone(),
            f64::from(self.x) + 0.5,
            f64::from(self.y) + height,
            f64::from(self.z) + 0.5,
        )
    }

    /// Region (16x16 column) key the host loads terrain by
    #[must_use]
    pub fn region(&self) -> (String, i32, i32) {
        (self.world.clone(), self.x >> 4, self.z >> 4)
    }
}

/// Upper-case block type name such as `COBBLESTONE`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
pub struct Material(String);

impl Material {
    /// Parse a material name, accepting any case
    ///
    /// # Errors
    /// Returns the rejected name if it is empty or contains characters other
    /// than ASCII letters, digits and underscores.
    pub fn parse(name: &str) -> Result<Self, String> {
        let normalized = name.trim().to_ascii_uppercase();
        if normalized.is_empty()
            || !normalized
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(name.to_string());
        }
        Ok(Self(normalized))
    }

    /// Material from a name already in canonical form
    pub(crate) fn canonical(name: &'static str) -> Self {
        debug_assert!(Self::parse(name).is_ok_and(|m| m.0 == name));
        Self(name.to_string())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Material {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).map_err(|name| format!("invalid material name: {name}"))
    }
}

impl From<Material> for String {
    fn from(material: Material) -> Self {
        material.0
    }
}
