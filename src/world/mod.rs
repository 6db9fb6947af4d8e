//! Host world abstraction
//!
//! The engine never talks to a game server directly. It calls a [`World`]
//! implementation, and only from the world context (see [`WorldScheduler`]).

mod geometry;
mod scheduler;

pub use geometry::{BlockCoord, Location, Material, SubjectId};
pub use scheduler::{WorldLoop, WorldScheduler, WorldTask};

use derive_more::{Display, From};
use uuid::Uuid;

/// Handle of an ephemeral display object spawned in the world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, From)]
pub struct DisplayHandle(pub Uuid);

/// Operations the engine needs from the host game server
///
/// All methods must be called from the world context.
pub trait World: Send + Sync {
    /// Whether the subject currently has a live session
    fn is_online(&self, subject: SubjectId) -> bool;

    /// Ask the host to bring the terrain around `location` into memory
    fn load_region(&self, location: &Location);

    /// Move a subject, returning false if the host refused or failed
    fn teleport(&self, subject: SubjectId, location: &Location) -> bool;

    /// Material at a coordinate, `None` for air
    fn block_at(&self, coord: &BlockCoord) -> Option<Material>;

    /// Place a block, or clear it with `None`
    fn set_block(&self, coord: &BlockCoord, material: Option<&Material>);

    /// Spawn a text display visible to `viewer` only
    fn spawn_display(&self, anchor: &Location, text: &str, viewer: SubjectId) -> DisplayHandle;

    fn remove_display(&self, handle: DisplayHandle);

    /// Default spawn point used when no release anchor is configured
    fn spawn_location(&self) -> Location;

    fn send_message(&self, subject: SubjectId, message: &str);

    fn send_action_bar(&self, subject: SubjectId, text: &str);
}
