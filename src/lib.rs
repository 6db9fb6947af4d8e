pub mod config;
pub mod confinement;
pub mod logging;
pub mod script;
pub mod sim;
pub mod status;
pub mod world;

pub const CRATE_NAME: &str = "cellblock";
pub const ADMIN_TARGET: &str = "cellblock::admin";
pub const ERROR_TARGET: &str = "cellblock::error";
pub const WORLD_TARGET: &str = "cellblock::world";
pub const CONSOLE_TARGET: &str = "cellblock";

pub use config::ConfinementConfig;
pub use confinement::{
    ConfineRequest, ConfinementRecord, ConfinementService, InboundAction, Verdict,
};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
