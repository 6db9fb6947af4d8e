//! Confinement engine
//!
//! Tracks confined subjects, keeps them inside their cell, counts their
//! labor and releases them once their sentence is served.

mod action;
mod cells;
mod display;
mod enforcer;
mod error;
mod labor;
mod mirror;
mod notify;
mod record;
mod registry;
mod relocate;
mod service;
mod store;
mod sweeper;
#[cfg(test)]
pub(crate) mod testing;

pub use action::{DenyReason, InboundAction, Verdict, command_verb};
pub use cells::CellDirectory;
pub use display::{VisibilitySubscriptionManager, render_text};
pub use enforcer::ContainmentEnforcer;
pub use error::{ConfinementError, ConfinementResult, StoreError, StoreResult};
pub use labor::{LaborOutcome, LaborProgressTracker};
pub use mirror::{PersistenceMirror, RetryPolicy};
pub use notify::{ChannelSink, LogSink, ModerationEvent, NotificationSink};
#[cfg(test)]
pub use notify::MockNotificationSink;
pub use record::{ConfineRequest, ConfinementRecord, release_condition};
pub use registry::ConfinementRegistry;
pub use relocate::{RelocationGuard, Relocator};
pub use service::ConfinementService;
pub use store::{DurableStore, MemoryStore, YamlStore};
#[cfg(test)]
pub use store::MockDurableStore;
pub use sweeper::{ExpirationSweeper, SweepRequest, SweeperHandle};
