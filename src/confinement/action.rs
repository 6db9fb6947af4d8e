//! Inbound actions and verdicts
//!
//! Every action a subject attempts while the engine is running arrives as an
//! [`InboundAction`] and leaves as a [`Verdict`].

use crate::world::{BlockCoord, Location, Material, SubjectId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An action attempted by a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InboundAction {
    Move {
        subject: SubjectId,
        from: Location,
        to: Location,
    },
    Teleport {
        subject: SubjectId,
        to: Location,
    },
    /// A command line, with or without the leading `/`
    Command {
        subject: SubjectId,
        line: String,
    },
    Chat {
        subject: SubjectId,
        message: String,
    },
    BlockBreak {
        subject: SubjectId,
        coord: BlockCoord,
        material: Material,
    },
    BlockPlace {
        subject: SubjectId,
        coord: BlockCoord,
        material: Material,
    },
    ItemDrop {
        subject: SubjectId,
    },
    ItemPickup {
        subject: SubjectId,
    },
    /// Right-click or use on a block
    Interact {
        subject: SubjectId,
        coord: BlockCoord,
        material: Option<Material>,
    },
    Join {
        subject: SubjectId,
    },
    Quit {
        subject: SubjectId,
    },
}

impl InboundAction {
    #[must_use]
    pub fn subject(&self) -> SubjectId {
        match self {
            Self::Move { subject, .. }
            | Self::Teleport { subject, .. }
            | Self::Command { subject, .. }
            | Self::Chat { subject, .. }
            | Self::BlockBreak { subject, .. }
            | Self::BlockPlace { subject, .. }
            | Self::ItemDrop { subject }
            | Self::ItemPickup { subject }
            | Self::Interact { subject, .. }
            | Self::Join { subject }
            | Self::Quit { subject } => *subject,
        }
    }

    /// Short name used in logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Move { .. } => "move",
            Self::Teleport { .. } => "teleport",
            Self::Command { .. } => "command",
            Self::Chat { .. } => "chat",
            Self::BlockBreak { .. } => "block_break",
            Self::BlockPlace { .. } => "block_place",
            Self::ItemDrop { .. } => "item_drop",
            Self::ItemPickup { .. } => "item_pickup",
            Self::Interact { .. } => "interact",
            Self::Join { .. } => "join",
            Self::Quit { .. } => "quit",
        }
    }
}

/// Why an action was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Moved past the escape radius
    Escape,
    UnexpectedTeleport,
    CommandBlocked(String),
    ChatBlocked,
    ItemDrop,
    ItemPickup,
    BlockPlace,
    Interact,
    /// Broke a block while serving a sentence without labor
    NoLaborGate,
    LaborDisabled,
    WrongBlock(Material),
    WrongLocation,
    /// Broke a block the subject placed themselves
    PlacementQuarantine,
}

impl DenyReason {
    /// Whether the subject should be told about the denial
    #[must_use]
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::ItemPickup)
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Escape => write!(f, "You cannot escape from jail!"),
            Self::UnexpectedTeleport => write!(f, "You cannot teleport while jailed."),
            Self::CommandBlocked(verb) => write!(f, "You cannot use /{verb} while jailed."),
            Self::ChatBlocked => write!(f, "You cannot chat while jailed."),
            Self::ItemDrop => write!(f, "You cannot drop items while jailed."),
            Self::ItemPickup => write!(f, "You cannot pick up items while jailed."),
            Self::BlockPlace => write!(f, "You cannot place blocks while jailed."),
            Self::Interact => write!(f, "You cannot interact with that while jailed."),
            Self::NoLaborGate => write!(f, "You cannot break blocks while jailed."),
            Self::LaborDisabled => write!(f, "Labor is currently disabled."),
            Self::WrongBlock(material) => {
                write!(f, "You can only break {} blocks.", material.name())
            }
            Self::WrongLocation => write!(f, "That is not a labor block of your cell."),
            Self::PlacementQuarantine => {
                write!(f, "Blocks you placed yourself do not count as labor.")
            }
        }
    }
}

/// Decision for an inbound action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// Allow the break but the host must not drop items
    AllowWithoutDrops,
    Deny(DenyReason),
}

impl Verdict {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Deny(_))
    }

    #[must_use]
    pub fn deny_reason(&self) -> Option<&DenyReason> {
        match self {
            Self::Deny(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Verb of a command line, lowercased and without the leading `/`
#[must_use]
pub fn command_verb(line: &str) -> String {
    line.trim()
        .trim_start_matches('/')
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}
