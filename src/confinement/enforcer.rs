//! Containment enforcement
//!
//! A subject is CONFINED while the registry holds a record for it and FREE
//! otherwise. Free subjects are never restricted; every inbound action of a
//! confined subject goes through [`ContainmentEnforcer::dispatch`].

use crate::confinement::{
    ConfinementService, DenyReason, InboundAction, LaborProgressTracker, Verdict, command_verb,
};
use crate::world::{BlockCoord, Location, Material, SubjectId};
use crate::WORLD_TARGET;
use tracing::debug;

/// Accepts or denies inbound actions of confined subjects
#[derive(Clone)]
pub struct ContainmentEnforcer {
    service: ConfinementService,
    labor: LaborProgressTracker,
}

impl ContainmentEnforcer {
    pub fn new(service: ConfinementService, labor: LaborProgressTracker) -> Self {
        Self { service, labor }
    }

    pub fn service(&self) -> &ConfinementService {
        &self.service
    }

    pub fn labor(&self) -> &LaborProgressTracker {
        &self.labor
    }

    /// Decide an inbound action; world context only
    ///
    /// Denials other than silent ones are reported to the subject.
    pub fn dispatch(&self, action: &InboundAction) -> Verdict {
        let subject = action.subject();
        let verdict = match action {
            InboundAction::Join { .. } => {
                self.service.handle_join(subject);
                Verdict::Allow
            }
            InboundAction::Quit { .. } => {
                self.service.handle_quit(subject);
                Verdict::Allow
            }
            _ if !self.service.registry.contains(subject) => Verdict::Allow,
            InboundAction::Move { from, to, .. } => self.on_move(subject, from, to),
            InboundAction::Teleport { .. } => self.on_teleport(subject),
            InboundAction::Command { line, .. } => self.on_command(line),
            InboundAction::Chat { .. } => {
                if self.service.config().allow_chat {
                    Verdict::Allow
                } else {
                    Verdict::Deny(DenyReason::ChatBlocked)
                }
            }
            InboundAction::ItemDrop { .. } => Verdict::Deny(DenyReason::ItemDrop),
            InboundAction::ItemPickup { .. } => Verdict::Deny(DenyReason::ItemPickup),
            InboundAction::BlockPlace { coord, .. } => {
                self.labor.quarantine(coord);
                Verdict::Deny(DenyReason::BlockPlace)
            }
            InboundAction::BlockBreak {
                coord, material, ..
            } => self
                .labor
                .on_block_break(subject, coord, material)
                .verdict(self.service.cells.labor_material()),
            InboundAction::Interact {
                coord, material, ..
            } => self.on_interact(coord, material.as_ref()),
        };

        if let Verdict::Deny(reason) = &verdict {
            debug!(
                target: WORLD_TARGET,
                subject = %subject,
                action = action.kind(),
                reason = ?reason,
                "Denied action of confined subject"
            );
            if !reason.is_silent() {
                self.service
                    .world()
                    .send_message(subject, &reason.to_string());
            }
        }
        verdict
    }

    fn on_move(&self, subject: SubjectId, from: &Location, to: &Location) -> Verdict {
        if from.block() == to.block() {
            return Verdict::Allow;
        }
        let Some(record) = self.service.registry.get(subject) else {
            return Verdict::Allow;
        };
        let Some(anchor) = self.service.cells.cell_anchor(&record.cell) else {
            return Verdict::Allow;
        };
        if to.distance(&anchor) <= self.service.cells.escape_radius() {
            return Verdict::Allow;
        }
        self.service.relocator.relocate_if_idle(subject, anchor);
        Verdict::Deny(DenyReason::Escape)
    }

    fn on_teleport(&self, subject: SubjectId) -> Verdict {
        if self.service.relocator.guard().consume(subject) {
            Verdict::Allow
        } else {
            Verdict::Deny(DenyReason::UnexpectedTeleport)
        }
    }

    fn on_command(&self, line: &str) -> Verdict {
        let verb = command_verb(line);
        if self.service.config().is_command_allowed(&verb) {
            Verdict::Allow
        } else {
            Verdict::Deny(DenyReason::CommandBlocked(verb))
        }
    }

    fn on_interact(&self, coord: &BlockCoord, material: Option<&Material>) -> Verdict {
        if self.service.config().allow_interactions {
            return Verdict::Allow;
        }
        let labor_block = material == Some(self.service.cells.labor_material())
            && self.service.cells.is_any_spawner(coord);
        if labor_block {
            Verdict::Allow
        } else {
            Verdict::Deny(DenyReason::Interact)
        }
    }
}
