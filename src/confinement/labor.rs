//! Labor progress tracking
//!
//! Block-break events come from the host unverified. The tracker only counts
//! a break when the subject is serving a labor sentence, the block is the
//! labor material, it sits on a spawner of the subject's own cell and the
//! subject did not just place something there. Accepted blocks respawn after
//! a delay.

use crate::confinement::{ConfinementService, DenyReason, ModerationEvent, Verdict};
use crate::world::{BlockCoord, Material, SubjectId};
use crate::WORLD_TARGET;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Result of validating a block break
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaborOutcome {
    Accepted {
        progress: u32,
        required: u32,
        /// True only for the break that first completed the requirement
        completed: bool,
    },
    NotConfined,
    NoLaborGate,
    LaborDisabled,
    WrongBlock,
    WrongLocation,
    PlacementQuarantine,
}

impl LaborOutcome {
    /// Host verdict for the break that produced this outcome
    #[must_use]
    pub fn verdict(&self, labor_material: &Material) -> Verdict {
        match self {
            Self::Accepted { .. } => Verdict::AllowWithoutDrops,
            Self::NotConfined => Verdict::Allow,
            Self::NoLaborGate => Verdict::Deny(DenyReason::NoLaborGate),
            Self::LaborDisabled => Verdict::Deny(DenyReason::LaborDisabled),
            Self::WrongBlock => Verdict::Deny(DenyReason::WrongBlock(labor_material.clone())),
            Self::WrongLocation => Verdict::Deny(DenyReason::WrongLocation),
            Self::PlacementQuarantine => Verdict::Deny(DenyReason::PlacementQuarantine),
        }
    }
}

/// Validates labor breaks and keeps spawners stocked
#[derive(Clone)]
pub struct LaborProgressTracker {
    service: ConfinementService,
    /// Coordinates where a confined subject tried to place a block, with expiry
    quarantine: Arc<DashMap<BlockCoord, Instant>>,
}

impl LaborProgressTracker {
    pub fn new(service: ConfinementService) -> Self {
        Self {
            service,
            quarantine: Arc::new(DashMap::new()),
        }
    }

    fn quarantine_window(&self) -> Duration {
        Duration::from_secs(self.service.config().labor.placement_quarantine_secs)
    }

    /// Exclude `coord` from labor for the quarantine window
    pub fn quarantine(&self, coord: &BlockCoord) {
        self.quarantine
            .insert(coord.clone(), Instant::now() + self.quarantine_window());
    }

    pub fn is_quarantined(&self, coord: &BlockCoord) -> bool {
        self.quarantine
            .get(coord)
            .is_some_and(|expiry| Instant::now() < *expiry)
    }

    /// Forget expired quarantine entries
    pub fn prune_quarantine(&self) -> usize {
        let now = Instant::now();
        let before = self.quarantine.len();
        self.quarantine.retain(|_, expiry| now < *expiry);
        before - self.quarantine.len()
    }

    /// Validate and count a block break; world context only
    pub fn on_block_break(
        &self,
        subject: SubjectId,
        coord: &BlockCoord,
        material: &Material,
    ) -> LaborOutcome {
        let outcome = self.validate(subject, coord, material);
        if outcome != LaborOutcome::NotConfined {
            debug!(
                target: WORLD_TARGET,
                subject = %subject,
                coord = %coord,
                outcome = ?outcome,
                "Labor break checked"
            );
        }
        match outcome {
            LaborOutcome::Accepted { .. } => self.accept(subject, coord),
            rejected => rejected,
        }
    }

    /// Checks in order; `Accepted` here means only "passed validation"
    fn validate(
        &self,
        subject: SubjectId,
        coord: &BlockCoord,
        material: &Material,
    ) -> LaborOutcome {
        let Some(record) = self.service.registry.get(subject) else {
            return LaborOutcome::NotConfined;
        };
        if record.labor_required == 0 {
            return LaborOutcome::NoLaborGate;
        }
        if !self.service.config().labor.enabled {
            return LaborOutcome::LaborDisabled;
        }
        if material != self.service.cells.labor_material() {
            return LaborOutcome::WrongBlock;
        }
        if !self.service.cells.is_spawner_of(&record.cell, coord) {
            return LaborOutcome::WrongLocation;
        }
        if self.is_quarantined(coord) {
            return LaborOutcome::PlacementQuarantine;
        }
        LaborOutcome::Accepted {
            progress: record.labor_progress,
            required: record.labor_required,
            completed: false,
        }
    }

    fn accept(&self, subject: SubjectId, coord: &BlockCoord) -> LaborOutcome {
        let world = self.service.world();
        world.set_block(coord, None);
        self.schedule_respawn(coord.clone());

        let mut completed = false;
        let Some(record) = self.service.registry.modify(subject, |r| {
            let was_complete = r.is_labor_complete();
            let moved = r.add_labor();
            completed = !was_complete && r.is_labor_complete();
            moved
        }) else {
            return LaborOutcome::NotConfined;
        };

        self.service.displays.refresh_all_for(subject);
        world.send_message(
            subject,
            &format!(
                "Labor progress: {}/{}",
                record.labor_progress, record.labor_required
            ),
        );

        if completed {
            info!(
                target: WORLD_TARGET,
                subject = %subject,
                required = record.labor_required,
                "Labor requirement completed"
            );
            world.send_message(
                subject,
                "Labor complete! You will be released when your time is served.",
            );
            self.service.notifier().emit(ModerationEvent::LaborComplete {
                subject,
                display_name: record.display_name.clone(),
                labor_required: record.labor_required,
            });
        }

        if record.can_be_released(Utc::now()) {
            self.service.release(subject, None);
        }

        LaborOutcome::Accepted {
            progress: record.labor_progress,
            required: record.labor_required,
            completed,
        }
    }

    fn schedule_respawn(&self, coord: BlockCoord) {
        let this = self.clone();
        self.service.scheduler().run_later(
            Duration::from_millis(self.service.config().labor.respawn_delay_ms),
            move || {
                this.restore_block(&coord);
            },
        );
    }

    /// Put the labor block back if the spawner is empty, then show it to the
    /// cell's confined subjects; returns whether a block was placed
    fn restore_block(&self, coord: &BlockCoord) -> bool {
        let world = self.service.world();
        if world.block_at(coord).is_some() {
            return false;
        }
        world.set_block(coord, Some(self.service.cells.labor_material()));

        if let Some(cell) = self.service.cells.spawner_cell(coord) {
            for record in self.service.registry.all() {
                if record.cell == cell {
                    self.service.displays.show_for(record.subject, coord);
                }
            }
        }
        true
    }

    /// Place the labor block at every empty spawner; world context only
    pub fn restock(&self) -> usize {
        let placed = self
            .service
            .cells
            .all_spawners()
            .iter()
            .filter(|coord| self.restore_block(coord))
            .count();
        if placed > 0 {
            debug!(target: WORLD_TARGET, placed, "Restocked labor spawners");
        }
        placed
    }

    /// Periodically restock spawners and prune the quarantine
    pub fn start_maintenance(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.prune_quarantine();
                let this = self.clone();
                self.service.scheduler().run(move || {
                    this.restock();
                });
            }
        })
    }
}
