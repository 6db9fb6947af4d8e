//! Scripted sessions
//!
//! A script is a YAML list of staff operations and inbound actions replayed
//! against the engine on a [`SimWorld`]. The binary uses it to exercise a
//! configuration without a game server attached.

use crate::confinement::{
    ConfineRequest, ConfinementResult, ConfinementService, ContainmentEnforcer, ExpirationSweeper,
    InboundAction, Verdict,
};
use crate::logging::log_console;
use crate::sim::SimWorld;
use crate::status::{RegistrySummary, format_summary};
use crate::world::{BlockCoord, Location, SubjectId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// One scripted step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Bring a subject online at `at` and announce the join
    Connect { subject: SubjectId, at: Location },
    /// Announce the quit and take the subject offline
    Disconnect { subject: SubjectId },
    Confine(ConfineRequest),
    Release {
        subject: SubjectId,
        #[serde(default)]
        releaser: Option<String>,
    },
    Action(InboundAction),
    Status { subject: SubjectId },
    Summary,
    Wait { ms: u64 },
    Sweep,
    Restock,
    SetCell { name: String, anchor: Location },
    RemoveCell { name: String },
    AddSpawner { cell: String, coord: BlockCoord },
    RemoveSpawner { cell: String, coord: BlockCoord },
    SetReleaseAnchor {
        #[serde(default)]
        anchor: Option<Location>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Script {
    /// Read a script from a YAML file
    ///
    /// # Errors
    /// Fails when the file cannot be read or parsed.
    pub async fn load(path: impl AsRef<Path>) -> ConfinementResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Whether replaying changes the cell layout
    #[must_use]
    pub fn edits_cells(&self) -> bool {
        self.steps.iter().any(|step| {
            matches!(
                step,
                Step::SetCell { .. }
                    | Step::RemoveCell { .. }
                    | Step::AddSpawner { .. }
                    | Step::RemoveSpawner { .. }
                    | Step::SetReleaseAnchor { .. }
            )
        })
    }
}

/// What happened while replaying a script
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptReport {
    pub steps: usize,
    pub denied: usize,
    pub failed: usize,
    pub transcript: Vec<String>,
}

impl ScriptReport {
    fn note(&mut self, line: String) {
        log_console(line.clone());
        self.transcript.push(line);
    }
}

/// Replays scripts against a running engine
///
/// The world loop must be running; world-context work is handed to it and
/// awaited.
pub struct ScriptRunner {
    enforcer: ContainmentEnforcer,
    world: Arc<SimWorld>,
}

impl ScriptRunner {
    pub fn new(enforcer: ContainmentEnforcer, world: Arc<SimWorld>) -> Self {
        Self { enforcer, world }
    }

    fn service(&self) -> &ConfinementService {
        self.enforcer.service()
    }

    /// Run `task` on the world context and wait for its result
    async fn on_world<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> T + Send + 'static,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.service().scheduler().run(move || {
            let _ = tx.send(task());
        });
        rx.await.ok()
    }

    pub async fn run(&self, script: &Script) -> ScriptReport {
        let mut report = ScriptReport::default();
        info!(steps = script.steps.len(), "Replaying script");
        for step in &script.steps {
            report.steps += 1;
            self.run_step(step, &mut report).await;
        }
        info!(
            steps = report.steps,
            denied = report.denied,
            failed = report.failed,
            "Script finished"
        );
        report
    }

    async fn run_step(&self, step: &Step, report: &mut ScriptReport) {
        match step {
            Step::Connect { subject, at } => {
                let world = Arc::clone(&self.world);
                let enforcer = self.enforcer.clone();
                let (subject, at) = (*subject, at.clone());
                self.on_world(move || {
                    world.connect(subject, at);
                    enforcer.dispatch(&InboundAction::Join { subject });
                })
                .await;
                report.note(format!("{subject} connected"));
            }
            Step::Disconnect { subject } => {
                let world = Arc::clone(&self.world);
                let enforcer = self.enforcer.clone();
                let subject = *subject;
                self.on_world(move || {
                    enforcer.dispatch(&InboundAction::Quit { subject });
                    world.disconnect(subject);
                })
                .await;
                report.note(format!("{subject} disconnected"));
            }
            Step::Confine(request) => match self.service().confine(request.clone()) {
                Ok(record) => report.note(format!(
                    "{} confined in {} until {}",
                    record.display_name, record.cell, record.expires_at
                )),
                Err(e) => {
                    report.failed += 1;
                    report.note(format!("confine of {} failed: {e}", request.subject));
                }
            },
            Step::Release { subject, releaser } => {
                match self.service().release(*subject, releaser.as_deref()) {
                    Some(record) => report.note(format!("{} released", record.display_name)),
                    None => report.note(format!("{subject} was not confined")),
                }
            }
            Step::Action(action) => {
                let verdict = self.dispatch(action.clone()).await;
                match verdict {
                    Some(Verdict::Deny(reason)) => {
                        report.denied += 1;
                        report.note(format!(
                            "{} {} denied: {reason}",
                            action.subject(),
                            action.kind()
                        ));
                    }
                    Some(_) => {
                        report.note(format!("{} {} allowed", action.subject(), action.kind()));
                    }
                    None => {
                        report.failed += 1;
                        warn!("World loop stopped during script");
                    }
                }
            }
            Step::Status { subject } => match self.service().status(*subject) {
                Some(view) => report.note(view.to_string()),
                None => report.note(format!("{subject} is not jailed")),
            },
            Step::Summary => {
                let records = self.service().registry.all();
                let summary = RegistrySummary::from_records(&records);
                report.note(format_summary(&summary, &records, Utc::now()));
            }
            Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
            Step::Sweep => {
                let due = ExpirationSweeper::from_service(self.service().clone()).sweep_once();
                // let the queued releases run before the next step
                self.on_world(|| ()).await;
                report.note(format!("sweep released {due}"));
            }
            Step::Restock => {
                let labor = self.enforcer.labor().clone();
                let placed = self.on_world(move || labor.restock()).await.unwrap_or_default();
                report.note(format!("restocked {placed} labor blocks"));
            }
            Step::SetCell { name, anchor } => {
                self.service().cells.set_cell(name, anchor.clone());
                report.note(format!("cell {name} set to {anchor}"));
            }
            Step::RemoveCell { name } => match self.service().cells.remove_cell(name) {
                Ok(_) => report.note(format!("cell {name} removed")),
                Err(e) => {
                    report.failed += 1;
                    report.note(format!("remove cell {name} failed: {e}"));
                }
            },
            Step::AddSpawner { cell, coord } => {
                match self.service().cells.add_spawner(cell, coord.clone()) {
                    Ok(true) => report.note(format!("spawner {coord} added to {cell}")),
                    Ok(false) => report.note(format!("spawner {coord} already in {cell}")),
                    Err(e) => {
                        report.failed += 1;
                        report.note(format!("add spawner to {cell} failed: {e}"));
                    }
                }
            }
            Step::RemoveSpawner { cell, coord } => {
                let removed = self.service().cells.remove_spawner(cell, coord);
                if removed {
                    let displays = self.service().displays.clone();
                    let coord = coord.clone();
                    self.on_world(move || displays.remove_at(&coord)).await;
                }
                report.note(format!("spawner {coord} removed from {cell}: {removed}"));
            }
            Step::SetReleaseAnchor { anchor } => {
                self.service().cells.set_release_anchor(anchor.clone());
                report.note(match anchor {
                    Some(anchor) => format!("release anchor set to {anchor}"),
                    None => "release anchor cleared".to_string(),
                });
            }
        }
    }

    /// Dispatch an action and apply its world effects when allowed
    async fn dispatch(&self, action: InboundAction) -> Option<Verdict> {
        let world = Arc::clone(&self.world);
        let enforcer = self.enforcer.clone();
        self.on_world(move || {
            let verdict = enforcer.dispatch(&action);
            if verdict.is_allowed() {
                match &action {
                    InboundAction::Move { subject, to, .. }
                    | InboundAction::Teleport { subject, to } => {
                        world.set_position(*subject, to.clone());
                    }
                    InboundAction::BlockBreak { coord, .. } if verdict == Verdict::Allow => {
                        world.clear_block(coord);
                    }
                    InboundAction::BlockPlace { coord, material, .. } => {
                        world.place_block(coord, material.clone());
                    }
                    _ => {}
                }
            }
            verdict
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confinement::ModerationEvent;
    use crate::confinement::testing::{fixture, test_config};

    const SCRIPT: &str = r#"
steps:
  - step: connect
    subject: 6f1c2a8e-0000-4000-8000-000000000001
    at: { world: world, x: 0.5, y: 64.0, z: 0.5 }
  - step: confine
    subject: 6f1c2a8e-0000-4000-8000-000000000001
    display_name: Alex
    cell: north
    staff: Admin
    reason: griefing
    duration_ms: 0
    labor_required: 1
  - step: wait
    ms: 2000
  - step: action
    action: command
    subject: 6f1c2a8e-0000-4000-8000-000000000001
    line: /spawn
  - step: status
    subject: 6f1c2a8e-0000-4000-8000-000000000001
  - step: action
    action: block_break
    subject: 6f1c2a8e-0000-4000-8000-000000000001
    coord: { world: world, x: 2, y: 64, z: 0 }
    material: COBBLESTONE
  - step: wait
    ms: 2000
  - step: summary
"#;

    #[test]
    fn test_parse_script() {
        let script: Script = serde_yaml::from_str(SCRIPT).unwrap();
        assert_eq!(script.steps.len(), 8);
        assert!(matches!(script.steps[1], Step::Confine(ConfineRequest { labor_required: 1, .. })));
        assert_eq!(script.steps[2], Step::Wait { ms: 2000 });
        assert!(matches!(script.steps[7], Step::Summary));
        assert!(!script.edits_cells());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_labor_sentence() {
        let fx = fixture(test_config());
        let world_task = tokio::spawn(fx.world_loop.run());
        let runner = ScriptRunner::new(fx.enforcer.clone(), Arc::clone(&fx.world));

        let script: Script = serde_yaml::from_str(SCRIPT).unwrap();
        let report = runner.run(&script).await;

        assert_eq!(report.steps, 8);
        assert_eq!(report.denied, 1);
        assert_eq!(report.failed, 0);
        assert!(report.transcript.iter().any(|line| line.contains("command denied")));
        assert!(report.transcript.iter().any(|line| line.contains("Labor: 0/1")));
        assert!(report.transcript.last().unwrap().contains("No active confinements."));

        let subject = script.steps[0].clone();
        let Step::Connect { subject, .. } = subject else {
            panic!("first step connects");
        };
        assert!(!fx.service.registry.contains(subject));
        let events = fx.events.lock().unwrap();
        assert_eq!(
            events.iter().filter(|e| matches!(e, ModerationEvent::LaborComplete { .. })).count(),
            1
        );
        assert_eq!(fx.world.position(subject), fx.service.cells.release_anchor());
        world_task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_steps_are_counted() {
        let fx = fixture(test_config());
        let world_task = tokio::spawn(fx.world_loop.run());
        let runner = ScriptRunner::new(fx.enforcer.clone(), Arc::clone(&fx.world));

        let script = Script {
            steps: vec![
                Step::RemoveCell {
                    name: "missing".to_string(),
                },
                Step::AddSpawner {
                    cell: "missing".to_string(),
                    coord: BlockCoord::new("world", 9, 64, 9),
                },
                Step::Release {
                    subject: SubjectId::random(),
                    releaser: None,
                },
            ],
        };
        let report = runner.run(&script).await;
        assert_eq!(report.failed, 2);
        assert!(report.transcript[2].ends_with("was not confined"));
        world_task.abort();
    }
}
