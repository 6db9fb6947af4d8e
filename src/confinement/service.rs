//! Confinement service
//!
//! This module ties the registry, cell directory, displays and relocation
//! together and exposes the admin surface: confine, release and status.

use crate::config::ConfinementConfig;
use crate::confinement::{
    CellDirectory, ConfineRequest, ConfinementError, ConfinementRecord, ConfinementRegistry,
    ConfinementResult, ModerationEvent, NotificationSink, RelocationGuard, Relocator,
    VisibilitySubscriptionManager,
};
use crate::logging::{log_admin_action, log_admin_error};
use crate::status::StatusView;
use crate::world::{SubjectId, World, WorldScheduler};
use crate::WORLD_TARGET;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Service for confinement operations
#[derive(Clone)]
pub struct ConfinementService {
    pub registry: ConfinementRegistry,
    pub cells: CellDirectory,
    pub displays: VisibilitySubscriptionManager,
    pub relocator: Relocator,
    config: Arc<ConfinementConfig>,
    world: Arc<dyn World>,
    scheduler: WorldScheduler,
    notifier: Arc<dyn NotificationSink>,
}

impl ConfinementService {
    /// Wire up a service around an existing registry
    pub fn new(
        config: ConfinementConfig,
        world: Arc<dyn World>,
        scheduler: WorldScheduler,
        registry: ConfinementRegistry,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let cells = CellDirectory::from_config(&config);
        let displays = VisibilitySubscriptionManager::new(
            Arc::clone(&world),
            registry.clone(),
            cells.clone(),
            config.display.clone(),
        );
        let relocator = Relocator::new(
            Arc::clone(&world),
            scheduler.clone(),
            RelocationGuard::new(),
            Arc::clone(&notifier),
            config.relocation.clone(),
        );
        Self {
            registry,
            cells,
            displays,
            relocator,
            config: Arc::new(config),
            world,
            scheduler,
            notifier,
        }
    }

    pub fn config(&self) -> &ConfinementConfig {
        &self.config
    }

    pub fn world(&self) -> &Arc<dyn World> {
        &self.world
    }

    pub fn scheduler(&self) -> &WorldScheduler {
        &self.scheduler
    }

    pub fn notifier(&self) -> &Arc<dyn NotificationSink> {
        &self.notifier
    }

    /// Rehydrate the registry from durable storage
    ///
    /// Must finish before the engine accepts actions. With offline time
    /// excluded every loaded clock starts frozen, since nobody is connected
    /// yet; joins resume them.
    ///
    /// # Errors
    /// Returns the store error if loading fails.
    pub async fn restore(&self) -> ConfinementResult<usize> {
        let Some(mirror) = self.registry.mirror() else {
            return Ok(0);
        };
        let records = mirror.load_all().await?;
        let loaded = self.registry.hydrate(records);

        if self.config.exclude_offline_time {
            let now = Utc::now();
            for record in self.registry.all() {
                self.registry.modify(record.subject, |r| r.pause(now));
            }
        }

        info!(loaded, "Restored confinements from durable storage");
        Ok(loaded)
    }

    /// Confine a subject, replacing any current confinement
    ///
    /// # Errors
    /// Fails without any change if the cell is unknown, or if labor is
    /// requested for a cell without spawners.
    pub fn confine(&self, mut request: ConfineRequest) -> ConfinementResult<ConfinementRecord> {
        let Some(anchor) = self.cells.cell_anchor(&request.cell) else {
            let error = ConfinementError::CellNotFound(request.cell.clone());
            log_admin_error("confine", request.subject, &request.staff, &error);
            return Err(error);
        };

        if !self.config.labor.enabled && request.labor_required > 0 {
            debug!(subject = %request.subject, "Labor disabled, dropping labor requirement");
            request.labor_required = 0;
        }
        if request.labor_required > 0 && self.cells.spawners(&request.cell).is_empty() {
            let error = ConfinementError::NoSpawners(request.cell.clone());
            log_admin_error("confine", request.subject, &request.staff, &error);
            return Err(error);
        }

        let subject = request.subject;
        let issued = ConfinementRecord::issued_at(&request, Utc::now());
        let replaced = self.registry.put(issued.clone()).is_some();
        let record = self.registry.get(subject).unwrap_or(issued);

        log_admin_action(
            "confine",
            subject,
            &record.staff,
            &format!(
                "cell={} until={} labor={} replaced={replaced}",
                record.cell, record.expires_at, record.labor_required
            ),
        );
        self.notifier.emit(ModerationEvent::Confined {
            subject,
            display_name: record.display_name.clone(),
            cell: record.cell.clone(),
            staff: record.staff.clone(),
            reason: record.reason.clone(),
            expires_at: record.expires_at,
            labor_required: record.labor_required,
        });

        let this = self.clone();
        let cell = record.cell.clone();
        let notice = format!(
            "You have been jailed in {} by {}: {}",
            record.cell, record.staff, record.reason
        );
        self.scheduler.run(move || {
            if replaced {
                this.displays.remove_all_for(subject);
            }
            if !this.world.is_online(subject) {
                return;
            }
            this.world.send_message(subject, &notice);
            let displays = this.displays.clone();
            this.relocator.relocate(
                subject,
                anchor,
                Some(Box::new(move || {
                    displays.show_all_for(subject, &cell);
                })),
            );
        });

        Ok(record)
    }

    /// Release a subject
    ///
    /// The record leaves the registry immediately; teardown and relocation
    /// follow on the world context. Releasing a free subject is a no-op
    /// returning `None`.
    pub fn release(&self, subject: SubjectId, releaser: Option<&str>) -> Option<ConfinementRecord> {
        let Some(record) = self.registry.remove(subject) else {
            debug!(subject = %subject, "Release requested for free subject");
            return None;
        };

        log_admin_action(
            "release",
            subject,
            releaser.unwrap_or("system"),
            &format!(
                "cell={} labor={}/{}",
                record.cell, record.labor_progress, record.labor_required
            ),
        );

        let this = self.clone();
        let released = record.clone();
        let releaser = releaser.map(str::to_string);
        self.scheduler
            .run(move || this.finish_release(&released, releaser));
        Some(record)
    }

    /// World-context half of a release
    fn finish_release(&self, record: &ConfinementRecord, releaser: Option<String>) {
        let subject = record.subject;
        self.displays.remove_all_for(subject);

        if self.world.is_online(subject) {
            let destination = self
                .cells
                .release_anchor()
                .unwrap_or_else(|| self.world.spawn_location());
            self.world
                .send_message(subject, "You have been released from jail.");
            self.relocator.relocate(subject, destination, None);
        }

        self.notifier.emit(ModerationEvent::Released {
            subject,
            display_name: record.display_name.clone(),
            releaser,
        });
    }

    /// Release the subject if its release condition holds now
    pub fn release_if_due(&self, subject: SubjectId) -> bool {
        let due = self
            .registry
            .get(subject)
            .is_some_and(|record| record.can_be_released(Utc::now()));
        due && self.release(subject, None).is_some()
    }

    /// Current status of a subject, `None` when free
    pub fn status(&self, subject: SubjectId) -> Option<StatusView> {
        self.registry
            .get(subject)
            .map(|record| StatusView::from_record(&record, Utc::now()))
    }

    /// World-context handling of a subject connecting
    pub fn handle_join(&self, subject: SubjectId) {
        let now = Utc::now();
        if self.config.exclude_offline_time {
            self.registry.modify(subject, |r| r.resume(now));
        }
        let Some(record) = self.registry.get(subject) else {
            return;
        };
        if record.can_be_released(now) {
            self.release_if_due(subject);
            return;
        }
        let Some(anchor) = self.cells.cell_anchor(&record.cell) else {
            warn!(
                target: WORLD_TARGET,
                subject = %subject,
                cell = %record.cell,
                "Confined in a cell that no longer exists"
            );
            return;
        };

        let this = self.clone();
        self.scheduler.run_later(
            Duration::from_millis(self.config.join_relocation_delay_ms),
            move || {
                let Some(record) = this.registry.get(subject) else {
                    return;
                };
                if !this.world.is_online(subject) {
                    return;
                }
                this.world.send_message(
                    subject,
                    &format!("You are still jailed in {}.", record.cell),
                );
                let displays = this.displays.clone();
                let cell = record.cell;
                this.relocator.relocate(
                    subject,
                    anchor,
                    Some(Box::new(move || {
                        displays.show_all_for(subject, &cell);
                    })),
                );
            },
        );
    }

    /// World-context handling of a subject disconnecting
    pub fn handle_quit(&self, subject: SubjectId) {
        self.displays.remove_all_for(subject);
        if self.config.exclude_offline_time {
            let now = Utc::now();
            self.registry.modify(subject, |r| r.pause(now));
        }
    }

    /// Push the action-bar status line to every online confined subject
    pub fn push_status_lines(&self) -> usize {
        let now = Utc::now();
        let mut pushed = 0;
        for record in self.registry.all() {
            if self.world.is_online(record.subject) {
                let view = StatusView::from_record(&record, now);
                self.world
                    .send_action_bar(record.subject, &view.action_bar_line());
                pushed += 1;
            }
        }
        pushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confinement::testing::{fixture, request, test_config};
    use crate::confinement::DurableStore;
    use crate::world::Location;

    #[tokio::test(start_paused = true)]
    async fn test_confine_round_trip() {
        let mut fx = fixture(test_config());
        let subject = SubjectId::random();

        let record = fx.service.confine(request(subject, "north", 10_000, 0)).unwrap();
        assert_eq!(
            record.expires_at,
            record.created_at + chrono::Duration::milliseconds(10_000)
        );

        let stored = fx.service.registry.get(subject).unwrap();
        assert_eq!(stored, record);
        assert_eq!(stored.cell, "north");

        fx.world_loop.run_for(Duration::from_millis(10)).await;
        assert_eq!(fx.store.row(subject).unwrap().subject, subject);
        assert!(matches!(
            fx.events.lock().unwrap()[0],
            ModerationEvent::Confined { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confine_moves_online_subject_and_shows_displays() {
        let mut fx = fixture(test_config());
        let subject = SubjectId::random();
        fx.world.connect(subject, Location::new("world", 500.0, 64.0, 500.0));
        for coord in fx.service.cells.spawners("north") {
            fx.world.place_block(&coord, fx.service.cells.labor_material().clone());
        }

        fx.service.confine(request(subject, "north", 60_000, 3)).unwrap();
        fx.world_loop.run_for(Duration::from_secs(1)).await;

        assert_eq!(fx.world.position(subject), fx.service.cells.cell_anchor("north"));
        assert_eq!(fx.service.displays.count_for(subject), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confine_rejects_bad_requests() {
        let fx = fixture(test_config());
        let subject = SubjectId::random();

        assert!(matches!(
            fx.service.confine(request(subject, "nowhere", 1000, 0)),
            Err(ConfinementError::CellNotFound(_))
        ));
        assert!(matches!(
            fx.service.confine(request(subject, "empty", 1000, 3)),
            Err(ConfinementError::NoSpawners(_))
        ));
        assert!(fx.service.registry.is_empty());
        assert!(fx.events.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_labor_forced_off_when_disabled() {
        let mut config = test_config();
        config.labor.enabled = false;
        let fx = fixture(config);

        let record = fx
            .service
            .confine(request(SubjectId::random(), "empty", 1000, 7))
            .unwrap();
        assert_eq!(record.labor_required, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_idempotent() {
        let mut fx = fixture(test_config());
        let subject = SubjectId::random();
        fx.world.connect(subject, Location::new("world", 0.5, 64.0, 0.5));
        fx.service.confine(request(subject, "north", 60_000, 0)).unwrap();
        fx.world_loop.run_for(Duration::from_secs(1)).await;
        let teleports_before = fx.world.teleport_count();

        assert!(fx.service.release(subject, Some("Admin")).is_some());
        assert!(fx.service.release(subject, Some("Admin")).is_none());
        fx.world_loop.run_for(Duration::from_secs(2)).await;

        assert_eq!(fx.store.delete_count(), 1);
        assert!(fx.store.row(subject).is_none());
        assert_eq!(fx.world.teleport_count(), teleports_before + 1);
        assert_eq!(fx.world.position(subject), fx.service.cells.release_anchor());
        let released = fx
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ModerationEvent::Released { .. }))
            .count();
        assert_eq!(released, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_falls_back_to_world_spawn() {
        let mut config = test_config();
        config.release_anchor = None;
        let mut fx = fixture(config);
        let subject = SubjectId::random();
        fx.world.connect(subject, Location::new("world", 0.5, 64.0, 0.5));
        fx.service.confine(request(subject, "north", 60_000, 0)).unwrap();
        fx.world_loop.run_for(Duration::from_secs(1)).await;

        fx.service.release(subject, None);
        fx.world_loop.run_for(Duration::from_secs(1)).await;
        assert_eq!(fx.world.position(subject), Some(fx.world.spawn_location()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_rehydrates_registry() {
        let fx = fixture(test_config());
        let subject = SubjectId::random();
        let mut stored =
            ConfinementRecord::issued_at(&request(subject, "north", 60_000, 2), Utc::now());
        stored.revision = 12;
        fx.store.insert_or_replace(&stored).await.unwrap();

        assert_eq!(fx.service.restore().await.unwrap(), 1);
        assert_eq!(fx.service.registry.get(subject).unwrap().labor_required, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_time_excluded_pauses_clock() {
        let mut config = test_config();
        config.exclude_offline_time = true;
        let mut fx = fixture(config);
        let subject = SubjectId::random();
        fx.world.connect(subject, Location::new("world", 0.5, 64.0, 0.5));
        fx.service.confine(request(subject, "north", 60_000, 0)).unwrap();
        fx.world_loop.run_for(Duration::from_secs(1)).await;

        fx.world.disconnect(subject);
        fx.service.handle_quit(subject);
        let paused = fx.service.registry.get(subject).unwrap();
        assert!(paused.is_paused());
        assert!(!paused.can_be_released(Utc::now() + chrono::Duration::days(1)));

        fx.world.connect(subject, Location::new("world", 300.0, 64.0, 300.0));
        fx.service.handle_join(subject);
        let resumed = fx.service.registry.get(subject).unwrap();
        assert!(!resumed.is_paused());
        assert!(resumed.expires_at > Utc::now());

        fx.world_loop.run_for(Duration::from_secs(2)).await;
        assert_eq!(fx.world.position(subject), fx.service.cells.cell_anchor("north"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_releases_expired_subject() {
        let mut fx = fixture(test_config());
        let subject = SubjectId::random();
        fx.service.confine(request(subject, "north", 0, 0)).unwrap();

        fx.world.connect(subject, Location::new("world", 0.5, 64.0, 0.5));
        fx.service.handle_join(subject);
        fx.world_loop.run_for(Duration::from_secs(1)).await;

        assert!(fx.service.registry.get(subject).is_none());
        assert_eq!(fx.world.position(subject), fx.service.cells.release_anchor());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_view() {
        let fx = fixture(test_config());
        let subject = SubjectId::random();
        assert!(fx.service.status(subject).is_none());

        fx.service.confine(request(subject, "north", 60_000, 4)).unwrap();
        let view = fx.service.status(subject).unwrap();
        assert_eq!(view.cell, "north");
        assert_eq!(view.labor_remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_lines_reach_online_subjects_only() {
        let fx = fixture(test_config());
        let online = SubjectId::random();
        let offline = SubjectId::random();
        fx.connect_at_cell(online, "north");
        fx.service.confine(request(online, "north", 60_000, 2)).unwrap();
        fx.service.confine(request(offline, "north", 60_000, 0)).unwrap();

        assert_eq!(fx.service.push_status_lines(), 1);
        let line = fx.world.last_action_bar(online).unwrap();
        assert!(line.contains("&e0&7/&e2"));
        assert!(fx.world.last_action_bar(offline).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_confine_with_unbounded_duration() {
        let mut fx = fixture(test_config());
        let subject = SubjectId::random();
        fx.connect_at_cell(subject, "north");

        let record = fx.service.confine(request(subject, "north", u64::MAX, 0)).unwrap();
        assert_eq!(record.expires_at, chrono::DateTime::<Utc>::MAX_UTC);
        fx.world_loop.run_for(Duration::from_secs(1)).await;

        assert!(!fx.service.release_if_due(subject));
        let view = fx.service.status(subject).unwrap();
        assert!(view.action_bar_line().contains('h'));
    }
}
