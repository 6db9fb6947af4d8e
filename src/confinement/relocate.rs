//! Bounded-retry relocation
//!
//! Destinations may sit in terrain the host has not loaded yet, so a
//! relocation asks for the region, waits a settle delay and then teleports,
//! retrying with a linear backoff. Every step is a world-context task; the
//! waits are timer continuations.

use crate::config::RelocationConfig;
use crate::confinement::{ModerationEvent, NotificationSink};
use crate::world::{Location, SubjectId, World, WorldScheduler, WorldTask};
use crate::{ERROR_TARGET, WORLD_TARGET};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Expected-relocation flags
///
/// A flag is armed right before the engine teleports a subject so the
/// enforcer lets that one teleport through. Flags expire on their own.
#[derive(Clone, Default)]
pub struct RelocationGuard {
    armed: Arc<DashMap<SubjectId, (Instant, u64)>>,
    tokens: Arc<AtomicU64>,
}

impl RelocationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the flag for `ttl`, returning a token for [`Self::disarm_if`]
    pub fn arm(&self, subject: SubjectId, ttl: Duration) -> u64 {
        let token = self.tokens.fetch_add(1, Ordering::SeqCst) + 1;
        self.armed.insert(subject, (Instant::now() + ttl, token));
        token
    }

    /// Use up the flag; true if it was armed and still live
    pub fn consume(&self, subject: SubjectId) -> bool {
        self.armed
            .remove(&subject)
            .is_some_and(|(_, (deadline, _))| Instant::now() <= deadline)
    }

    pub fn is_armed(&self, subject: SubjectId) -> bool {
        self.armed
            .get(&subject)
            .is_some_and(|entry| Instant::now() <= entry.0)
    }

    /// Clear the flag only if it still carries `token`
    pub fn disarm_if(&self, subject: SubjectId, token: u64) {
        self.armed.remove_if(&subject, |_, (_, armed)| *armed == token);
    }

    pub fn disarm(&self, subject: SubjectId) {
        self.armed.remove(&subject);
    }
}

/// Moves subjects to a destination, retrying until the host accepts
#[derive(Clone)]
pub struct Relocator {
    world: Arc<dyn World>,
    scheduler: WorldScheduler,
    guard: RelocationGuard,
    notifier: Arc<dyn NotificationSink>,
    settings: RelocationConfig,
    /// Generation of the live relocation chain per subject
    in_flight: Arc<DashMap<SubjectId, u64>>,
    generations: Arc<AtomicU64>,
}

impl Relocator {
    pub fn new(
        world: Arc<dyn World>,
        scheduler: WorldScheduler,
        guard: RelocationGuard,
        notifier: Arc<dyn NotificationSink>,
        settings: RelocationConfig,
    ) -> Self {
        Self {
            world,
            scheduler,
            guard,
            notifier,
            settings,
            in_flight: Arc::new(DashMap::new()),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn guard(&self) -> &RelocationGuard {
        &self.guard
    }

    /// Whether a relocation chain is running for the subject
    pub fn is_relocating(&self, subject: SubjectId) -> bool {
        self.in_flight.contains_key(&subject)
    }

    /// Start relocating `subject`, superseding any running chain
    ///
    /// Must be called on the world context. `on_arrival` runs on the world
    /// context after a successful teleport.
    pub fn relocate(
        &self,
        subject: SubjectId,
        destination: Location,
        on_arrival: Option<WorldTask>,
    ) {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight.insert(subject, generation);
        self.prepare(subject, destination, generation, 1, on_arrival);
    }

    /// Start relocating only if no chain is running; returns whether it started
    pub fn relocate_if_idle(&self, subject: SubjectId, destination: Location) -> bool {
        if self.is_relocating(subject) {
            return false;
        }
        self.relocate(subject, destination, None);
        true
    }

    /// Whether the chain may continue; ends it if the subject left
    fn still_current(&self, subject: SubjectId, generation: u64, attempt: u32) -> bool {
        if self.in_flight.get(&subject).map(|g| *g) != Some(generation) {
            debug!(target: WORLD_TARGET, subject = %subject, attempt, "Relocation superseded");
            return false;
        }
        if !self.world.is_online(subject) {
            debug!(
                target: WORLD_TARGET,
                subject = %subject,
                attempt,
                "Subject went offline, stopping relocation"
            );
            self.finish(subject, generation);
            return false;
        }
        true
    }

    fn finish(&self, subject: SubjectId, generation: u64) {
        self.in_flight.remove_if(&subject, |_, current| *current == generation);
    }

    fn prepare(
        &self,
        subject: SubjectId,
        destination: Location,
        generation: u64,
        attempt: u32,
        on_arrival: Option<WorldTask>,
    ) {
        if !self.still_current(subject, generation, attempt) {
            return;
        }
        self.world.load_region(&destination);

        let this = self.clone();
        self.scheduler.run_later(
            Duration::from_millis(self.settings.settle_delay_ms),
            move || this.attempt(subject, destination, generation, attempt, on_arrival),
        );
    }

    fn attempt(
        &self,
        subject: SubjectId,
        destination: Location,
        generation: u64,
        attempt: u32,
        on_arrival: Option<WorldTask>,
    ) {
        if !self.still_current(subject, generation, attempt) {
            return;
        }

        let token = self
            .guard
            .arm(subject, Duration::from_millis(self.settings.guard_ttl_ms));

        if self.world.teleport(subject, &destination) {
            self.finish(subject, generation);
            info!(
                target: WORLD_TARGET,
                subject = %subject,
                destination = %destination,
                attempt,
                "Relocated subject"
            );
            let guard = self.guard.clone();
            self.scheduler.run_later(
                Duration::from_millis(self.settings.guard_clear_ms),
                move || guard.disarm_if(subject, token),
            );
            if let Some(task) = on_arrival {
                task();
            }
            return;
        }

        self.guard.disarm_if(subject, token);

        if attempt >= self.settings.max_attempts {
            self.finish(subject, generation);
            error!(
                target: ERROR_TARGET,
                subject = %subject,
                destination = %destination,
                attempts = attempt,
                "Relocation abandoned"
            );
            self.world.send_message(
                subject,
                "Teleport failed. Please contact an administrator.",
            );
            self.notifier.emit(ModerationEvent::RelocationAbandoned {
                subject,
                attempts: attempt,
            });
            return;
        }

        let delay = Duration::from_millis(self.settings.backoff_unit_ms)
            .saturating_mul(attempt);
        warn!(
            target: WORLD_TARGET,
            subject = %subject,
            attempt,
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Teleport failed, retrying"
        );
        let this = self.clone();
        self.scheduler.run_later(delay, move || {
            this.prepare(subject, destination, generation, attempt + 1, on_arrival);
        });
    }
}
