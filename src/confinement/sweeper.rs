//! Expiration sweeper
//!
//! Catches confinements whose release condition became true without any
//! triggering event, such as plain time expiry of a sentence with no labor.

use crate::confinement::ConfinementService;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Request type for the sweeper task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepRequest {
    /// Sweep immediately instead of waiting for the next tick
    SweepNow,
    /// Stop the sweeper task
    Shutdown,
}

/// Periodic release scan over a registry snapshot
pub struct ExpirationSweeper {
    service: ConfinementService,
    period: Duration,
}

/// Handle to a running sweeper
pub struct SweeperHandle {
    tx: Sender<SweepRequest>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Ask for an immediate sweep
    pub async fn sweep_now(&self) {
        if let Err(e) = self.tx.send(SweepRequest::SweepNow).await {
            error!("Failed to request sweep: {e}");
        }
    }

    /// Stop the sweeper and wait for it to finish
    pub async fn shutdown(self) {
        if let Err(e) = self.tx.send(SweepRequest::Shutdown).await {
            error!("Failed to send shutdown to sweeper: {e}");
        }
        if let Err(e) = self.task.await {
            error!("Sweeper task failed: {e}");
        }
    }
}

impl ExpirationSweeper {
    pub fn new(service: ConfinementService, period: Duration) -> Self {
        Self { service, period }
    }

    /// Build a sweeper with the configured period
    pub fn from_service(service: ConfinementService) -> Self {
        let period = Duration::from_secs(service.config().sweep_interval_secs.max(1));
        Self::new(service, period)
    }

    /// Queue the release of every due subject on the world context
    ///
    /// The due check runs again on the world context so a join or labor
    /// event handled in between is respected.
    pub fn sweep_once(&self) -> usize {
        let now = Utc::now();
        let due: Vec<_> = self
            .service
            .registry
            .all()
            .into_iter()
            .filter(|record| record.can_be_released(now))
            .map(|record| record.subject)
            .collect();

        for subject in &due {
            let service = self.service.clone();
            let subject = *subject;
            self.service.scheduler().run(move || {
                if service.release_if_due(subject) {
                    debug!(subject = %subject, "Sweeper released subject");
                }
            });
        }
        due.len()
    }

    /// Spawn the sweeper loop
    pub fn start(self) -> SweeperHandle {
        let (tx, rx) = mpsc::channel::<SweepRequest>(16);
        let task = tokio::spawn(async move {
            self.sweep_task(rx).await;
        });
        SweeperHandle { tx, task }
    }

    async fn sweep_task(self, mut rx: Receiver<SweepRequest>) {
        let mut interval = tokio::time::interval(self.period);
        info!(period_secs = self.period.as_secs(), "Expiration sweeper started");

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(SweepRequest::SweepNow) => {
                        let due = self.sweep_once();
                        debug!(due, "Requested sweep finished");
                    }
                    Some(SweepRequest::Shutdown) | None => {
                        info!("Expiration sweeper shutting down");
                        break;
                    }
                },
                _ = interval.tick() => {
                    let due = self.sweep_once();
                    if due > 0 {
                        debug!(due, "Periodic sweep queued releases");
                    }
                }
            }
        }
    }
}
