//! Outbound moderation events
//!
//! Emission is fire-and-forget: a sink never blocks the caller and never
//! reports failure back into the engine.

use crate::ADMIN_TARGET;
use crate::world::SubjectId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{info, warn};

/// Something external consumers may want to hear about
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ModerationEvent {
    Confined {
        subject: SubjectId,
        display_name: String,
        cell: String,
        staff: String,
        reason: String,
        expires_at: DateTime<Utc>,
        labor_required: u32,
    },
    Released {
        subject: SubjectId,
        display_name: String,
        /// Staff name, or `None` for automatic releases
        releaser: Option<String>,
    },
    LaborComplete {
        subject: SubjectId,
        display_name: String,
        labor_required: u32,
    },
    RelocationAbandoned {
        subject: SubjectId,
        attempts: u32,
    },
}

impl ModerationEvent {
    #[must_use]
    pub fn subject(&self) -> SubjectId {
        match self {
            Self::Confined { subject, .. }
            | Self::Released { subject, .. }
            | Self::LaborComplete { subject, .. }
            | Self::RelocationAbandoned { subject, .. } => *subject,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Confined { .. } => "confined",
            Self::Released { .. } => "released",
            Self::LaborComplete { .. } => "labor_complete",
            Self::RelocationAbandoned { .. } => "relocation_abandoned",
        }
    }
}

/// Receiver of moderation events
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink: Send + Sync {
    fn emit(&self, event: ModerationEvent);
}

/// Sink that writes events to the admin log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn emit(&self, event: ModerationEvent) {
        info!(
            target: ADMIN_TARGET,
            subject = %event.subject(),
            event = event.name(),
            details = ?event,
            "Moderation event"
        );
    }
}

/// Sink that forwards events over a bounded channel, dropping them when full
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<ModerationEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events arrive on
    #[must_use]
    pub fn new(capacity: usize) -> (Self, Receiver<ModerationEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn emit(&self, event: ModerationEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Dropping moderation event: {e}");
        }
    }
}
