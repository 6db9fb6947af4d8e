//! Confinement record and release condition
//!
//! This module defines the confinement record structure and the rule that
//! decides when a confined subject becomes eligible for release.

use crate::world::SubjectId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Whether a confinement may end at `now`
///
/// Time must have run out, and the labor gate (if any) must be satisfied.
#[must_use]
pub fn release_condition(
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    labor_required: u32,
    labor_progress: u32,
) -> bool {
    let time_expired = now >= expires_at;
    time_expired && (labor_required == 0 || labor_progress >= labor_required)
}

/// `now` plus `duration_ms`, saturating at the latest representable instant
fn expiry_after(now: DateTime<Utc>, duration_ms: u64) -> DateTime<Utc> {
    i64::try_from(duration_ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .and_then(|duration| now.checked_add_signed(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Parameters of an admin confine action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfineRequest {
    pub subject: SubjectId,
    pub display_name: String,
    pub cell: String,
    pub staff: String,
    pub reason: String,
    /// Sentence length in milliseconds
    pub duration_ms: u64,
    #[serde(default)]
    pub labor_required: u32,
}

/// Record of an active confinement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfinementRecord {
    /// The confined subject, unique across the registry
    pub subject: SubjectId,
    /// Name shown in messages and notifications
    pub display_name: String,
    /// Cell the subject is held in
    pub cell: String,
    pub reason: String,
    /// Who issued the confinement
    pub staff: String,
    pub created_at: DateTime<Utc>,
    /// When the time part of the sentence runs out
    pub expires_at: DateTime<Utc>,
    /// Labor blocks to break before release, 0 for none
    pub labor_required: u32,
    /// Labor blocks broken so far, never above `labor_required`
    pub labor_progress: u32,
    /// Remaining sentence frozen while the subject is offline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_remaining_ms: Option<i64>,
    /// Stamp of the last accepted mutation
    #[serde(default)]
    pub revision: u64,
}

impl ConfinementRecord {
    /// Create a record issued at `now`
    #[must_use]
    pub fn issued_at(request: &ConfineRequest, now: DateTime<Utc>) -> Self {
        Self {
            subject: request.subject,
            display_name: request.display_name.clone(),
            cell: request.cell.clone(),
            reason: request.reason.clone(),
            staff: request.staff.clone(),
            created_at: now,
            expires_at: expiry_after(now, request.duration_ms),
            labor_required: request.labor_required,
            labor_progress: 0,
            paused_remaining_ms: None,
            revision: 0,
        }
    }

    /// Count one labor block, returning whether progress moved
    pub fn add_labor(&mut self) -> bool {
        if self.labor_progress >= self.labor_required {
            self.labor_progress = self.labor_required;
            return false;
        }
        self.labor_progress += 1;
        true
    }

    #[must_use]
    pub fn is_labor_complete(&self) -> bool {
        self.labor_required == 0 || self.labor_progress >= self.labor_required
    }

    #[must_use]
    pub fn labor_remaining(&self) -> u32 {
        self.labor_required.saturating_sub(self.labor_progress)
    }

    /// Progress as a whole percentage, 100 when there is no labor gate
    #[must_use]
    pub fn labor_percentage(&self) -> u32 {
        if self.labor_required == 0 {
            return 100;
        }
        let pct = u64::from(self.labor_progress) * 100 / u64::from(self.labor_required);
        u32::try_from(pct.min(100)).unwrap_or(100)
    }

    /// Whether the sentence clock is frozen
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused_remaining_ms.is_some()
    }

    /// Whether the time part of the sentence is over; never while paused
    #[must_use]
    pub fn is_time_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_paused() && now >= self.expires_at
    }

    #[must_use]
    pub fn can_be_released(&self, now: DateTime<Utc>) -> bool {
        !self.is_paused()
            && release_condition(now, self.expires_at, self.labor_required, self.labor_progress)
    }

    /// Time left on the sentence, zero once expired
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.paused_remaining_ms {
            Some(ms) => Duration::milliseconds(ms.max(0)),
            None => (self.expires_at - now).max(Duration::zero()),
        }
    }

    /// Freeze the sentence clock, returning false if already frozen
    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_paused() {
            return false;
        }
        self.paused_remaining_ms = Some(self.remaining(now).num_milliseconds());
        true
    }

    /// Restart the sentence clock from `now`, returning false if not frozen
    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        let Some(ms) = self.paused_remaining_ms.take() else {
            return false;
        };
        self.expires_at = expiry_after(now, u64::try_from(ms).unwrap_or(0)).max(self.created_at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(duration_ms: u64, labor_required: u32) -> ConfineRequest {
        ConfineRequest {
            subject: SubjectId::random(),
            display_name: "Steve".to_string(),
            cell: "north".to_string(),
            staff: "Admin".to_string(),
            reason: "griefing".to_string(),
            duration_ms,
            labor_required,
        }
    }

    #[test]
    fn test_release_condition_truth_table() {
        let now = Utc::now();
        let past = now - Duration::seconds(1);
        let future = now + Duration::seconds(60);

        // time expired, labor complete
        assert!(release_condition(now, past, 3, 3));
        // time expired, labor incomplete
        assert!(!release_condition(now, past, 3, 2));
        // time not expired, labor complete
        assert!(!release_condition(now, future, 3, 3));
        // time not expired, labor incomplete
        assert!(!release_condition(now, future, 3, 0));
        // no labor gate only needs time
        assert!(release_condition(now, past, 0, 0));
        assert!(!release_condition(now, future, 0, 0));
        // expiry instant itself counts as expired
        assert!(release_condition(now, now, 0, 0));
    }

    #[test]
    fn test_issued_record_timestamps() {
        let now = Utc::now();
        let record = ConfinementRecord::issued_at(&request(10_000, 0), now);
        assert_eq!(record.created_at, now);
        assert_eq!(record.expires_at, now + Duration::milliseconds(10_000));
        assert_eq!(record.labor_progress, 0);
        assert!(record.expires_at >= record.created_at);
    }

    #[test]
    fn test_unbounded_sentence_saturates() {
        let now = Utc::now();
        let mut record = ConfinementRecord::issued_at(&request(u64::MAX, 0), now);
        assert_eq!(record.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(!record.can_be_released(now));
        assert!(record.remaining(now) > Duration::days(365 * 1000));

        assert!(record.pause(now));
        assert!(record.resume(now + Duration::days(1)));
        assert_eq!(record.expires_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_labor_clamps_at_requirement() {
        let mut record = ConfinementRecord::issued_at(&request(1000, 2), Utc::now());
        assert!(record.add_labor());
        assert!(record.add_labor());
        for _ in 0..10 {
            assert!(!record.add_labor());
        }
        assert_eq!(record.labor_progress, 2);
        assert!(record.is_labor_complete());
        assert_eq!(record.labor_remaining(), 0);
        assert_eq!(record.labor_percentage(), 100);
    }

    #[test]
    fn test_no_labor_gate_never_counts() {
        let mut record = ConfinementRecord::issued_at(&request(1000, 0), Utc::now());
        assert!(!record.add_labor());
        assert_eq!(record.labor_progress, 0);
        assert!(record.is_labor_complete());
    }

    #[test]
    fn test_percentage_rounds_down() {
        let mut record = ConfinementRecord::issued_at(&request(1000, 3), Utc::now());
        record.add_labor();
        assert_eq!(record.labor_percentage(), 33);
    }

    #[test]
    fn test_pause_and_resume_shift_expiry() {
        let start = Utc::now();
        let mut record = ConfinementRecord::issued_at(&request(60_000, 0), start);

        let quit_at = start + Duration::seconds(20);
        assert!(record.pause(quit_at));
        assert!(!record.pause(quit_at));
        assert_eq!(record.paused_remaining_ms, Some(40_000));

        // an offline subject never expires, however late it is
        assert!(!record.is_time_expired(start + Duration::days(30)));
        assert!(!record.can_be_released(start + Duration::days(30)));

        let join_at = start + Duration::hours(5);
        assert!(record.resume(join_at));
        assert!(!record.resume(join_at));
        assert_eq!(record.expires_at, join_at + Duration::seconds(40));
        assert!(record.expires_at >= record.created_at);
    }

    #[test]
    fn test_remaining_never_negative() {
        let now = Utc::now();
        let record = ConfinementRecord::issued_at(&request(0, 0), now);
        assert_eq!(record.remaining(now + Duration::seconds(5)), Duration::zero());
    }
}
