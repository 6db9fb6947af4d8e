use crate::confinement::{ConfinementRecord, ConfinementService};
use crate::world::SubjectId;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fmt::{Display, Formatter};
use tokio::task::JoinHandle;
use tracing::info;

/// Cells in the action-bar progress bar
pub const PROGRESS_BAR_CELLS: u32 = 20;

/// Snapshot of one subject's confinement, as shown to players and staff
#[derive(Debug, Clone, PartialEq)]
pub struct StatusView {
    pub subject: SubjectId,
    pub display_name: String,
    pub cell: String,
    pub reason: String,
    pub staff: String,
    pub expires_at: DateTime<Utc>,
    /// Sentence time left, frozen while paused
    pub remaining: Duration,
    pub labor_required: u32,
    pub labor_progress: u32,
    pub labor_remaining: u32,
    pub labor_percentage: u32,
    /// Clock frozen while the subject is offline
    pub paused: bool,
}

impl StatusView {
    #[must_use]
    pub fn from_record(record: &ConfinementRecord, now: DateTime<Utc>) -> Self {
        Self {
            subject: record.subject,
            display_name: record.display_name.clone(),
            cell: record.cell.clone(),
            reason: record.reason.clone(),
            staff: record.staff.clone(),
            expires_at: record.expires_at,
            remaining: record.remaining(now),
            labor_required: record.labor_required,
            labor_progress: record.labor_progress,
            labor_remaining: record.labor_remaining(),
            labor_percentage: record.labor_percentage(),
            paused: record.is_paused(),
        }
    }

    /// One-line summary for the action bar
    #[must_use]
    pub fn action_bar_line(&self) -> String {
        let mut line = format!("&c&lJAILED &7| &fTime: &e{}", format_remaining(self.remaining));
        if self.labor_required > 0 {
            let _ = write!(
                line,
                " &7| &fLabor: {} &e{}&7/&e{}",
                progress_bar(self.labor_percentage),
                self.labor_progress,
                self.labor_required
            );
        }
        line
    }
}

impl Display for StatusView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Jail status for {}", self.display_name)?;
        writeln!(f, "Cell: {}", self.cell)?;
        writeln!(f, "Reason: {}", self.reason)?;
        writeln!(f, "Jailed by: {}", self.staff)?;
        if self.paused {
            writeln!(f, "Time left: {} (paused while offline)", format_remaining(self.remaining))?;
        } else {
            writeln!(f, "Time left: {}", format_remaining(self.remaining))?;
        }
        if self.labor_required > 0 {
            write!(
                f,
                "Labor: {}/{} ({}%)",
                self.labor_progress, self.labor_required, self.labor_percentage
            )
        } else {
            write!(f, "Labor: none")
        }
    }
}

/// Filled and empty cells for a percentage
fn progress_bar(percentage: u32) -> String {
    let filled = percentage.min(100) * PROGRESS_BAR_CELLS / 100;
    let mut bar = String::from("&a");
    bar.push_str(&"|".repeat(filled as usize));
    bar.push_str("&7");
    bar.push_str(&"|".repeat((PROGRESS_BAR_CELLS - filled) as usize));
    bar
}

/// Format a duration as `1h 2m 3s`, dropping leading zero units
#[must_use]
pub fn format_remaining(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Format a duration by its largest unit, such as `2d` or `45m`
#[must_use]
pub fn format_duration_short(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    match total {
        t if t >= 86_400 => format!("{}d", t / 86_400),
        t if t >= 3600 => format!("{}h", t / 3600),
        t if t >= 60 => format!("{}m", t / 60),
        t => format!("{t}s"),
    }
}

/// Counts over every active confinement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySummary {
    pub confined: usize,
    /// Subjects with labor still owed
    pub laboring: usize,
    pub paused: usize,
    pub per_cell: BTreeMap<String, usize>,
}

impl RegistrySummary {
    #[must_use]
    pub fn from_records(records: &[ConfinementRecord]) -> Self {
        let mut summary = Self {
            confined: records.len(),
            ..Self::default()
        };
        for record in records {
            if !record.is_labor_complete() {
                summary.laboring += 1;
            }
            if record.is_paused() {
                summary.paused += 1;
            }
            *summary.per_cell.entry(record.cell.clone()).or_default() += 1;
        }
        summary
    }
}

/// Render a staff-facing status report
#[must_use]
pub fn format_summary(
    summary: &RegistrySummary,
    records: &[ConfinementRecord],
    now: DateTime<Utc>,
) -> String {
    let mut result = String::new();
    let _ = writeln!(result, "# Confinement Status\n");
    let _ = writeln!(
        result,
        "**Confined**: {} ({} laboring, {} paused)",
        summary.confined, summary.laboring, summary.paused
    );

    if summary.per_cell.is_empty() {
        let _ = writeln!(result, "\nNo active confinements.");
        return result;
    }

    let _ = writeln!(result, "\n### Cells\n");
    for (cell, count) in &summary.per_cell {
        let _ = writeln!(result, "- **{cell}**: {count}");
    }

    let _ = writeln!(result, "\n### Subjects\n");
    let mut sorted: Vec<&ConfinementRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.expires_at);
    for record in sorted {
        let labor = if record.labor_required > 0 {
            format!(", labor {}/{}", record.labor_progress, record.labor_required)
        } else {
            String::new()
        };
        let _ = writeln!(
            result,
            "- **{}** in {}: {} left{labor}",
            record.display_name,
            record.cell,
            format_duration_short(record.remaining(now))
        );
    }
    result
}

/// Push status lines to online confined subjects every `period`
pub fn spawn_status_ticker(
    service: ConfinementService,
    period: std::time::Duration,
) -> JoinHandle<()> {
    let period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
    info!(period_ms, "Status ticker started");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let service_for_tick = service.clone();
            service.scheduler().run(move || {
                service_for_tick.push_status_lines();
            });
        }
    })
}
