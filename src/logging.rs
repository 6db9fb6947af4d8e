use crate::world::SubjectId;
use crate::{ADMIN_TARGET, CONSOLE_TARGET, ERROR_TARGET};
use std::fmt::Display;
use std::path::Path;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log directory name
pub const LOG_DIR: &str = "logs";
/// Moderation log file name
pub const MODERATION_LOG_FILE: &str = "moderation";

/// Initialize the logging system with console and file outputs
pub fn init() -> Result<(), crate::Error> {
    if !Path::new(LOG_DIR).exists() {
        std::fs::create_dir_all(LOG_DIR)?;
    }

    let moderation_file = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, MODERATION_LOG_FILE);

    // Human-readable console output
    let console_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(true);

    // JSON audit trail
    let moderation_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(moderation_file);

    // RUST_LOG wins, otherwise INFO
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(moderation_layer)
        .try_init()?;

    info!("Logging system initialized");
    Ok(())
}

/// Record a staff action in the audit trail
pub fn log_admin_action(action: &str, subject: SubjectId, staff: &str, detail: &str) {
    info!(
        target: ADMIN_TARGET,
        action = %action,
        subject = %subject,
        staff = %staff,
        detail = %detail,
        event = "action",
        "Moderation action"
    );
}

/// Record a staff action that was refused
pub fn log_admin_error(action: &str, subject: SubjectId, staff: &str, error: &dyn Display) {
    error!(
        target: ERROR_TARGET,
        action = %action,
        subject = %subject,
        staff = %staff,
        error = %error,
        "Moderation action failed"
    );
}

pub fn log_console(message: String) {
    info!(
        target: CONSOLE_TARGET,
        message = %message,
        event = "console",
    );
}
