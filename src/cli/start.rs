use crate::cli::{
    actions::Action,
    commands,
    dispatch::handler,
    telemetry::{self, AuditSink},
};
use anyhow::Result;

/// Parse arguments, initialize telemetry, and return the action to run.
/// # Errors
/// Returns an error if telemetry cannot be initialized or arguments are inconsistent.
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    let verbosity_level = match matches.get_one::<u8>("verbosity").map_or(0, |&v| v) {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::WARN,
        2 => tracing::Level::INFO,
        3 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    telemetry::init(&telemetry::Config {
        verbosity: verbosity_level,
        audit: matches
            .get_one::<AuditSink>("audit-log")
            .cloned()
            .unwrap_or_default(),
    })?;

    let action = handler(&matches)?;

    Ok(action)
}
