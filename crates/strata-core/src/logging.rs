//! Logging integration for the strata workspace.
//!
//! Provides helpers for configuring [`tracing`]-based logging from
//! [`Settings`](crate::settings::Settings) and for creating per-query spans.

use crate::settings::Settings;

/// Sets up the global tracing subscriber based on the given settings.
///
/// The filter is read from `settings.log_level` (e.g. "debug",
/// "strata_db=trace,info"). In debug mode a pretty, human-readable format is
/// used; otherwise a structured JSON format is used. Installing a second
/// subscriber is a no-op.
pub fn setup_logging(settings: &Settings) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.debug {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .try_init()
            .ok();
    } else {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .ok();
    }
}

/// Creates a tracing span for one terminal query operation.
///
/// Everything logged while the statement is compiled, routed and executed is
/// attached to this span.
///
/// # Examples
///
/// ```
/// use strata_core::logging::query_span;
///
/// let span = query_span("users", "count");
/// let _guard = span.enter();
/// tracing::debug!("counting rows");
/// ```
pub fn query_span(table: &str, operation: &str) -> tracing::Span {
    tracing::debug_span!("query", table = table, op = operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_twice_is_harmless() {
        let settings = Settings::default();
        setup_logging(&settings);
        setup_logging(&settings);
    }

    #[test]
    fn test_query_span_can_be_entered() {
        let span = query_span("users", "all");
        let _guard = span.enter();
        tracing::debug!("inside span");
    }
}
