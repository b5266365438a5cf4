/*!
 * Logging functionality for linkflow.
 *
 * This module provides tracing setup and span helpers so every link logs
 * with the same structure.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// `RUST_LOG` takes precedence over `filter` when it is set.
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "linkflow_transport=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    install(filter, true, true)
}

/// Initialize the logging system from the `[logging]` configuration section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    install(&config.level, config.with_target, config.ansi)
}

fn install(filter: &str, with_target: bool, ansi: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(with_target).with_ansi(ansi))
        .with(filter)
        .try_init()
        .map_err(|e| Error::logging(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component
///
/// # Arguments
///
/// * `name` - The name of the component
/// * `id` - An optional ID for the component instance
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a new span for an operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_reports_error() {
        // Only the first installer in a process wins.
        let first = init();
        let second = init_from_config(&LoggingConfig::default());
        assert!(first.is_err() || second.is_err());
    }

    #[test]
    fn test_component_span() {
        let span = component_span("link", Some("dsp"));
        let _entered = span.enter();

        let span = component_span("link", None);
        let _entered = span.enter();
    }

    #[test_log::test]
    fn test_operation_span() {
        let span = operation_span("connect", "dsp");
        let _entered = span.enter();
    }
}
