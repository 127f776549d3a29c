//! Logging initialization and span constructors.
//!
//! Every Relay component logs through `tracing` with the same span shapes,
//! so a transaction can be followed across the scheduler, its steps, and
//! the completion path with one filter expression.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `relay_flow=debug`)
///
/// # Example
///
/// ```rust
/// use relay_core::observability::{LogFormat, init_logging};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for scheduler operations with standard fields.
///
/// # Example
///
/// ```rust
/// use relay_core::observability::scheduler_span;
///
/// let span = scheduler_span("handle_tx_start", "default");
/// let _guard = span.enter();
/// // ... handle the event
/// ```
#[must_use]
pub fn scheduler_span(operation: &str, node_group: &str) -> Span {
    tracing::info_span!(
        "scheduler",
        op = operation,
        node_group = node_group,
    )
}

/// Creates a span for one transaction's processing.
#[must_use]
pub fn transaction_span(operation: &str, tx_id: &str, node_group: &str) -> Span {
    tracing::info_span!(
        "transaction",
        op = operation,
        tx_id = tx_id,
        node_group = node_group,
    )
}
