//! Observability metrics for the scheduling engine.
//!
//! Metrics are exposed via the `metrics` crate facade and are designed to
//! support alerting on completion rejections, dashboarding of queue depths
//! and tick latency, and debugging of step state transitions.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `relay_flow_events_total` | Counter | `kind`, `outcome` | Events processed by the tick loop |
//! | `relay_flow_tick_duration_seconds` | Histogram | - | Tick processing time |
//! | `relay_flow_event_queue_depth` | Gauge | - | Events waiting for the next tick |
//! | `relay_flow_ready_queue_depth` | Gauge | - | Jobs waiting for a worker |
//! | `relay_flow_busy_workers` | Gauge | - | Worker slots currently busy |
//! | `relay_flow_active_transactions` | Gauge | - | Non-terminal cached transactions |
//! | `relay_flow_step_transitions_total` | Counter | `from`, `to` | Step state transitions |
//! | `relay_flow_completion_rejections_total` | Counter | `reason` | Rejected completion attempts |
//!
//! ## Integration
//!
//! To export to Prometheus, install a recorder at startup:
//!
//! ```rust,ignore
//! use metrics_exporter_prometheus::PrometheusBuilder;
//!
//! PrometheusBuilder::new()
//!     .with_http_listener(([0, 0, 0, 0], 9090))
//!     .install()
//!     .expect("failed to install Prometheus recorder");
//! ```

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Events processed by the tick loop.
    pub const EVENTS_TOTAL: &str = "relay_flow_events_total";
    /// Histogram: Tick processing time in seconds.
    pub const TICK_DURATION_SECONDS: &str = "relay_flow_tick_duration_seconds";
    /// Gauge: Events waiting for the next tick.
    pub const EVENT_QUEUE_DEPTH: &str = "relay_flow_event_queue_depth";
    /// Gauge: Jobs waiting for a worker.
    pub const READY_QUEUE_DEPTH: &str = "relay_flow_ready_queue_depth";
    /// Gauge: Worker slots currently busy.
    pub const BUSY_WORKERS: &str = "relay_flow_busy_workers";
    /// Gauge: Non-terminal cached transactions.
    pub const ACTIVE_TRANSACTIONS: &str = "relay_flow_active_transactions";
    /// Counter: Step state transitions.
    pub const STEP_TRANSITIONS_TOTAL: &str = "relay_flow_step_transitions_total";
    /// Counter: Rejected completion attempts.
    pub const COMPLETION_REJECTIONS_TOTAL: &str = "relay_flow_completion_rejections_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Event kind (tx_start, tx_end, step_start, step_end).
    pub const KIND: &str = "kind";
    /// Processing outcome (ok, error).
    pub const OUTCOME: &str = "outcome";
    /// Previous step state (for transitions).
    pub const FROM: &str = "from";
    /// Target step state (for transitions).
    pub const TO: &str = "to";
    /// Rejection reason (unknown_step, token_mismatch, already_terminal).
    pub const REASON: &str = "reason";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics {
    _private: (),
}

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one processed event and its outcome.
    pub fn record_event(&self, kind: &str, outcome: &str) {
        counter!(
            names::EVENTS_TOTAL,
            labels::KIND => kind.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records tick processing time.
    pub fn observe_tick_duration(&self, duration: Duration) {
        histogram!(names::TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Updates the event queue depth gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_event_queue_depth(&self, depth: usize) {
        gauge!(names::EVENT_QUEUE_DEPTH).set(depth as f64);
    }

    /// Updates the ready queue depth gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_ready_queue_depth(&self, depth: usize) {
        gauge!(names::READY_QUEUE_DEPTH).set(depth as f64);
    }

    /// Updates the busy worker gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_busy_workers(&self, busy: usize) {
        gauge!(names::BUSY_WORKERS).set(busy as f64);
    }

    /// Updates the active transactions gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_active_transactions(&self, count: usize) {
        gauge!(names::ACTIVE_TRANSACTIONS).set(count as f64);
    }

    /// Records a step state transition.
    pub fn record_step_transition(&self, from: &str, to: &str) {
        counter!(
            names::STEP_TRANSITIONS_TOTAL,
            labels::FROM => from.to_string(),
            labels::TO => to.to_string(),
        )
        .increment(1);
    }

    /// Records a rejected completion attempt.
    pub fn record_completion_rejected(&self, reason: &str) {
        counter!(
            names::COMPLETION_REJECTIONS_TOTAL,
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_an_installed_recorder_is_a_no_op() {
        let metrics = FlowMetrics::new();
        metrics.record_event("tx_start", "ok");
        metrics.observe_tick_duration(Duration::from_millis(3));
        metrics.set_event_queue_depth(2);
        metrics.set_ready_queue_depth(0);
        metrics.set_busy_workers(1);
        metrics.set_active_transactions(5);
        metrics.record_step_transition("sleeping", "running");
        metrics.record_completion_rejected("token_mismatch");
    }
}
