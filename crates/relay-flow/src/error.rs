//! Error types for the scheduling and step-execution domain.

use relay_core::{StepId, TxId};

/// The result type used throughout relay-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in scheduling and step-execution operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An event payload failed validation before enqueue.
    #[error("invalid event: {message}")]
    InvalidEvent {
        /// Description of the validation failure.
        message: String,
    },

    /// A transaction type is not registered.
    #[error("unknown transaction type: {name}")]
    UnknownTransactionType {
        /// The transaction type that was looked up.
        name: String,
    },

    /// A transaction type name was registered twice.
    #[error("transaction type already registered: {name}")]
    DuplicateTransactionType {
        /// The transaction type that was registered twice.
        name: String,
    },

    /// A pipeline reference did not resolve to a persisted definition.
    #[error("unknown pipeline: {reference}")]
    UnknownPipeline {
        /// The `name[:version]` reference that failed to resolve.
        reference: String,
    },

    /// A pipeline name and version pair was registered twice.
    #[error("pipeline already registered: {name} version {version}")]
    DuplicatePipeline {
        /// The pipeline name.
        name: String,
        /// The version that was registered twice.
        version: u32,
    },

    /// A step type has no registered runner.
    #[error("unknown step type: {step_type}")]
    UnknownStepType {
        /// The step type that was looked up.
        step_type: String,
    },

    /// A step type was registered twice.
    #[error("step type already registered: {step_type}")]
    DuplicateStepType {
        /// The step type that was registered twice.
        step_type: String,
    },

    /// A completion was presented for a step the engine does not know.
    ///
    /// Treated as hostile input: the step may never have existed, or the
    /// presenter may be probing for evicted steps.
    #[error("unknown step {step_id}: possible forged completion")]
    UnknownStep {
        /// The step ID that was presented.
        step_id: StepId,
    },

    /// A completion presented a token that does not match the issued one.
    ///
    /// Treated as hostile input; no state is mutated.
    #[error("completion token mismatch for step {step_id}: possible forged completion")]
    CompletionTokenMismatch {
        /// The step whose completion was attempted.
        step_id: StepId,
    },

    /// A completion was presented for a step already in a terminal state.
    #[error("step {step_id} is already terminal ({status})")]
    StepAlreadyTerminal {
        /// The step whose completion was attempted.
        step_id: StepId,
        /// The terminal status the step already holds.
        status: String,
    },

    /// A callback name was not found in the registry.
    #[error("unknown callback '{name}' (known: {})", known.join(", "))]
    UnknownCallback {
        /// The callback name that was looked up.
        name: String,
        /// All registered callback names, for diagnosis.
        known: Vec<String>,
    },

    /// A callback name was registered twice.
    #[error("callback already registered: {name}")]
    DuplicateCallback {
        /// The callback name that was registered twice.
        name: String,
    },

    /// A transaction was not found in the cache.
    #[error("unknown transaction: {tx_id}")]
    UnknownTransaction {
        /// The transaction ID that was looked up.
        tx_id: TxId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A queue ticket did not match a live entry in the queue.
    #[error("stale queue ticket: slot {index} generation {generation}")]
    StaleTicket {
        /// The slot index the ticket pointed at.
        index: usize,
        /// The generation the ticket carried.
        generation: u64,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Runtime configuration is invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An internal consistency invariant was violated.
    #[error("internal consistency error: {message}")]
    InternalConsistency {
        /// Description of the violated invariant.
        message: String,
    },

    /// An error from relay-core.
    #[error("core error: {0}")]
    Core(#[from] relay_core::Error),
}

impl Error {
    /// Creates an internal consistency error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalConsistency {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true for errors that indicate hostile input.
    ///
    /// Security errors are logged prominently and must never mutate state.
    #[must_use]
    pub const fn is_security(&self) -> bool {
        matches!(
            self,
            Self::UnknownStep { .. } | Self::CompletionTokenMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_callback_lists_known_names() {
        let err = Error::UnknownCallback {
            name: "missing".into(),
            known: vec!["root_step_complete".into(), "pipeline_child_complete".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("missing"));
        assert!(msg.contains("root_step_complete"));
        assert!(msg.contains("pipeline_child_complete"));
    }

    #[test]
    fn security_errors_are_flagged() {
        let step_id = StepId::generate();
        assert!(Error::UnknownStep { step_id }.is_security());
        assert!(Error::CompletionTokenMismatch { step_id }.is_security());
        assert!(!Error::StepAlreadyTerminal {
            step_id,
            status: "SUCCESS".into()
        }
        .is_security());
    }

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "SLEEPING".into(),
            to: "SUCCESS".into(),
            reason: "step was never invoked".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("SLEEPING"));
        assert!(msg.contains("SUCCESS"));
    }
}
