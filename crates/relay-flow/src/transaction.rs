//! Transaction records and the transaction lifecycle state machine.
//!
//! A transaction is the end-to-end unit of work a caller submits. Its status
//! is driven entirely by its root step: the root's terminal state is copied
//! onto the transaction, and the caller's `onComplete` callback fires exactly
//! once. Every mutation bumps `sequence_of_update` so observers can detect
//! change with an optimistic version check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use relay_core::{StepId, TxId};

use crate::error::{Error, Result};
use crate::event::TxMetadata;
use crate::step::StepStatus;

/// Metadata keys reserved for engine use, stripped from caller metadata.
pub const RESERVED_METADATA_KEYS: &[&str] = &[
    "owner",
    "nodeGroup",
    "externalId",
    "transactionType",
    "onComplete",
    "onChange",
];

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    /// Steps are executing.
    Running,
    /// The root step succeeded.
    Complete,
    /// The root step failed or hit an internal error.
    Failed,
    /// The root step was aborted.
    Aborted,
    /// Status cannot be determined (evicted or never seen).
    Unknown,
}

impl TxStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Aborted)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Running => target.is_terminal(),
            Self::Complete | Self::Failed | Self::Aborted | Self::Unknown => false,
        }
    }

    /// Maps a step's terminal status onto the transaction vocabulary.
    ///
    /// # Errors
    ///
    /// Returns an internal consistency error for non-terminal step status.
    pub fn from_step_terminal(status: StepStatus) -> Result<Self> {
        match status {
            StepStatus::Success => Ok(Self::Complete),
            StepStatus::Failed | StepStatus::InternalError => Ok(Self::Failed),
            StepStatus::Aborted => Ok(Self::Aborted),
            StepStatus::Sleeping | StepStatus::Running => Err(Error::internal(format!(
                "step status {status} is not terminal"
            ))),
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Failed => write!(f, "FAILED"),
            Self::Aborted => write!(f, "ABORTED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// A caller-supplied callback: registered name plus stored context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackSpec {
    /// Registered callback name.
    pub callback: String,
    /// Context replayed to the callback on invocation.
    #[serde(default)]
    pub context: Value,
}

/// One end-to-end unit of work.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Unique transaction identifier.
    pub tx_id: TxId,
    /// Submitting owner.
    pub owner: String,
    /// Caller-side correlation identifier.
    pub external_id: String,
    /// The registered transaction type this resolves to.
    pub transaction_type: String,
    /// Node group that owns this transaction's scheduling state.
    pub node_group: String,
    /// Current lifecycle state.
    pub status: TxStatus,
    /// Caller-supplied metadata, minus reserved keys.
    pub metadata: Map<String, Value>,
    /// Input payload submitted with the transaction.
    pub input_data: Value,
    /// Output copied from the root step at completion.
    pub transaction_output: Value,
    /// Completion callback; fires exactly once.
    pub on_complete: CallbackSpec,
    /// Optional change callback; fires on each step transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_change: Option<CallbackSpec>,
    /// The root step of the execution tree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_step_id: Option<StepId>,
    /// Monotonic version counter, bumped on every mutation.
    pub sequence_of_update: u64,
    /// When the transaction was created.
    pub started_at: DateTime<Utc>,
    /// When the transaction reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Latch ensuring `on_complete` is delivered at most once.
    #[serde(skip_serializing)]
    completion_delivered: bool,
}

impl Transaction {
    /// Creates a `RUNNING` transaction from validated start metadata.
    ///
    /// Reserved keys are stripped from the caller metadata map.
    #[must_use]
    pub fn new(tx_id: TxId, metadata: &TxMetadata, input_data: Value) -> Self {
        let mut extra = metadata.extra.clone();
        for key in RESERVED_METADATA_KEYS {
            extra.remove(*key);
        }

        Self {
            tx_id,
            owner: metadata.owner.clone(),
            external_id: metadata.external_id.clone(),
            transaction_type: metadata.transaction_type.clone(),
            node_group: metadata.node_group.clone(),
            status: TxStatus::Running,
            metadata: extra,
            input_data,
            transaction_output: Value::Null,
            on_complete: metadata.on_complete.clone(),
            on_change: metadata.on_change.clone(),
            root_step_id: None,
            sequence_of_update: 0,
            started_at: Utc::now(),
            completed_at: None,
            completion_delivered: false,
        }
    }

    /// Returns true if the transaction has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Bumps the version counter; call on every mutation.
    pub fn touch(&mut self) {
        self.sequence_of_update += 1;
    }

    /// Transitions to a new status and bumps the version counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(skip(self), fields(tx_id = %self.tx_id, from = %self.status, to = %target))]
    pub fn set_status(&mut self, target: TxStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: "invalid transaction state transition".into(),
            });
        }
        self.status = target;
        if target.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.touch();
        Ok(())
    }

    /// Claims the single `on_complete` delivery.
    ///
    /// Returns true exactly once; later calls return false.
    pub fn claim_completion_delivery(&mut self) -> bool {
        if self.completion_delivered {
            return false;
        }
        self.completion_delivered = true;
        self.touch();
        true
    }
}

/// Completion payload handed to the transaction's `on_complete` callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxCompletion {
    /// The completed transaction.
    pub tx_id: TxId,
    /// Final status.
    pub status: TxStatus,
    /// Final output, copied from the root step.
    pub output: Value,
}
