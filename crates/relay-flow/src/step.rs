//! Step records and the step lifecycle state machine.
//!
//! A step is one node in a transaction's execution tree: either an atomic
//! step handed to a runner, or a pipeline step whose children the engine
//! sequences itself. Status moves monotonically through
//! `SLEEPING -> RUNNING -> terminal`; no terminal state is ever re-entered.
//!
//! Completion is guarded by the step's [`CompletionToken`]: the token issued
//! at creation must be presented, and [`Step::try_complete`] is the only
//! write path for terminal status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use relay_core::{CompletionToken, StepId, TxId};

use crate::definition::ChildSpec;
use crate::error::{Error, Result};

/// Width of one zero-padded sequence segment.
const SEQUENCE_SEGMENT_WIDTH: usize = 5;

/// Step execution states.
///
/// ```text
/// ┌──────────┐  invoked  ┌─────────┐
/// │ SLEEPING │──────────►│ RUNNING │
/// └──────────┘           └─────────┘
///                             │
///          ┌─────────────┬────┴───────┬────────────────┐
///          ▼             ▼            ▼                ▼
///     ┌─────────┐   ┌────────┐  ┌─────────┐  ┌────────────────┐
///     │ SUCCESS │   │ FAILED │  │ ABORTED │  │ INTERNAL_ERROR │
///     └─────────┘   └────────┘  └─────────┘  └────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Registered, not yet invoked.
    Sleeping,
    /// Invoked, awaiting completion.
    Running,
    /// Completed successfully.
    Success,
    /// Completed with a failure reported by the step.
    Failed,
    /// Aborted by the step or an external actor.
    Aborted,
    /// Completed with an internal error in the step implementation.
    InternalError,
}

impl StepStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Aborted | Self::InternalError
        )
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Sleeping => matches!(target, Self::Running),
            Self::Running => target.is_terminal(),
            Self::Success | Self::Failed | Self::Aborted | Self::InternalError => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Sleeping => "sleeping",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sleeping => write!(f, "SLEEPING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
            Self::Aborted => write!(f, "ABORTED"),
            Self::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// The callback a step invokes on completion, addressed by node group and
/// callback name so delivery can cross a process boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRef {
    /// Node group that must handle the callback.
    pub node_group: String,
    /// Registered callback name.
    pub callback: String,
    /// Context stored at step creation and replayed to the callback.
    pub context: Value,
}

/// A pre-allocated child slot of a pipeline step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineChild {
    /// The child's pre-allocated step ID.
    pub step_id: StepId,
    /// The child's declared spec.
    pub spec: ChildSpec,
}

/// One node in a transaction's execution tree.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique step identifier.
    pub step_id: StepId,
    /// Owning transaction.
    pub tx_id: TxId,
    /// Parent step, if any (`None` for the root step).
    pub parent_step_id: Option<StepId>,
    /// Dotted, zero-padded position path (e.g. `00001.00002`).
    pub full_sequence: String,
    /// Nesting depth (1 for the root step).
    pub level: u32,
    /// Step type.
    pub step_type: String,
    /// Description from the resolved definition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Current lifecycle state.
    pub status: StepStatus,
    /// Input fed to the step at invocation.
    pub step_input: Value,
    /// Output recorded at completion.
    pub step_output: Value,
    /// Completion note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// The completion credential issued at creation. Never serialized.
    #[serde(skip_serializing)]
    pub completion_token: CompletionToken,
    /// Completion callback, invoked by name through the registry.
    pub on_complete: CallbackRef,
    /// When the step was registered.
    pub created_at: DateTime<Utc>,
    /// When the step was invoked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Pre-allocated children, in execution order. Pipeline steps only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<PipelineChild>,
    /// Index of the child currently executing (or next to execute).
    pub index_of_current_child: usize,
}

impl Step {
    /// Creates a step record in `SLEEPING` state with a freshly minted
    /// completion token.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        step_id: StepId,
        tx_id: TxId,
        parent_step_id: Option<StepId>,
        full_sequence: String,
        step_type: impl Into<String>,
        step_input: Value,
        on_complete: CallbackRef,
    ) -> Self {
        let level = u32::try_from(full_sequence.split('.').count()).unwrap_or(u32::MAX);
        Self {
            step_id,
            tx_id,
            parent_step_id,
            full_sequence,
            level,
            step_type: step_type.into(),
            description: None,
            status: StepStatus::Sleeping,
            step_input,
            step_output: Value::Null,
            note: None,
            completion_token: CompletionToken::mint(),
            on_complete,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            children: Vec::new(),
            index_of_current_child: 0,
        }
    }

    /// Returns true for pipeline steps.
    #[must_use]
    pub fn is_pipeline(&self) -> bool {
        self.step_type == crate::definition::PIPELINE_STEP_TYPE
    }

    /// Returns true if the step has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Marks the step as invoked.
    ///
    /// # Errors
    ///
    /// Returns an error if the step is not in `SLEEPING` state.
    #[tracing::instrument(skip(self), fields(step_id = %self.step_id, from = %self.status))]
    pub fn begin(&mut self) -> Result<()> {
        if !self.status.can_transition_to(StepStatus::Running) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: StepStatus::Running.to_string(),
                reason: "step already invoked".into(),
            });
        }
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Applies a completion after validating the presented token.
    ///
    /// This is the only write path for terminal status. The ladder is:
    /// token match, then at-most-once (terminal re-entry rejected), then
    /// transition validity. A rejection leaves the step untouched.
    ///
    /// # Errors
    ///
    /// - [`Error::CompletionTokenMismatch`] for a token that does not match
    ///   the one issued at creation (treated as a forgery attempt).
    /// - [`Error::StepAlreadyTerminal`] for a second completion.
    /// - [`Error::InvalidStateTransition`] for a non-terminal presented
    ///   status or a step that was never invoked.
    pub fn try_complete(
        &mut self,
        presented: &CompletionToken,
        status: StepStatus,
        note: Option<String>,
        output: Value,
    ) -> Result<()> {
        if !self.completion_token.matches(presented) {
            return Err(Error::CompletionTokenMismatch {
                step_id: self.step_id,
            });
        }
        if self.status.is_terminal() {
            return Err(Error::StepAlreadyTerminal {
                step_id: self.step_id,
                status: self.status.to_string(),
            });
        }
        if !status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: status.to_string(),
                reason: "completion must present a terminal status".into(),
            });
        }
        if !self.status.can_transition_to(status) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: status.to_string(),
                reason: "step was never invoked".into(),
            });
        }

        self.status = status;
        self.note = note;
        self.step_output = output;
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// Completion data handed to a step's `on_complete` callback.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCompletion {
    /// Owning transaction.
    pub tx_id: TxId,
    /// The completed step.
    pub step_id: StepId,
    /// Terminal status.
    pub status: StepStatus,
    /// Completion note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Output data.
    pub output: Value,
}

/// Transition data handed to a transaction's `on_change` callback.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTransition {
    /// Owning transaction.
    pub tx_id: TxId,
    /// The step that transitioned.
    pub step_id: StepId,
    /// The status it transitioned to.
    pub status: StepStatus,
}

/// Formats one sequence segment, zero-padded for lexical ordering.
#[must_use]
pub fn format_sequence_segment(seq: u32) -> String {
    format!("{seq:0width$}", width = SEQUENCE_SEGMENT_WIDTH)
}

/// Appends a child's local sequence number to a parent prefix.
///
/// An empty prefix produces a root-level sequence.
#[must_use]
pub fn child_sequence(prefix: &str, seq: u32) -> String {
    let segment = format_sequence_segment(seq);
    if prefix.is_empty() {
        segment
    } else {
        format!("{prefix}.{segment}")
    }
}

/// Builds a sort key for a dotted sequence by zero-padding each numeric
/// segment, so that lexical comparison orders steps numerically.
#[must_use]
pub fn sequence_sort_key(sequence: &str) -> String {
    sequence
        .split('.')
        .map(|segment| match segment.parse::<u32>() {
            Ok(n) => format_sequence_segment(n),
            Err(_) => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_step() -> Step {
        Step::new(
            StepId::generate(),
            TxId::generate(),
            None,
            child_sequence("", 1),
            "ping",
            json!({"value": 1}),
            CallbackRef {
                node_group: "default".into(),
                callback: "root_step_complete".into(),
                context: Value::Null,
            },
        )
    }

    #[test]
    fn status_machine_is_monotonic() {
        assert!(StepStatus::Sleeping.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Sleeping.can_transition_to(StepStatus::Success));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Success));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Aborted));
        assert!(!StepStatus::Success.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Failed.can_transition_to(StepStatus::Success));
    }

    #[test]
    fn complete_happy_path() {
        let mut step = test_step();
        step.begin().unwrap();

        let token = step.completion_token.clone();
        step.try_complete(&token, StepStatus::Success, None, json!({"ok": true}))
            .unwrap();

        assert_eq!(step.status, StepStatus::Success);
        assert_eq!(step.step_output, json!({"ok": true}));
        assert!(step.completed_at.is_some());
    }

    #[test]
    fn wrong_token_rejected_without_mutation() {
        let mut step = test_step();
        step.begin().unwrap();

        let forged = CompletionToken::mint();
        let err = step
            .try_complete(&forged, StepStatus::Success, None, json!({}))
            .unwrap_err();

        assert!(matches!(err, Error::CompletionTokenMismatch { .. }));
        assert_eq!(step.status, StepStatus::Running);
        assert_eq!(step.step_output, Value::Null);
    }

    #[test]
    fn second_completion_rejected() {
        let mut step = test_step();
        step.begin().unwrap();

        let token = step.completion_token.clone();
        step.try_complete(&token, StepStatus::Success, None, json!({"first": true}))
            .unwrap();

        let err = step
            .try_complete(&token, StepStatus::Failed, None, json!({"second": true}))
            .unwrap_err();

        assert!(matches!(err, Error::StepAlreadyTerminal { .. }));
        assert_eq!(step.status, StepStatus::Success);
        assert_eq!(step.step_output, json!({"first": true}));
    }

    #[test]
    fn non_terminal_completion_status_rejected() {
        let mut step = test_step();
        step.begin().unwrap();

        let token = step.completion_token.clone();
        let err = step
            .try_complete(&token, StepStatus::Running, None, Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn sleeping_step_cannot_complete() {
        let mut step = test_step();
        let token = step.completion_token.clone();
        let err = step
            .try_complete(&token, StepStatus::Success, None, Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn sequences_nest_and_pad() {
        let root = child_sequence("", 1);
        assert_eq!(root, "00001");

        let child = child_sequence(&root, 2);
        assert_eq!(child, "00001.00002");

        let step = test_step();
        assert_eq!(step.level, 1);
    }

    #[test]
    fn sort_key_pads_unnormalized_segments() {
        assert_eq!(sequence_sort_key("1.12"), "00001.00012");
        // Unpadded numeric comparison: 2 sorts before 10 once padded.
        let mut sequences = vec!["1.10", "1.2"];
        sequences.sort_by_key(|s| sequence_sort_key(s));
        assert_eq!(sequences, vec!["1.2", "1.10"]);
    }

    #[test]
    fn serialized_step_omits_token() {
        let step = test_step();
        let json = serde_json::to_value(&step).unwrap();
        assert!(json.get("completionToken").is_none());
        assert!(json.get("stepId").is_some());
    }
}
