//! Typed, validated scheduler event envelopes.
//!
//! Events are the only way anything crosses into the scheduler: transaction
//! starts, step starts, and completions all arrive as [`SchedulerEvent`]s on
//! the event queue and are consumed exactly once by the tick loop.
//!
//! Validation happens at construction, before enqueue, so a malformed
//! payload is a synchronous error to the submitter rather than a poisoned
//! queue entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use relay_core::{CompletionToken, EventId, StepId, TxId};

use crate::definition::DefinitionOrRef;
use crate::error::{Error, Result};
use crate::step::StepStatus;
use crate::transaction::CallbackSpec;

/// Event kinds, used for dispatch and as metric/log labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A caller submitted a transaction.
    TxStart,
    /// A transaction's root step resolved; deliver the completion.
    TxEnd,
    /// Start a step (root or pipeline child).
    StepStart,
    /// A step reported completion.
    StepEnd,
}

impl EventKind {
    /// Returns a `snake_case` label for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::TxStart => "tx_start",
            Self::TxEnd => "tx_end",
            Self::StepStart => "step_start",
            Self::StepEnd => "step_end",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Transaction start metadata, as submitted by the caller.
///
/// The named fields are mandatory; everything else the caller supplies
/// lands in `extra` and is carried as transaction metadata (minus the
/// reserved keys, which are stripped at transaction creation).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxMetadata {
    /// Submitting owner.
    pub owner: String,
    /// Node group that will own the transaction's scheduling state.
    pub node_group: String,
    /// Caller-side correlation identifier.
    pub external_id: String,
    /// Registered transaction type to execute.
    pub transaction_type: String,
    /// Completion callback; fires exactly once.
    pub on_complete: CallbackSpec,
    /// Optional change callback; fires on each step transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_change: Option<CallbackSpec>,
    /// Any further caller-supplied metadata.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TxMetadata {
    fn validate(&self) -> Result<()> {
        let required = [
            ("owner", &self.owner),
            ("nodeGroup", &self.node_group),
            ("externalId", &self.external_id),
            ("transactionType", &self.transaction_type),
            ("onComplete.callback", &self.on_complete.callback),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(Error::InvalidEvent {
                    message: format!("metadata field '{field}' must be a non-empty string"),
                });
            }
        }
        if let Some(on_change) = &self.on_change {
            if on_change.callback.trim().is_empty() {
                return Err(Error::InvalidEvent {
                    message: "metadata field 'onChange.callback' must be a non-empty string"
                        .into(),
                });
            }
        }
        Ok(())
    }
}

/// Payload of a `TX_START` event.
///
/// The transaction ID is allocated at construction so the submitter can
/// hold a poll/reply handle before the event is processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxStartPayload {
    /// The pre-allocated transaction ID.
    pub tx_id: TxId,
    /// Validated start metadata.
    pub metadata: TxMetadata,
    /// Input payload for the root step.
    pub data: Value,
}

/// Payload of a `TX_END` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxEndPayload {
    /// The transaction whose root step resolved.
    pub tx_id: TxId,
}

/// Payload of a `STEP_START` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStartPayload {
    /// Owning transaction.
    pub tx_id: TxId,
    /// Pre-allocated ID for the step to start.
    pub step_id: StepId,
    /// Parent step, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<StepId>,
    /// The step's complete dotted sequence, computed by the enqueuer.
    pub full_sequence: String,
    /// The step's definition, inline or by reference.
    pub definition: DefinitionOrRef,
    /// Completion callback name.
    pub callback: String,
    /// Context stored for the completion callback.
    pub callback_context: Value,
}

/// The completion protocol fields carried by a `STEP_END` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    /// The completion credential issued when the step was created.
    pub token: CompletionToken,
    /// Terminal status reported by the step.
    pub status: StepStatus,
    /// Optional completion note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Output data.
    pub output: Value,
}

/// Payload of a `STEP_END` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEndPayload {
    /// Owning transaction.
    pub tx_id: TxId,
    /// The step reporting completion.
    pub step_id: StepId,
    /// The completion protocol fields, validated by the handler.
    pub completion: CompletionRequest,
}

/// Kind-specific event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    /// See [`TxStartPayload`].
    TxStart(TxStartPayload),
    /// See [`TxEndPayload`].
    TxEnd(TxEndPayload),
    /// See [`StepStartPayload`].
    StepStart(StepStartPayload),
    /// See [`StepEndPayload`].
    StepEnd(StepEndPayload),
}

impl EventPayload {
    /// Returns the event kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::TxStart(_) => EventKind::TxStart,
            Self::TxEnd(_) => EventKind::TxEnd,
            Self::StepStart(_) => EventKind::StepStart,
            Self::StepEnd(_) => EventKind::StepEnd,
        }
    }

    /// Returns the transaction ID the event is scoped to.
    #[must_use]
    pub const fn tx_id(&self) -> TxId {
        match self {
            Self::TxStart(p) => p.tx_id,
            Self::TxEnd(p) => p.tx_id,
            Self::StepStart(p) => p.tx_id,
            Self::StepEnd(p) => p.tx_id,
        }
    }
}

/// A validated event envelope, consumed exactly once by the tick loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerEvent {
    /// Unique event identifier.
    pub id: EventId,
    /// When the event was constructed.
    pub created_at: DateTime<Utc>,
    /// Kind-specific payload.
    pub payload: EventPayload,
}

impl SchedulerEvent {
    fn wrap(payload: EventPayload) -> Self {
        Self {
            id: EventId::generate(),
            created_at: Utc::now(),
            payload,
        }
    }

    /// Builds a validated `TX_START` event, allocating the transaction ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] when a mandatory metadata field is
    /// missing or empty, or when `data` is not a JSON object.
    pub fn tx_start(metadata: TxMetadata, data: Value) -> Result<Self> {
        metadata.validate()?;
        if !data.is_object() {
            return Err(Error::InvalidEvent {
                message: "transaction data must be a JSON object".into(),
            });
        }
        Ok(Self::wrap(EventPayload::TxStart(TxStartPayload {
            tx_id: TxId::generate(),
            metadata,
            data,
        })))
    }

    /// Builds a `TX_END` event.
    #[must_use]
    pub fn tx_end(tx_id: TxId) -> Self {
        Self::wrap(EventPayload::TxEnd(TxEndPayload { tx_id }))
    }

    /// Builds a validated `STEP_START` event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] when the callback name or sequence is
    /// empty.
    pub fn step_start(payload: StepStartPayload) -> Result<Self> {
        if payload.callback.trim().is_empty() {
            return Err(Error::InvalidEvent {
                message: "step start callback must be a non-empty string".into(),
            });
        }
        if payload.full_sequence.trim().is_empty() {
            return Err(Error::InvalidEvent {
                message: "step start sequence must be a non-empty string".into(),
            });
        }
        Ok(Self::wrap(EventPayload::StepStart(payload)))
    }

    /// Builds a `STEP_END` event carrying the completion protocol fields.
    #[must_use]
    pub fn step_end(tx_id: TxId, step_id: StepId, completion: CompletionRequest) -> Self {
        Self::wrap(EventPayload::StepEnd(StepEndPayload {
            tx_id,
            step_id,
            completion,
        }))
    }

    /// Returns the event kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_metadata() -> TxMetadata {
        TxMetadata {
            owner: "alice".into(),
            node_group: "default".into(),
            external_id: "ext-1".into(),
            transaction_type: "ping1".into(),
            on_complete: CallbackSpec {
                callback: "notify".into(),
                context: json!({"channel": "web"}),
            },
            on_change: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn tx_start_validates_mandatory_fields() {
        let event = SchedulerEvent::tx_start(valid_metadata(), json!({})).unwrap();
        assert_eq!(event.kind(), EventKind::TxStart);

        let mut missing_owner = valid_metadata();
        missing_owner.owner = "  ".into();
        let err = SchedulerEvent::tx_start(missing_owner, json!({})).unwrap_err();
        assert!(matches!(err, Error::InvalidEvent { .. }));

        let mut missing_callback = valid_metadata();
        missing_callback.on_complete.callback = String::new();
        assert!(SchedulerEvent::tx_start(missing_callback, json!({})).is_err());
    }

    #[test]
    fn tx_start_rejects_non_object_data() {
        let err = SchedulerEvent::tx_start(valid_metadata(), json!("nope")).unwrap_err();
        assert!(matches!(err, Error::InvalidEvent { .. }));
    }

    #[test]
    fn tx_start_allocates_a_transaction_id() {
        let a = SchedulerEvent::tx_start(valid_metadata(), json!({})).unwrap();
        let b = SchedulerEvent::tx_start(valid_metadata(), json!({})).unwrap();
        assert_ne!(a.payload.tx_id(), b.payload.tx_id());
    }

    #[test]
    fn step_start_requires_callback_and_sequence() {
        let payload = StepStartPayload {
            tx_id: TxId::generate(),
            step_id: StepId::generate(),
            parent_step_id: None,
            full_sequence: "00001".into(),
            definition: DefinitionOrRef::Ref("ingest".into()),
            callback: String::new(),
            callback_context: Value::Null,
        };
        assert!(SchedulerEvent::step_start(payload).is_err());
    }

    #[test]
    fn metadata_extra_fields_flatten_through_serde() {
        let json = json!({
            "owner": "alice",
            "nodeGroup": "default",
            "externalId": "ext-1",
            "transactionType": "ping1",
            "onComplete": { "callback": "notify" },
            "tenant": "acme"
        });
        let metadata: TxMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(metadata.extra.get("tenant"), Some(&json!("acme")));
        assert_eq!(metadata.node_group, "default");
    }

    #[test]
    fn event_kinds_have_labels() {
        assert_eq!(EventKind::TxStart.as_label(), "tx_start");
        assert_eq!(EventKind::StepEnd.as_label(), "step_end");
    }

    #[test]
    fn event_payload_serializes_with_kind_tag() {
        let event = SchedulerEvent::tx_end(TxId::generate());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["eventType"], "TX_END");
    }
}
