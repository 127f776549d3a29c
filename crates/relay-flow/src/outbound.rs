//! Outbound routing of completion and continuation messages by node group.
//!
//! A completion addressed to another node group cannot be applied locally;
//! it is handed to an [`OutboundSink`] keyed by `(node_group, queue_class)`.
//! Within one node group a single default queue class is used unless the
//! sender says otherwise.
//!
//! Delivery is intentionally synchronous: the scheduler stays deterministic
//! and side-effect free, while the sink implementation decides how and when
//! messages actually move.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::event::SchedulerEvent;

/// The queue class used when the sender does not specify one.
pub const DEFAULT_QUEUE_CLASS: &str = "default";

/// Destination of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueAddress {
    /// Node group that must handle the message.
    pub node_group: String,
    /// Queue class within the node group.
    pub queue_class: String,
}

impl QueueAddress {
    /// Creates an address with an explicit queue class.
    #[must_use]
    pub fn new(node_group: impl Into<String>, queue_class: impl Into<String>) -> Self {
        Self {
            node_group: node_group.into(),
            queue_class: queue_class.into(),
        }
    }

    /// Creates an address using the node group's default queue.
    #[must_use]
    pub fn default_for(node_group: impl Into<String>) -> Self {
        Self::new(node_group, DEFAULT_QUEUE_CLASS)
    }
}

impl std::fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node_group, self.queue_class)
    }
}

/// A message routed to another node group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A scheduler event to enqueue on the receiving node.
    Event(SchedulerEvent),
    /// A callback invocation to perform on the receiving node.
    Callback {
        /// Registered callback name.
        callback: String,
        /// Stored callback context.
        context: Value,
        /// Completion data.
        data: Value,
    },
}

/// Sink for messages addressed to other node groups.
pub trait OutboundSink: Send {
    /// Delivers one message to an address.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot accept the message.
    fn deliver(&mut self, address: QueueAddress, message: OutboundMessage) -> Result<()>;
}

/// In-memory outbound sink for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryOutbound {
    queues: HashMap<QueueAddress, VecDeque<OutboundMessage>>,
}

impl InMemoryOutbound {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains and returns all messages queued for an address.
    pub fn take(&mut self, address: &QueueAddress) -> Vec<OutboundMessage> {
        self.queues
            .get_mut(address)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Returns the number of messages queued for an address.
    #[must_use]
    pub fn depth(&self, address: &QueueAddress) -> usize {
        self.queues.get(address).map_or(0, VecDeque::len)
    }
}

impl OutboundSink for InMemoryOutbound {
    fn deliver(&mut self, address: QueueAddress, message: OutboundMessage) -> Result<()> {
        self.queues.entry(address).or_default().push_back(message);
        Ok(())
    }
}
