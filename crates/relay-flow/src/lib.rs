//! # relay-flow
//!
//! Scheduling and step-execution engine for the Relay transaction
//! orchestrator.
//!
//! Callers submit a *transaction* (a named operation plus input payload);
//! the engine resolves it to a *pipeline* (an ordered sequence of steps,
//! each atomic or itself a nested pipeline), executes the steps, tracks
//! progress, and delivers exactly one completion notification back to the
//! caller.
//!
//! ## Core Concepts
//!
//! - **Transaction**: one end-to-end unit of work, driven to a terminal
//!   state by its root step
//! - **Step**: one node of the execution tree; atomic steps run on workers,
//!   pipeline steps sequence their children strictly in declared order
//! - **Event**: the only way anything crosses into the scheduler; the event
//!   queue is the engine's sole synchronization boundary
//! - **Completion token**: the unguessable credential a step must present
//!   to complete; forged or replayed completions are rejected without
//!   visible effect
//!
//! ## Example
//!
//! ```rust,no_run
//! use relay_flow::definition::{DefinitionOrRef, StepDefinition};
//! use relay_flow::config::SchedulerConfig;
//! use relay_flow::error::Result;
//! use relay_flow::event::TxMetadata;
//! use relay_flow::scheduler::Scheduler;
//! use relay_flow::transaction::CallbackSpec;
//! use serde_json::{Map, json};
//!
//! # fn main() -> Result<()> {
//! let mut scheduler = Scheduler::new(SchedulerConfig::default())?;
//! scheduler.register_transaction_type(
//!     "ping1",
//!     DefinitionOrRef::Inline(StepDefinition::atomic("ping")),
//! )?;
//!
//! let metadata = TxMetadata {
//!     owner: "alice".into(),
//!     node_group: "default".into(),
//!     external_id: "order-17".into(),
//!     transaction_type: "ping1".into(),
//!     // The name must be registered via `Scheduler::register_callback`
//!     // before the completion is dispatched.
//!     on_complete: CallbackSpec {
//!         callback: "notify".into(),
//!         context: json!({}),
//!     },
//!     on_change: None,
//!     extra: Map::new(),
//! };
//! let (_tx_id, _reply) = scheduler.submit(metadata, json!({}))?;
//! // Drive the engine: scheduler.run(shutdown).await, or tick() manually.
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod callback;
pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod metrics;
pub mod outbound;
pub mod queue;
pub mod scheduler;
pub mod step;
pub mod steps;
pub mod sync_reply;
pub mod transaction;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cache::{TransactionCache, TransactionDetail};
    pub use crate::callback::{Callback, CallbackRegistry};
    pub use crate::config::SchedulerConfig;
    pub use crate::definition::{
        ChildSpec, DefinitionOrRef, PipelineLibrary, StepDefinition, TransactionTypes,
    };
    pub use crate::error::{Error, Result};
    pub use crate::event::{EventKind, SchedulerEvent, TxMetadata};
    pub use crate::metrics::FlowMetrics;
    pub use crate::outbound::{InMemoryOutbound, OutboundMessage, OutboundSink, QueueAddress};
    pub use crate::queue::{Queue, Ticket};
    pub use crate::scheduler::{EngineCx, EngineState, Scheduler, SchedulerHandle};
    pub use crate::step::{Step, StepCompletion, StepStatus};
    pub use crate::steps::{InvokeOutcome, StepContext, StepRunner, StepRunnerFactory};
    pub use crate::sync_reply::{Reply, ReplyRouter, await_reply};
    pub use crate::transaction::{CallbackSpec, Transaction, TxCompletion, TxStatus};
    pub use crate::worker::{Job, WorkerPool};
}
