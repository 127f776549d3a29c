//! The tick-driven scheduling engine.
//!
//! One scheduler instance owns an incoming event queue, a ready-to-run job
//! queue, a bounded worker pool, and the transaction cache. All of that
//! state is mutated on the tick loop only; workers and external actors
//! reach the engine exclusively by submitting events through a
//! [`SchedulerHandle`], and the event queue is the serialization boundary.
//!
//! Each tick:
//!
//! 1. Frees worker slots whose invocation future has resolved, then pulls
//!    externally submitted events into the event queue.
//! 2. Drains at most the events queued at tick start. Events produced while
//!    handling are processed on the *next* tick, so one tick can never
//!    recurse unboundedly. A failing event is logged and isolated; the tick
//!    survives.
//! 3. Hands one ready job to each idle worker.
//! 4. Evicts expired transactions and updates gauges.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};

use relay_core::observability::scheduler_span;
use relay_core::{CompletionToken, StepId, TxId};

use crate::cache::TransactionCache;
use crate::callback::{Callback, CallbackRegistry, PIPELINE_CHILD_COMPLETE, ROOT_STEP_COMPLETE};
use crate::config::SchedulerConfig;
use crate::definition::{DefinitionOrRef, PipelineLibrary, StepDefinition, TransactionTypes};
use crate::error::{Error, Result};
use crate::event::{
    CompletionRequest, EventPayload, SchedulerEvent, StepEndPayload, StepStartPayload,
    TxEndPayload, TxMetadata, TxStartPayload,
};
use crate::metrics::FlowMetrics;
use crate::outbound::{InMemoryOutbound, OutboundMessage, OutboundSink, QueueAddress};
use crate::queue::Queue;
use crate::step::{
    CallbackRef, PipelineChild, Step, StepCompletion, StepStatus, StepTransition, child_sequence,
};
use crate::steps::{
    DelayRunner, InvokeOutcome, PingRunner, StepContext, StepRunner, StepRunnerFactory,
};
use crate::sync_reply::ReplyRouter;
use crate::transaction::{Transaction, TxCompletion, TxStatus};
use crate::worker::{Job, WorkerPool};

/// Handle for submitting events to a scheduler from any task or thread.
///
/// Submissions land in the scheduler's inbox and become visible to the tick
/// loop at the start of the next tick.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    sender: mpsc::UnboundedSender<SchedulerEvent>,
}

impl SchedulerHandle {
    /// Submits an event.
    ///
    /// # Errors
    ///
    /// Returns an error when the owning scheduler has shut down.
    pub fn submit(&self, event: SchedulerEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| Error::internal("scheduler inbox is closed"))
    }

    /// Presents a step's completion: the protocol entry point for workers,
    /// timers, and external systems.
    ///
    /// # Errors
    ///
    /// Returns an error when the owning scheduler has shut down. Token and
    /// status validation happens on the scheduler side.
    pub fn step_finished(
        &self,
        tx_id: TxId,
        step_id: StepId,
        token: CompletionToken,
        status: StepStatus,
        note: Option<String>,
        output: Value,
    ) -> Result<()> {
        self.submit(SchedulerEvent::step_end(
            tx_id,
            step_id,
            CompletionRequest {
                token,
                status,
                note,
                output,
            },
        ))
    }

    /// Creates a handle wired to a bare receiver instead of a scheduler.
    ///
    /// Used by tests and step implementations exercised in isolation.
    #[must_use]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

/// Mutable engine state owned by the tick loop.
///
/// Callbacks receive this through [`EngineCx`]; everything else reaches it
/// only via the event queue.
pub struct EngineState {
    pub(crate) node_group: String,
    pub(crate) events: Queue<SchedulerEvent>,
    pub(crate) ready: Queue<Job>,
    pub(crate) cache: TransactionCache,
    pub(crate) outbound: Box<dyn OutboundSink>,
    pub(crate) replies: ReplyRouter,
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("node_group", &self.node_group)
            .field("event_queue_depth", &self.events.len())
            .field("ready_queue_depth", &self.ready.len())
            .field("open_reply_slots", &self.replies.open_count())
            .finish_non_exhaustive()
    }
}

impl EngineState {
    /// Returns the node group this scheduler serves.
    #[must_use]
    pub fn node_group(&self) -> &str {
        &self.node_group
    }

    /// Returns the transaction cache.
    #[must_use]
    pub fn cache(&self) -> &TransactionCache {
        &self.cache
    }

    /// Returns the transaction cache mutably.
    pub fn cache_mut(&mut self) -> &mut TransactionCache {
        &mut self.cache
    }

    /// Enqueues an event for the next tick.
    pub fn enqueue_event(&mut self, event: SchedulerEvent) {
        self.events.enqueue(event);
    }
}

/// The context handed to callbacks: engine state plus the registry and
/// metrics needed to continue the completion chain.
pub struct EngineCx<'a> {
    /// Mutable engine state.
    pub state: &'a mut EngineState,
    /// The callback registry, for invoking further continuations by name.
    pub registry: &'a CallbackRegistry,
    /// Metrics recorder.
    pub metrics: &'a FlowMetrics,
}

/// Parameters of the step creation protocol.
struct InvokeStep {
    tx_id: TxId,
    step_id: StepId,
    parent_step_id: Option<StepId>,
    full_sequence: String,
    definition: DefinitionOrRef,
    input: Value,
    on_complete: CallbackRef,
}

/// The tick-driven scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: CallbackRegistry,
    runners: StepRunnerFactory,
    pipelines: PipelineLibrary,
    tx_types: TransactionTypes,
    metrics: FlowMetrics,
    state: EngineState,
    workers: WorkerPool,
    inbox: mpsc::UnboundedReceiver<SchedulerEvent>,
    handle: SchedulerHandle,
}

impl Scheduler {
    /// Creates a scheduler with the built-in callbacks and step runners
    /// pre-registered, and an in-memory outbound sink.
    ///
    /// # Errors
    ///
    /// Returns an error if a built-in registration collides, which would
    /// indicate a packaging defect.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        Self::with_outbound(config, Box::new(InMemoryOutbound::new()))
    }

    /// Creates a scheduler delivering cross-node messages to `outbound`.
    ///
    /// # Errors
    ///
    /// Returns an error if a built-in registration collides.
    pub fn with_outbound(
        config: SchedulerConfig,
        outbound: Box<dyn OutboundSink>,
    ) -> Result<Self> {
        let (sender, inbox) = mpsc::unbounded_channel();

        let mut registry = CallbackRegistry::new();
        registry.register(ROOT_STEP_COMPLETE, Arc::new(RootStepComplete))?;
        registry.register(PIPELINE_CHILD_COMPLETE, Arc::new(PipelineChildComplete))?;

        let mut runners = StepRunnerFactory::new();
        runners.register("ping", Arc::new(PingRunner))?;
        runners.register("delay", Arc::new(DelayRunner))?;

        let state = EngineState {
            node_group: config.node_group.clone(),
            events: Queue::new(),
            ready: Queue::new(),
            cache: TransactionCache::new(config.cache_retention),
            outbound,
            replies: ReplyRouter::new(),
        };

        Ok(Self {
            workers: WorkerPool::new(config.worker_count),
            config,
            registry,
            runners,
            pipelines: PipelineLibrary::new(),
            tx_types: TransactionTypes::new(),
            metrics: FlowMetrics::new(),
            state,
            inbox,
            handle: SchedulerHandle { sender },
        })
    }

    /// Returns a submission handle for workers and external actors.
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Returns the transaction cache, for status and listing queries.
    #[must_use]
    pub fn cache(&self) -> &TransactionCache {
        &self.state.cache
    }

    /// Returns a transaction's status, `UNKNOWN` when it is not cached.
    #[must_use]
    pub fn transaction_status(&self, tx_id: TxId) -> TxStatus {
        self.state
            .cache
            .transaction(tx_id)
            .map_or(TxStatus::Unknown, |tx| tx.status)
    }

    /// Registers a caller callback name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateCallback`] if the name is taken.
    pub fn register_callback(
        &mut self,
        name: impl Into<String>,
        callback: Arc<dyn Callback>,
    ) -> Result<()> {
        self.registry.register(name, callback)
    }

    /// Registers a step runner for a step type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateStepType`] if the type is taken.
    pub fn register_step_runner(
        &mut self,
        step_type: impl Into<String>,
        runner: Arc<dyn StepRunner>,
    ) -> Result<()> {
        self.runners.register(step_type, runner)
    }

    /// Registers a pipeline definition under a name and version.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicates or non-pipeline definitions.
    pub fn register_pipeline(
        &mut self,
        name: impl Into<String>,
        version: u32,
        definition: StepDefinition,
    ) -> Result<()> {
        self.pipelines.register(name, version, definition)
    }

    /// Registers a transaction type and the definition its root step runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateTransactionType`] if the name is taken.
    pub fn register_transaction_type(
        &mut self,
        name: impl Into<String>,
        root: DefinitionOrRef,
    ) -> Result<()> {
        self.tx_types.register(name, root)
    }

    /// Validates and enqueues an event.
    ///
    /// Validation failures are synchronous contract errors to the caller;
    /// nothing is enqueued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTransactionType`] or
    /// [`Error::UnknownPipeline`] when the event references something the
    /// scheduler cannot resolve.
    pub fn event(&mut self, event: SchedulerEvent) -> Result<()> {
        match &event.payload {
            EventPayload::TxStart(payload) => {
                let root = self.tx_types.resolve(&payload.metadata.transaction_type)?;
                if let DefinitionOrRef::Ref(reference) = root {
                    self.pipelines.resolve(reference)?;
                }
            }
            EventPayload::StepStart(payload) => {
                if let DefinitionOrRef::Ref(reference) = &payload.definition {
                    self.pipelines.resolve(reference)?;
                }
            }
            EventPayload::TxEnd(_) | EventPayload::StepEnd(_) => {}
        }
        self.state.events.enqueue(event);
        Ok(())
    }

    /// Submits a transaction and opens its synchronous-reply slot.
    ///
    /// Returns the allocated transaction ID and the receiver a caller can
    /// await (time-boxed) for the completion; see
    /// [`await_reply`](crate::sync_reply::await_reply).
    ///
    /// # Errors
    ///
    /// Propagates event validation errors; nothing is enqueued on failure.
    pub fn submit(
        &mut self,
        metadata: TxMetadata,
        data: Value,
    ) -> Result<(TxId, oneshot::Receiver<TxCompletion>)> {
        let event = SchedulerEvent::tx_start(metadata, data)?;
        let tx_id = event.payload.tx_id();
        self.event(event)?;
        let receiver = self.state.replies.register(tx_id)?;
        Ok((tx_id, receiver))
    }

    /// Runs one tick. Requires a Tokio runtime context for job spawning.
    pub fn tick(&mut self) {
        let span = scheduler_span("tick", &self.state.node_group);
        let _guard = span.enter();
        let started = Instant::now();

        self.workers.reap_finished();
        while let Ok(event) = self.inbox.try_recv() {
            self.state.events.enqueue(event);
        }

        // One pass over the events present now; later arrivals wait a tick.
        let pending = self.state.events.len();
        for _ in 0..pending {
            let Some(event) = self.state.events.dequeue() else {
                break;
            };
            let kind = event.kind().as_label();
            let event_id = event.id;
            match self.dispatch_event(event) {
                Ok(()) => self.metrics.record_event(kind, "ok"),
                Err(error) => {
                    self.metrics.record_event(kind, "error");
                    tracing::error!(kind, %event_id, %error, "event handling failed");
                }
            }
        }

        loop {
            let Some(slot) = self.workers.free_slot() else {
                break;
            };
            let Some(job) = self.state.ready.dequeue() else {
                break;
            };
            let step_id = job.step_id;
            if let Err(error) = self.start_job(slot, job) {
                tracing::error!(%step_id, %error, "job start failed");
            }
        }

        self.state.cache.evict_expired(Utc::now());

        self.metrics.set_event_queue_depth(self.state.events.len());
        self.metrics.set_ready_queue_depth(self.state.ready.len());
        self.metrics.set_busy_workers(self.workers.busy_count());
        self.metrics
            .set_active_transactions(self.state.cache.active_count());
        self.metrics.observe_tick_duration(started.elapsed());
    }

    /// Runs the tick loop until `shutdown` flips to true.
    ///
    /// A single interval timer drives the loop; at most one tick is ever in
    /// flight.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(node_group = %self.state.node_group, "scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(node_group = %self.state.node_group, "scheduler stopped");
    }

    fn cx(&mut self) -> EngineCx<'_> {
        EngineCx {
            state: &mut self.state,
            registry: &self.registry,
            metrics: &self.metrics,
        }
    }

    fn dispatch_event(&mut self, event: SchedulerEvent) -> Result<()> {
        match event.payload {
            EventPayload::TxStart(payload) => self.handle_tx_start(payload),
            EventPayload::TxEnd(payload) => self.handle_tx_end(payload),
            EventPayload::StepStart(payload) => self.handle_step_start(payload),
            EventPayload::StepEnd(payload) => self.handle_step_end(payload),
        }
    }

    #[tracing::instrument(skip(self, payload), fields(tx_id = %payload.tx_id, transaction_type = %payload.metadata.transaction_type))]
    fn handle_tx_start(&mut self, payload: TxStartPayload) -> Result<()> {
        let TxStartPayload {
            tx_id,
            metadata,
            data,
        } = payload;

        let root_definition = self.tx_types.resolve(&metadata.transaction_type)?.clone();
        let root_step_id = StepId::generate();

        let mut transaction = Transaction::new(tx_id, &metadata, data.clone());
        transaction.root_step_id = Some(root_step_id);
        transaction.touch();
        self.state.cache.insert_transaction(transaction)?;

        // The root continuation runs on the executing node; it is the
        // TX_END it produces that gets addressed to the originating node
        // group (which may differ, see `RootStepComplete`).
        self.invoke_step(InvokeStep {
            tx_id,
            step_id: root_step_id,
            parent_step_id: None,
            full_sequence: child_sequence("", 1),
            definition: root_definition,
            input: data,
            on_complete: CallbackRef {
                node_group: self.state.node_group.clone(),
                callback: ROOT_STEP_COMPLETE.into(),
                context: json!({ "txId": tx_id }),
            },
        })
    }

    #[tracing::instrument(skip(self, payload), fields(tx_id = %payload.tx_id))]
    fn handle_tx_end(&mut self, payload: TxEndPayload) -> Result<()> {
        let TxEndPayload { tx_id } = payload;

        let (completion, on_complete) = {
            let transaction = self
                .state
                .cache
                .transaction_mut(tx_id)
                .ok_or(Error::UnknownTransaction { tx_id })?;
            if !transaction.claim_completion_delivery() {
                tracing::warn!(%tx_id, "duplicate TX_END ignored");
                return Ok(());
            }
            (
                TxCompletion {
                    tx_id,
                    status: transaction.status,
                    output: transaction.transaction_output.clone(),
                },
                transaction.on_complete.clone(),
            )
        };

        self.state.replies.resolve(tx_id, completion.clone());

        let data = serde_json::to_value(&completion).map_err(|e| Error::Serialization {
            message: format!("failed to serialize transaction completion: {e}"),
        })?;
        let registry = &self.registry;
        let mut cx = EngineCx {
            state: &mut self.state,
            registry,
            metrics: &self.metrics,
        };
        registry.call(&on_complete.callback, &mut cx, &on_complete.context, &data)
    }

    #[tracing::instrument(skip(self, payload), fields(tx_id = %payload.tx_id, step_id = %payload.step_id))]
    fn handle_step_start(&mut self, payload: StepStartPayload) -> Result<()> {
        let input = self.resolve_step_input(&payload)?;
        self.invoke_step(InvokeStep {
            tx_id: payload.tx_id,
            step_id: payload.step_id,
            parent_step_id: payload.parent_step_id,
            full_sequence: payload.full_sequence,
            definition: payload.definition,
            input,
            on_complete: CallbackRef {
                node_group: self.state.node_group.clone(),
                callback: payload.callback,
                context: payload.callback_context,
            },
        })
    }

    #[tracing::instrument(skip(self, payload), fields(tx_id = %payload.tx_id, step_id = %payload.step_id))]
    fn handle_step_end(&mut self, payload: StepEndPayload) -> Result<()> {
        let StepEndPayload {
            tx_id,
            step_id,
            completion,
        } = payload;
        let mut cx = self.cx();
        complete_step(
            &mut cx,
            Some(tx_id),
            step_id,
            &completion.token,
            completion.status,
            completion.note,
            completion.output,
        )
    }

    /// Computes a step's input: the transaction input for a root step, the
    /// pipeline's own input for a first child, the previous child's output
    /// otherwise (strict sequential data threading).
    fn resolve_step_input(&self, payload: &StepStartPayload) -> Result<Value> {
        match payload.parent_step_id {
            None => {
                let transaction = self
                    .state
                    .cache
                    .transaction(payload.tx_id)
                    .ok_or(Error::UnknownTransaction {
                        tx_id: payload.tx_id,
                    })?;
                Ok(transaction.input_data.clone())
            }
            Some(parent_step_id) => {
                let parent = self.state.cache.step(parent_step_id).ok_or_else(|| {
                    Error::internal(format!("pipeline parent {parent_step_id} is not cached"))
                })?;
                let index = parent.index_of_current_child;
                if index == 0 {
                    return Ok(parent.step_input.clone());
                }
                let previous = parent.children.get(index - 1).ok_or_else(|| {
                    Error::internal(format!(
                        "pipeline {parent_step_id} has no child at index {}",
                        index - 1
                    ))
                })?;
                let previous_step =
                    self.state.cache.step(previous.step_id).ok_or_else(|| {
                        Error::internal(format!(
                            "pipeline child {} is not cached",
                            previous.step_id
                        ))
                    })?;
                Ok(previous_step.step_output.clone())
            }
        }
    }

    /// The step creation protocol.
    ///
    /// Resolves the definition, validates the runner exists, registers the
    /// step *before* invocation (so a synchronous inline completion can
    /// already find it), then invokes: pipelines are sequenced by the
    /// engine, atomic steps are queued for a worker.
    fn invoke_step(&mut self, spec: InvokeStep) -> Result<()> {
        let resolved = match spec.definition {
            DefinitionOrRef::Inline(definition) => definition,
            DefinitionOrRef::Ref(reference) => self.pipelines.resolve(&reference)?.clone(),
        };
        if !resolved.is_pipeline() {
            // Validate before registering; an unknown step type must not
            // leave a step record behind.
            self.runners.get(&resolved.step_type)?;
        }

        let mut step = Step::new(
            spec.step_id,
            spec.tx_id,
            spec.parent_step_id,
            spec.full_sequence,
            resolved.step_type.clone(),
            spec.input.clone(),
            spec.on_complete,
        );
        step.description = resolved.description.clone();
        if resolved.is_pipeline() {
            step.children = resolved
                .sorted_children()
                .into_iter()
                .map(|child| PipelineChild {
                    step_id: StepId::generate(),
                    spec: child.clone(),
                })
                .collect();
        }
        let token = step.completion_token.clone();

        self.state.cache.register_step(step)?;
        if let Some(transaction) = self.state.cache.transaction_mut(spec.tx_id) {
            transaction.touch();
        }

        if resolved.is_pipeline() {
            self.invoke_pipeline(spec.tx_id, spec.step_id)
        } else {
            self.state.ready.enqueue(Job {
                tx_id: spec.tx_id,
                step_id: spec.step_id,
                step_type: resolved.step_type,
                input: spec.input,
                params: resolved.params,
                token,
            });
            Ok(())
        }
    }

    /// Invokes a pipeline step: starts the first child, or completes inline
    /// when the pipeline has no children.
    fn invoke_pipeline(&mut self, tx_id: TxId, step_id: StepId) -> Result<()> {
        let (first_child, full_sequence, own_token, own_input) = {
            let step = self
                .state
                .cache
                .step_mut(step_id)
                .ok_or_else(|| Error::internal(format!("pipeline {step_id} is not cached")))?;
            step.begin()?;
            (
                step.children
                    .first()
                    .map(|child| (child.step_id, child.spec.definition.clone())),
                step.full_sequence.clone(),
                step.completion_token.clone(),
                step.step_input.clone(),
            )
        };
        if let Some(transaction) = self.state.cache.transaction_mut(tx_id) {
            transaction.touch();
        }
        self.metrics.record_step_transition(
            StepStatus::Sleeping.as_label(),
            StepStatus::Running.as_label(),
        );
        self.notify_change(tx_id, step_id, StepStatus::Running);

        match first_child {
            None => {
                // An empty pipeline completes synchronously, inline, during
                // its own invocation; register-before-invoke makes this safe.
                let mut cx = self.cx();
                complete_step(
                    &mut cx,
                    None,
                    step_id,
                    &own_token,
                    StepStatus::Success,
                    None,
                    own_input,
                )
            }
            Some((child_step_id, definition)) => {
                let event = SchedulerEvent::step_start(StepStartPayload {
                    tx_id,
                    step_id: child_step_id,
                    parent_step_id: Some(step_id),
                    full_sequence: child_sequence(&full_sequence, 1),
                    definition,
                    callback: PIPELINE_CHILD_COMPLETE.into(),
                    callback_context: json!({
                        "txId": tx_id,
                        "parentStepId": step_id,
                        "childIndex": 0,
                    }),
                })?;
                self.state.events.enqueue(event);
                Ok(())
            }
        }
    }

    /// Hands one job to a free worker slot.
    fn start_job(&mut self, slot: usize, job: Job) -> Result<()> {
        {
            let step = self
                .state
                .cache
                .step_mut(job.step_id)
                .ok_or_else(|| Error::internal(format!("job step {} is not cached", job.step_id)))?;
            step.begin()?;
        }
        if let Some(transaction) = self.state.cache.transaction_mut(job.tx_id) {
            transaction.touch();
        }
        self.metrics.record_step_transition(
            StepStatus::Sleeping.as_label(),
            StepStatus::Running.as_label(),
        );
        self.notify_change(job.tx_id, job.step_id, StepStatus::Running);

        let runner = self.runners.get(&job.step_type)?;
        let handle = self.handle.clone();
        let Job {
            tx_id,
            step_id,
            input,
            params,
            token,
            ..
        } = job;
        let context = StepContext {
            tx_id,
            step_id,
            input,
            params,
            token: token.clone(),
            handle: handle.clone(),
        };

        let join = tokio::spawn(async move {
            match runner.invoke(context).await {
                Ok(InvokeOutcome::Completed {
                    status,
                    output,
                    note,
                }) => {
                    if let Err(error) =
                        handle.step_finished(tx_id, step_id, token, status, note, output)
                    {
                        tracing::warn!(%tx_id, %step_id, %error, "completion not delivered");
                    }
                }
                Ok(InvokeOutcome::Pending) => {}
                Err(error) => {
                    tracing::error!(%tx_id, %step_id, %error, "step invocation failed");
                    let _ = handle.step_finished(
                        tx_id,
                        step_id,
                        token,
                        StepStatus::InternalError,
                        Some(error.to_string()),
                        Value::Null,
                    );
                }
            }
        });
        self.workers.start(slot, step_id, join);
        Ok(())
    }

    /// Fires the transaction's `on_change` callback, if any. Advisory: a
    /// failure is logged and never affects the transaction outcome.
    fn notify_change(&mut self, tx_id: TxId, step_id: StepId, status: StepStatus) {
        let registry = &self.registry;
        let mut cx = EngineCx {
            state: &mut self.state,
            registry,
            metrics: &self.metrics,
        };
        let transition = StepTransition {
            tx_id,
            step_id,
            status,
        };
        fire_on_change(&mut cx, tx_id, &transition);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("node_group", &self.state.node_group)
            .field("event_queue_depth", &self.state.events.len())
            .field("ready_queue_depth", &self.state.ready.len())
            .field("busy_workers", &self.workers.busy_count())
            .finish_non_exhaustive()
    }
}

/// The step completion protocol: the single write path for terminal status.
///
/// Validates the presented token against the issued one, rejects
/// re-completion of terminal steps, records status/note/output, bumps the
/// transaction version, fires `on_change`, and delivers the step's
/// `on_complete` callback by name (locally, or through the outbound sink
/// when the callback is addressed to another node group).
///
/// # Errors
///
/// Security rejections ([`Error::UnknownStep`],
/// [`Error::CompletionTokenMismatch`]) and at-most-once rejections
/// ([`Error::StepAlreadyTerminal`]) leave all state unchanged.
pub(crate) fn complete_step(
    cx: &mut EngineCx<'_>,
    expected_tx: Option<TxId>,
    step_id: StepId,
    presented: &CompletionToken,
    status: StepStatus,
    note: Option<String>,
    output: Value,
) -> Result<()> {
    let (from_label, tx_id, on_complete, completion) = {
        let Some(step) = cx.state.cache.step_mut(step_id) else {
            cx.metrics.record_completion_rejected("unknown_step");
            let error = Error::UnknownStep { step_id };
            tracing::error!(%step_id, %error, "rejected completion");
            return Err(error);
        };
        if expected_tx.is_some_and(|tx_id| tx_id != step.tx_id) {
            // A valid step ID under the wrong transaction is as suspicious
            // as an unknown one; reveal nothing more.
            cx.metrics.record_completion_rejected("unknown_step");
            let error = Error::UnknownStep { step_id };
            tracing::error!(%step_id, %error, "rejected completion");
            return Err(error);
        }

        let from_label = step.status.as_label();
        if let Err(error) = step.try_complete(presented, status, note, output) {
            let reason = match &error {
                Error::CompletionTokenMismatch { .. } => "token_mismatch",
                Error::StepAlreadyTerminal { .. } => "already_terminal",
                _ => "invalid_transition",
            };
            cx.metrics.record_completion_rejected(reason);
            if error.is_security() {
                tracing::error!(%step_id, %error, "rejected completion");
            } else {
                tracing::warn!(%step_id, %error, "rejected completion");
            }
            return Err(error);
        }

        (
            from_label,
            step.tx_id,
            step.on_complete.clone(),
            StepCompletion {
                tx_id: step.tx_id,
                step_id,
                status,
                note: step.note.clone(),
                output: step.step_output.clone(),
            },
        )
    };

    cx.metrics
        .record_step_transition(from_label, status.as_label());
    if let Some(transaction) = cx.state.cache.transaction_mut(tx_id) {
        transaction.touch();
    }

    let transition = StepTransition {
        tx_id,
        step_id,
        status,
    };
    fire_on_change(cx, tx_id, &transition);

    let data = serde_json::to_value(&completion).map_err(|e| Error::Serialization {
        message: format!("failed to serialize step completion: {e}"),
    })?;
    if on_complete.node_group == cx.state.node_group {
        let registry = cx.registry;
        registry.call(&on_complete.callback, cx, &on_complete.context, &data)
    } else {
        cx.state.outbound.deliver(
            QueueAddress::default_for(on_complete.node_group),
            OutboundMessage::Callback {
                callback: on_complete.callback,
                context: on_complete.context,
                data,
            },
        )
    }
}

/// Fires the transaction's `on_change` callback for one step transition.
fn fire_on_change(cx: &mut EngineCx<'_>, tx_id: TxId, transition: &StepTransition) {
    let Some(spec) = cx
        .state
        .cache
        .transaction(tx_id)
        .and_then(|transaction| transaction.on_change.clone())
    else {
        return;
    };

    let data = match serde_json::to_value(transition) {
        Ok(data) => data,
        Err(error) => {
            tracing::warn!(%tx_id, %error, "on_change payload serialization failed");
            return;
        }
    };
    let registry = cx.registry;
    if let Err(error) = registry.call(&spec.callback, cx, &spec.context, &data) {
        tracing::warn!(%tx_id, %error, "on_change callback failed");
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RootCompleteContext {
    tx_id: TxId,
}

/// Built-in continuation for root steps: copies the root's terminal status
/// and output onto the transaction, then enqueues `TX_END` addressed to the
/// node group that originally started the transaction.
struct RootStepComplete;

impl Callback for RootStepComplete {
    fn invoke(&self, cx: &mut EngineCx<'_>, context: &Value, data: &Value) -> Result<()> {
        let ctx: RootCompleteContext =
            serde_json::from_value(context.clone()).map_err(|e| {
                Error::internal(format!("malformed root completion context: {e}"))
            })?;
        let completion: StepCompletion = serde_json::from_value(data.clone())
            .map_err(|e| Error::internal(format!("malformed step completion: {e}")))?;

        let origin_group = {
            let transaction = cx
                .state
                .cache
                .transaction_mut(ctx.tx_id)
                .ok_or(Error::UnknownTransaction { tx_id: ctx.tx_id })?;
            transaction.transaction_output = completion.output.clone();
            transaction.set_status(TxStatus::from_step_terminal(completion.status)?)?;
            transaction.node_group.clone()
        };

        let event = SchedulerEvent::tx_end(ctx.tx_id);
        if origin_group == cx.state.node_group {
            cx.state.events.enqueue(event);
            Ok(())
        } else {
            cx.state.outbound.deliver(
                QueueAddress::default_for(origin_group),
                OutboundMessage::Event(event),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipelineChildContext {
    tx_id: TxId,
    parent_step_id: StepId,
    child_index: usize,
}

/// Built-in continuation for pipeline children.
///
/// On child success the pipeline advances: the next child starts with the
/// previous child's output as input, or, when no children remain, the
/// pipeline adopts the last child's status and output as its own. On child
/// failure, abort, or internal error the pipeline does not roll back
/// already-completed children; it adopts the child's outcome immediately
/// and propagates upward.
struct PipelineChildComplete;

impl Callback for PipelineChildComplete {
    fn invoke(&self, cx: &mut EngineCx<'_>, context: &Value, data: &Value) -> Result<()> {
        let ctx: PipelineChildContext =
            serde_json::from_value(context.clone()).map_err(|e| {
                Error::internal(format!("malformed pipeline child context: {e}"))
            })?;
        let completion: StepCompletion = serde_json::from_value(data.clone())
            .map_err(|e| Error::internal(format!("malformed step completion: {e}")))?;

        match completion.status {
            StepStatus::Success => {
                let (next_child, parent_sequence, parent_token) = {
                    let parent = cx
                        .state
                        .cache
                        .step_mut(ctx.parent_step_id)
                        .ok_or_else(|| {
                            Error::internal(format!(
                                "pipeline {} is not cached",
                                ctx.parent_step_id
                            ))
                        })?;
                    parent.index_of_current_child = ctx.child_index + 1;
                    (
                        parent
                            .children
                            .get(ctx.child_index + 1)
                            .map(|child| (child.step_id, child.spec.definition.clone())),
                        parent.full_sequence.clone(),
                        parent.completion_token.clone(),
                    )
                };
                if let Some(transaction) = cx.state.cache.transaction_mut(ctx.tx_id) {
                    transaction.touch();
                }

                match next_child {
                    Some((child_step_id, definition)) => {
                        let next_index = ctx.child_index + 1;
                        let local_seq = u32::try_from(next_index + 1).map_err(|_| {
                            Error::internal("pipeline child index overflow".to_string())
                        })?;
                        let event = SchedulerEvent::step_start(StepStartPayload {
                            tx_id: ctx.tx_id,
                            step_id: child_step_id,
                            parent_step_id: Some(ctx.parent_step_id),
                            full_sequence: child_sequence(&parent_sequence, local_seq),
                            definition,
                            callback: PIPELINE_CHILD_COMPLETE.into(),
                            callback_context: json!({
                                "txId": ctx.tx_id,
                                "parentStepId": ctx.parent_step_id,
                                "childIndex": next_index,
                            }),
                        })?;
                        cx.state.events.enqueue(event);
                        Ok(())
                    }
                    None => complete_step(
                        cx,
                        None,
                        ctx.parent_step_id,
                        &parent_token,
                        StepStatus::Success,
                        completion.note,
                        completion.output,
                    ),
                }
            }
            StepStatus::Failed | StepStatus::Aborted | StepStatus::InternalError => {
                let parent_token = cx
                    .state
                    .cache
                    .step(ctx.parent_step_id)
                    .map(|parent| parent.completion_token.clone())
                    .ok_or_else(|| {
                        Error::internal(format!(
                            "pipeline {} is not cached",
                            ctx.parent_step_id
                        ))
                    })?;
                complete_step(
                    cx,
                    None,
                    ctx.parent_step_id,
                    &parent_token,
                    completion.status,
                    completion.note,
                    completion.output,
                )
            }
            StepStatus::Sleeping | StepStatus::Running => Err(Error::internal(format!(
                "pipeline child {} reported non-terminal status {}",
                completion.step_id, completion.status
            ))),
        }
    }
}
