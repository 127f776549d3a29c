//! End-to-end scheduler scenarios: transaction lifecycles, pipeline
//! sequencing, completion-token enforcement, and delivery guarantees.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value, json};

use relay_core::{CompletionToken, TxId};
use relay_flow::callback::Callback;
use relay_flow::config::SchedulerConfig;
use relay_flow::definition::{ChildSpec, DefinitionOrRef, StepDefinition};
use relay_flow::error::Result;
use relay_flow::event::TxMetadata;
use relay_flow::outbound::{OutboundMessage, OutboundSink, QueueAddress};
use relay_flow::scheduler::{EngineCx, Scheduler};
use relay_flow::step::{StepStatus, StepTransition};
use relay_flow::steps::{InvokeOutcome, StepContext, StepRunner};
use relay_flow::sync_reply::{Reply, await_reply};
use relay_flow::transaction::{CallbackSpec, TxCompletion, TxStatus};

const DONE_CALLBACK: &str = "test_done";

fn metadata(transaction_type: &str) -> TxMetadata {
    TxMetadata {
        owner: "alice".into(),
        node_group: "default".into(),
        external_id: "ext-1".into(),
        transaction_type: transaction_type.into(),
        on_complete: CallbackSpec {
            callback: DONE_CALLBACK.into(),
            context: Value::Null,
        },
        on_change: None,
        extra: Map::new(),
    }
}

/// Records transaction completions in arrival order.
struct DoneCapture {
    completions: Mutex<Vec<TxCompletion>>,
}

impl DoneCapture {
    fn install(scheduler: &mut Scheduler) -> Arc<Self> {
        let capture = Arc::new(Self {
            completions: Mutex::new(Vec::new()),
        });
        scheduler
            .register_callback(DONE_CALLBACK, capture.clone())
            .expect("callback name free");
        capture
    }

    fn completions(&self) -> Vec<TxCompletion> {
        self.completions.lock().expect("capture lock").clone()
    }
}

impl Callback for DoneCapture {
    fn invoke(&self, _cx: &mut EngineCx<'_>, _context: &Value, data: &Value) -> Result<()> {
        let completion: TxCompletion = serde_json::from_value(data.clone())
            .map_err(|e| relay_flow::error::Error::internal(e.to_string()))?;
        self.completions
            .lock()
            .expect("capture lock")
            .push(completion);
        Ok(())
    }
}

/// Returns `Pending` and parks its context for the test to complete later.
#[derive(Debug)]
struct HoldRunner {
    held: Arc<Mutex<Vec<StepContext>>>,
}

#[async_trait::async_trait]
impl StepRunner for HoldRunner {
    async fn invoke(&self, ctx: StepContext) -> Result<InvokeOutcome> {
        self.held.lock().expect("hold lock").push(ctx);
        Ok(InvokeOutcome::Pending)
    }
}

/// Fails immediately with a recognizable output.
#[derive(Debug)]
struct FailRunner;

#[async_trait::async_trait]
impl StepRunner for FailRunner {
    async fn invoke(&self, _ctx: StepContext) -> Result<InvokeOutcome> {
        Ok(InvokeOutcome::Completed {
            status: StepStatus::Failed,
            output: json!({"failedBy": "fail-step"}),
            note: Some("deliberate failure".into()),
        })
    }
}

/// Ticks the scheduler until `done` holds, or panics after `max_ticks`.
async fn drive<F>(scheduler: &mut Scheduler, max_ticks: usize, mut done: F)
where
    F: FnMut(&Scheduler) -> bool,
{
    for _ in 0..max_ticks {
        scheduler.tick();
        if done(scheduler) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("scenario did not settle within {max_ticks} ticks");
}

fn ping_child(id: &str) -> ChildSpec {
    ChildSpec::new(id, DefinitionOrRef::Inline(StepDefinition::atomic("ping")))
}

#[tokio::test]
async fn ping_transaction_completes_with_marker() -> Result<()> {
    let mut scheduler = Scheduler::new(SchedulerConfig::default())?;
    scheduler.register_transaction_type(
        "ping1",
        DefinitionOrRef::Inline(StepDefinition::atomic("ping")),
    )?;
    let capture = DoneCapture::install(&mut scheduler);

    let (tx_id, _reply) = scheduler.submit(metadata("ping1"), json!({"probe": 7}))?;

    drive(&mut scheduler, 100, |_| !capture.completions().is_empty()).await;

    let completions = capture.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].tx_id, tx_id);
    assert_eq!(completions[0].status, TxStatus::Complete);
    assert_eq!(completions[0].output["ping"], "pong");

    // The callback fires exactly once; further ticks deliver nothing new.
    for _ in 0..5 {
        scheduler.tick();
    }
    assert_eq!(capture.completions().len(), 1);
    assert_eq!(scheduler.transaction_status(tx_id), TxStatus::Complete);
    Ok(())
}

/// Runs the two-child pipeline scenario and returns the final
/// `sequence_of_update` for reproducibility checks.
async fn run_pair_pipeline() -> Result<u64> {
    let mut scheduler = Scheduler::new(SchedulerConfig::default())?;
    scheduler.register_transaction_type(
        "pair",
        DefinitionOrRef::Inline(StepDefinition::pipeline(vec![
            ping_child("first"),
            ping_child("second"),
        ])),
    )?;
    let capture = DoneCapture::install(&mut scheduler);

    let (tx_id, _reply) = scheduler.submit(metadata("pair"), json!({"seed": 1}))?;
    drive(&mut scheduler, 200, |_| !capture.completions().is_empty()).await;

    let completions = capture.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].status, TxStatus::Complete);

    // Exactly three step records: the root pipeline and its two children.
    let steps = scheduler.cache().list_steps(tx_id);
    assert_eq!(steps.len(), 3);

    let root = steps[0];
    assert!(root.is_pipeline());
    assert_eq!(root.children.len(), 2);
    assert_eq!(root.parent_step_id, None);
    assert_eq!(root.full_sequence, "00001");

    for (leaf, expected_sequence) in steps[1..].iter().zip(["00001.00001", "00001.00002"]) {
        assert_eq!(leaf.parent_step_id, Some(root.step_id));
        assert_eq!(leaf.full_sequence, expected_sequence);
        assert_eq!(leaf.status, StepStatus::Success);
        assert_eq!(leaf.level, 2);
    }

    // Strict sequential data threading: the second child received the first
    // child's output, and the pipeline adopted the second child's output.
    assert_eq!(completions[0].output["ping"], "pong");
    assert_eq!(completions[0].output["input"]["ping"], "pong");
    assert_eq!(completions[0].output["input"]["input"], json!({"seed": 1}));

    let transaction = scheduler
        .cache()
        .transaction(tx_id)
        .expect("transaction retained");
    Ok(transaction.sequence_of_update)
}

#[tokio::test]
async fn pipeline_structure_and_update_count_are_reproducible() -> Result<()> {
    let first = run_pair_pipeline().await?;
    let second = run_pair_pipeline().await?;
    assert!(first > 0);
    assert_eq!(first, second);
    Ok(())
}

#[tokio::test]
async fn single_worker_batch_completes_in_submission_order() -> Result<()> {
    let mut scheduler = Scheduler::new(SchedulerConfig::default().with_worker_count(1))?;
    scheduler.register_transaction_type(
        "ping1",
        DefinitionOrRef::Inline(StepDefinition::atomic("ping")),
    )?;
    let capture = DoneCapture::install(&mut scheduler);

    let mut submitted: Vec<TxId> = Vec::new();
    for n in 0..5 {
        let (tx_id, _reply) = scheduler.submit(metadata("ping1"), json!({"n": n}))?;
        submitted.push(tx_id);
    }

    drive(&mut scheduler, 300, |_| capture.completions().len() == 5).await;

    let completed: Vec<TxId> = capture
        .completions()
        .iter()
        .map(|completion| completion.tx_id)
        .collect();
    assert_eq!(completed, submitted);
    Ok(())
}

#[tokio::test]
async fn failure_short_circuits_the_pipeline() -> Result<()> {
    let mut scheduler = Scheduler::new(SchedulerConfig::default())?;
    scheduler.register_step_runner("fail", Arc::new(FailRunner))?;
    scheduler.register_transaction_type(
        "flaky",
        DefinitionOrRef::Inline(StepDefinition::pipeline(vec![
            ping_child("first"),
            ChildSpec::new("trips", DefinitionOrRef::Inline(StepDefinition::atomic("fail"))),
            ping_child("never-runs"),
        ])),
    )?;
    let capture = DoneCapture::install(&mut scheduler);

    let (tx_id, _reply) = scheduler.submit(metadata("flaky"), json!({}))?;
    drive(&mut scheduler, 200, |_| !capture.completions().is_empty()).await;

    let completions = capture.completions();
    assert_eq!(completions[0].status, TxStatus::Failed);
    assert_eq!(completions[0].output, json!({"failedBy": "fail-step"}));

    // Children after the failing one never start: only the root and the two
    // invoked children have records.
    let steps = scheduler.cache().list_steps(tx_id);
    assert_eq!(steps.len(), 3);

    let root = steps[0];
    assert_eq!(root.status, StepStatus::Failed);
    assert_eq!(root.step_output, json!({"failedBy": "fail-step"}));
    let never_started = root.children[2].step_id;
    assert!(scheduler.cache().step(never_started).is_none());
    Ok(())
}

#[tokio::test]
async fn completion_is_applied_at_most_once() -> Result<()> {
    let held = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = Scheduler::new(SchedulerConfig::default())?;
    scheduler.register_step_runner("hold", Arc::new(HoldRunner { held: held.clone() }))?;
    scheduler.register_transaction_type(
        "held",
        DefinitionOrRef::Inline(StepDefinition::atomic("hold")),
    )?;
    let capture = DoneCapture::install(&mut scheduler);

    let (tx_id, _reply) = scheduler.submit(metadata("held"), json!({}))?;
    drive(&mut scheduler, 100, |_| {
        !held.lock().expect("hold lock").is_empty()
    })
    .await;

    let ctx = held.lock().expect("hold lock")[0].clone();
    ctx.handle.step_finished(
        ctx.tx_id,
        ctx.step_id,
        ctx.token.clone(),
        StepStatus::Success,
        None,
        json!({"attempt": 1}),
    )?;
    drive(&mut scheduler, 100, |_| !capture.completions().is_empty()).await;
    assert_eq!(scheduler.transaction_status(tx_id), TxStatus::Complete);

    // A second completion with the same valid token is rejected: the step is
    // already terminal, and the callback does not fire again.
    ctx.handle.step_finished(
        ctx.tx_id,
        ctx.step_id,
        ctx.token.clone(),
        StepStatus::Failed,
        None,
        json!({"attempt": 2}),
    )?;
    for _ in 0..5 {
        scheduler.tick();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert_eq!(capture.completions().len(), 1);
    assert_eq!(capture.completions()[0].output, json!({"attempt": 1}));
    assert_eq!(scheduler.transaction_status(tx_id), TxStatus::Complete);
    Ok(())
}

#[tokio::test]
async fn forged_token_is_rejected_without_effect() -> Result<()> {
    let held = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = Scheduler::new(SchedulerConfig::default())?;
    scheduler.register_step_runner("hold", Arc::new(HoldRunner { held: held.clone() }))?;
    scheduler.register_transaction_type(
        "held",
        DefinitionOrRef::Inline(StepDefinition::atomic("hold")),
    )?;
    let capture = DoneCapture::install(&mut scheduler);

    let (tx_id, _reply) = scheduler.submit(metadata("held"), json!({}))?;
    drive(&mut scheduler, 100, |_| {
        !held.lock().expect("hold lock").is_empty()
    })
    .await;
    let ctx = held.lock().expect("hold lock")[0].clone();

    // A forged completion is rejected and leaves the step running.
    ctx.handle.step_finished(
        ctx.tx_id,
        ctx.step_id,
        CompletionToken::mint(),
        StepStatus::Success,
        None,
        json!({"forged": true}),
    )?;
    for _ in 0..5 {
        scheduler.tick();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(capture.completions().is_empty());
    assert_eq!(scheduler.transaction_status(tx_id), TxStatus::Running);
    let step = scheduler.cache().step(ctx.step_id).expect("step cached");
    assert_eq!(step.status, StepStatus::Running);
    assert_eq!(step.step_output, Value::Null);

    // The legitimate token still works afterwards.
    ctx.handle.step_finished(
        ctx.tx_id,
        ctx.step_id,
        ctx.token.clone(),
        StepStatus::Success,
        None,
        json!({"legit": true}),
    )?;
    drive(&mut scheduler, 100, |_| !capture.completions().is_empty()).await;
    assert_eq!(scheduler.transaction_status(tx_id), TxStatus::Complete);
    Ok(())
}

#[tokio::test]
async fn delay_step_completes_through_external_timer() -> Result<()> {
    let mut scheduler = Scheduler::new(SchedulerConfig::default())?;
    scheduler.register_transaction_type(
        "pause",
        DefinitionOrRef::Inline(
            StepDefinition::atomic("delay").with_params(json!({"delayMs": 10})),
        ),
    )?;
    let capture = DoneCapture::install(&mut scheduler);

    let (tx_id, _reply) = scheduler.submit(metadata("pause"), json!({"carry": "over"}))?;
    drive(&mut scheduler, 300, |_| !capture.completions().is_empty()).await;

    let completions = capture.completions();
    assert_eq!(completions[0].status, TxStatus::Complete);
    assert_eq!(completions[0].output, json!({"carry": "over"}));
    assert_eq!(scheduler.transaction_status(tx_id), TxStatus::Complete);
    Ok(())
}

#[tokio::test]
async fn sync_reply_resolves_when_completion_beats_the_window() -> Result<()> {
    let mut scheduler = Scheduler::new(SchedulerConfig::default())?;
    scheduler.register_transaction_type(
        "ping1",
        DefinitionOrRef::Inline(StepDefinition::atomic("ping")),
    )?;
    DoneCapture::install(&mut scheduler);

    let (tx_id, reply) = scheduler.submit(metadata("ping1"), json!({}))?;
    drive(&mut scheduler, 100, |scheduler| {
        scheduler.transaction_status(tx_id) == TxStatus::Complete
    })
    .await;
    // One more tick delivers TX_END resolution to the reply slot.
    scheduler.tick();

    match await_reply(reply, Duration::from_millis(100)).await {
        Reply::Completed(completion) => {
            assert_eq!(completion.tx_id, tx_id);
            assert_eq!(completion.status, TxStatus::Complete);
        }
        Reply::Poll => panic!("completion should beat the window"),
    }
    Ok(())
}

#[tokio::test]
async fn sync_reply_times_out_to_polling() -> Result<()> {
    let mut scheduler = Scheduler::new(SchedulerConfig::default())?;
    scheduler.register_transaction_type(
        "ping1",
        DefinitionOrRef::Inline(StepDefinition::atomic("ping")),
    )?;
    DoneCapture::install(&mut scheduler);

    // Submit but never tick: the window elapses first.
    let (_tx_id, reply) = scheduler.submit(metadata("ping1"), json!({}))?;
    let reply = await_reply(reply, Duration::from_millis(5)).await;
    assert!(matches!(reply, Reply::Poll));
    Ok(())
}

#[tokio::test]
async fn on_change_observes_step_transitions() -> Result<()> {
    let transitions: Arc<Mutex<Vec<StepTransition>>> = Arc::new(Mutex::new(Vec::new()));

    struct ChangeCapture {
        transitions: Arc<Mutex<Vec<StepTransition>>>,
    }
    impl Callback for ChangeCapture {
        fn invoke(&self, _cx: &mut EngineCx<'_>, _context: &Value, data: &Value) -> Result<()> {
            let transition: StepTransition = serde_json::from_value(data.clone())
                .map_err(|e| relay_flow::error::Error::internal(e.to_string()))?;
            self.transitions.lock().expect("change lock").push(transition);
            Ok(())
        }
    }

    let mut scheduler = Scheduler::new(SchedulerConfig::default())?;
    scheduler.register_callback(
        "observe_change",
        Arc::new(ChangeCapture {
            transitions: transitions.clone(),
        }),
    )?;
    scheduler.register_transaction_type(
        "ping1",
        DefinitionOrRef::Inline(StepDefinition::atomic("ping")),
    )?;
    let capture = DoneCapture::install(&mut scheduler);

    let mut meta = metadata("ping1");
    meta.on_change = Some(CallbackSpec {
        callback: "observe_change".into(),
        context: Value::Null,
    });
    let (_tx_id, _reply) = scheduler.submit(meta, json!({}))?;
    drive(&mut scheduler, 100, |_| !capture.completions().is_empty()).await;

    let seen = transitions.lock().expect("change lock").clone();
    let statuses: Vec<StepStatus> = seen.iter().map(|t| t.status).collect();
    assert!(statuses.contains(&StepStatus::Running));
    assert!(statuses.contains(&StepStatus::Success));
    Ok(())
}

#[tokio::test]
async fn remote_origin_routes_tx_end_outbound() -> Result<()> {
    /// Captures outbound deliveries for inspection.
    struct SharedSink {
        delivered: Arc<Mutex<Vec<(QueueAddress, OutboundMessage)>>>,
    }
    impl OutboundSink for SharedSink {
        fn deliver(&mut self, address: QueueAddress, message: OutboundMessage) -> Result<()> {
            self.delivered
                .lock()
                .expect("sink lock")
                .push((address, message));
            Ok(())
        }
    }

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = Scheduler::with_outbound(
        SchedulerConfig::default(),
        Box::new(SharedSink {
            delivered: delivered.clone(),
        }),
    )?;
    scheduler.register_transaction_type(
        "ping1",
        DefinitionOrRef::Inline(StepDefinition::atomic("ping")),
    )?;
    let capture = DoneCapture::install(&mut scheduler);

    // The transaction was started by the "east" node group; this scheduler
    // serves "default", so the completion must be routed outbound.
    let mut meta = metadata("ping1");
    meta.node_group = "east".into();
    let (tx_id, _reply) = scheduler.submit(meta, json!({}))?;

    drive(&mut scheduler, 100, |_| {
        !delivered.lock().expect("sink lock").is_empty()
    })
    .await;

    let deliveries = delivered.lock().expect("sink lock").clone();
    let (address, message) = &deliveries[0];
    assert_eq!(address, &QueueAddress::default_for("east"));
    match message {
        OutboundMessage::Event(event) => {
            assert_eq!(event.payload.tx_id(), tx_id);
            assert_eq!(event.kind(), relay_flow::event::EventKind::TxEnd);
        }
        OutboundMessage::Callback { .. } => panic!("expected a TX_END event"),
    }

    // The local caller callback never fires; the origin node group owns it.
    for _ in 0..5 {
        scheduler.tick();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(capture.completions().is_empty());
    Ok(())
}
