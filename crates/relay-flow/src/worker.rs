//! Bounded worker pool: the execution slots that invoke step logic.
//!
//! A worker slot is busy from the moment a job is handed to it until the
//! job's invocation future resolves. A busy worker never receives a second
//! job. Completion data never flows back through the pool; workers report
//! through the event queue, which is the engine's sole synchronization
//! boundary.

use serde_json::Value;
use tokio::task::JoinHandle;

use relay_core::{CompletionToken, StepId, TxId};

/// A unit of work queued for a worker.
#[derive(Debug)]
pub struct Job {
    /// Owning transaction.
    pub tx_id: TxId,
    /// The step to execute.
    pub step_id: StepId,
    /// Step type, dispatched through the runner factory.
    pub step_type: String,
    /// Input data for the step.
    pub input: Value,
    /// Step-type parameters from the resolved definition.
    pub params: Value,
    /// The step's completion credential, passed to the step instance.
    pub token: CompletionToken,
}

#[derive(Debug)]
struct RunningJob {
    step_id: StepId,
    handle: JoinHandle<()>,
}

/// A fixed set of execution slots.
#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<Option<RunningJob>>,
}

impl WorkerPool {
    /// Creates a pool with `count` slots.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            slots: (0..count).map(|_| None).collect(),
        }
    }

    /// Returns the total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of busy slots.
    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns the index of a free slot, if any.
    #[must_use]
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Marks a slot busy with a spawned invocation.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already busy; the feed loop only hands jobs to
    /// slots reported free by [`free_slot`](Self::free_slot).
    pub fn start(&mut self, slot: usize, step_id: StepId, handle: JoinHandle<()>) {
        assert!(
            self.slots[slot].is_none(),
            "worker slot {slot} is already busy"
        );
        self.slots[slot] = Some(RunningJob { step_id, handle });
    }

    /// Frees slots whose invocation future has resolved.
    ///
    /// Returns the number of slots freed.
    pub fn reap_finished(&mut self) -> usize {
        let mut freed = 0;
        for slot in &mut self.slots {
            let done = slot
                .as_ref()
                .is_some_and(|running| running.handle.is_finished());
            if done {
                *slot = None;
                freed += 1;
            }
        }
        freed
    }

    /// Returns the step IDs currently occupying slots.
    #[must_use]
    pub fn running_steps(&self) -> Vec<StepId> {
        self.slots
            .iter()
            .flatten()
            .map(|running| running.step_id)
            .collect()
    }
}
