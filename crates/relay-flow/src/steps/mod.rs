//! Step-type implementations and the runner factory.
//!
//! Every atomic step type implements [`StepRunner`]. A runner's `invoke`
//! may complete the step inline by returning
//! [`InvokeOutcome::Completed`], or return [`InvokeOutcome::Pending`] and
//! arrange for some external actor to drive the completion protocol later
//! through the [`SchedulerHandle`](crate::scheduler::SchedulerHandle) in its
//! context. A pending step stays `RUNNING` indefinitely; the engine imposes
//! no default timeout.
//!
//! Pipeline steps are sequenced by the engine itself and never reach a
//! runner.

pub mod delay;
pub mod ping;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use relay_core::{CompletionToken, StepId, TxId};

use crate::error::{Error, Result};
use crate::scheduler::SchedulerHandle;
use crate::step::StepStatus;

pub use delay::DelayRunner;
pub use ping::PingRunner;

/// Everything a runner needs to execute one step.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Owning transaction.
    pub tx_id: TxId,
    /// The step being executed.
    pub step_id: StepId,
    /// Input data fed to the step.
    pub input: Value,
    /// Step-type parameters from the resolved definition.
    pub params: Value,
    /// The step's completion credential.
    ///
    /// Only this step instance and the engine ever hold it.
    pub token: CompletionToken,
    /// Handle for submitting the completion event from any task or thread.
    pub handle: SchedulerHandle,
}

/// Result of invoking a step runner.
#[derive(Debug)]
pub enum InvokeOutcome {
    /// The step completed inline during its own invocation.
    Completed {
        /// Terminal status.
        status: StepStatus,
        /// Output data.
        output: Value,
        /// Optional completion note.
        note: Option<String>,
    },
    /// The step's logical work continues; an external actor will drive the
    /// completion protocol later.
    Pending,
}

/// The contract every atomic step type fulfils.
#[async_trait]
pub trait StepRunner: Send + Sync + std::fmt::Debug {
    /// Executes the step.
    ///
    /// The return value is only meaningful for steps that complete
    /// synchronously inline; a `Pending` step must eventually present its
    /// completion through the context's handle.
    async fn invoke(&self, ctx: StepContext) -> Result<InvokeOutcome>;
}

/// Typed table of step runners, keyed by step type.
#[derive(Default)]
pub struct StepRunnerFactory {
    runners: HashMap<String, Arc<dyn StepRunner>>,
}

impl std::fmt::Debug for StepRunnerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunnerFactory")
            .field("step_types", &self.step_types())
            .finish()
    }
}

impl StepRunnerFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a runner for a step type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateStepType`] if the type is taken.
    pub fn register(
        &mut self,
        step_type: impl Into<String>,
        runner: Arc<dyn StepRunner>,
    ) -> Result<()> {
        let step_type = step_type.into();
        if self.runners.contains_key(&step_type) {
            return Err(Error::DuplicateStepType { step_type });
        }
        self.runners.insert(step_type, runner);
        Ok(())
    }

    /// Looks up the runner for a step type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownStepType`] when the type is absent.
    pub fn get(&self, step_type: &str) -> Result<Arc<dyn StepRunner>> {
        self.runners
            .get(step_type)
            .cloned()
            .ok_or_else(|| Error::UnknownStepType {
                step_type: step_type.to_string(),
            })
    }

    /// Returns the registered step types, sorted.
    #[must_use]
    pub fn step_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.runners.keys().cloned().collect();
        types.sort();
        types
    }
}
