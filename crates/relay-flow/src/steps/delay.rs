//! The `delay` step: stays `RUNNING` until its timer drives the completion
//! protocol from a spawned task.
//!
//! This is the reference implementation of the asynchronous-completion seam:
//! `invoke` returns [`InvokeOutcome::Pending`] and the timer task later
//! presents the step's completion token through the scheduler handle,
//! exactly as a remote worker or external system would.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::step::StepStatus;
use crate::steps::{InvokeOutcome, StepContext, StepRunner};

/// Default delay when the definition supplies no `delayMs`.
const DEFAULT_DELAY_MS: u64 = 1_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelayParams {
    #[serde(default = "default_delay_ms")]
    delay_ms: u64,
}

const fn default_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}

/// A step that completes with `SUCCESS` after a configured delay.
#[derive(Debug, Default)]
pub struct DelayRunner;

#[async_trait]
impl StepRunner for DelayRunner {
    async fn invoke(&self, ctx: StepContext) -> Result<InvokeOutcome> {
        let params: DelayParams = if ctx.params.is_null() {
            DelayParams {
                delay_ms: DEFAULT_DELAY_MS,
            }
        } else {
            serde_json::from_value(ctx.params.clone()).map_err(|e| Error::InvalidEvent {
                message: format!("invalid delay params: {e}"),
            })?
        };

        let StepContext {
            tx_id,
            step_id,
            input,
            token,
            handle,
            ..
        } = ctx;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(params.delay_ms)).await;
            let result = handle.step_finished(
                tx_id,
                step_id,
                token,
                StepStatus::Success,
                Some(format!("delayed {}ms", params.delay_ms)),
                input,
            );
            if let Err(error) = result {
                tracing::warn!(%tx_id, %step_id, %error, "delay completion not delivered");
            }
        });

        Ok(InvokeOutcome::Pending)
    }
}
