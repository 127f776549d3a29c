//! The `ping` step: completes synchronously with a fixed marker output.

use async_trait::async_trait;
use serde_json::json;

use crate::error::Result;
use crate::step::StepStatus;
use crate::steps::{InvokeOutcome, StepContext, StepRunner};

/// The marker field present in every ping output.
pub const PING_MARKER_FIELD: &str = "ping";

/// The marker value present in every ping output.
pub const PING_MARKER_VALUE: &str = "pong";

/// A step that succeeds immediately, echoing its input alongside the marker.
#[derive(Debug, Default)]
pub struct PingRunner;

#[async_trait]
impl StepRunner for PingRunner {
    async fn invoke(&self, ctx: StepContext) -> Result<InvokeOutcome> {
        Ok(InvokeOutcome::Completed {
            status: StepStatus::Success,
            output: json!({
                PING_MARKER_FIELD: PING_MARKER_VALUE,
                "input": ctx.input,
            }),
            note: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerHandle;
    use relay_core::{CompletionToken, StepId, TxId};
    use serde_json::Value;

    #[tokio::test]
    async fn ping_succeeds_with_marker() {
        let (handle, _rx) = SchedulerHandle::detached();
        let ctx = StepContext {
            tx_id: TxId::generate(),
            step_id: StepId::generate(),
            input: Value::Null,
            params: Value::Null,
            token: CompletionToken::mint(),
            handle,
        };

        let outcome = PingRunner.invoke(ctx).await.unwrap();
        let InvokeOutcome::Completed { status, output, .. } = outcome else {
            panic!("ping must complete inline");
        };
        assert_eq!(status, StepStatus::Success);
        assert_eq!(output[PING_MARKER_FIELD], PING_MARKER_VALUE);
    }
}
