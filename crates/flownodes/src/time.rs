use async_trait::async_trait;
use flowcore::{field_or, Node, NodeContext, NodeError, NodeMetadata, NodeOutput, Value};
use tokio::time::{sleep, Duration};

/// Delay execution for a specified duration
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new(self.node_type())
            .with_description("Delay execution for specified milliseconds")
    }

    async fn execute(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = field_or(&input, "delay_ms", Value::from(1000))
            .as_u64()
            .ok_or_else(|| NodeError::Configuration("delay_ms must be a non-negative integer".into()))?;

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        }

        // Pass the upstream item through
        Ok(NodeOutput::new(ctx.json().clone()))
    }
}
