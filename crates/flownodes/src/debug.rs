use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeMetadata, NodeOutput, Value};

/// Logs a message and passes its first upstream item through
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new(self.node_type()).with_description("Logs a message for debugging")
    }

    async fn execute(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = match input.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "(no message)".to_string(),
        };

        tracing::info!(
            execution_id = %ctx.execution_id,
            node_id = %ctx.node_id,
            "DEBUG: {}",
            message
        );
        ctx.events.info(format!("DEBUG: {}", message));

        Ok(NodeOutput::new(ctx.json().clone()))
    }
}
