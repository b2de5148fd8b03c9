use async_trait::async_trait;
use flowcore::{field_or, Node, NodeContext, NodeError, NodeMetadata, NodeOutput, Value, ValueExt};

/// Routes the upstream item down the true or false edges
pub struct IfNode;

#[async_trait]
impl Node for IfNode {
    fn node_type(&self) -> &str {
        "logic.if"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new(self.node_type())
            .with_description("Branch on a condition")
            .branching()
    }

    async fn execute(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let condition = field_or(&input, "condition", Value::Null).is_truthy();
        ctx.events.info(format!("Condition evaluated to {}", condition));
        Ok(NodeOutput::new(ctx.json().clone()).with_branch(condition))
    }
}
