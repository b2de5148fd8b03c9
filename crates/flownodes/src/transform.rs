use async_trait::async_trait;
use flowcore::{
    field_or, require_field, require_str, Map, Node, NodeContext, NodeError, NodeMetadata,
    NodeOutput, Value, ValueExt,
};

/// Set fields on the upstream item
pub struct SetNode;

#[async_trait]
impl Node for SetNode {
    fn node_type(&self) -> &str {
        "transform.set"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new(self.node_type())
            .with_description("Set fields on the incoming item, or build a new one")
    }

    async fn execute(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let values = match require_field(&input, "values")? {
            Value::Object(map) => map.clone(),
            other => {
                return Err(NodeError::InvalidInputType {
                    field: "values".to_string(),
                    expected: "object".to_string(),
                    actual: other.type_name().to_string(),
                })
            }
        };
        let keep_only_set = field_or(&input, "keep_only_set", Value::Bool(false)).is_truthy();

        let mut output = match ctx.json() {
            Value::Object(map) if !keep_only_set => map.clone(),
            _ => Map::new(),
        };
        output.extend(values);

        Ok(NodeOutput::new(Value::Object(output)))
    }
}

/// Parse JSON string to Value
pub struct JsonParseNode;

#[async_trait]
impl Node for JsonParseNode {
    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new(self.node_type()).with_description("Parse JSON string")
    }

    async fn execute(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let text = require_str(&input, "json")?;

        let parsed: Value = serde_json::from_str(text)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(NodeOutput::new(parsed))
    }
}

/// Stringify Value to JSON
pub struct JsonStringifyNode;

#[async_trait]
impl Node for JsonStringifyNode {
    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new(self.node_type()).with_description("Convert value to JSON string")
    }

    async fn execute(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = require_field(&input, "value")?;
        let pretty = field_or(&input, "pretty", Value::Bool(false)).is_truthy();

        let json_str = if pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::new(serde_json::json!({ "json": json_str })))
    }
}
