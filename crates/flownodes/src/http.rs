use async_trait::async_trait;
use flowcore::{
    field_or, require_str, Map, Node, NodeContext, NodeError, NodeMetadata, NodeOutput, Value,
    ValueExt,
};
use reqwest::Method;

/// HTTP request node
pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for HttpRequestNode {
    fn node_type(&self) -> &str {
        "http.request"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new(self.node_type()).with_description("Make HTTP requests")
    }

    async fn execute(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let url = require_str(&input, "url")?;
        let method_value = field_or(&input, "method", Value::String("GET".to_string()));
        let method = method_value.as_str().unwrap_or("GET").to_uppercase();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| NodeError::Configuration(format!("Unsupported method: {}", method)))?;

        ctx.events.info(format!("{} {}", method, url));

        let mut request = self.client.request(method, url);
        if let Some(Value::Object(headers)) = input.get("headers") {
            for (key, value) in headers {
                request = request.header(key.as_str(), value.to_display_string());
            }
        }
        if let Some(Value::Object(query)) = input.get("query") {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| (k.clone(), v.to_display_string()))
                .collect();
            request = request.query(&pairs);
        }
        match input.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(json) => request = request.json(json),
        }
        if let Some(remaining) = ctx.remaining() {
            request = request.timeout(remaining);
        }

        let response = tokio::select! {
            response = request.send() => response
                .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?,
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        };

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    Value::String(v.to_str().unwrap_or("").to_string()),
                )
            })
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;
        let body = serde_json::from_str(&body_text).unwrap_or(Value::String(body_text));

        let fail_on_status = field_or(&input, "fail_on_status", Value::Bool(true)).is_truthy();
        if status.is_client_error() || status.is_server_error() {
            if fail_on_status {
                return Err(NodeError::ExecutionFailed(format!(
                    "HTTP request returned status {}",
                    status
                )));
            }
            ctx.events.warn(format!("Response status: {}", status));
        } else {
            ctx.events.info(format!("Response status: {}", status));
        }

        Ok(NodeOutput::new(serde_json::json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        })))
    }
}
