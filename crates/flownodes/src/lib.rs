//! Standard node library
//!
//! Collection of built-in nodes for common operations

mod debug;
mod http;
mod logic;
mod time;
mod transform;

pub use debug::DebugNode;
pub use http::HttpRequestNode;
pub use logic::IfNode;
pub use time::DelayNode;
pub use transform::{JsonParseNode, JsonStringifyNode, SetNode};
use flowruntime::NodeRegistry;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register_node(DebugNode);
    registry.register_node(HttpRequestNode::new());
    registry.register_node(IfNode);
    registry.register_node(DelayNode);
    registry.register_node(SetNode);
    registry.register_node(JsonParseNode);
    registry.register_node(JsonStringifyNode);
}

/// Registry holding every standard node
pub fn standard_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    registry
}
