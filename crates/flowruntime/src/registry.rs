use flowcore::{Node, NodeContext, NodeError, NodeMetadata, NodeOutput, NodeTypeCatalog, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available node handlers, keyed by type tag
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<dyn Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Register a node handler. A later registration for the same type
    /// replaces the earlier one.
    pub fn register(&mut self, node: Arc<dyn Node>) {
        let node_type = node.node_type().to_string();
        tracing::info!("Registering node type: {}", node_type);
        if self.nodes.insert(node_type.clone(), node).is_some() {
            tracing::warn!("Node type {} was already registered, replacing it", node_type);
        }
    }

    pub fn register_node<N: Node + 'static>(&mut self, node: N) {
        self.register(Arc::new(node));
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn Node>> {
        self.nodes.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.nodes.contains_key(node_type)
    }

    /// Run the handler registered for `node_type`.
    pub async fn invoke(
        &self,
        node_type: &str,
        input: Value,
        ctx: NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let node = self
            .nodes
            .get(node_type)
            .ok_or_else(|| NodeError::UnknownNodeType(node_type.to_string()))?;
        node.execute(input, ctx).await
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.nodes.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.nodes.get(node_type).map(|n| n.metadata())
    }

    pub fn list_metadata(&self) -> Vec<NodeMetadata> {
        self.list_node_types()
            .iter()
            .filter_map(|t| self.get_metadata(t))
            .collect()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTypeCatalog for NodeRegistry {
    fn is_known(&self, node_type: &str) -> bool {
        self.contains(node_type)
    }

    fn declares_branching(&self, node_type: &str) -> bool {
        self.nodes
            .get(node_type)
            .map(|n| n.metadata().branching)
            .unwrap_or(false)
    }
}
