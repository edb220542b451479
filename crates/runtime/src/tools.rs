//! The `Tool` capability trait and the registry the turn loop dispatches
//! through. Concrete file/search/shell tools live outside this crate;
//! the loop only sees this seam.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use hm_domain::llm::ToolDefinition;
use hm_domain::Result;

/// One callable tool. Arguments are free-form JSON; each implementation
/// carries its own small typed façade.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn invoke(&self, args: serde_json::Value) -> Result<String>;
}

/// Registry of all tools available to this process.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, replacing previous");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Definitions for the tools passing `filter` (the visibility gate).
    pub fn definitions_where(&self, mut filter: impl FnMut(&str) -> bool) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| t.definition())
            .filter(|d| filter(&d.name))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FixedTool;
    use super::*;

    #[test]
    fn register_and_filter() {
        let mut reg = ToolRegistry::new();
        reg.register(FixedTool::new("agent_spawn", "ok"));
        reg.register(FixedTool::new("read_file", "ok"));

        assert_eq!(reg.names(), vec!["agent_spawn", "read_file"]);
        let defs = reg.definitions_where(|n| n.starts_with("agent_"));
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "agent_spawn");
    }

    #[tokio::test]
    async fn invoke_round_trip() {
        let tool = FixedTool::new("echo", "pong");
        let out = tool.invoke(serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(out, "pong");
        assert_eq!(tool.call_count(), 1);
    }
}
