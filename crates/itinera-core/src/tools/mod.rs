pub mod retrieve;
pub mod web;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::error::{RegistryError, ToolError};

pub use retrieve::RetrieverTool;
pub use web::WebSearchTool;

/// What kind of external capability a tool wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Search,
    Retrieve,
}

/// Trait for tools callable by the agent. Every tool takes a single text
/// query and returns text.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn capability(&self) -> Capability;

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"}
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, query: &str) -> Result<String>;
}

/// What the model is told about a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Registry of available tools, keyed by unique name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails if the name is taken; use [`replace`](Self::replace)
    /// to overwrite on purpose.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Register a tool, returning the one it displaced.
    pub fn replace(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        self.tools.insert(tool.name().to_string(), tool)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>, RegistryError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// All tools, ordered by name.
    pub fn list(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|k| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Look up and run a tool, bounded by `timeout`.
    pub async fn invoke(
        &self,
        name: &str,
        query: &str,
        timeout: Duration,
    ) -> Result<String, ToolError> {
        let tool = self
            .get(name)
            .map_err(|_| ToolError::NotFound(name.to_string()))?;

        match tokio::time::timeout(timeout, tool.invoke(query)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(ToolError::Failed {
                name: name.to_string(),
                message: format!("{e:#}"),
            }),
            Err(_) => Err(ToolError::Timeout {
                name: name.to_string(),
                timeout,
            }),
        }
    }
}
