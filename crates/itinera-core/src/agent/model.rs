use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ModelError;
use crate::memory::ChatMessage;
use crate::tools::ToolDescriptor;

/// A request for one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub name: String,
    pub query: String,
}

/// One item of a model response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    Token(String),
    ToolCall(ToolCallRequest),
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDescriptor>,
    pub temperature: f64,
    pub max_tokens: u64,
}

pub type ModelStream = BoxStream<'static, Result<ModelEvent, ModelError>>;

/// The language model behind the agent. Given the conversation and the
/// available tools, it streams either answer tokens or a tool request.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, ModelError>;
}
