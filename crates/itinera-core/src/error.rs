use std::time::Duration;

use thiserror::Error;

/// Failures while loading, chunking, embedding or caching documents.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to load document '{document}': {reason}")]
    Load { document: String, reason: String },

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("invalid chunking parameters: {0}")]
    Config(String),

    #[error("index cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("index cache lock poisoned")]
    CacheLock,
}

impl IndexError {
    pub fn load(document: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Load {
            document: document.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a tool named '{0}' is already registered")]
    DuplicateTool(String),

    #[error("no tool named '{0}'")]
    NotFound(String),
}

/// Failures of a single tool invocation. These never end a turn; the agent
/// loop feeds them back to the model.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool '{0}' not found")]
    NotFound(String),

    #[error("tool '{name}' timed out after {}s", timeout.as_secs_f64())]
    Timeout { name: String, timeout: Duration },

    #[error("tool '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

/// Error reported by the language model boundary (network, auth, rate limit,
/// malformed stream).
#[derive(Debug, Error)]
#[error("language model error: {0}")]
pub struct ModelError(pub String);

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Turn-level failures. Memory is left untouched whenever one is returned.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no final answer after {attempts} tool attempts; please rephrase or retry")]
    Stalled { attempts: usize },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("turn cancelled")]
    Cancelled,
}

impl AgentError {
    /// Whether the user can simply retry the same turn.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Stalled { .. } | Self::Cancelled)
    }
}
