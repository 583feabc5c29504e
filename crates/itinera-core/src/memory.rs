use itinera_config::MemoryWindowConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A message held by a [`ConversationMemory`]. Fields are read-only once
/// appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    role: Role,
    content: String,
    ordinal: u64,
}

impl Message {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Role + content pair as sent to the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }
}

/// Rough token estimate (~4 chars per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Limits applied after every append. `None` disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryWindow {
    pub max_messages: Option<usize>,
    pub max_tokens: Option<usize>,
}

impl MemoryWindow {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_bounded(&self) -> bool {
        self.max_messages.is_some() || self.max_tokens.is_some()
    }
}

impl From<&MemoryWindowConfig> for MemoryWindow {
    fn from(cfg: &MemoryWindowConfig) -> Self {
        Self {
            max_messages: cfg.max_messages,
            max_tokens: cfg.max_tokens,
        }
    }
}

/// Ordered conversation log for one session.
///
/// Every append takes the next ordinal, so ordinals are strictly increasing
/// and handed out without gaps. When a window is configured the oldest
/// non-system messages are evicted first; system messages and the newest
/// message always stay.
#[derive(Debug, Clone, Default)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    next_ordinal: u64,
    window: MemoryWindow,
    evicted: u64,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(window: MemoryWindow) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    /// Append a message and return the ordinal it was assigned.
    pub fn append(&mut self, role: Role, content: impl Into<String>) -> u64 {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.messages.push(Message {
            role,
            content: content.into(),
            ordinal,
        });
        self.enforce_window();
        ordinal
    }

    /// Messages in insertion order.
    pub fn history(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn window(&self) -> MemoryWindow {
        self.window
    }

    /// Number of messages dropped by the window so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(|m| estimate_tokens(&m.content)).sum()
    }

    /// Drop every message and restart ordinals.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.next_ordinal = 0;
        self.evicted = 0;
    }

    /// Export the history as `{ "<key>": [ {role, content, ordinal}, ... ] }`.
    pub fn snapshot(&self, key: &str) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            key.to_string(),
            serde_json::to_value(&self.messages).unwrap_or_default(),
        );
        serde_json::Value::Object(map)
    }

    fn over_limit(&self) -> bool {
        let too_many = self
            .window
            .max_messages
            .is_some_and(|max| self.messages.len() > max);
        let too_large = self
            .window
            .max_tokens
            .is_some_and(|max| self.estimated_tokens() > max);
        too_many || too_large
    }

    fn enforce_window(&mut self) {
        if !self.window.is_bounded() {
            return;
        }
        while self.over_limit() {
            let newest = self.messages.len().saturating_sub(1);
            let Some(idx) = self.messages[..newest]
                .iter()
                .position(|m| m.role != Role::System)
            else {
                break;
            };
            let dropped = self.messages.remove(idx);
            self.evicted += 1;
            debug!(
                "Memory window evicted {} message #{}",
                dropped.role.as_str(),
                dropped.ordinal
            );
        }
    }
}
