use tracing::debug;

use super::model::ModelRequest;
use crate::memory::{ChatMessage, Message, Role};
use crate::tools::ToolDescriptor;

/// Builds model requests from committed history plus the messages staged
/// in the current turn.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    temperature: f64,
    max_tokens: u64,
}

impl ContextBuilder {
    pub fn new(temperature: f64, max_tokens: u64) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }

    pub fn build(
        &self,
        history: &[Message],
        pending: &[ChatMessage],
        tools: Vec<ToolDescriptor>,
    ) -> ModelRequest {
        let messages: Vec<ChatMessage> = history
            .iter()
            .map(Message::to_chat)
            .chain(pending.iter().cloned())
            .collect();

        // Log context summary
        {
            let system_chars: usize = messages
                .iter()
                .filter(|m| m.role == Role::System)
                .map(|m| m.content.len())
                .sum();
            let msg_summary: Vec<String> = messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| format!("{}:{}", m.role.as_str(), m.content.len()))
                .collect();
            debug!(
                "Context: system={system_chars} chars, history=[{}]",
                msg_summary.join(", ")
            );
        }

        ModelRequest {
            messages,
            tools,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ConversationMemory;

    #[test]
    fn history_then_pending() {
        let mut memory = ConversationMemory::new();
        memory.append(Role::System, "persona");
        memory.append(Role::User, "hi");
        memory.append(Role::Assistant, "hello");

        let pending = vec![ChatMessage::user("Rome?"), ChatMessage::tool("result")];
        let req = ContextBuilder::new(0.2, 100).build(memory.history(), &pending, Vec::new());

        let roles: Vec<Role> = req.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User, Role::Tool]
        );
        assert_eq!(req.messages[3].content, "Rome?");
        assert_eq!(req.temperature, 0.2);
        assert_eq!(req.max_tokens, 100);
    }
}
