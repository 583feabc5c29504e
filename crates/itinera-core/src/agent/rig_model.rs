use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::StreamExt;
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::completion::{CompletionModel, CompletionRequest, Message, ToolDefinition};
use rig::message::{AssistantContent, Text, UserContent};
use rig::streaming::{StreamedAssistantContent, StreamingCompletionResponse};
use rig::OneOrMany;
use tracing::debug;

use super::model::{LanguageModel, ModelEvent, ModelRequest, ModelStream, ToolCallRequest};
use crate::error::ModelError;
use crate::memory::{ChatMessage, Role};

#[allow(deprecated)]
type RigStream = StreamingCompletionResponse<
    <CompletionModelHandle<'static> as CompletionModel>::StreamingResponse,
>;

/// [`LanguageModel`] backed by a rig completion model, streaming tokens as
/// the provider produces them.
#[allow(deprecated)]
pub struct RigModel {
    handle: CompletionModelHandle<'static>,
    name: String,
}

#[allow(deprecated)]
impl RigModel {
    pub fn new(handle: CompletionModelHandle<'static>, name: impl Into<String>) -> Self {
        Self {
            handle,
            name: name.into(),
        }
    }
}

#[allow(deprecated)]
#[async_trait]
impl LanguageModel for RigModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
        let request = to_rig_request(request)?;
        let response = self
            .handle
            .stream(request)
            .await
            .map_err(|e| ModelError::new(format!("LLM completion error: {e}")))?;
        Ok(into_events(Box::pin(response)))
    }
}

enum Phase {
    Streaming(Pin<Box<RigStream>>),
    Draining(VecDeque<ModelEvent>),
}

/// Text deltas are forwarded as they arrive. Tool calls are taken from the
/// aggregated response once the provider stream ends.
fn into_events(response: Pin<Box<RigStream>>) -> ModelStream {
    futures::stream::unfold(Some(Phase::Streaming(response)), |phase| async move {
        match phase? {
            Phase::Streaming(mut response) => loop {
                match response.next().await {
                    Some(Ok(StreamedAssistantContent::Text(text))) => {
                        return Some((
                            Ok(ModelEvent::Token(text.text)),
                            Some(Phase::Streaming(response)),
                        ));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Some((Err(ModelError::new(format!("LLM stream error: {e}"))), None));
                    }
                    None => {
                        let mut calls: VecDeque<ModelEvent> = response
                            .choice
                            .iter()
                            .filter_map(|content| match content {
                                AssistantContent::ToolCall(tc) => {
                                    Some(ModelEvent::ToolCall(ToolCallRequest {
                                        name: tc.function.name.clone(),
                                        query: query_from_arguments(&tc.function.arguments),
                                    }))
                                }
                                _ => None,
                            })
                            .collect();
                        let first = calls.pop_front()?;
                        return Some((Ok(first), Some(Phase::Draining(calls))));
                    }
                }
            },
            Phase::Draining(mut calls) => {
                let next = calls.pop_front()?;
                Some((Ok(next), Some(Phase::Draining(calls))))
            }
        }
    })
    .boxed()
}

/// Convert a model request into rig's format. System messages become the
/// preamble; tool results are sent as user text.
pub(crate) fn to_rig_request(request: ModelRequest) -> Result<CompletionRequest, ModelError> {
    let mut preamble_parts: Vec<String> = Vec::new();
    let mut chat_history: Vec<Message> = Vec::new();

    for ChatMessage { role, content } in request.messages {
        match role {
            Role::System => preamble_parts.push(content),
            Role::User | Role::Tool => chat_history.push(Message::User {
                content: OneOrMany::one(UserContent::Text(Text { text: content })),
            }),
            Role::Assistant => chat_history.push(Message::Assistant {
                id: None,
                content: OneOrMany::one(AssistantContent::Text(Text { text: content })),
            }),
        }
    }

    let chat_history = OneOrMany::many(chat_history)
        .map_err(|_| ModelError::new("request has no user or assistant messages"))?;

    let tools: Vec<ToolDefinition> = request
        .tools
        .into_iter()
        .map(|t| ToolDefinition {
            name: t.name,
            description: t.description,
            parameters: t.parameters,
        })
        .collect();

    debug!(
        "LLM request: {} messages, {} tools, temp={}, max_tokens={}",
        chat_history.len(),
        tools.len(),
        request.temperature,
        request.max_tokens
    );

    Ok(CompletionRequest {
        preamble: if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        },
        chat_history,
        documents: Vec::new(),
        tools,
        temperature: Some(request.temperature),
        max_tokens: Some(request.max_tokens),
        tool_choice: None,
        additional_params: None,
    })
}

/// Extract the query from tool-call arguments. Providers send an object
/// (`{"query": ...}`), a JSON-encoded string of one, or a bare string.
pub(crate) fn query_from_arguments(arguments: &serde_json::Value) -> String {
    match arguments {
        serde_json::Value::Object(map) => map
            .get("query")
            .and_then(|q| q.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| arguments.to_string()),
        serde_json::Value::String(s) => match serde_json::from_str::<serde_json::Value>(s) {
            Ok(inner @ serde_json::Value::Object(_)) => query_from_arguments(&inner),
            _ => s.clone(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolDescriptor;

    fn request(messages: Vec<ChatMessage>) -> ModelRequest {
        ModelRequest {
            messages,
            tools: vec![ToolDescriptor {
                name: "travel_docs".into(),
                description: "Search travel documents".into(),
                parameters: serde_json::json!({"type": "object"}),
            }],
            temperature: 0.7,
            max_tokens: 512,
        }
    }

    #[test]
    fn system_messages_become_preamble() {
        let req = to_rig_request(request(vec![
            ChatMessage::new(Role::System, "You are a travel assistant."),
            ChatMessage::user("Plan 2 days in Rome"),
            ChatMessage::tool("Result of travel_docs(\"Rome\"):\nColosseum"),
            ChatMessage::new(Role::Assistant, "Day 1: Colosseum"),
            ChatMessage::user("And day 2?"),
        ]))
        .unwrap();

        assert_eq!(req.preamble.as_deref(), Some("You are a travel assistant."));
        assert_eq!(req.chat_history.len(), 4);
        assert_eq!(req.tools.len(), 1);
        assert_eq!(req.tools[0].name, "travel_docs");
        assert_eq!(req.temperature, Some(0.7));
        assert_eq!(req.max_tokens, Some(512));
    }

    #[test]
    fn only_system_messages_is_an_error() {
        let err = to_rig_request(request(vec![ChatMessage::new(Role::System, "x")])).unwrap_err();
        assert!(err.to_string().contains("no user or assistant"));
    }

    #[test]
    fn query_argument_shapes() {
        assert_eq!(
            query_from_arguments(&serde_json::json!({"query": "Vatican hours"})),
            "Vatican hours"
        );
        assert_eq!(
            query_from_arguments(&serde_json::json!("{\"query\": \"Uffizi\"}")),
            "Uffizi"
        );
        assert_eq!(query_from_arguments(&serde_json::json!("gelato")), "gelato");
        assert_eq!(
            query_from_arguments(&serde_json::json!({"q": 1})),
            "{\"q\":1}"
        );
    }
}
