use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use itinera_config::AgentConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::ContextBuilder;
use super::model::{LanguageModel, ModelEvent, ModelStream, ToolCallRequest};
use crate::error::{AgentError, ToolError};
use crate::memory::{ChatMessage, ConversationMemory, Role};
use crate::presenter::Presenter;
use crate::tools::ToolRegistry;

/// Reply used when the model answers with nothing.
pub const EMPTY_REPLY_FALLBACK: &str = "I've completed processing but have no response to give.";

/// Find the largest byte index <= `max` that is a UTF-8 char boundary.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn preview(s: &str, max: usize) -> String {
    if s.len() > max {
        let end = floor_char_boundary(s, max);
        format!("{}... ({} chars)", &s[..end], s.len())
    } else {
        s.to_string()
    }
}

/// One tool call made during a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub name: String,
    pub query: String,
    pub ok: bool,
}

/// Result of a successful turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub tool_calls: Vec<ToolInvocation>,
    /// Model calls made.
    pub iterations: usize,
}

/// What one model response amounted to.
enum Step {
    Answer(String),
    Tool(ToolCallRequest),
}

/// Runs the plan/act/respond cycle for one user turn.
///
/// Messages produced during a turn are staged and only committed to memory
/// when the turn succeeds, so a failed or cancelled turn leaves the
/// conversation exactly as it was.
pub struct AgentLoop {
    model: Arc<dyn LanguageModel>,
    context: ContextBuilder,
    max_iterations: usize,
    tool_timeout: Duration,
}

impl AgentLoop {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        context: ContextBuilder,
        max_iterations: usize,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            model,
            context,
            max_iterations: max_iterations.max(1),
            tool_timeout,
        }
    }

    pub fn from_config(model: Arc<dyn LanguageModel>, config: &AgentConfig) -> Self {
        Self::new(
            model,
            ContextBuilder::new(f64::from(config.temperature), u64::from(config.max_tokens)),
            config.max_iterations as usize,
            Duration::from_secs(config.tool_timeout_secs),
        )
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn tool_timeout(&self) -> Duration {
        self.tool_timeout
    }

    /// Process one user utterance.
    ///
    /// The presenter sees the reply tokens as they stream and then exactly
    /// one of `on_complete` or `on_error`.
    pub async fn run_turn(
        &self,
        memory: &mut ConversationMemory,
        tools: &ToolRegistry,
        utterance: &str,
        presenter: &mut dyn Presenter,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let mut staged = vec![ChatMessage::user(utterance)];

        match self
            .run_steps(memory, tools, &mut staged, presenter, cancel)
            .await
        {
            Ok(outcome) => {
                for message in staged {
                    memory.append(message.role, message.content);
                }
                presenter.on_complete(&outcome.reply);
                Ok(outcome)
            }
            Err(e) => {
                match &e {
                    AgentError::Cancelled => info!("Turn cancelled; memory unchanged"),
                    other => warn!("Turn failed: {other}"),
                }
                presenter.on_error(&e);
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        memory: &ConversationMemory,
        tools: &ToolRegistry,
        staged: &mut Vec<ChatMessage>,
        presenter: &mut dyn Presenter,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let mut tool_calls: Vec<ToolInvocation> = Vec::new();
        let mut iterations = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            iterations += 1;

            let request = self
                .context
                .build(memory.history(), staged, tools.descriptors());
            debug!(
                "LLM request [{iterations}/{}] to {}: {} messages",
                self.max_iterations,
                self.model.name(),
                request.messages.len()
            );

            let llm_start = Instant::now();
            let stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                stream = self.model.stream(request) => stream?,
            };
            let step = consume(stream, presenter, cancel).await?;
            let llm_elapsed = llm_start.elapsed();

            let call = match step {
                Step::Answer(text) => {
                    let reply = if text.trim().is_empty() {
                        EMPTY_REPLY_FALLBACK.to_string()
                    } else {
                        text
                    };
                    debug!(
                        "LLM response [{iterations}/{}]: text ({} chars) in {:.1}s",
                        self.max_iterations,
                        reply.len(),
                        llm_elapsed.as_secs_f64()
                    );
                    staged.push(ChatMessage::new(Role::Assistant, reply.clone()));
                    return Ok(TurnOutcome {
                        reply,
                        tool_calls,
                        iterations,
                    });
                }
                Step::Tool(call) => call,
            };

            info!(
                "Tool call [{}/{}]: {}({})",
                tool_calls.len() + 1,
                self.max_iterations,
                call.name,
                preview(&call.query, 200)
            );
            presenter.on_tool_call(&call.name, &call.query);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                result = tools.invoke(&call.name, &call.query, self.tool_timeout) => result,
            };

            let (content, ok) = match result {
                Ok(output) => {
                    debug!("Tool result [{}]: {}", call.name, preview(&output, 200));
                    (format!("Result of {}({:?}):\n{output}", call.name, call.query), true)
                }
                Err(e) => {
                    warn!("Tool error: {e}");
                    (format_tool_error(&e, tools), false)
                }
            };
            staged.push(ChatMessage::tool(content));
            tool_calls.push(ToolInvocation {
                name: call.name,
                query: call.query,
                ok,
            });

            if tool_calls.len() >= self.max_iterations {
                warn!(
                    "Agent loop reached max iterations ({}) without final response",
                    self.max_iterations
                );
                return Err(AgentError::Stalled {
                    attempts: tool_calls.len(),
                });
            }
        }
    }
}

/// Read one model response. Tokens go to the presenter as they arrive; the
/// first tool request ends the response.
async fn consume(
    mut stream: ModelStream,
    presenter: &mut dyn Presenter,
    cancel: &CancellationToken,
) -> Result<Step, AgentError> {
    let mut text = String::new();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            event = stream.next() => event,
        };
        match event {
            Some(Ok(ModelEvent::Token(fragment))) => {
                presenter.on_token(&fragment);
                text.push_str(&fragment);
            }
            Some(Ok(ModelEvent::ToolCall(call))) => {
                if !text.is_empty() {
                    debug!("Dropping {} chars streamed before tool call", text.len());
                }
                return Ok(Step::Tool(call));
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(Step::Answer(text)),
        }
    }
}

/// Text fed back to the model when a tool call fails.
fn format_tool_error(error: &ToolError, tools: &ToolRegistry) -> String {
    match error {
        ToolError::NotFound(_) => {
            format!("Error: {error}. Available tools: {}", tools.names().join(", "))
        }
        _ => format!("Error: {error}"),
    }
}
