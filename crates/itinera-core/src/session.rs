use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use itinera_config::Config;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::{AgentLoop, TurnOutcome};
use crate::error::AgentError;
use crate::index::DocumentIndex;
use crate::memory::{ConversationMemory, MemoryWindow, Role};
use crate::presenter::Presenter;
use crate::tools::{RetrieverTool, Tool, ToolRegistry, WebSearchTool};

/// A line of the display transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// What a reset clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetScope {
    /// Conversation memory only; the system prompt is re-seeded.
    Memory,
    /// Display transcript only; the model still remembers.
    Transcript,
    All,
}

impl ResetScope {
    pub fn clears_memory(self) -> bool {
        matches!(self, Self::Memory | Self::All)
    }

    pub fn clears_transcript(self) -> bool {
        matches!(self, Self::Transcript | Self::All)
    }
}

impl FromStr for ResetScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "transcript" | "display" => Ok(Self::Transcript),
            "all" | "" => Ok(Self::All),
            other => {
                anyhow::bail!("unknown reset scope '{other}' (expected memory, transcript or all)")
            }
        }
    }
}

/// One user's conversation: its memory, transcript and tool registry.
pub struct ChatSession {
    id: String,
    agent: Arc<AgentLoop>,
    tools: ToolRegistry,
    memory: ConversationMemory,
    transcript: Vec<TranscriptEntry>,
    system_prompt: String,
    memory_key: String,
}

impl ChatSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run one turn. Memory and transcript change only if it succeeds.
    pub async fn send(
        &mut self,
        utterance: &str,
        presenter: &mut dyn Presenter,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let outcome = self
            .agent
            .run_turn(&mut self.memory, &self.tools, utterance, presenter, cancel)
            .await?;

        let now = Utc::now();
        self.transcript.push(TranscriptEntry {
            role: Role::User,
            content: utterance.to_string(),
            timestamp: now,
        });
        self.transcript.push(TranscriptEntry {
            role: Role::Assistant,
            content: outcome.reply.clone(),
            timestamp: now,
        });
        debug!(
            "Session {}: {} messages in memory, {} tool calls this turn",
            self.id,
            self.memory.len(),
            outcome.tool_calls.len()
        );
        Ok(outcome)
    }

    pub fn reset(&mut self, scope: ResetScope) {
        if scope.clears_memory() {
            self.memory.clear();
            seed(&mut self.memory, &self.system_prompt);
        }
        if scope.clears_transcript() {
            self.transcript.clear();
        }
        info!("Session {} reset ({scope:?})", self.id);
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Memory exported under the configured key.
    pub fn snapshot(&self) -> serde_json::Value {
        self.memory.snapshot(&self.memory_key)
    }
}

fn seed(memory: &mut ConversationMemory, system_prompt: &str) {
    if !system_prompt.trim().is_empty() {
        memory.append(Role::System, system_prompt);
    }
}

/// Creates sessions that share the agent and document index but nothing
/// mutable.
pub struct SessionFactory {
    agent: Arc<AgentLoop>,
    index: Option<Arc<DocumentIndex>>,
    config: Config,
    extra_tools: Vec<Arc<dyn Tool>>,
}

impl SessionFactory {
    pub fn new(agent: Arc<AgentLoop>, config: &Config, index: Option<Arc<DocumentIndex>>) -> Self {
        Self {
            agent,
            index,
            config: config.clone(),
            extra_tools: Vec::new(),
        }
    }

    /// Add a tool to every session built from now on.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    pub fn agent(&self) -> &Arc<AgentLoop> {
        &self.agent
    }

    pub fn index(&self) -> Option<&Arc<DocumentIndex>> {
        self.index.as_ref()
    }

    /// A fresh registry for one session.
    pub fn build_registry(&self) -> Result<ToolRegistry> {
        let mut registry = ToolRegistry::new();

        if let Some(index) = &self.index {
            let retriever = &self.config.tools.retriever;
            registry.register(Arc::new(RetrieverTool::new(
                retriever.name.clone(),
                retriever.description.clone(),
                index.clone(),
                self.config.index.top_k,
            )))?;
        }

        let search = &self.config.tools.web.search;
        if search.enabled {
            let tool = WebSearchTool::new(search.api_key.clone(), search.max_results)
                .context("failed to create web search tool")?;
            registry.register(Arc::new(tool))?;
        }

        for tool in &self.extra_tools {
            registry.register(tool.clone())?;
        }

        Ok(registry)
    }

    pub fn new_session(&self, id: impl Into<String>) -> Result<ChatSession> {
        let id = id.into();
        let tools = self.build_registry()?;
        let agent_config = &self.config.agent;

        let mut memory =
            ConversationMemory::with_window(MemoryWindow::from(&agent_config.memory_window));
        seed(&mut memory, &agent_config.system_prompt);

        info!(
            "New session {id} with tools [{}]",
            tools.names().join(", ")
        );

        Ok(ChatSession {
            id,
            agent: self.agent.clone(),
            tools,
            memory,
            transcript: Vec::new(),
            system_prompt: agent_config.system_prompt.clone(),
            memory_key: agent_config.memory_key.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::StreamExt;

    use super::*;
    use crate::agent::{LanguageModel, ModelEvent, ModelRequest, ModelStream};
    use crate::error::{ModelError, RegistryError};
    use crate::index::{ChunkingConfig, Document, HashingEmbedder};
    use crate::presenter::CollectingPresenter;
    use crate::tools::tests::FixedTool;

    /// Answers "reply N" where N counts calls.
    struct EchoModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for EchoModel {
        fn name(&self) -> &str {
            "echo"
        }

        async fn stream(&self, _request: ModelRequest) -> Result<ModelStream, ModelError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let events = vec![Ok(ModelEvent::Token(format!("reply {n}")))];
            Ok(futures::stream::iter(events).boxed())
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.tools.web.search.enabled = false;
        config
    }

    fn factory(config: &Config) -> SessionFactory {
        let model = Arc::new(EchoModel {
            calls: AtomicUsize::new(0),
        });
        let agent = Arc::new(AgentLoop::from_config(model, &config.agent));
        SessionFactory::new(agent, config, None)
    }

    async fn say(session: &mut ChatSession, text: &str) -> TurnOutcome {
        session
            .send(text, &mut CollectingPresenter::new(), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn session_seeds_system_prompt_and_records_turns() {
        let config = config();
        let mut session = factory(&config).new_session("s1").unwrap();
        assert_eq!(session.memory().len(), 1);
        assert_eq!(session.memory().history()[0].role(), Role::System);

        let outcome = say(&mut session, "Rome in 2 days?").await;
        assert_eq!(outcome.reply, "reply 1");
        assert_eq!(session.memory().len(), 3);
        assert_eq!(session.transcript().len(), 2);
        assert_eq!(session.transcript()[1].content, "reply 1");
    }

    #[tokio::test]
    async fn reset_scopes_are_separable() {
        let config = config();
        let mut session = factory(&config).new_session("s1").unwrap();
        say(&mut session, "hello").await;

        session.reset(ResetScope::Transcript);
        assert!(session.transcript().is_empty());
        assert_eq!(session.memory().len(), 3);

        say(&mut session, "again").await;
        session.reset(ResetScope::Memory);
        assert_eq!(session.transcript().len(), 2);
        assert_eq!(session.memory().len(), 1);
        assert_eq!(session.memory().history()[0].role(), Role::System);
        assert_eq!(session.memory().history()[0].ordinal(), 0);

        session.reset(ResetScope::All);
        assert!(session.transcript().is_empty());
        assert_eq!(session.memory().len(), 1);
    }

    #[tokio::test]
    async fn sessions_do_not_share_memory() {
        let config = config();
        let factory = factory(&config);
        let mut a = factory.new_session("a").unwrap();
        let b = factory.new_session("b").unwrap();
        say(&mut a, "only in a").await;
        assert_eq!(a.memory().len(), 3);
        assert_eq!(b.memory().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_uses_memory_key() {
        let mut config = config();
        config.agent.memory_key = "trip_log".into();
        let mut session = factory(&config).new_session("s").unwrap();
        say(&mut session, "hi").await;

        let snapshot = session.snapshot();
        let log = snapshot["trip_log"].as_array().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1]["role"], "user");
        assert_eq!(log[1]["content"], "hi");
    }

    #[tokio::test]
    async fn registry_includes_retriever_when_indexed() {
        let config = config();
        let index = DocumentIndex::build(
            vec![Document::new("rome.md", "The Colosseum opens at 8:30.")],
            &ChunkingConfig::default(),
            Arc::new(HashingEmbedder::new(64)),
        )
        .await
        .unwrap();
        let model = Arc::new(EchoModel {
            calls: AtomicUsize::new(0),
        });
        let agent = Arc::new(AgentLoop::from_config(model, &config.agent));
        let factory = SessionFactory::new(agent, &config, Some(Arc::new(index)));

        let session = factory.new_session("s").unwrap();
        assert_eq!(session.tools().names(), vec!["travel_docs"]);
    }

    #[test]
    fn duplicate_extra_tool_fails_session_setup() {
        let config = config();
        let factory = factory(&config)
            .with_tool(Arc::new(FixedTool::new("weather", "sunny")))
            .with_tool(Arc::new(FixedTool::new("weather", "rain")));
        let err = factory.new_session("s").err().unwrap();
        assert_eq!(
            err.downcast_ref::<RegistryError>(),
            Some(&RegistryError::DuplicateTool("weather".into()))
        );
    }

    #[test]
    fn reset_scope_parsing() {
        assert_eq!("memory".parse::<ResetScope>().unwrap(), ResetScope::Memory);
        assert_eq!("Transcript".parse::<ResetScope>().unwrap(), ResetScope::Transcript);
        assert_eq!("".parse::<ResetScope>().unwrap(), ResetScope::All);
        assert!("everything".parse::<ResetScope>().is_err());
    }
}
