use serde::{Deserialize, Serialize};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that help the user to plan an optimized itinerary.";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agent: AgentConfig,
    pub model: ModelRef,
    pub providers: ProvidersConfig,
    pub index: IndexConfig,
    pub tools: ToolsConfig,
    pub gateway: GatewayConfig,
}

impl Config {
    /// Reject settings the agent cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.agent.max_iterations == 0 {
            anyhow::bail!("agent.maxIterations must be at least 1");
        }
        if self.agent.tool_timeout_secs == 0 {
            anyhow::bail!("agent.toolTimeoutSecs must be greater than 0");
        }
        if self.agent.memory_key.trim().is_empty() {
            anyhow::bail!("agent.memoryKey must not be empty");
        }
        if self.index.chunk_size == 0 {
            anyhow::bail!("index.chunkSize must be greater than 0");
        }
        if self.index.chunk_overlap >= self.index.chunk_size {
            anyhow::bail!(
                "index.chunkOverlap ({}) must be smaller than index.chunkSize ({})",
                self.index.chunk_overlap,
                self.index.chunk_size
            );
        }
        if self.index.embedding.dimensions == 0 {
            anyhow::bail!("index.embedding.dimensions must be greater than 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub system_prompt: String,
    /// Upper bound on tool attempts per turn.
    pub max_iterations: u32,
    pub tool_timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Key under which conversation history is exported.
    pub memory_key: String,
    pub memory_window: MemoryWindowConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_iterations: 5,
            tool_timeout_secs: 20,
            temperature: 0.7,
            max_tokens: 2048,
            memory_key: "chat_history".into(),
            memory_window: MemoryWindowConfig::default(),
        }
    }
}

/// Bounds for conversation memory. Both unset means unbounded growth.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryWindowConfig {
    pub max_messages: Option<usize>,
    pub max_tokens: Option<usize>,
}

/// Reference to a provider + model combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl Default for ModelRef {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub ollama: Option<ProviderConfig>,
    pub anthropic: Option<ProviderConfig>,
    pub openai: Option<ProviderConfig>,
    pub openrouter: Option<ProviderConfig>,
    pub deepseek: Option<ProviderConfig>,
    pub groq: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexConfig {
    /// Documents (paths or glob patterns) indexed at startup.
    pub documents: Vec<String>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Number of chunks the retriever returns.
    pub top_k: usize,
    /// SQLite cache of chunk embeddings. `None` disables caching.
    pub cache_path: Option<String>,
    pub embedding: EmbeddingConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            documents: Vec::new(),
            chunk_size: 1500,
            chunk_overlap: 200,
            top_k: 4,
            cache_path: Some("~/.itinera/index.sqlite".into()),
            embedding: EmbeddingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    /// Remote embedding model name (ignored by the hashing embedder).
    pub model: String,
    /// Vector width of the hashing embedder.
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            model: "text-embedding-3-small".into(),
            dimensions: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    #[default]
    Hashing,
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    pub web: WebToolsConfig,
    pub retriever: RetrieverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WebToolsConfig {
    pub search: WebSearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSearchConfig {
    pub enabled: bool,
    pub api_key: String,
    pub max_results: u32,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrieverConfig {
    pub name: String,
    pub description: String,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            name: "travel_docs".into(),
            description: "Search the indexed travel guides for passages about destinations, \
                          sights, opening hours and practical tips. Input is a short search query."
                .into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Optional shared password for the web widget. Empty disables the check.
    pub password: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 18790,
            password: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: Config = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(cfg.agent.max_iterations, 5);
        assert_eq!(cfg.agent.tool_timeout_secs, 20);
        assert_eq!(cfg.agent.memory_key, "chat_history");
        assert_eq!(cfg.index.chunk_size, 1500);
        assert_eq!(cfg.index.chunk_overlap, 200);
        assert_eq!(cfg.index.embedding.provider, EmbeddingProvider::Hashing);
        assert_eq!(cfg.agent.memory_window, MemoryWindowConfig::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn camel_case_fields_parsed() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "agent": {
                "maxIterations": 3,
                "toolTimeoutSecs": 10,
                "memoryKey": "history",
                "memoryWindow": { "maxMessages": 12 }
            },
            "index": {
                "chunkSize": 800,
                "chunkOverlap": 100,
                "embedding": { "provider": "openai" }
            },
            "tools": { "web": { "search": { "apiKey": "k", "maxResults": 3 } } }
        }))
        .unwrap();
        assert_eq!(cfg.agent.max_iterations, 3);
        assert_eq!(cfg.agent.tool_timeout_secs, 10);
        assert_eq!(cfg.agent.memory_key, "history");
        assert_eq!(cfg.agent.memory_window.max_messages, Some(12));
        assert_eq!(cfg.agent.memory_window.max_tokens, None);
        assert_eq!(cfg.index.chunk_size, 800);
        assert_eq!(cfg.index.chunk_overlap, 100);
        assert_eq!(cfg.index.embedding.provider, EmbeddingProvider::Openai);
        assert_eq!(cfg.tools.web.search.api_key, "k");
        assert_eq!(cfg.tools.web.search.max_results, 3);
        // Unspecified siblings keep their defaults
        assert_eq!(cfg.agent.temperature, 0.7);
        assert_eq!(cfg.index.top_k, 4);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let mut cfg = Config::default();
        cfg.index.chunk_overlap = cfg.index.chunk_size;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("chunkOverlap"));
    }

    #[test]
    fn zero_iterations_rejected() {
        let mut cfg = Config::default();
        cfg.agent.max_iterations = 0;
        assert!(cfg.validate().is_err());
    }
}
