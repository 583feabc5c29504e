pub mod loader;
pub mod schema;

pub use loader::{data_dir, find_config_path, load_config, resolve_path, save_config};
pub use schema::{
    AgentConfig, Config, EmbeddingConfig, EmbeddingProvider, GatewayConfig, IndexConfig,
    MemoryWindowConfig, ModelRef, ProviderConfig, RetrieverConfig, WebSearchConfig,
    DEFAULT_SYSTEM_PROMPT,
};
