pub mod agent;
pub mod error;
pub mod index;
pub mod memory;
pub mod presenter;
pub mod session;
pub mod tools;

// Re-export key types
pub use agent::{AgentLoop, LanguageModel, TurnOutcome};
pub use error::{AgentError, IndexError, ModelError, RegistryError, ToolError};
pub use index::{DocumentIndex, SearchHit};
pub use memory::{ConversationMemory, Message, Role};
pub use presenter::{CollectingPresenter, Presenter, TranscriptBuffer};
pub use session::{ChatSession, ResetScope, SessionFactory, TranscriptEntry};
pub use tools::{Tool, ToolRegistry};
