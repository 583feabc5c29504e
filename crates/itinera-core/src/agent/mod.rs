pub mod context;
pub mod r#loop;
pub mod model;
pub mod rig_model;

pub use context::ContextBuilder;
pub use model::{LanguageModel, ModelEvent, ModelRequest, ModelStream, ToolCallRequest};
pub use r#loop::{AgentLoop, ToolInvocation, TurnOutcome, EMPTY_REPLY_FALLBACK};
pub use rig_model::RigModel;
