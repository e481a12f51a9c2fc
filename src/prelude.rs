//! Convenience re-exports for common use.

pub use crate::binding::{
    BindContext, BuiltinRegistry, ModelBinder, Tool, ToolArguments, ToolBinder,
    HUMAN_INPUT_TOOL_NAME,
};
pub use crate::cancel::{CancellationMonitor, FlagStore};
pub use crate::config::MusterConfig;
pub use crate::error::{MusterError, Result};
pub use crate::events::{EventRouter, ExecutionEvent, WireEnvelope, WireKind, WireMessage};
pub use crate::graph::{CompositeKey, EntityGraphResolver, ResolvedGraph};
pub use crate::platform::{
    ChatClient, ChatMessage, ChatRequest, EmbeddingClient, GenerationSettings, Role, Usage,
};
pub use crate::pool::SessionPool;
pub use crate::records::{ConfigStore, Platform, TeamInput};
pub use crate::session::{
    CheckpointStore, ConversationMachine, SessionHandle, SessionResult, SessionStatus, TeamRun,
    TeamRunner,
};
pub use crate::team::{RuntimeTeam, TeamAssembler};
pub use crate::transport::{Transport, TERMINATE_SENTINEL};
