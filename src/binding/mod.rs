//! Binding factories: stored records plus their resolved dependencies in,
//! live invocable runtime objects out.

pub mod builtin;
pub mod human;
pub mod model;
pub mod retrieval;
pub mod tool;

pub use builtin::BuiltinRegistry;
pub use human::{HumanInputTool, HUMAN_INPUT_TOOL_NAME};
pub use model::{BoundModel, ModelBinder};
pub use retrieval::{
    MemoryIndexFactory, MemoryVectorIndex, RetrievedChunk, VectorIndexFactory, VectorSearch,
};
pub use tool::{BindContext, ClosureTool, Tool, ToolArguments, ToolBinder, ToolExecutionContext};
