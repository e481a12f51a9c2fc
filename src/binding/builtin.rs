//! Builtin tool registry.
//!
//! An explicit, immutable registration table constructed once at process
//! start and passed by reference into binding, never ambient global state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::records::ToolRecord;

use super::human::{HumanInputTool, HUMAN_INPUT_TOOL_NAME};
use super::tool::{BindContext, Tool};

/// Constructor for one builtin tool.
pub type BuiltinFactory =
    Arc<dyn Fn(&ToolRecord, &BindContext) -> Result<Arc<dyn Tool>> + Send + Sync>;

/// Name -> constructor table for builtin tools.
pub struct BuiltinRegistry {
    entries: HashMap<String, BuiltinFactory>,
}

impl BuiltinRegistry {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The stock table: the human-input tool. Embedders extend it with
    /// their own wrappers before building any sessions.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(HUMAN_INPUT_TOOL_NAME, |record, ctx| {
            Ok(Arc::new(HumanInputTool::new(
                ctx.session_id.clone(),
                record.name.clone(),
                ctx.transport.clone(),
            )) as Arc<dyn Tool>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ToolRecord, &BindContext) -> Result<Arc<dyn Tool>> + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn get(&self, name: &str) -> Option<&BuiltinFactory> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
