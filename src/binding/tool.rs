//! Tool trait, arguments helper, and the tool binding factory.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{MusterError, Result};
use crate::platform::{ChatClient, EmbeddingClient};
use crate::records::{DatasourceRecord, RetrieverKind, ToolRecord};
use crate::transport::Transport;

use super::builtin::BuiltinRegistry;
use super::retrieval::{RetrievalStrategy, RetrievalTool, VectorIndexFactory};

/// Context available during tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolExecutionContext {
    pub session_id: String,
    pub tool_call_id: Option<String>,
}

/// Core tool trait. Implement to create custom tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters(&self) -> serde_json::Value;

    /// Execute the tool with parsed arguments.
    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolExecutionContext,
    ) -> Result<serde_json::Value>;
}

/// Parsed tool-call arguments with typed accessors.
#[derive(Debug, Clone, Default)]
pub struct ToolArguments(serde_json::Value);

impl ToolArguments {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        self.get_str_opt(key).ok_or_else(|| {
            MusterError::InvalidState(format!("missing string argument '{key}'"))
        })
    }

    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|v| v.as_u64())
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.0.clone())?)
    }
}

/// Type alias for the tool handler function.
type ToolHandler = dyn Fn(
        ToolArguments,
        ToolExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>
    + Send
    + Sync;

/// Closure-based tool for quick tool creation.
pub struct ClosureTool {
    name: String,
    description: String,
    parameters: serde_json::Value,
    handler: Arc<ToolHandler>,
}

impl ClosureTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }
}

#[async_trait]
impl Tool for ClosureTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> serde_json::Value {
        self.parameters.clone()
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolExecutionContext,
    ) -> Result<serde_json::Value> {
        (self.handler)(args.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for ClosureTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// Session context handed to tool binding.
#[derive(Clone)]
pub struct BindContext {
    pub session_id: String,
    pub transport: Arc<dyn Transport>,
}

/// Turns stored tool records plus resolved dependencies into live tools.
pub struct ToolBinder<'a> {
    registry: &'a BuiltinRegistry,
    indexes: Arc<dyn VectorIndexFactory>,
}

impl<'a> ToolBinder<'a> {
    pub fn new(registry: &'a BuiltinRegistry, indexes: Arc<dyn VectorIndexFactory>) -> Self {
        Self { registry, indexes }
    }

    /// Bind one tool record.
    ///
    /// Retrieval tools need exactly one resolved datasource and one
    /// embedding-capable model under the same composite key. Constructing
    /// the index handle probes it; a failed handshake propagates unretried.
    pub async fn bind(
        &self,
        record: &ToolRecord,
        datasource: Option<&DatasourceRecord>,
        embedder: Option<Arc<dyn EmbeddingClient>>,
        formatter: Option<Arc<dyn ChatClient>>,
        ctx: &BindContext,
    ) -> Result<Arc<dyn Tool>> {
        if record.builtin {
            let factory = self.registry.get(&record.name).ok_or_else(|| {
                MusterError::binding(&record.name, "unknown builtin tool name")
            })?;
            debug!(tool = %record.name, "binding builtin tool");
            return factory(record, ctx);
        }

        if record.is_retrieval() {
            let datasource = datasource.ok_or_else(|| {
                MusterError::binding(&record.name, "retrieval tool has no resolved datasource")
            })?;
            let embedder = embedder.ok_or_else(|| {
                MusterError::binding(
                    &record.name,
                    "retrieval tool has no resolved embedding model",
                )
            })?;
            let index = self.indexes.open(datasource)?;
            index.probe().await?;

            let strategy = RetrievalStrategy::from_record(
                record.retriever.as_ref().unwrap_or(&RetrieverKind::Raw),
                record.retriever_config.as_ref(),
            );
            debug!(tool = %record.name, datasource = %datasource.name, "binding retrieval tool");
            return Ok(Arc::new(RetrievalTool::new(
                record, embedder, index, strategy, formatter,
            )));
        }

        // Custom code tools run in an external sandbox; no runtime here.
        Err(MusterError::binding(
            &record.name,
            "tool is neither builtin nor retrieval-backed",
        ))
    }
}
