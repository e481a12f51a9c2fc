//! Platform clients: message types, the chat/embedding client traits, and
//! one concrete client per supported platform.

pub mod anthropic;
pub mod http;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::records::Platform;

/// Conversation role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A message in a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool results: the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For tool results: the tool's name. The session loop uses this to
    /// exclude human-input results from the message cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    pub fn assistant_with_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, text)
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(tool_name.into()),
            ..Self::plain(Role::Tool, result)
        }
    }

    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            timestamp: Some(Utc::now()),
        }
    }
}

/// Tool definition sent to the platform API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Token usage accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Generation settings carried on every chat request.
#[derive(Debug, Clone, Default, Builder, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Fail the stream if no delta arrives within this window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_idle_timeout_ms: Option<u64>,
}

/// A request sent to a chat client.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub settings: GenerationSettings,
    pub tools: Option<Vec<ToolDefinition>>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            settings: GenerationSettings::default(),
            tools: None,
        }
    }
}

/// Non-streaming chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

/// Kind of streamed delta.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatDeltaKind {
    /// Incremental text content.
    Token,
    /// A fully assembled tool call.
    ToolCall,
    /// Stream finished.
    Done,
}

/// A delta emitted during streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDelta {
    pub kind: ChatDeltaKind,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatDelta {
    pub fn token(text: impl Into<String>) -> Self {
        Self {
            kind: ChatDeltaKind::Token,
            text: text.into(),
            tool_call: None,
            usage: None,
        }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            kind: ChatDeltaKind::ToolCall,
            text: String::new(),
            tool_call: Some(call),
            usage: None,
        }
    }

    pub fn done(usage: Option<Usage>) -> Self {
        Self {
            kind: ChatDeltaKind::Done,
            text: String::new(),
            tool_call: None,
            usage,
        }
    }
}

/// Stream of chat deltas.
pub type ChatStream = BoxStream<'static, Result<ChatDelta>>;

/// An invocable chat model.
#[async_trait]
pub trait ChatClient: Send + Sync {
    fn platform(&self) -> Platform;
    fn model_id(&self) -> &str;

    /// Generate a full response (non-streaming).
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Generate a streaming response.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream>;
}

/// An invocable embedding model.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    fn platform(&self) -> Platform;
    fn model_id(&self) -> &str;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Whether a platform demands strict user/assistant alternation after the
/// system prompt, triggering pre-call repair.
pub fn requires_alternation(platform: Platform) -> bool {
    matches!(platform, Platform::Anthropic)
}
