//! OpenAI Chat Completions and Embeddings clients. Also serves Azure
//! deployments, which speak the same protocol behind different auth headers
//! and URL shapes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::debug;

use crate::error::{MusterError, Result};
use crate::records::Platform;

use super::http::{
    error_for_status, json_headers, shared_client, sse_payload, with_bearer, with_header, SSE_DONE,
};
use super::{
    ChatClient, ChatDelta, ChatMessage, ChatRequest, ChatResponse, ChatStream, EmbeddingClient,
    Role, ToolCall, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// How the endpoint authenticates and shapes its URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthStyle {
    Bearer,
    AzureApiKey,
}

pub struct OpenAiChat {
    model_id: String,
    api_key: String,
    base_url: String,
    api_version: Option<String>,
    style: AuthStyle,
}

impl OpenAiChat {
    pub fn new(model_id: impl Into<String>, api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            model_id: model_id.into(),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_version: None,
            style: AuthStyle::Bearer,
        }
    }

    /// Azure deployment of the same protocol. `base_url` is the resource
    /// endpoint; `model_id` doubles as the deployment name.
    pub fn azure(
        model_id: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            api_version: Some(api_version.into()),
            style: AuthStyle::AzureApiKey,
        }
    }

    fn chat_url(&self) -> String {
        match self.style {
            AuthStyle::Bearer => format!("{}/chat/completions", self.base_url),
            AuthStyle::AzureApiKey => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.base_url,
                self.model_id,
                self.api_version.as_deref().unwrap_or("2024-06-01"),
            ),
        }
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        match self.style {
            AuthStyle::Bearer => with_bearer(json_headers(), &self.api_key),
            AuthStyle::AzureApiKey => with_header(json_headers(), "api-key", &self.api_key),
        }
    }

    fn build_request_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let messages = request
            .messages
            .iter()
            .map(message_to_openai)
            .collect::<Vec<_>>();

        let mut body = serde_json::json!({
            "model": self.model_id,
            "messages": messages,
            "stream": stream,
        });
        let obj = body.as_object_mut().unwrap();

        if let Some(max) = request.settings.max_tokens {
            obj.insert("max_tokens".into(), max.into());
        }
        if let Some(temp) = request.settings.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = request.settings.top_p {
            obj.insert("top_p".into(), top_p.into());
        }
        if let Some(ref stops) = request.settings.stop_sequences {
            obj.insert("stop".into(), serde_json::json!(stops));
        }
        if stream {
            obj.insert(
                "stream_options".into(),
                serde_json::json!({ "include_usage": true }),
            );
        }

        if let Some(ref tools) = request.tools {
            if !tools.is_empty() {
                let tool_defs: Vec<serde_json::Value> = tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect();
                obj.insert("tools".into(), tool_defs.into());
            }
        }

        body
    }

    fn platform_tag(&self) -> Platform {
        match self.style {
            AuthStyle::Bearer => Platform::OpenAi,
            AuthStyle::AzureApiKey => Platform::Azure,
        }
    }
}

#[async_trait]
impl ChatClient for OpenAiChat {
    fn platform(&self) -> Platform {
        self.platform_tag()
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_request_body(request, false);

        debug!(model = %self.model_id, "openai chat");

        let resp = shared_client()
            .post(self.chat_url())
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body_text));
        }

        let data: OpenAiChatResponse = resp.json().await?;
        let choice = data.choices.into_iter().next().ok_or_else(|| MusterError::Api {
            status: 200,
            message: "no choices in response".into(),
        })?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::String(tc.function.arguments)),
            })
            .collect();

        Ok(ChatResponse {
            text: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage: data.usage.map(api_usage).unwrap_or_default(),
        })
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        let body = self.build_request_body(request, true);

        debug!(model = %self.model_id, "openai stream_chat");

        let resp = shared_client()
            .post(self.chat_url())
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body_text));
        }

        let byte_stream = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = String::new();
            // Tool call fragments accumulate per choice index until [DONE].
            let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
            let mut usage: Option<Usage> = None;
            futures::pin_mut!(byte_stream);

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(MusterError::Network(e));
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    if line.strip_prefix("data:").map(str::trim_start) == Some(SSE_DONE) {
                        for (_, call) in std::mem::take(&mut pending) {
                            yield Ok(ChatDelta::tool_call(call.finish()));
                        }
                        yield Ok(ChatDelta::done(usage.take()));
                        return;
                    }

                    let Some(data) = sse_payload(&line) else { continue; };
                    let Ok(chunk) = serde_json::from_str::<OpenAiStreamChunk>(data) else {
                        continue; // skip unparseable chunks
                    };
                    if let Some(u) = chunk.usage {
                        usage = Some(api_usage(u));
                    }
                    let Some(choice) = chunk.choices.into_iter().next() else { continue; };

                    if let Some(text) = choice.delta.content {
                        if !text.is_empty() {
                            yield Ok(ChatDelta::token(text));
                        }
                    }
                    for frag in choice.delta.tool_calls.unwrap_or_default() {
                        let entry = pending.entry(frag.index).or_default();
                        if let Some(id) = frag.id {
                            entry.id = id;
                        }
                        if let Some(function) = frag.function {
                            if let Some(name) = function.name {
                                entry.name = name;
                            }
                            if let Some(arguments) = function.arguments {
                                entry.arguments.push_str(&arguments);
                            }
                        }
                    }
                }
            }

            // Stream closed without a [DONE] marker; flush what arrived.
            for (_, call) in std::mem::take(&mut pending) {
                yield Ok(ChatDelta::tool_call(call.finish()));
            }
            yield Ok(ChatDelta::done(usage.take()));
        };

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl PendingToolCall {
    fn finish(self) -> ToolCall {
        ToolCall {
            arguments: serde_json::from_str(&self.arguments)
                .unwrap_or(serde_json::Value::String(self.arguments)),
            id: self.id,
            name: self.name,
        }
    }
}

/// OpenAI embeddings client.
pub struct OpenAiEmbedding {
    model_id: String,
    api_key: String,
    base_url: String,
}

impl OpenAiEmbedding {
    pub fn new(model_id: impl Into<String>, api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            model_id: model_id.into(),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbedding {
    fn platform(&self) -> Platform {
        Platform::OpenAi
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model_id,
            "input": texts,
        });

        let resp = shared_client()
            .post(format!("{}/embeddings", self.base_url))
            .headers(with_bearer(json_headers(), &self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body_text));
        }

        let data: OpenAiEmbeddingResponse = resp.json().await?;
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }
}

fn message_to_openai(msg: &ChatMessage) -> serde_json::Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    if msg.role == Role::Tool {
        return serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id,
            "content": msg.content,
        });
    }

    if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
        let calls: Vec<serde_json::Value> = msg
            .tool_calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": tc.arguments.to_string(),
                    }
                })
            })
            .collect();
        return serde_json::json!({
            "role": "assistant",
            "content": msg.content,
            "tool_calls": calls,
        });
    }

    serde_json::json!({ "role": role, "content": msg.content })
}

fn api_usage(u: ApiUsage) -> Usage {
    Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
    }
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCallFragment>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallFragment {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<StreamFunctionFragment>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}
