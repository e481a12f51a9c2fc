//! Anthropic Messages API chat client.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::debug;

use crate::error::{MusterError, Result};
use crate::records::Platform;

use super::http::{error_for_status, json_headers, shared_client, sse_payload, with_header};
use super::{
    ChatClient, ChatDelta, ChatMessage, ChatRequest, ChatResponse, ChatStream, Role, ToolCall,
    Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicChat {
    model_id: String,
    api_key: String,
    base_url: String,
}

impl AnthropicChat {
    pub fn new(model_id: impl Into<String>, api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            model_id: model_id.into(),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        let headers = with_header(json_headers(), "x-api-key", &self.api_key);
        with_header(headers, "anthropic-version", API_VERSION)
    }

    fn build_request_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        // System prompt travels in its own field, not as a message.
        let system: String = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(message_to_anthropic)
            .collect();

        let mut body = serde_json::json!({
            "model": self.model_id,
            "messages": messages,
            "max_tokens": request.settings.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });
        let obj = body.as_object_mut().unwrap();

        if !system.is_empty() {
            obj.insert("system".into(), system.into());
        }
        if let Some(temp) = request.settings.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if let Some(top_p) = request.settings.top_p {
            obj.insert("top_p".into(), top_p.into());
        }
        if let Some(ref stops) = request.settings.stop_sequences {
            obj.insert("stop_sequences".into(), serde_json::json!(stops));
        }

        if let Some(ref tools) = request.tools {
            if !tools.is_empty() {
                let tool_defs: Vec<serde_json::Value> = tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect();
                obj.insert("tools".into(), tool_defs.into());
            }
        }

        body
    }
}

#[async_trait]
impl ChatClient for AnthropicChat {
    fn platform(&self) -> Platform {
        Platform::Anthropic
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_request_body(request, false);

        debug!(model = %self.model_id, "anthropic chat");

        let resp = shared_client()
            .post(format!("{}/messages", self.base_url))
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body_text));
        }

        let data: AnthropicResponse = resp.json().await?;
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in data.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(&t),
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: input,
                    });
                }
            }
        }

        Ok(ChatResponse {
            text,
            tool_calls,
            usage: data
                .usage
                .map(|u| Usage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                    total_tokens: u.input_tokens + u.output_tokens,
                })
                .unwrap_or_default(),
        })
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        let body = self.build_request_body(request, true);

        debug!(model = %self.model_id, "anthropic stream_chat");

        let resp = shared_client()
            .post(format!("{}/messages", self.base_url))
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
            let mut current_block_type: Option<String> = None;
            let mut current_tool_id: Option<String> = None;
            let mut current_tool_name: Option<String> = None;
            let mut current_tool_input = String::new();
            let mut usage = Usage::default();
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
                    let Some(data) = sse_payload(&line) else { continue; };
                    let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
                        continue;
                    };
                    let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
                    match event_type {
                        "message_start" => {
                            if let Some(input) = event
                                .pointer("/message/usage/input_tokens")
                                .and_then(|v| v.as_u64())
                            {
                                usage.input_tokens = input as u32;
                            }
                        }
                        "content_block_start" => {
                            if let Some(block) = event.get("content_block") {
                                let btype = block.get("type").and_then(|t| t.as_str()).unwrap_or("");
                                current_block_type = Some(btype.to_string());
                                if btype == "tool_use" {
                                    current_tool_id =
                                        block.get("id").and_then(|v| v.as_str()).map(String::from);
                                    current_tool_name =
                                        block.get("name").and_then(|v| v.as_str()).map(String::from);
                                    current_tool_input.clear();
                                }
                            }
                        }
                        "content_block_delta" => {
                            if let Some(delta) = event.get("delta") {
                                let delta_type =
                                    delta.get("type").and_then(|t| t.as_str()).unwrap_or("");
                                match delta_type {
                                    "text_delta" => {
                                        if let Some(text) =
                                            delta.get("text").and_then(|t| t.as_str())
                                        {
                                            yield Ok(ChatDelta::token(text));
                                        }
                                    }
                                    "input_json_delta" => {
                                        if let Some(json) =
                                            delta.get("partial_json").and_then(|t| t.as_str())
                                        {
                                            current_tool_input.push_str(json);
                                        }
                                    }
                                    _ => {}
                                }
                            }
                        }
                        "content_block_stop" => {
                            if current_block_type.as_deref() == Some("tool_use") {
                                if let (Some(id), Some(name)) =
                                    (current_tool_id.take(), current_tool_name.take())
                                {
                                    let args = serde_json::from_str(&current_tool_input)
                                        .unwrap_or(serde_json::Value::String(
                                            current_tool_input.clone(),
                                        ));
                                    yield Ok(ChatDelta::tool_call(ToolCall {
                                        id,
                                        name,
                                        arguments: args,
                                    }));
                                    current_tool_input.clear();
                                }
                            }
                            current_block_type = None;
                        }
                        "message_delta" => {
                            if let Some(output) = event
                                .pointer("/usage/output_tokens")
                                .and_then(|v| v.as_u64())
                            {
                                usage.output_tokens = output as u32;
                            }
                        }
                        "message_stop" => {
                            usage.total_tokens = usage.input_tokens + usage.output_tokens;
                            yield Ok(ChatDelta::done(Some(usage)));
                            return;
                        }
                        "error" => {
                            let message = event
                                .pointer("/error/message")
                                .and_then(|m| m.as_str())
                                .unwrap_or("stream error")
                                .to_string();
                            yield Err(MusterError::Stream(message));
                            return;
                        }
                        _ => {}
                    }
                }
            }

            yield Ok(ChatDelta::done(None));
        };

        Ok(Box::pin(stream))
    }
}

fn message_to_anthropic(msg: &ChatMessage) -> serde_json::Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": msg.tool_call_id,
                "content": msg.content,
            }],
        }),
        Role::Assistant if !msg.tool_calls.is_empty() => {
            let mut content = Vec::new();
            if !msg.content.is_empty() {
                content.push(serde_json::json!({ "type": "text", "text": msg.content }));
            }
            for tc in &msg.tool_calls {
                content.push(serde_json::json!({
                    "type": "tool_use",
                    "id": tc.id,
                    "name": tc.name,
                    "input": tc.arguments,
                }));
            }
            serde_json::json!({ "role": "assistant", "content": content })
        }
        Role::Assistant => serde_json::json!({ "role": "assistant", "content": msg.content }),
        _ => serde_json::json!({ "role": "user", "content": msg.content }),
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}
