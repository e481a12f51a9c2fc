//! Ollama local chat and embedding clients. No credential required.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::debug;

use crate::error::{MusterError, Result};
use crate::records::Platform;

use super::http::{error_for_status, shared_client};
use super::{
    ChatClient, ChatDelta, ChatMessage, ChatRequest, ChatResponse, ChatStream, EmbeddingClient,
    Role, ToolCall, Usage,
};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaChat {
    model_id: String,
    base_url: String,
}

impl OllamaChat {
    pub fn new(model_id: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            model_id: model_id.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn build_request_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(message_to_ollama)
            .collect();

        let mut body = serde_json::json!({
            "model": self.model_id,
            "messages": messages,
            "stream": stream,
        });
        let obj = body.as_object_mut().unwrap();

        let mut options = serde_json::Map::new();
        if let Some(temp) = request.settings.temperature {
            options.insert("temperature".into(), temp.into());
        }
        if let Some(max) = request.settings.max_tokens {
            options.insert("num_predict".into(), max.into());
        }
        if !options.is_empty() {
            obj.insert("options".into(), options.into());
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
}

#[async_trait]
impl ChatClient for OllamaChat {
    fn platform(&self) -> Platform {
        Platform::Ollama
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_request_body(request, false);

        debug!(model = %self.model_id, "ollama chat");

        let resp = shared_client()
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body_text));
        }

        let data: OllamaChatResponse = resp.json().await?;
        Ok(ChatResponse {
            tool_calls: data
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(i, tc)| ToolCall {
                    id: format!("call_{i}"),
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                })
                .collect(),
            text: data.message.content,
            usage: ollama_usage(data.prompt_eval_count, data.eval_count),
        })
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        let body = self.build_request_body(request, true);

        debug!(model = %self.model_id, "ollama stream_chat");

        let resp = shared_client()
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body_text));
        }

        let byte_stream = resp.bytes_stream();

        // NDJSON, one object per line.
        let stream = async_stream::stream! {
            let mut buffer = String::new();
            let mut call_index = 0usize;
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
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(part) = serde_json::from_str::<OllamaChatResponse>(&line) else {
                        continue;
                    };
                    if !part.message.content.is_empty() {
                        yield Ok(ChatDelta::token(part.message.content));
                    }
                    for tc in part.message.tool_calls.unwrap_or_default() {
                        yield Ok(ChatDelta::tool_call(ToolCall {
                            id: format!("call_{call_index}"),
                            name: tc.function.name,
                            arguments: tc.function.arguments,
                        }));
                        call_index += 1;
                    }
                    if part.done {
                        yield Ok(ChatDelta::done(Some(ollama_usage(
                            part.prompt_eval_count,
                            part.eval_count,
                        ))));
                        return;
                    }
                }
            }

            yield Ok(ChatDelta::done(None));
        };

        Ok(Box::pin(stream))
    }
}

pub struct OllamaEmbedding {
    model_id: String,
    base_url: String,
}

impl OllamaEmbedding {
    pub fn new(model_id: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            model_id: model_id.into(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

#[async_trait]
impl EmbeddingClient for OllamaEmbedding {
    fn platform(&self) -> Platform {
        Platform::Ollama
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
            .post(format!("{}/api/embed", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body_text));
        }

        let data: OllamaEmbedResponse = resp.json().await?;
        Ok(data.embeddings)
    }
}

fn message_to_ollama(msg: &ChatMessage) -> serde_json::Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    serde_json::json!({ "role": role, "content": msg.content })
}

fn ollama_usage(prompt: Option<u32>, eval: Option<u32>) -> Usage {
    let input = prompt.unwrap_or(0);
    let output = eval.unwrap_or(0);
    Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
    }
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    done: bool,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    tool_calls: Option<Vec<OllamaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Debug, Deserialize)]
struct OllamaFunction {
    name: String,
    arguments: serde_json::Value,
}
