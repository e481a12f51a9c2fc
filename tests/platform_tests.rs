//! Platform client tests against a mock HTTP server.

use futures::StreamExt;

use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use muster::error::MusterError;
use muster::platform::anthropic::AnthropicChat;
use muster::platform::ollama::{OllamaChat, OllamaEmbedding};
use muster::platform::openai::{OpenAiChat, OpenAiEmbedding};
use muster::platform::{ChatClient, ChatDeltaKind, ChatMessage, ChatRequest, EmbeddingClient};

fn request(text: &str) -> ChatRequest {
    ChatRequest::new(vec![
        ChatMessage::system("be brief"),
        ChatMessage::user(text),
    ])
}

#[tokio::test]
async fn openai_chat_sends_bearer_auth_and_parses_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_string_contains("be brief"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "hello" } }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiChat::new("gpt-4o", "sk-test", Some(server.uri()));
    let response = client.chat(&request("hi")).await.unwrap();
    assert_eq!(response.text, "hello");
    assert_eq!(response.usage.total_tokens, 8);
    assert!(response.tool_calls.is_empty());
}

#[tokio::test]
async fn openai_chat_parses_tool_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": "lookup", "arguments": "{\"q\":\"rust\"}" }
                }]
            }}]
        })))
        .mount(&server)
        .await;

    let client = OpenAiChat::new("gpt-4o", "sk-test", Some(server.uri()));
    let response = client.chat(&request("hi")).await.unwrap();
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].name, "lookup");
    assert_eq!(response.tool_calls[0].arguments["q"], "rust");
}

#[tokio::test]
async fn openai_stream_yields_tokens_then_done() {
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}\n\n",
        "data: [DONE]\n\n",
    );
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(body.as_bytes(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let client = OpenAiChat::new("gpt-4o", "sk-test", Some(server.uri()));
    let mut stream = client.stream_chat(&request("hi")).await.unwrap();

    let mut text = String::new();
    let mut done = false;
    while let Some(delta) = stream.next().await {
        let delta = delta.unwrap();
        match delta.kind {
            ChatDeltaKind::Token => text.push_str(&delta.text),
            ChatDeltaKind::Done => {
                assert_eq!(delta.usage.unwrap().total_tokens, 3);
                done = true;
            }
            ChatDeltaKind::ToolCall => panic!("no tool call expected"),
        }
    }
    assert_eq!(text, "Hello");
    assert!(done);
}

#[tokio::test]
async fn openai_unauthorized_maps_to_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let client = OpenAiChat::new("gpt-4o", "sk-bad", Some(server.uri()));
    let err = client.chat(&request("hi")).await.unwrap_err();
    assert!(matches!(err, MusterError::Authentication(_)));
}

#[tokio::test]
async fn azure_chat_uses_deployment_path_and_api_key_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/openai/deployments/my-gpt/chat/completions"))
        .and(header("api-key", "azure-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "ok" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiChat::azure("my-gpt", "azure-key", server.uri(), "2024-06-01");
    let response = client.chat(&request("hi")).await.unwrap();
    assert_eq!(response.text, "ok");
}

#[tokio::test]
async fn openai_embedding_returns_vectors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "embedding": [0.1, 0.2] },
                { "embedding": [0.3, 0.4] }
            ]
        })))
        .mount(&server)
        .await;

    let client = OpenAiEmbedding::new("text-embedding-3-small", "sk-test", Some(server.uri()));
    let vectors = client
        .embed(&["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0], vec![0.1, 0.2]);
}

#[tokio::test]
async fn anthropic_chat_extracts_system_and_parses_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("x-api-key", "ak-test"))
        .and(body_string_contains("\"system\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [
                { "type": "text", "text": "sure, " },
                { "type": "text", "text": "done" },
                { "type": "tool_use", "id": "tu_1", "name": "lookup", "input": { "q": "rust" } }
            ],
            "usage": { "input_tokens": 4, "output_tokens": 6 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = AnthropicChat::new("claude-sonnet", "ak-test", Some(server.uri()));
    let response = client.chat(&request("hi")).await.unwrap();
    assert_eq!(response.text, "sure, done");
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.usage.total_tokens, 10);
}

#[tokio::test]
async fn ollama_chat_needs_no_credential() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": { "role": "assistant", "content": "local says hi" },
            "prompt_eval_count": 2,
            "eval_count": 3,
            "done": true
        })))
        .mount(&server)
        .await;

    let client = OllamaChat::new("llama3", Some(server.uri()));
    let response = client.chat(&request("hi")).await.unwrap();
    assert_eq!(response.text, "local says hi");
    assert_eq!(response.usage.total_tokens, 5);
}

#[tokio::test]
async fn ollama_embedding_parses_vectors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "nomic-embed-text",
            "embeddings": [[0.25, -0.5], [0.75, 1.0]]
        })))
        .mount(&server)
        .await;

    let client = OllamaEmbedding::new("nomic-embed-text", Some(server.uri()));
    let vectors = client
        .embed(&["one".to_string(), "two".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[0], vec![0.25, -0.5]);
}
