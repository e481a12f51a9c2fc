//! Execution events and the router that maps them onto the wire schema.

use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::Display;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::transport::Transport;

/// Event kind on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
pub enum WireKind {
    #[serde(rename = "message")]
    #[strum(serialize = "message")]
    Message,
    #[serde(rename = "message_complete")]
    #[strum(serialize = "message_complete")]
    MessageComplete,
    #[serde(rename = "terminate")]
    #[strum(serialize = "terminate")]
    Terminate,
    #[serde(rename = "isFeedback")]
    #[strum(serialize = "isFeedback")]
    Feedback,
}

/// How the receiving side renders a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DisplayType {
    Bubble,
    Inline,
}

/// One streamed message fragment on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Correlation id grouping fragments into one logical message.
    pub chunk_id: Uuid,
    pub text: String,
    /// True on the first fragment of a logical message.
    pub first: bool,
    /// Running token count within the logical message.
    pub tokens: u32,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub display_type: DisplayType,
    /// The receiver replaces the chunk's prior content instead of appending.
    pub overwrite: bool,
    /// One-shot message; no further fragments will follow this chunk id.
    pub single: bool,
}

/// Envelope addressed to a session's room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub room: String,
    pub author_name: String,
    pub message: WireMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_feedback: Option<bool>,
}

/// Which configured limit ended the session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Messages(usize),
    Recursion(usize),
}

/// Internal execution events emitted by the session loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ModelToken {
        author: String,
        token: String,
        /// Internal-only sub-call output (e.g. retrieval formatting); the
        /// router never forwards it.
        #[serde(default)]
        internal: bool,
    },
    ModelComplete {
        author: String,
        text: String,
        #[serde(default)]
        internal: bool,
    },
    ToolStart {
        /// The model invocation's run id; unique per invocation, so
        /// concurrent calls within one turn do not collide.
        run_id: Uuid,
        author: String,
        tool: String,
    },
    ToolEnd {
        run_id: Uuid,
        author: String,
        tool: String,
        output: String,
    },
    LimitReached {
        limit: LimitKind,
    },
    Stopped,
    Error {
        author: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace: Option<String>,
    },
}

/// Correlation state for the in-flight logical message.
#[derive(Debug)]
struct ChunkState {
    id: Uuid,
    tokens: u32,
}

/// Maps [`ExecutionEvent`]s to wire messages and forwards them to the
/// transport. Send failures are logged and swallowed; delivery is
/// best-effort and never takes the session down.
pub struct EventRouter {
    session_id: String,
    transport: Arc<dyn Transport>,
    chunk: Mutex<Option<ChunkState>>,
}

impl EventRouter {
    pub fn new(session_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            session_id: session_id.into(),
            transport,
            chunk: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Route one event. Returns the wire message that was forwarded, if any.
    pub async fn route(&self, event: ExecutionEvent) -> Option<WireMessage> {
        match event {
            ExecutionEvent::ModelToken {
                author,
                token,
                internal,
            } => {
                if internal {
                    return None;
                }
                let (id, first, tokens) = {
                    let mut guard = self.chunk.lock().unwrap();
                    let first = guard.is_none();
                    let state = guard.get_or_insert_with(|| ChunkState {
                        id: Uuid::new_v4(),
                        tokens: 0,
                    });
                    state.tokens += 1;
                    (state.id, first, state.tokens)
                };
                let message = wire_message(id, token, first, tokens, DisplayType::Bubble, false, false);
                self.send(WireKind::Message, &author, message.clone(), None)
                    .await;
                Some(message)
            }
            ExecutionEvent::ModelComplete {
                author,
                text,
                internal,
            } => {
                if internal {
                    return None;
                }
                // Retire the chunk id; the next message draws a fresh one.
                let state = self.chunk.lock().unwrap().take();
                let (id, tokens) = state
                    .map(|s| (s.id, s.tokens))
                    .unwrap_or_else(|| (Uuid::new_v4(), 0));
                let message =
                    wire_message(id, text, tokens == 0, tokens, DisplayType::Bubble, true, false);
                self.send(WireKind::MessageComplete, &author, message.clone(), None)
                    .await;
                Some(message)
            }
            ExecutionEvent::ToolStart {
                run_id,
                author,
                tool,
            } => {
                let message = wire_message(
                    run_id,
                    format!("Using tool: {tool}..."),
                    true,
                    0,
                    DisplayType::Inline,
                    false,
                    false,
                );
                self.send(WireKind::Message, &author, message.clone(), None)
                    .await;
                Some(message)
            }
            ExecutionEvent::ToolEnd {
                run_id,
                author,
                tool,
                output,
            } => {
                let message = wire_message(
                    run_id,
                    format!("Used tool: {tool}\n{output}"),
                    false,
                    0,
                    DisplayType::Inline,
                    true,
                    false,
                );
                self.send(WireKind::Message, &author, message.clone(), None)
                    .await;
                Some(message)
            }
            ExecutionEvent::LimitReached { limit } => {
                let text = match limit {
                    LimitKind::Messages(max) => {
                        format!("Session reached the configured message limit ({max}).")
                    }
                    LimitKind::Recursion(max) => {
                        format!("Session reached the configured recursion depth ({max}).")
                    }
                };
                let message = wire_message(
                    Uuid::new_v4(),
                    text,
                    true,
                    0,
                    DisplayType::Bubble,
                    false,
                    true,
                );
                self.send(WireKind::Message, "system", message.clone(), None)
                    .await;
                Some(message)
            }
            ExecutionEvent::Stopped => {
                let message = wire_message(
                    Uuid::new_v4(),
                    "Session stopped.".to_string(),
                    true,
                    0,
                    DisplayType::Inline,
                    false,
                    true,
                );
                self.send(WireKind::Terminate, "system", message.clone(), None)
                    .await;
                Some(message)
            }
            ExecutionEvent::Error {
                author,
                message,
                trace,
            } => {
                let inline = wire_message(
                    Uuid::new_v4(),
                    message,
                    true,
                    0,
                    DisplayType::Inline,
                    false,
                    true,
                );
                self.send(WireKind::Message, &author, inline.clone(), None)
                    .await;
                if let Some(trace) = trace {
                    let bubble = wire_message(
                        Uuid::new_v4(),
                        trace,
                        true,
                        0,
                        DisplayType::Bubble,
                        false,
                        true,
                    );
                    self.send(WireKind::Message, &author, bubble, None).await;
                }
                Some(inline)
            }
        }
    }

    /// Human-input round trip: emit the feedback request, then block until a
    /// reply arrives on the transport. Unlike ordinary routing, failures
    /// here propagate; the session cannot proceed without the reply.
    pub async fn feedback(&self, author: &str, prompt: &str) -> Result<String> {
        let message = wire_message(
            Uuid::new_v4(),
            prompt.to_string(),
            true,
            0,
            DisplayType::Bubble,
            false,
            true,
        );
        let envelope = WireEnvelope {
            room: self.session_id.clone(),
            author_name: author.to_string(),
            message,
            is_feedback: Some(true),
        };
        self.transport.send(WireKind::Feedback, envelope).await?;
        self.transport.recv_feedback(&self.session_id).await
    }

    async fn send(
        &self,
        kind: WireKind,
        author: &str,
        message: WireMessage,
        is_feedback: Option<bool>,
    ) {
        let envelope = WireEnvelope {
            room: self.session_id.clone(),
            author_name: author.to_string(),
            message,
            is_feedback,
        };
        if let Err(err) = self.transport.send(kind, envelope).await {
            warn!(session = %self.session_id, %err, "transport send failed; continuing");
        }
    }
}

fn wire_message(
    chunk_id: Uuid,
    text: impl Into<String>,
    first: bool,
    tokens: u32,
    display_type: DisplayType,
    overwrite: bool,
    single: bool,
) -> WireMessage {
    WireMessage {
        chunk_id,
        text: text.into(),
        first,
        tokens,
        timestamp: Utc::now().timestamp_millis(),
        display_type,
        overwrite,
        single,
    }
}
