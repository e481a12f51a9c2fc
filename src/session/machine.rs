//! The conversation state machine: alternates model calls, tool calls, and
//! human-input round trips for one task, streaming events as it goes.

use std::sync::Arc;

use futures::StreamExt;
use tokio::time::{self, Duration};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::binding::{Tool, ToolArguments, ToolExecutionContext, HUMAN_INPUT_TOOL_NAME};
use crate::cancel::CancellationMonitor;
use crate::config::MusterConfig;
use crate::error::{MusterError, Result};
use crate::events::{EventRouter, ExecutionEvent, LimitKind};
use crate::platform::{
    requires_alternation, ChatClient, ChatDeltaKind, ChatMessage, ChatRequest, GenerationSettings,
    Role, ToolCall, ToolDefinition, Usage,
};
use crate::team::RuntimeAgent;
use crate::transport::TERMINATE_SENTINEL;

use super::history::CheckpointStore;
use super::repair::repair_alternation;

/// How a session's execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The model finished without requesting further work.
    Completed,
    /// A human reply carried the terminate sentinel; all remaining tasks
    /// are skipped.
    Terminated,
    /// The qualifying-message cap was reached.
    MessageLimit,
    /// The model/tool call depth cap was reached.
    RecursionLimit,
    /// The external stop flag was observed.
    Canceled,
    /// An unrecoverable error ended the session.
    Failed,
}

/// Outcome of running one task to termination.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub status: SessionStatus,
    /// The last assistant text produced before termination.
    pub text: String,
    pub usage: Usage,
}

impl SessionResult {
    /// Whether a team runner should proceed to the next task.
    pub fn should_continue(&self) -> bool {
        self.status == SessionStatus::Completed
    }
}

/// What one streamed model turn produced.
enum Turn {
    Response {
        text: String,
        calls: Vec<ToolCall>,
        usage: Usage,
    },
    Canceled,
}

/// Drives one task's conversation. The machine exclusively owns the history
/// it is handed and checkpoints it on every exit path.
pub struct ConversationMachine {
    config: MusterConfig,
    router: Arc<EventRouter>,
    monitor: Arc<CancellationMonitor>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl ConversationMachine {
    pub fn new(
        config: MusterConfig,
        router: Arc<EventRouter>,
        monitor: Arc<CancellationMonitor>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            router,
            monitor,
            checkpoints,
        }
    }

    /// Run the loop until a terminal state.
    ///
    /// The first no-tool-call response always routes through a human-input
    /// round trip instead of ending the session, so a task never closes
    /// without giving the user a chance to respond.
    pub async fn run(
        &self,
        agent: &RuntimeAgent,
        tools: &[Arc<dyn Tool>],
        history: &mut Vec<ChatMessage>,
        settings: &GenerationSettings,
    ) -> SessionResult {
        let client = agent.client.clone();
        let author = agent.name().to_string();
        let tool_defs = definitions(tools);
        let mut usage = Usage::default();
        let mut last_text = String::new();
        let mut human_invoked = false;
        let mut depth = 0usize;

        loop {
            // Limit check happens before the call, never aborting one in
            // flight. Human-input tool results are exempt from the count.
            let qualifying = qualifying_messages(history);
            if qualifying > self.config.max_messages {
                self.router
                    .route(ExecutionEvent::LimitReached {
                        limit: LimitKind::Messages(self.config.max_messages),
                    })
                    .await;
                return self
                    .finish(history, SessionStatus::MessageLimit, last_text, usage)
                    .await;
            }

            if self.monitor.is_cancelled().await {
                return self.stopped(history, last_text, usage).await;
            }

            if requires_alternation(client.platform()) {
                repair_alternation(history);
            }

            let request = ChatRequest {
                messages: history.clone(),
                settings: settings.clone(),
                tools: tool_defs.clone(),
            };
            let turn = match self.stream_turn(client.as_ref(), &request, &author).await {
                Ok(turn) => turn,
                Err(err) => return self.failed(history, &author, err, last_text, usage).await,
            };
            let (text, calls, turn_usage) = match turn {
                Turn::Response { text, calls, usage } => (text, calls, usage),
                Turn::Canceled => return self.stopped(history, last_text, usage).await,
            };
            usage.add(&turn_usage);
            if !text.is_empty() {
                last_text = text.clone();
            }

            self.router
                .route(ExecutionEvent::ModelComplete {
                    author: author.clone(),
                    text: text.clone(),
                    internal: false,
                })
                .await;

            if calls.is_empty() {
                history.push(ChatMessage::assistant(text.clone()));
                if !human_invoked {
                    human_invoked = true;
                    let reply = match self.router.feedback(&author, &text).await {
                        Ok(reply) => reply,
                        Err(err) => {
                            return self.failed(history, &author, err, last_text, usage).await
                        }
                    };
                    if reply.trim() == TERMINATE_SENTINEL {
                        return self
                            .finish(history, SessionStatus::Terminated, last_text, usage)
                            .await;
                    }
                    history.push(ChatMessage::user(reply));
                    continue;
                }
                return self
                    .finish(history, SessionStatus::Completed, last_text, usage)
                    .await;
            }

            history.push(ChatMessage::assistant_with_calls(text, calls.clone()));

            depth += 1;
            if depth > self.config.max_recursion {
                self.router
                    .route(ExecutionEvent::LimitReached {
                        limit: LimitKind::Recursion(self.config.max_recursion),
                    })
                    .await;
                return self
                    .finish(history, SessionStatus::RecursionLimit, last_text, usage)
                    .await;
            }

            if self.monitor.is_cancelled().await {
                return self.stopped(history, last_text, usage).await;
            }

            // Regular tools run first. A human-input call suspends the loop,
            // so it goes last within the turn.
            let run_id = Uuid::new_v4();
            let (human_calls, tool_calls): (Vec<_>, Vec<_>) = calls
                .into_iter()
                .partition(|c| c.name == HUMAN_INPUT_TOOL_NAME);

            for call in tool_calls {
                match self.execute_tool(tools, &author, run_id, &call, history).await {
                    Ok(()) => {}
                    Err(err) => return self.failed(history, &author, err, last_text, usage).await,
                }
            }

            for call in human_calls {
                human_invoked = true;
                let reply = match tools.iter().find(|t| t.name() == HUMAN_INPUT_TOOL_NAME) {
                    Some(tool) => {
                        let args = ToolArguments::new(call.arguments.clone());
                        let ctx = ToolExecutionContext {
                            session_id: self.router.session_id().to_string(),
                            tool_call_id: Some(call.id.clone()),
                        };
                        match tool.execute(&args, &ctx).await {
                            Ok(value) => {
                                if value.get("terminate").and_then(|v| v.as_bool())
                                    == Some(true)
                                {
                                    return self
                                        .finish(
                                            history,
                                            SessionStatus::Terminated,
                                            last_text,
                                            usage,
                                        )
                                        .await;
                                }
                                value
                                    .get("feedback")
                                    .and_then(|v| v.as_str())
                                    .map(str::to_string)
                                    .unwrap_or_else(|| value.to_string())
                            }
                            Err(err) => {
                                return self.failed(history, &author, err, last_text, usage).await
                            }
                        }
                    }
                    // The model can name the tool without it being offered.
                    // Fall back to a direct round trip over the transport.
                    None => {
                        let question = call
                            .arguments
                            .get("question")
                            .and_then(|v| v.as_str())
                            .unwrap_or(&last_text)
                            .to_string();
                        match self.router.feedback(&author, &question).await {
                            Ok(reply) => reply,
                            Err(err) => {
                                return self.failed(history, &author, err, last_text, usage).await
                            }
                        }
                    }
                };
                if reply.trim() == TERMINATE_SENTINEL {
                    return self
                        .finish(history, SessionStatus::Terminated, last_text, usage)
                        .await;
                }
                history.push(ChatMessage::tool_result(
                    call.id,
                    HUMAN_INPUT_TOOL_NAME,
                    reply,
                ));
            }
        }
    }

    /// Stream one model response, assembling text and tool calls. The
    /// stop flag is polled before each delta is routed; an idle stream
    /// fails after the configured window.
    async fn stream_turn(
        &self,
        client: &dyn ChatClient,
        request: &ChatRequest,
        author: &str,
    ) -> Result<Turn> {
        let mut stream = client.stream_chat(request).await?;
        let mut text = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        let mut usage = Usage::default();

        let idle_timeout_ms = request
            .settings
            .stream_idle_timeout_ms
            .unwrap_or(self.config.stream_idle_timeout_ms);
        let mut idle_sleep = (idle_timeout_ms > 0)
            .then(|| Box::pin(time::sleep(Duration::from_millis(idle_timeout_ms))));

        loop {
            tokio::select! {
                _ = idle_sleep.as_mut().unwrap(), if idle_sleep.is_some() => {
                    return Err(MusterError::Stream("stream idle timeout".to_string()));
                }
                delta = stream.next() => {
                    let Some(delta) = delta else { break; };
                    let delta = delta?;
                    if let Some(ref mut sleep) = idle_sleep {
                        sleep
                            .as_mut()
                            .reset(time::Instant::now() + Duration::from_millis(idle_timeout_ms));
                    }
                    if self.monitor.is_cancelled().await {
                        return Ok(Turn::Canceled);
                    }
                    match delta.kind {
                        ChatDeltaKind::Token => {
                            if !delta.text.is_empty() {
                                text.push_str(&delta.text);
                                self.router
                                    .route(ExecutionEvent::ModelToken {
                                        author: author.to_string(),
                                        token: delta.text,
                                        internal: false,
                                    })
                                    .await;
                            }
                        }
                        ChatDeltaKind::ToolCall => {
                            if let Some(call) = delta.tool_call {
                                calls.push(call);
                            }
                        }
                        ChatDeltaKind::Done => {
                            if let Some(turn_usage) = delta.usage {
                                usage = turn_usage;
                            }
                            break;
                        }
                    }
                }
            }
        }

        debug!(
            author,
            text_len = text.len(),
            tool_calls = calls.len(),
            "model turn complete"
        );
        Ok(Turn::Response { text, calls, usage })
    }

    /// Execute one regular tool call and append its result to history.
    /// Non-fatal tool failures become error-shaped results the model can
    /// read; session-fatal ones propagate.
    async fn execute_tool(
        &self,
        tools: &[Arc<dyn Tool>],
        author: &str,
        run_id: Uuid,
        call: &ToolCall,
        history: &mut Vec<ChatMessage>,
    ) -> Result<()> {
        self.router
            .route(ExecutionEvent::ToolStart {
                run_id,
                author: author.to_string(),
                tool: call.name.clone(),
            })
            .await;

        let output = match tools.iter().find(|t| t.name() == call.name) {
            None => serde_json::json!({ "error": format!("unknown tool '{}'", call.name) }),
            Some(tool) => {
                let args = ToolArguments::new(call.arguments.clone());
                let ctx = ToolExecutionContext {
                    session_id: self.router.session_id().to_string(),
                    tool_call_id: Some(call.id.clone()),
                };
                match tool.execute(&args, &ctx).await {
                    Ok(value) => value,
                    Err(err) if err.is_session_fatal() => return Err(err),
                    Err(err) => {
                        warn!(tool = %call.name, %err, "tool call failed; reporting to model");
                        serde_json::json!({ "error": err.to_string() })
                    }
                }
            }
        };

        let rendered = match &output {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.router
            .route(ExecutionEvent::ToolEnd {
                run_id,
                author: author.to_string(),
                tool: call.name.clone(),
                output: rendered.clone(),
            })
            .await;
        history.push(ChatMessage::tool_result(&call.id, &call.name, rendered));
        Ok(())
    }

    async fn stopped(
        &self,
        history: &[ChatMessage],
        text: String,
        usage: Usage,
    ) -> SessionResult {
        self.router.route(ExecutionEvent::Stopped).await;
        self.monitor.reset().await;
        self.finish(history, SessionStatus::Canceled, text, usage)
            .await
    }

    async fn failed(
        &self,
        history: &[ChatMessage],
        author: &str,
        err: MusterError,
        text: String,
        usage: Usage,
    ) -> SessionResult {
        self.router
            .route(ExecutionEvent::Error {
                author: author.to_string(),
                message: err.to_string(),
                trace: Some(format!("{err:?}")),
            })
            .await;
        self.finish(history, SessionStatus::Failed, text, usage)
            .await
    }

    /// Checkpoint and build the result. Every exit path lands here, so
    /// mutated history survives limits and cancellation alike.
    async fn finish(
        &self,
        history: &[ChatMessage],
        status: SessionStatus,
        text: String,
        usage: Usage,
    ) -> SessionResult {
        if let Err(err) = self
            .checkpoints
            .save(self.router.session_id(), history)
            .await
        {
            warn!(session = %self.router.session_id(), %err, "history checkpoint failed");
        }
        debug!(session = %self.router.session_id(), ?status, "session loop finished");
        SessionResult {
            status,
            text,
            usage,
        }
    }
}

fn definitions(tools: &[Arc<dyn Tool>]) -> Option<Vec<ToolDefinition>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect(),
    )
}

/// Count the messages that the configured cap applies to: assistant
/// messages plus tool results from anything other than the human-input
/// tool.
pub fn qualifying_messages(history: &[ChatMessage]) -> usize {
    history
        .iter()
        .filter(|m| match m.role {
            Role::Assistant => true,
            Role::Tool => m.name.as_deref() != Some(HUMAN_INPUT_TOOL_NAME),
            _ => false,
        })
        .count()
}
