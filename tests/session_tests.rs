//! Tests for the conversation state machine and the team runner, using a
//! scripted chat client.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use tokio::sync::mpsc;

use muster::binding::{ClosureTool, HumanInputTool, Tool, HUMAN_INPUT_TOOL_NAME};
use muster::cancel::{request_stop, CancellationMonitor, MemoryFlagStore};
use muster::config::MusterConfig;
use muster::error::{MusterError, Result};
use muster::events::{EventRouter, WireEnvelope, WireKind};
use muster::graph::CompositeKey;
use muster::platform::{
    ChatClient, ChatDelta, ChatMessage, ChatRequest, ChatResponse, ChatStream,
    GenerationSettings, Role, ToolCall, Usage,
};
use muster::records::{AgentRecord, Platform, TaskRecord};
use muster::session::{
    CheckpointStore, ConversationMachine, MemoryCheckpointStore, SessionStatus, TeamRunner,
};
use muster::team::{RuntimeAgent, RuntimeTask, RuntimeTeam};
use muster::transport::{ChannelTransport, Transport};

/// Chat client that replays queued delta sequences and records requests.
struct ScriptedChat {
    turns: Mutex<VecDeque<Vec<ChatDelta>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    fn new(turns: Vec<Vec<ChatDelta>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatClient for ScriptedChat {
    fn platform(&self) -> Platform {
        Platform::OpenAi
    }

    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        Err(MusterError::InvalidState("scripted client streams only".into()))
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChatStream> {
        self.requests.lock().unwrap().push(request.clone());
        let deltas = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| MusterError::InvalidState("no scripted turn left".into()))?;
        Ok(stream::iter(deltas.into_iter().map(Ok)).boxed())
    }
}

fn usage(output: u32) -> Usage {
    Usage {
        input_tokens: 10,
        output_tokens: output,
        total_tokens: 10 + output,
    }
}

fn agent_record(id: &str) -> AgentRecord {
    AgentRecord {
        id: id.to_string(),
        name: "Scout".to_string(),
        role: "Researcher".to_string(),
        goal: "Find facts".to_string(),
        backstory: String::new(),
        system_message: None,
        model_id: "m1".to_string(),
        tool_ids: Vec::new(),
    }
}

fn agent(client: Arc<dyn ChatClient>, tools: Vec<Arc<dyn Tool>>) -> RuntimeAgent {
    RuntimeAgent::new(CompositeKey::singleton("a1"), agent_record("a1"), client, tools)
}

struct Harness {
    machine: ConversationMachine,
    monitor: Arc<CancellationMonitor>,
    flags: Arc<MemoryFlagStore>,
    checkpoints: Arc<MemoryCheckpointStore>,
    transport: Arc<dyn Transport>,
    out_rx: mpsc::UnboundedReceiver<(WireKind, WireEnvelope)>,
    feedback_tx: mpsc::UnboundedSender<String>,
}

fn harness(config: MusterConfig) -> Harness {
    let (transport, out_rx, feedback_tx) = ChannelTransport::new();
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let router = Arc::new(EventRouter::new("sess-1", transport.clone()));
    let flags = Arc::new(MemoryFlagStore::new());
    let monitor = Arc::new(CancellationMonitor::new(flags.clone(), "sess-1"));
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let machine = ConversationMachine::new(config, router, monitor.clone(), checkpoints.clone());
    Harness {
        machine,
        monitor,
        flags,
        checkpoints,
        transport,
        out_rx,
        feedback_tx,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<(WireKind, WireEnvelope)>) -> Vec<(WireKind, WireEnvelope)> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn seed_history() -> Vec<ChatMessage> {
    vec![ChatMessage::system("be helpful"), ChatMessage::user("go")]
}

#[tokio::test]
async fn plain_completion_streams_one_logical_message() {
    let client = ScriptedChat::new(vec![
        vec![
            ChatDelta::token("Hel"),
            ChatDelta::token("lo"),
            ChatDelta::done(Some(usage(2))),
        ],
        vec![ChatDelta::token("bye"), ChatDelta::done(None)],
    ]);
    let mut h = harness(MusterConfig::default());
    h.feedback_tx.send("ok".to_string()).unwrap();
    let agent = agent(client, Vec::new());
    let mut history = seed_history();

    let result = h
        .machine
        .run(&agent, &[], &mut history, &GenerationSettings::default())
        .await;

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.text, "bye");
    assert_eq!(result.usage.output_tokens, 2);
    assert_eq!(history.last().unwrap().role, Role::Assistant);

    let events = drain(&mut h.out_rx);
    let tokens: Vec<&WireEnvelope> = events
        .iter()
        .filter(|(kind, _)| *kind == WireKind::Message)
        .map(|(_, env)| env)
        .collect();
    assert_eq!(tokens.len(), 3);
    // The first response's fragments share one correlation id; the second
    // response starts a new one.
    assert_eq!(tokens[0].message.chunk_id, tokens[1].message.chunk_id);
    assert_ne!(tokens[1].message.chunk_id, tokens[2].message.chunk_id);
    assert!(tokens[0].message.first);
    assert!(!tokens[1].message.first);
    assert_eq!(tokens[1].message.tokens, 2);
    assert!(events
        .iter()
        .any(|(kind, _)| *kind == WireKind::MessageComplete));
}

#[tokio::test]
async fn first_response_always_routes_through_forced_human_input() {
    let client = ScriptedChat::new(vec![
        vec![ChatDelta::token("draft"), ChatDelta::done(None)],
        vec![ChatDelta::token("final"), ChatDelta::done(None)],
    ]);
    let mut h = harness(MusterConfig::default());
    h.feedback_tx.send("looks good".to_string()).unwrap();
    let agent = agent(client.clone(), Vec::new());
    let mut history = seed_history();

    let result = h
        .machine
        .run(&agent, &[], &mut history, &GenerationSettings::default())
        .await;

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.text, "final");
    // The human reply went back into history as a user message.
    assert!(history
        .iter()
        .any(|m| m.role == Role::User && m.content == "looks good"));
    assert_eq!(client.requests().len(), 2);

    let events = drain(&mut h.out_rx);
    let feedback: Vec<&WireEnvelope> = events
        .iter()
        .filter(|(kind, _)| *kind == WireKind::Feedback)
        .map(|(_, env)| env)
        .collect();
    // Exactly one forced round trip; the second response ends the session.
    assert_eq!(feedback.len(), 1);
    assert_eq!(feedback[0].is_feedback, Some(true));
    assert!(feedback[0].message.single);
}

#[tokio::test]
async fn terminate_reply_ends_the_session() {
    let client = ScriptedChat::new(vec![vec![
        ChatDelta::token("draft"),
        ChatDelta::done(None),
    ]]);
    let mut h = harness(MusterConfig::default());
    h.feedback_tx.send("terminate".to_string()).unwrap();
    let agent = agent(client, Vec::new());
    let mut history = seed_history();

    let result = h
        .machine
        .run(&agent, &[], &mut history, &GenerationSettings::default())
        .await;

    assert_eq!(result.status, SessionStatus::Terminated);
    drain(&mut h.out_rx);
}

#[tokio::test]
async fn explicit_human_call_executes_the_bound_tool() {
    let call = ToolCall {
        id: "c1".to_string(),
        name: HUMAN_INPUT_TOOL_NAME.to_string(),
        arguments: serde_json::json!({ "question": "Proceed?" }),
    };
    let client = ScriptedChat::new(vec![
        vec![ChatDelta::tool_call(call), ChatDelta::done(None)],
        vec![ChatDelta::token("done"), ChatDelta::done(None)],
    ]);
    let mut h = harness(MusterConfig::default());
    let human: Arc<dyn Tool> = Arc::new(HumanInputTool::new(
        "sess-1".to_string(),
        "Scout".to_string(),
        h.transport.clone(),
    ));
    h.feedback_tx.send("yes, ship it".to_string()).unwrap();
    let agent = agent(client, Vec::new());
    let mut history = seed_history();

    let result = h
        .machine
        .run(
            &agent,
            &[human],
            &mut history,
            &GenerationSettings::default(),
        )
        .await;

    assert_eq!(result.status, SessionStatus::Completed);
    let reply = history
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("human reply in history");
    assert_eq!(reply.name.as_deref(), Some(HUMAN_INPUT_TOOL_NAME));
    assert_eq!(reply.content, "yes, ship it");

    let events = drain(&mut h.out_rx);
    let feedback = events
        .iter()
        .find(|(kind, _)| *kind == WireKind::Feedback)
        .expect("feedback envelope from the tool");
    assert_eq!(feedback.1.message.text, "Proceed?");
    assert!(feedback.1.message.single);
}

#[tokio::test]
async fn terminate_through_the_bound_tool_ends_the_session() {
    let call = ToolCall {
        id: "c1".to_string(),
        name: HUMAN_INPUT_TOOL_NAME.to_string(),
        arguments: serde_json::json!({ "question": "Keep going?" }),
    };
    let client = ScriptedChat::new(vec![vec![
        ChatDelta::tool_call(call),
        ChatDelta::done(None),
    ]]);
    let mut h = harness(MusterConfig::default());
    let human: Arc<dyn Tool> = Arc::new(HumanInputTool::new(
        "sess-1".to_string(),
        "Scout".to_string(),
        h.transport.clone(),
    ));
    h.feedback_tx.send("terminate".to_string()).unwrap();
    let agent = agent(client, Vec::new());
    let mut history = seed_history();

    let result = h
        .machine
        .run(
            &agent,
            &[human],
            &mut history,
            &GenerationSettings::default(),
        )
        .await;

    assert_eq!(result.status, SessionStatus::Terminated);
    drain(&mut h.out_rx);
}

#[tokio::test]
async fn tool_round_trip_appends_result_and_correlates_events() {
    let call = ToolCall {
        id: "c1".to_string(),
        name: "echo".to_string(),
        arguments: serde_json::json!({ "text": "hi" }),
    };
    let client = ScriptedChat::new(vec![
        vec![ChatDelta::tool_call(call), ChatDelta::done(None)],
        vec![ChatDelta::token("done"), ChatDelta::done(None)],
        vec![ChatDelta::token("done"), ChatDelta::done(None)],
    ]);
    let echo: Arc<dyn Tool> = Arc::new(ClosureTool::new(
        "echo",
        "Echo text back",
        serde_json::json!({ "type": "object" }),
        |args, _ctx| async move {
            Ok(serde_json::json!({ "echoed": args.get_str("text")?.to_string() }))
        },
    ));
    let mut h = harness(MusterConfig::default());
    h.feedback_tx.send("ship it".to_string()).unwrap();
    let agent = agent(client, Vec::new());
    let mut history = seed_history();

    let result = h
        .machine
        .run(
            &agent,
            &[echo],
            &mut history,
            &GenerationSettings::default(),
        )
        .await;

    assert_eq!(result.status, SessionStatus::Completed);
    let tool_msg = history
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool result in history");
    assert_eq!(tool_msg.name.as_deref(), Some("echo"));
    assert!(tool_msg.content.contains("echoed"));

    let events = drain(&mut h.out_rx);
    let inline: Vec<&WireEnvelope> = events
        .iter()
        .map(|(_, env)| env)
        .filter(|env| env.message.text.contains("tool: echo"))
        .collect();
    assert_eq!(inline.len(), 2, "tool start and tool end");
    assert!(inline[0].message.text.starts_with("Using tool"));
    assert!(inline[1].message.text.starts_with("Used tool"));
    assert_eq!(inline[0].message.chunk_id, inline[1].message.chunk_id);
}

#[tokio::test]
async fn message_cap_ends_session_before_the_model_call() {
    let client = ScriptedChat::new(vec![]);
    let mut h = harness(MusterConfig::builder().max_messages(2).build());
    let agent = agent(client.clone(), Vec::new());
    let mut history = seed_history();
    history.push(ChatMessage::assistant("one"));
    history.push(ChatMessage::assistant("two"));
    history.push(ChatMessage::assistant("three"));

    let result = h
        .machine
        .run(&agent, &[], &mut history, &GenerationSettings::default())
        .await;

    assert_eq!(result.status, SessionStatus::MessageLimit);
    assert!(client.requests().is_empty(), "model was never invoked");
    let events = drain(&mut h.out_rx);
    assert!(events
        .iter()
        .any(|(_, env)| env.message.text.contains("message limit")));
}

#[tokio::test]
async fn stop_flag_cancels_and_emits_terminate() {
    let client = ScriptedChat::new(vec![]);
    let mut h = harness(MusterConfig::default());
    request_stop(h.flags.as_ref(), "sess-1").await;
    let agent = agent(client, Vec::new());
    let mut history = seed_history();

    let result = h
        .machine
        .run(&agent, &[], &mut history, &GenerationSettings::default())
        .await;

    assert_eq!(result.status, SessionStatus::Canceled);
    assert!(!h.monitor.is_cancelled().await, "flag is reset on exit");
    let events = drain(&mut h.out_rx);
    assert_eq!(
        events
            .iter()
            .filter(|(kind, _)| *kind == WireKind::Terminate)
            .count(),
        1
    );
}

/// Chat client whose stream raises the stop flag between two token deltas.
struct StopMidStream {
    flags: Arc<MemoryFlagStore>,
}

#[async_trait]
impl ChatClient for StopMidStream {
    fn platform(&self) -> Platform {
        Platform::OpenAi
    }

    fn model_id(&self) -> &str {
        "mid-stream"
    }

    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        Err(MusterError::InvalidState("streams only".into()))
    }

    async fn stream_chat(&self, _request: &ChatRequest) -> Result<ChatStream> {
        let flags = self.flags.clone();
        let stream = async_stream::stream! {
            yield Ok(ChatDelta::token("one"));
            request_stop(flags.as_ref(), "sess-1").await;
            yield Ok(ChatDelta::token("two"));
            yield Ok(ChatDelta::done(None));
        };
        Ok(Box::pin(stream))
    }
}

#[tokio::test]
async fn stop_flag_mid_stream_halts_before_the_next_token() {
    let mut h = harness(MusterConfig::default());
    let client = Arc::new(StopMidStream {
        flags: h.flags.clone(),
    });
    let agent = agent(client, Vec::new());
    let mut history = seed_history();

    let result = h
        .machine
        .run(&agent, &[], &mut history, &GenerationSettings::default())
        .await;

    assert_eq!(result.status, SessionStatus::Canceled);
    let events = drain(&mut h.out_rx);
    let tokens: Vec<&WireEnvelope> = events
        .iter()
        .filter(|(kind, _)| *kind == WireKind::Message)
        .map(|(_, env)| env)
        .collect();
    // The token streamed before the flag went up is the only one routed.
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].message.text, "one");
    assert_eq!(
        events
            .iter()
            .filter(|(kind, _)| *kind == WireKind::Terminate)
            .count(),
        1,
        "exactly one stopped notification"
    );
}

#[tokio::test]
async fn recursion_cap_is_a_distinct_terminal_event() {
    let call = ToolCall {
        id: "c1".to_string(),
        name: "echo".to_string(),
        arguments: serde_json::json!({}),
    };
    let client = ScriptedChat::new(vec![vec![
        ChatDelta::tool_call(call),
        ChatDelta::done(None),
    ]]);
    let mut h = harness(MusterConfig::builder().max_recursion(0).build());
    let agent = agent(client, Vec::new());
    let mut history = seed_history();

    let result = h
        .machine
        .run(&agent, &[], &mut history, &GenerationSettings::default())
        .await;

    assert_eq!(result.status, SessionStatus::RecursionLimit);
    let events = drain(&mut h.out_rx);
    assert!(events
        .iter()
        .any(|(_, env)| env.message.text.contains("recursion depth")));
}

#[tokio::test]
async fn history_is_checkpointed_on_completion() {
    let client = ScriptedChat::new(vec![
        vec![ChatDelta::token("draft"), ChatDelta::done(None)],
        vec![ChatDelta::token("saved"), ChatDelta::done(None)],
    ]);
    let h = harness(MusterConfig::default());
    h.feedback_tx.send("ok".to_string()).unwrap();
    let agent = agent(client, Vec::new());
    let mut history = seed_history();

    h.machine
        .run(&agent, &[], &mut history, &GenerationSettings::default())
        .await;

    let saved = h.checkpoints.load("sess-1").await.unwrap().unwrap();
    assert_eq!(saved, history);
    assert_eq!(saved.last().unwrap().content, "saved");
}

#[tokio::test]
async fn session_handle_abort_cancels_at_the_next_poll_point() {
    let client = ScriptedChat::new(vec![
        vec![ChatDelta::token("draft"), ChatDelta::done(None)],
        vec![ChatDelta::token("never sent"), ChatDelta::done(None)],
    ]);
    let agent = agent(client, Vec::new());
    let task = RuntimeTask::new(
        CompositeKey::singleton("t1"),
        TaskRecord {
            id: "t1".to_string(),
            name: "chat".to_string(),
            description: "Talk to the user.".to_string(),
            expected_output: String::new(),
            agent_id: "a1".to_string(),
            tool_ids: vec![],
            context_task_ids: vec![],
            requires_human_input: true,
        },
        CompositeKey::singleton("a1"),
        Vec::new(),
    );
    let mut agents = HashMap::new();
    agents.insert(agent.key.clone(), agent);
    let team = RuntimeTeam {
        name: "crew".to_string(),
        agents,
        tasks: vec![task],
        manager: None,
    };

    let (transport, mut out_rx, feedback_tx) = ChannelTransport::new();
    let router = Arc::new(EventRouter::new("sess-1", Arc::new(transport)));
    let flags = Arc::new(MemoryFlagStore::new());
    let monitor = Arc::new(CancellationMonitor::new(flags.clone(), "sess-1"));
    let runner = Arc::new(TeamRunner::new(
        MusterConfig::default(),
        router,
        monitor,
        Arc::new(MemoryCheckpointStore::new()),
    ));

    let handle = runner.start(Arc::new(team), "sess-1", flags);
    // The forced human-input step suspends the session; abort while it
    // waits, then let the reply arrive.
    loop {
        let (kind, _) = out_rx.recv().await.unwrap();
        if kind == WireKind::Feedback {
            break;
        }
    }
    handle.abort().await;
    feedback_tx.send("keep going".to_string()).unwrap();

    let run = handle.wait().await;
    assert_eq!(run.status, SessionStatus::Canceled);
}

#[tokio::test]
async fn team_runner_feeds_outputs_forward() {
    let first = ScriptedChat::new(vec![
        vec![ChatDelta::token("alpha"), ChatDelta::done(None)],
        vec![ChatDelta::token("alpha"), ChatDelta::done(None)],
    ]);
    let second = ScriptedChat::new(vec![
        vec![ChatDelta::token("beta"), ChatDelta::done(None)],
        vec![ChatDelta::token("beta"), ChatDelta::done(None)],
    ]);

    let agent_a = agent(first, Vec::new());
    let mut record_b = agent_record("a2");
    record_b.name = "Writer".to_string();
    let agent_b = RuntimeAgent::new(
        CompositeKey::singleton("a2"),
        record_b,
        second.clone(),
        Vec::new(),
    );

    let task_a = RuntimeTask::new(
        CompositeKey::singleton("t1"),
        TaskRecord {
            id: "t1".to_string(),
            name: "research".to_string(),
            description: "Gather facts.".to_string(),
            expected_output: String::new(),
            agent_id: "a1".to_string(),
            tool_ids: vec![],
            context_task_ids: vec![],
            requires_human_input: false,
        },
        CompositeKey::singleton("a1"),
        Vec::new(),
    );
    let task_b = RuntimeTask::new(
        CompositeKey::singleton("t2"),
        TaskRecord {
            id: "t2".to_string(),
            name: "write".to_string(),
            description: "Write it up.".to_string(),
            expected_output: String::new(),
            agent_id: "a2".to_string(),
            tool_ids: vec![],
            context_task_ids: vec!["t1".to_string()],
            requires_human_input: false,
        },
        CompositeKey::singleton("a2"),
        Vec::new(),
    );

    let mut agents = HashMap::new();
    agents.insert(agent_a.key.clone(), agent_a);
    agents.insert(agent_b.key.clone(), agent_b);
    let team = RuntimeTeam {
        name: "crew".to_string(),
        agents,
        tasks: vec![task_a, task_b],
        manager: None,
    };

    let (transport, _out_rx, feedback_tx) = ChannelTransport::new();
    let router = Arc::new(EventRouter::new("sess-1", Arc::new(transport)));
    let flags = Arc::new(MemoryFlagStore::new());
    let monitor = Arc::new(CancellationMonitor::new(flags, "sess-1"));
    let runner = TeamRunner::new(
        MusterConfig::default(),
        router,
        monitor,
        Arc::new(MemoryCheckpointStore::new()),
    );

    // One forced human round trip per task.
    feedback_tx.send("ok".to_string()).unwrap();
    feedback_tx.send("ok".to_string()).unwrap();

    let run = runner.run(&team).await;
    assert_eq!(run.status, SessionStatus::Completed);
    assert_eq!(run.outputs.get("t1").map(String::as_str), Some("alpha"));
    assert_eq!(run.outputs.get("t2").map(String::as_str), Some("beta"));

    // The second task's prompt carried the first task's output as context.
    let second_request = &second.requests()[0];
    let user = second_request
        .messages
        .iter()
        .find(|m| m.role == Role::User)
        .unwrap();
    assert!(user.content.contains("alpha"));
}
