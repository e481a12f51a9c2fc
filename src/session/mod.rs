//! Session execution: history checkpoints, alternation repair, the
//! conversation state machine, and the task-by-task team runner.

pub mod history;
pub mod machine;
pub mod repair;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::binding::Tool;
use crate::cancel::{request_stop, CancellationMonitor, FlagStore};
use crate::config::MusterConfig;
use crate::events::EventRouter;
use crate::platform::{ChatMessage, GenerationSettings, Usage};
use crate::records::RecordId;
use crate::team::{RuntimeTask, RuntimeTeam};

pub use history::{CheckpointStore, MemoryCheckpointStore};
pub use machine::{ConversationMachine, SessionResult, SessionStatus};
pub use repair::repair_alternation;

/// Outcome of running a whole team.
#[derive(Debug, Clone)]
pub struct TeamRun {
    /// Status of the last task that executed.
    pub status: SessionStatus,
    /// Final text per completed task, keyed by task record id.
    pub outputs: HashMap<RecordId, String>,
    pub usage: Usage,
}

/// Executes a bound team's tasks in declaration order, feeding each task's
/// output into the prompts of the tasks that list it as context.
pub struct TeamRunner {
    machine: ConversationMachine,
    settings: GenerationSettings,
}

impl TeamRunner {
    pub fn new(
        config: MusterConfig,
        router: Arc<EventRouter>,
        monitor: Arc<CancellationMonitor>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            machine: ConversationMachine::new(config, router, monitor, checkpoints),
            settings: GenerationSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run every task to termination, stopping early when a task does not
    /// complete (limit, cancellation, terminate sentinel, or failure).
    pub async fn run(&self, team: &RuntimeTeam) -> TeamRun {
        let mut outputs: HashMap<RecordId, String> = HashMap::new();
        let mut usage = Usage::default();
        let mut status = SessionStatus::Completed;

        for task in &team.tasks {
            let Some(agent) = team.agent_for(task) else {
                // Assembly guarantees the agent exists; a miss here means the
                // team was mutated after assembly.
                status = SessionStatus::Failed;
                break;
            };

            info!(team = %team.name, task = %task.name(), agent = %agent.name(), "task start");
            let tools = task_tools(agent.tools.as_slice(), task);
            let mut history = vec![
                ChatMessage::system(agent.system_prompt()),
                ChatMessage::user(task.prompt(&outputs)),
            ];
            let result = self
                .machine
                .run(agent, &tools, &mut history, &self.settings)
                .await;
            usage.add(&result.usage);
            status = result.status;
            if !result.should_continue() {
                break;
            }
            outputs.insert(task.record.id.clone(), result.text);
        }

        TeamRun {
            status,
            outputs,
            usage,
        }
    }
}

impl TeamRunner {
    /// Spawn a team run as its own task and return a handle for aborting
    /// and awaiting it. Abort goes through the session's stop flag, so it
    /// takes effect at the loop's next poll point.
    pub fn start(
        self: Arc<Self>,
        team: Arc<RuntimeTeam>,
        session_id: impl Into<String>,
        flags: Arc<dyn FlagStore>,
    ) -> SessionHandle {
        let session_id = session_id.into();
        let runner = self;
        let join = tokio::spawn(async move { runner.run(&team).await });
        SessionHandle {
            session_id,
            flags,
            join,
        }
    }
}

/// Handle for an in-flight team run.
pub struct SessionHandle {
    session_id: String,
    flags: Arc<dyn FlagStore>,
    join: JoinHandle<TeamRun>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Request cooperative cancellation.
    pub async fn abort(&self) {
        request_stop(self.flags.as_ref(), &self.session_id).await;
    }

    pub async fn wait(self) -> TeamRun {
        self.join.await.unwrap_or(TeamRun {
            status: SessionStatus::Failed,
            outputs: HashMap::new(),
            usage: Usage::default(),
        })
    }
}

/// The tool set for one task: the task's own tools plus the agent's, with
/// task bindings winning on a name collision.
fn task_tools(agent_tools: &[Arc<dyn Tool>], task: &RuntimeTask) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = task.tools.clone();
    for tool in agent_tools {
        if !tools.iter().any(|t| t.name() == tool.name()) {
            tools.push(tool.clone());
        }
    }
    tools
}
