//! Runtime team assembly: resolved graph in, bound runtime agents and
//! tasks out.

pub mod agent;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::binding::{
    BindContext, BoundModel, BuiltinRegistry, ModelBinder, ToolBinder, VectorIndexFactory,
};
use crate::error::{MusterError, Result};
use crate::graph::{CompositeKey, ResolvedGraph};
use crate::platform::ChatClient;
use crate::records::TeamRecord;

pub use agent::RuntimeAgent;
pub use task::RuntimeTask;

/// A fully bound team, owned by the session that built it.
pub struct RuntimeTeam {
    pub name: String,
    pub agents: HashMap<CompositeKey, RuntimeAgent>,
    /// Tasks in declaration order.
    pub tasks: Vec<RuntimeTask>,
    pub manager: Option<Arc<dyn ChatClient>>,
}

impl RuntimeTeam {
    pub fn agent_for(&self, task: &RuntimeTask) -> Option<&RuntimeAgent> {
        self.agents.get(&task.agent_key)
    }
}

// Trait-object fields rule out a derive.
impl std::fmt::Debug for RuntimeTeam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeTeam")
            .field("name", &self.name)
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field(
                "tasks",
                &self.tasks.iter().map(RuntimeTask::name).collect::<Vec<_>>(),
            )
            .field("manager", &self.manager.is_some())
            .finish()
    }
}

/// Builds runtime agents and tasks from a resolved graph.
pub struct TeamAssembler<'a> {
    registry: &'a BuiltinRegistry,
    indexes: Arc<dyn VectorIndexFactory>,
    ctx: BindContext,
}

impl<'a> TeamAssembler<'a> {
    pub fn new(
        registry: &'a BuiltinRegistry,
        indexes: Arc<dyn VectorIndexFactory>,
        ctx: BindContext,
    ) -> Self {
        Self {
            registry,
            indexes,
            ctx,
        }
    }

    /// Materialize the whole team. Binding failures abort assembly; no
    /// partial team is ever returned.
    pub async fn assemble(&self, team: &TeamRecord, graph: &ResolvedGraph) -> Result<RuntimeTeam> {
        // Every model composite key binds to its own client instance.
        let mut models: HashMap<CompositeKey, BoundModel> = HashMap::new();
        for (model_key, model) in &graph.models {
            let credential = graph
                .credentials
                .iter()
                .find(|(cred_key, _)| cred_key.is_superset(model_key))
                .map(|(_, cred)| cred)
                .ok_or_else(|| {
                    MusterError::resolution(&model.name, "credential", model.platform.to_string())
                })?;
            models.insert(model_key.clone(), ModelBinder::bind(model, credential)?);
        }

        let binder = ToolBinder::new(self.registry, self.indexes.clone());
        let mut tools: HashMap<CompositeKey, Arc<dyn crate::binding::Tool>> = HashMap::new();
        for (tool_key, tool) in &graph.tools {
            let datasource = graph
                .datasources
                .iter()
                .find(|(ds_key, _)| ds_key.is_superset(tool_key))
                .map(|(key, ds)| (key.clone(), ds));

            let embedder = match &datasource {
                Some((ds_key, ds)) => {
                    let bound = models
                        .iter()
                        .find(|(model_key, _)| {
                            model_key.is_superset(ds_key) && model_key.contains(&ds.model_id)
                        })
                        .map(|(_, bound)| bound)
                        .ok_or_else(|| {
                            MusterError::binding(
                                &tool.name,
                                "retrieval tool has no resolved embedding model",
                            )
                        })?;
                    Some(bound.embedding().ok_or_else(|| {
                        MusterError::binding(
                            &tool.name,
                            "datasource model is not an embedding model",
                        )
                    })?)
                }
                None => None,
            };

            let formatter = match &tool.model_id {
                Some(model_id) => models
                    .iter()
                    .find(|(model_key, _)| {
                        model_key.is_superset(tool_key) && model_key.contains(model_id)
                    })
                    .and_then(|(_, bound)| bound.chat()),
                None => None,
            };

            let bound = binder
                .bind(
                    tool,
                    datasource.as_ref().map(|(_, ds)| *ds),
                    embedder,
                    formatter,
                    &self.ctx,
                )
                .await?;
            tools.insert(tool_key.clone(), bound);
        }

        let mut agents = HashMap::new();
        for (agent_key, record) in &graph.agents {
            let client = models
                .iter()
                .find(|(model_key, _)| {
                    model_key.is_superset(agent_key) && model_key.contains(&record.model_id)
                })
                .map(|(_, bound)| bound)
                .ok_or_else(|| {
                    MusterError::resolution(&record.name, "model", &record.model_id)
                })?
                .chat()
                .ok_or_else(|| {
                    MusterError::binding(&record.name, "agent model is not a chat model")
                })?;

            let agent_tools: Vec<Arc<dyn crate::binding::Tool>> = tools
                .iter()
                .filter(|(tool_key, _)| tool_key.is_superset(agent_key))
                .map(|(_, tool)| tool.clone())
                .collect();

            debug!(agent = %record.name, tools = agent_tools.len(), "assembled agent");
            agents.insert(
                agent_key.clone(),
                RuntimeAgent::new(agent_key.clone(), record.clone(), client, agent_tools),
            );
        }

        let mut tasks: Vec<RuntimeTask> = Vec::new();
        for (task_key, record) in &graph.tasks {
            let agent_key = CompositeKey::singleton(&record.agent_id);
            if !agents.contains_key(&agent_key) {
                return Err(MusterError::resolution(
                    &record.name,
                    "agent",
                    &record.agent_id,
                ));
            }

            // Context may only point at tasks already assembled, i.e.
            // earlier in the list. Validate, never reorder.
            for context_id in &record.context_task_ids {
                if !tasks.iter().any(|t| &t.record.id == context_id) {
                    return Err(MusterError::Ordering {
                        task: record.name.clone(),
                        context: context_id.clone(),
                    });
                }
            }

            let mut task_tools: Vec<Arc<dyn crate::binding::Tool>> = tools
                .iter()
                .filter(|(tool_key2, _)| tool_key2.is_superset(task_key))
                .map(|(_, tool)| tool.clone())
                .collect();

            if record.requires_human_input {
                let author = agents
                    .get(&agent_key)
                    .map(|a| a.record.name.clone())
                    .unwrap_or_default();
                task_tools.push(Arc::new(crate::binding::HumanInputTool::new(
                    self.ctx.session_id.clone(),
                    author,
                    self.ctx.transport.clone(),
                )));
            }

            debug!(task = %record.name, tools = task_tools.len(), "assembled task");
            tasks.push(RuntimeTask::new(
                task_key.clone(),
                record.clone(),
                agent_key,
                task_tools,
            ));
        }

        let manager = team.manager_model_id.as_ref().and_then(|manager_id| {
            models
                .iter()
                .find(|(model_key, _)| {
                    model_key.contains(&team.id) && model_key.contains(manager_id)
                })
                .and_then(|(_, bound)| bound.chat())
        });

        Ok(RuntimeTeam {
            name: team.name.clone(),
            agents,
            tasks,
            manager,
        })
    }
}
