//! Joins the raw record collections of one session into composite-keyed
//! mappings, one hop at a time.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{MusterError, Result};
use crate::records::{
    AgentRecord, CredentialRecord, DatasourceRecord, ModelRecord, TaskRecord, TeamInput,
    ToolRecord,
};

use super::key::CompositeKey;

/// Fully joined configuration graph for one session. Every reachable
/// composite key gets its own entry; binding later turns each entry into an
/// independent runtime instance.
#[derive(Debug, Clone, Default)]
pub struct ResolvedGraph {
    pub agents: HashMap<CompositeKey, AgentRecord>,
    /// Task order is preserved from the team definition; the assembler
    /// validates that context references only point backwards.
    pub tasks: Vec<(CompositeKey, TaskRecord)>,
    pub tools: HashMap<CompositeKey, ToolRecord>,
    pub datasources: HashMap<CompositeKey, DatasourceRecord>,
    pub models: HashMap<CompositeKey, ModelRecord>,
    pub credentials: HashMap<CompositeKey, CredentialRecord>,
}

impl ResolvedGraph {
    /// Find the single entry of `map` whose key is a superset of `parent`
    /// and whose record id matches.
    pub fn find_under<'a, R>(
        map: &'a HashMap<CompositeKey, R>,
        parent: &CompositeKey,
        id: &str,
    ) -> Option<(&'a CompositeKey, &'a R)> {
        map.iter()
            .find(|(key, _)| key.contains(id) && key.is_superset(parent))
    }
}

/// Performs the composite-key joins for a session.
///
/// Resolution is all-or-nothing: the first dangling reference aborts with a
/// [`MusterError::Resolution`] naming the parent, the relation, and the
/// missing id. No partially resolved graph is returned.
pub struct EntityGraphResolver;

impl EntityGraphResolver {
    pub fn resolve(input: &TeamInput) -> Result<ResolvedGraph> {
        let mut graph = ResolvedGraph::default();

        // Hop 0: roots. Agents and tasks key themselves.
        for agent in &input.agents {
            graph
                .agents
                .insert(CompositeKey::singleton(&agent.id), agent.clone());
        }
        for task in &input.tasks {
            graph
                .tasks
                .push((CompositeKey::singleton(&task.id), task.clone()));
        }

        // Hop 1: agent -> tool and task -> tool, merged into one map. A tool
        // shared by two parents lands under two distinct keys.
        for agent in &input.agents {
            let agent_key = CompositeKey::singleton(&agent.id);
            for tool_id in &agent.tool_ids {
                let tool = input.tools.get(tool_id).ok_or_else(|| {
                    MusterError::resolution(&agent.name, "tools", tool_id)
                })?;
                graph.tools.insert(agent_key.with(tool_id), tool.clone());
            }
        }
        for task in &input.tasks {
            let task_key = CompositeKey::singleton(&task.id);
            for tool_id in &task.tool_ids {
                let tool = input.tools.get(tool_id).ok_or_else(|| {
                    MusterError::resolution(&task.name, "tools", tool_id)
                })?;
                graph.tools.insert(task_key.with(tool_id), tool.clone());
            }
        }

        // Hop 2: tool -> datasource.
        for (tool_key, tool) in &graph.tools {
            let Some(ds_id) = &tool.datasource_id else {
                continue;
            };
            let ds = input.datasources.get(ds_id).ok_or_else(|| {
                MusterError::resolution(&tool.name, "datasource", ds_id)
            })?;
            graph.datasources.insert(tool_key.with(ds_id), ds.clone());
        }

        // Hop 3: models, reachable four ways. Later hops union provenance
        // with earlier ones instead of overwriting, so one model reached
        // both directly and through a datasource of the same agent keeps a
        // single combined key, while the same model under two unrelated
        // agents stays two entries.
        for agent in &input.agents {
            let agent_key = CompositeKey::singleton(&agent.id);
            let model = input.models.get(&agent.model_id).ok_or_else(|| {
                MusterError::resolution(&agent.name, "model", &agent.model_id)
            })?;
            insert_model(&mut graph.models, agent_key.with(&agent.model_id), model);
        }
        let datasources: Vec<(CompositeKey, DatasourceRecord)> = graph
            .datasources
            .iter()
            .map(|(k, d)| (k.clone(), d.clone()))
            .collect();
        for (ds_key, ds) in datasources {
            let model = input.models.get(&ds.model_id).ok_or_else(|| {
                MusterError::resolution(&ds.name, "model", &ds.model_id)
            })?;
            insert_model(&mut graph.models, ds_key.with(&ds.model_id), model);
        }
        let tools: Vec<(CompositeKey, ToolRecord)> = graph
            .tools
            .iter()
            .map(|(k, t)| (k.clone(), t.clone()))
            .collect();
        for (tool_key, tool) in tools {
            let Some(model_id) = &tool.model_id else {
                continue;
            };
            let model = input.models.get(model_id).ok_or_else(|| {
                MusterError::resolution(&tool.name, "model", model_id)
            })?;
            insert_model(&mut graph.models, tool_key.with(model_id), model);
        }
        if let Some(manager_id) = &input.team.manager_model_id {
            let model = input.models.get(manager_id).ok_or_else(|| {
                MusterError::resolution(&input.team.name, "managerModel", manager_id)
            })?;
            let key = CompositeKey::singleton(&input.team.id).with(manager_id);
            insert_model(&mut graph.models, key, model);
        }

        // Hop 4: model -> credential, matched by platform tag. Platforms
        // that need no secret get a synthesized placeholder.
        for (model_key, model) in &graph.models {
            let matched = input
                .credentials
                .iter()
                .find(|c| c.platform == model.platform);
            match matched {
                Some(cred) => {
                    graph
                        .credentials
                        .insert(model_key.with(&cred.id), cred.clone());
                }
                None if !model.platform.requires_credential() => {
                    graph
                        .credentials
                        .insert(model_key.clone(), CredentialRecord::none(model.platform));
                }
                None => {
                    return Err(MusterError::resolution(
                        &model.name,
                        "credential",
                        model.platform.to_string(),
                    ));
                }
            }
        }

        debug!(
            agents = graph.agents.len(),
            tasks = graph.tasks.len(),
            tools = graph.tools.len(),
            datasources = graph.datasources.len(),
            models = graph.models.len(),
            "entity graph resolved"
        );

        Ok(graph)
    }
}

/// Insert a model entry, merging provenance with an existing entry for the
/// same record when the two keys share an ancestor beyond the model's own
/// id. Disjoint-parent entries are kept separate.
fn insert_model(
    models: &mut HashMap<CompositeKey, ModelRecord>,
    key: CompositeKey,
    record: &ModelRecord,
) {
    let merge_target = models
        .iter()
        .find(|(existing, r)| r.id == record.id && existing.intersection_len(&key) > 1)
        .map(|(existing, _)| existing.clone());
    match merge_target {
        Some(existing) => {
            models.remove(&existing);
            models.insert(existing.union(&key), record.clone());
        }
        None => {
            models.insert(key, record.clone());
        }
    }
}
