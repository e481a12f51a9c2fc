//! Stored configuration records.
//!
//! These are the document-store shapes consumed by resolution. An external
//! admin surface writes them; Muster only reads them, once per session start.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{MusterError, Result};

/// Identifier of a stored record.
pub type RecordId = String;

/// Supported model platforms. Closed set: an unknown platform tag fails
/// deserialization rather than surfacing later as a stringly-typed branch.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    OpenAi,
    Azure,
    Anthropic,
    Ollama,
}

impl Platform {
    /// Whether this platform needs secret material to construct a client.
    pub fn requires_credential(&self) -> bool {
        !matches!(self, Platform::Ollama)
    }
}

/// Chat vs. embedding model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Chat,
    Embedding,
}

/// A stored model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub id: RecordId,
    pub name: String,
    pub platform: Platform,
    pub model_type: ModelType,
    /// Model identifier on the platform's API (e.g. "gpt-4o").
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A stored credential. Matched against models by platform tag, not by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub id: RecordId,
    pub platform: Platform,
    /// Secret material; `None` marks a synthesized placeholder for
    /// credential-less platforms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl CredentialRecord {
    /// Placeholder for platforms that need no credential.
    pub fn none(platform: Platform) -> Self {
        Self {
            id: format!("{platform}-no-credential"),
            platform,
            secret: None,
        }
    }
}

/// Retrieval strategy attached to a data-source-backed tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrieverKind {
    /// Plain top-k similarity search.
    Raw,
    /// Top-k restricted by a metadata filter.
    SelfQuery,
    /// Time-decay weighted scoring.
    TimeWeighted,
}

/// A stored tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRecord {
    pub id: RecordId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Builtin tools dispatch by name through the registry; non-builtin
    /// tools must carry a retriever or a code blob.
    #[serde(default)]
    pub builtin: bool,
    /// JSON Schema for the tool's parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retriever: Option<RetrieverKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retriever_config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource_id: Option<RecordId>,
    /// Chat model used for retrieval query formatting, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<RecordId>,
}

impl ToolRecord {
    pub fn is_retrieval(&self) -> bool {
        self.retriever.is_some() || self.datasource_id.is_some()
    }
}

/// A stored data source: a retrievable corpus in a vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceRecord {
    pub id: RecordId,
    pub name: String,
    /// Collection / index identifier in the vector store.
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_index: Option<String>,
    /// Field holding the embedded text.
    #[serde(default = "default_embedding_field")]
    pub embedding_field: String,
    /// Embedding model used to vectorize queries against this corpus.
    pub model_id: RecordId,
}

fn default_embedding_field() -> String {
    "page_content".to_string()
}

/// A stored agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: RecordId,
    pub name: String,
    pub role: String,
    pub goal: String,
    #[serde(default)]
    pub backstory: String,
    /// Explicit system message; overrides the role/goal/backstory prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    pub model_id: RecordId,
    #[serde(default)]
    pub tool_ids: Vec<RecordId>,
}

/// A stored task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: RecordId,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub expected_output: String,
    pub agent_id: RecordId,
    #[serde(default)]
    pub tool_ids: Vec<RecordId>,
    /// Ids of tasks whose outputs feed this one. Each must appear earlier
    /// in the team's task list.
    #[serde(default)]
    pub context_task_ids: Vec<RecordId>,
    #[serde(default)]
    pub requires_human_input: bool,
}

/// A stored team/session definition: which agents and tasks run together.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamRecord {
    pub id: RecordId,
    pub name: String,
    pub agent_ids: Vec<RecordId>,
    pub task_ids: Vec<RecordId>,
    /// Manager model for team-level coordination, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_model_id: Option<RecordId>,
}

/// Read access to the external document store. The driver itself is an
/// external collaborator; Muster only consumes fetch-by-id.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn agent(&self, id: &str) -> Result<Option<AgentRecord>>;
    async fn task(&self, id: &str) -> Result<Option<TaskRecord>>;
    async fn tool(&self, id: &str) -> Result<Option<ToolRecord>>;
    async fn datasource(&self, id: &str) -> Result<Option<DatasourceRecord>>;
    async fn model(&self, id: &str) -> Result<Option<ModelRecord>>;
    async fn credentials(&self) -> Result<Vec<CredentialRecord>>;
    async fn team(&self, id: &str) -> Result<Option<TeamRecord>>;
}

/// In-memory store, used by tests and embedders without a document store.
#[derive(Debug, Default, Clone)]
pub struct MemoryConfigStore {
    pub agents: HashMap<RecordId, AgentRecord>,
    pub tasks: HashMap<RecordId, TaskRecord>,
    pub tools: HashMap<RecordId, ToolRecord>,
    pub datasources: HashMap<RecordId, DatasourceRecord>,
    pub models: HashMap<RecordId, ModelRecord>,
    pub credential_list: Vec<CredentialRecord>,
    pub teams: HashMap<RecordId, TeamRecord>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_agent(&mut self, record: AgentRecord) -> &mut Self {
        self.agents.insert(record.id.clone(), record);
        self
    }

    pub fn insert_task(&mut self, record: TaskRecord) -> &mut Self {
        self.tasks.insert(record.id.clone(), record);
        self
    }

    pub fn insert_tool(&mut self, record: ToolRecord) -> &mut Self {
        self.tools.insert(record.id.clone(), record);
        self
    }

    pub fn insert_datasource(&mut self, record: DatasourceRecord) -> &mut Self {
        self.datasources.insert(record.id.clone(), record);
        self
    }

    pub fn insert_model(&mut self, record: ModelRecord) -> &mut Self {
        self.models.insert(record.id.clone(), record);
        self
    }

    pub fn insert_credential(&mut self, record: CredentialRecord) -> &mut Self {
        self.credential_list.push(record);
        self
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn agent(&self, id: &str) -> Result<Option<AgentRecord>> {
        Ok(self.agents.get(id).cloned())
    }

    async fn task(&self, id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.get(id).cloned())
    }

    async fn tool(&self, id: &str) -> Result<Option<ToolRecord>> {
        Ok(self.tools.get(id).cloned())
    }

    async fn datasource(&self, id: &str) -> Result<Option<DatasourceRecord>> {
        Ok(self.datasources.get(id).cloned())
    }

    async fn model(&self, id: &str) -> Result<Option<ModelRecord>> {
        Ok(self.models.get(id).cloned())
    }

    async fn credentials(&self) -> Result<Vec<CredentialRecord>> {
        Ok(self.credential_list.clone())
    }

    async fn team(&self, id: &str) -> Result<Option<TeamRecord>> {
        Ok(self.teams.get(id).cloned())
    }
}

/// Fetch every record a team references, ahead of resolution.
///
/// A missing top-level record is a [`MusterError::Resolution`] naming the
/// team as the parent; per-relation dangling references are reported later
/// by the resolver with the precise parent.
pub async fn fetch_team_input(store: &dyn ConfigStore, team_id: &str) -> Result<TeamInput> {
    let team = store
        .team(team_id)
        .await?
        .ok_or_else(|| MusterError::resolution("session", "team", team_id))?;

    let mut input = TeamInput {
        team: team.clone(),
        agents: Vec::new(),
        tasks: Vec::new(),
        tools: HashMap::new(),
        datasources: HashMap::new(),
        models: HashMap::new(),
        credentials: store.credentials().await?,
    };

    for agent_id in &team.agent_ids {
        let agent = store
            .agent(agent_id)
            .await?
            .ok_or_else(|| MusterError::resolution(&team.name, "agents", agent_id))?;
        input.agents.push(agent);
    }
    for task_id in &team.task_ids {
        let task = store
            .task(task_id)
            .await?
            .ok_or_else(|| MusterError::resolution(&team.name, "tasks", task_id))?;
        input.tasks.push(task);
    }

    let tool_ids: Vec<RecordId> = input
        .agents
        .iter()
        .flat_map(|a| a.tool_ids.iter().cloned())
        .chain(input.tasks.iter().flat_map(|t| t.tool_ids.iter().cloned()))
        .collect();
    for tool_id in tool_ids {
        if input.tools.contains_key(&tool_id) {
            continue;
        }
        let tool = store
            .tool(&tool_id)
            .await?
            .ok_or_else(|| MusterError::resolution(&team.name, "tools", &tool_id))?;
        if let Some(ds_id) = &tool.datasource_id {
            if !input.datasources.contains_key(ds_id) {
                let ds = store
                    .datasource(ds_id)
                    .await?
                    .ok_or_else(|| MusterError::resolution(&tool.name, "datasource", ds_id))?;
                input.datasources.insert(ds.id.clone(), ds);
            }
        }
        input.tools.insert(tool.id.clone(), tool);
    }

    let model_ids: Vec<RecordId> = input
        .agents
        .iter()
        .map(|a| a.model_id.clone())
        .chain(input.datasources.values().map(|d| d.model_id.clone()))
        .chain(input.tools.values().filter_map(|t| t.model_id.clone()))
        .chain(team.manager_model_id.iter().cloned())
        .collect();
    for model_id in model_ids {
        if input.models.contains_key(&model_id) {
            continue;
        }
        let model = store
            .model(&model_id)
            .await?
            .ok_or_else(|| MusterError::resolution(&team.name, "models", &model_id))?;
        input.models.insert(model.id.clone(), model);
    }

    Ok(input)
}

/// Raw, pre-fetched record collections for one session. Input to the
/// entity graph resolver.
#[derive(Debug, Clone)]
pub struct TeamInput {
    pub team: TeamRecord,
    /// Ordered as declared on the team.
    pub agents: Vec<AgentRecord>,
    /// Ordered as declared on the team; context references must point
    /// backwards in this order.
    pub tasks: Vec<TaskRecord>,
    pub tools: HashMap<RecordId, ToolRecord>,
    pub datasources: HashMap<RecordId, DatasourceRecord>,
    pub models: HashMap<RecordId, ModelRecord>,
    pub credentials: Vec<CredentialRecord>,
}
