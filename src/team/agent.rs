//! Runtime agents: a resolved agent record plus its bound model and tools.

use std::sync::Arc;

use crate::binding::Tool;
use crate::graph::CompositeKey;
use crate::platform::ChatClient;
use crate::records::AgentRecord;

/// A materialized agent, owned by one session.
pub struct RuntimeAgent {
    pub key: CompositeKey,
    pub record: AgentRecord,
    pub client: Arc<dyn ChatClient>,
    pub tools: Vec<Arc<dyn Tool>>,
}

impl RuntimeAgent {
    pub fn new(
        key: CompositeKey,
        record: AgentRecord,
        client: Arc<dyn ChatClient>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Self {
        Self {
            key,
            record,
            client,
            tools,
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// The agent's system prompt. An explicit system message wins over the
    /// composed role/goal/backstory prompt.
    pub fn system_prompt(&self) -> String {
        if let Some(system) = &self.record.system_message {
            return system.clone();
        }
        let mut prompt = format!(
            "You are {}.\nRole: {}\nGoal: {}",
            self.record.name, self.record.role, self.record.goal
        );
        if !self.record.backstory.is_empty() {
            prompt.push_str("\nBackstory: ");
            prompt.push_str(&self.record.backstory);
        }
        prompt
    }

    pub fn find_tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }
}
