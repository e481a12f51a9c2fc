//! Runtime tasks: a resolved task record plus its agent, tools, and
//! ordered context.

use std::collections::HashMap;
use std::sync::Arc;

use crate::binding::Tool;
use crate::graph::CompositeKey;
use crate::records::{RecordId, TaskRecord};

/// A materialized task, owned by one session.
pub struct RuntimeTask {
    pub key: CompositeKey,
    pub record: TaskRecord,
    /// Exact key of the assigned agent.
    pub agent_key: CompositeKey,
    pub tools: Vec<Arc<dyn Tool>>,
}

impl RuntimeTask {
    pub fn new(
        key: CompositeKey,
        record: TaskRecord,
        agent_key: CompositeKey,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Self {
        Self {
            key,
            record,
            agent_key,
            tools,
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// The user-facing prompt for this task, with prior task outputs
    /// spliced in as context.
    pub fn prompt(&self, outputs: &HashMap<RecordId, String>) -> String {
        let mut prompt = self.record.description.clone();
        if !self.record.expected_output.is_empty() {
            prompt.push_str("\n\nExpected output: ");
            prompt.push_str(&self.record.expected_output);
        }
        let context: Vec<&str> = self
            .record
            .context_task_ids
            .iter()
            .filter_map(|id| outputs.get(id).map(String::as_str))
            .collect();
        if !context.is_empty() {
            prompt.push_str("\n\nContext from earlier tasks:\n");
            prompt.push_str(&context.join("\n---\n"));
        }
        prompt
    }
}
