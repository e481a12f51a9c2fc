//! The human-input tool: blocks the conversation until a reply arrives.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::events::{DisplayType, WireEnvelope, WireKind, WireMessage};
use crate::transport::{Transport, TERMINATE_SENTINEL};

use super::tool::{Tool, ToolArguments, ToolExecutionContext};

/// The designated tool name the session loop intercepts for the
/// human-input transition.
pub const HUMAN_INPUT_TOOL_NAME: &str = "human_input";

pub struct HumanInputTool {
    session_id: String,
    author: String,
    transport: Arc<dyn Transport>,
}

impl HumanInputTool {
    pub fn new(session_id: String, author: String, transport: Arc<dyn Transport>) -> Self {
        Self {
            session_id,
            author,
            transport,
        }
    }

    pub fn parameters_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question or prompt to put to the human",
                }
            },
            "required": ["question"],
        })
    }
}

#[async_trait]
impl Tool for HumanInputTool {
    fn name(&self) -> &str {
        HUMAN_INPUT_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Ask the human operator a question and wait for their reply"
    }

    fn parameters(&self) -> serde_json::Value {
        Self::parameters_schema()
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        _ctx: &ToolExecutionContext,
    ) -> Result<serde_json::Value> {
        let question = args
            .get_str_opt("question")
            .unwrap_or("Please provide your input.");

        let envelope = WireEnvelope {
            room: self.session_id.clone(),
            author_name: self.author.clone(),
            message: WireMessage {
                chunk_id: uuid::Uuid::new_v4(),
                text: question.to_string(),
                first: true,
                tokens: 0,
                timestamp: chrono::Utc::now().timestamp_millis(),
                display_type: DisplayType::Bubble,
                overwrite: false,
                single: true,
            },
            is_feedback: Some(true),
        };
        self.transport.send(WireKind::Feedback, envelope).await?;

        let reply = self.transport.recv_feedback(&self.session_id).await?;
        if reply == TERMINATE_SENTINEL {
            return Ok(serde_json::json!({ "terminate": true }));
        }
        Ok(serde_json::json!({ "feedback": reply }))
    }
}
