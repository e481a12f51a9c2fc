//! Message history checkpointing.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::platform::ChatMessage;

/// Persistent history store, keyed by session id. Each session exclusively
/// owns and mutates its own entry; the store driver is an external
/// collaborator.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<Vec<ChatMessage>>>;
    async fn save(&self, session_id: &str, history: &[ChatMessage]) -> Result<()>;
}

/// In-memory checkpoint store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    histories: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, session_id: &str) -> Result<Option<Vec<ChatMessage>>> {
        Ok(self.histories.read().await.get(session_id).cloned())
    }

    async fn save(&self, session_id: &str, history: &[ChatMessage]) -> Result<()> {
        self.histories
            .write()
            .await
            .insert(session_id.to_string(), history.to_vec());
        Ok(())
    }
}
