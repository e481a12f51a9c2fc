//! Out-of-band cancellation flags.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// External key-value flag store (e.g. a shared cache). The driver is an
/// external collaborator; only get/set/clear are consumed here.
#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str);
    async fn clear(&self, key: &str);
}

/// In-memory flag store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryFlagStore {
    flags: RwLock<HashMap<String, String>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.flags.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) {
        self.flags.write().await.insert(key.to_string(), value.to_string());
    }

    async fn clear(&self, key: &str) {
        self.flags.write().await.remove(key);
    }
}

/// Polls the stop flag for one session. Cancellation is cooperative: the
/// session loop checks at each streamed increment and each major state
/// transition, never mid-tool-execution.
pub struct CancellationMonitor {
    store: Arc<dyn FlagStore>,
    key: String,
}

impl CancellationMonitor {
    pub fn new(store: Arc<dyn FlagStore>, session_id: &str) -> Self {
        Self {
            store,
            key: stop_key(session_id),
        }
    }

    pub async fn is_cancelled(&self) -> bool {
        self.store.get(&self.key).await.as_deref() == Some("1")
    }

    /// Clear the flag, typically after the session has acknowledged it.
    pub async fn reset(&self) {
        self.store.clear(&self.key).await;
    }
}

/// Request cancellation of a session.
pub async fn request_stop(store: &dyn FlagStore, session_id: &str) {
    store.set(&stop_key(session_id), "1").await;
}

fn stop_key(session_id: &str) -> String {
    format!("{session_id}_stop")
}
