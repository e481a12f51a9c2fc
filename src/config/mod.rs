//! Execution configuration.

use bon::Builder;

/// Limits and tuning for session execution.
#[derive(Debug, Clone, Builder)]
pub struct MusterConfig {
    /// Cap on assistant messages plus non-human-input tool messages,
    /// checked before each model call.
    #[builder(default = 50)]
    pub max_messages: usize,
    /// Cap on model/tool call graph depth within one conversation.
    #[builder(default = 8)]
    pub max_recursion: usize,
    /// Fail a model stream if no delta arrives within this window.
    #[builder(default = 120_000)]
    pub stream_idle_timeout_ms: u64,
    /// Concurrently executing sessions admitted by the pool.
    #[builder(default = 10)]
    pub pool_capacity: usize,
    /// Backoff between submit retries when the pool is saturated.
    #[builder(default = 250)]
    pub submit_backoff_ms: u64,
}

impl Default for MusterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MusterConfig {
    /// Load from environment variables (MUSTER_MAX_MESSAGES, ...), falling
    /// back to defaults. Reads `.env` if present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();
        Self {
            max_messages: env_usize("MUSTER_MAX_MESSAGES").unwrap_or(defaults.max_messages),
            max_recursion: env_usize("MUSTER_MAX_RECURSION").unwrap_or(defaults.max_recursion),
            stream_idle_timeout_ms: env_u64("MUSTER_STREAM_IDLE_TIMEOUT_MS")
                .unwrap_or(defaults.stream_idle_timeout_ms),
            pool_capacity: env_usize("MUSTER_POOL_CAPACITY").unwrap_or(defaults.pool_capacity),
            submit_backoff_ms: env_u64("MUSTER_SUBMIT_BACKOFF_MS")
                .unwrap_or(defaults.submit_backoff_ms),
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
