//! Error types for Muster.

use thiserror::Error;

/// Primary error type for all Muster operations.
#[derive(Error, Debug)]
pub enum MusterError {
    /// A configuration record references a child that does not exist.
    #[error("Resolution error: {parent} -> {relation} references missing id '{missing}'")]
    Resolution {
        parent: String,
        relation: String,
        missing: String,
    },

    /// A task's context references a task that appears later in the task list.
    #[error("Ordering error: task '{task}' references context '{context}' which is not yet assembled")]
    Ordering { task: String, context: String },

    /// A record could not be turned into a live runtime object.
    #[error("Binding error: {subject}: {message}")]
    Binding { subject: String, message: String },

    /// The conversation exceeded the configured recursion depth.
    #[error("Recursion limit of {0} exceeded")]
    RecursionLimit(usize),

    /// The conversation exceeded the configured message cap.
    #[error("Message limit of {0} exceeded")]
    MessageLimit(usize),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Transport disconnected: {0}")]
    Transport(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Coarse classification used by the session loop to decide error policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Authentication,
    RateLimit,
    Network,
    Api,
    Server,
    ToolExecution,
    Transport,
    Limit,
    Serialization,
    Unknown,
}

impl MusterError {
    /// Create a resolution error for a dangling reference.
    pub fn resolution(
        parent: impl Into<String>,
        relation: impl Into<String>,
        missing: impl Into<String>,
    ) -> Self {
        Self::Resolution {
            parent: parent.into(),
            relation: relation.into(),
            missing: missing.into(),
        }
    }

    /// Create a binding error naming the record that failed to bind.
    pub fn binding(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Binding {
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Resolution { .. } | Self::Ordering { .. } | Self::Binding { .. } => {
                ErrorCategory::Configuration
            }
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Network(_) | Self::Io(_) => ErrorCategory::Network,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Api { status, .. } => match status {
                401 | 403 => ErrorCategory::Authentication,
                429 => ErrorCategory::RateLimit,
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Api,
            },
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::Transport(_) => ErrorCategory::Transport,
            Self::RecursionLimit(_) | Self::MessageLimit(_) => ErrorCategory::Limit,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Whether the session loop must end instead of surfacing this to the
    /// model as a tool result. Authentication failures and non-429 client
    /// errors from a provider are not recoverable by another model turn.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Self::Authentication(_) => true,
            Self::Api { status, .. } => (400..=499).contains(status) && *status != 429,
            Self::Resolution { .. } | Self::Ordering { .. } | Self::Binding { .. } => true,
            _ => false,
        }
    }

    /// Whether this error is potentially retryable by an outer layer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::RateLimit | ErrorCategory::Network | ErrorCategory::Server
        )
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, MusterError>;
