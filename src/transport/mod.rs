//! Wire transport seam. The transport's own protocol is an external
//! collaborator; Muster only needs send plus the blocking feedback receive.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::error::{MusterError, Result};
use crate::events::{WireEnvelope, WireKind};

/// Reply text meaning "end all tasks immediately" rather than feedback.
pub const TERMINATE_SENTINEL: &str = "terminate";

#[async_trait]
pub trait Transport: Send + Sync {
    /// Forward one wire event. Delivery is best-effort from the caller's
    /// perspective; errors are reported but sessions keep running.
    async fn send(&self, kind: WireKind, envelope: WireEnvelope) -> Result<()>;

    /// Block until a human reply arrives for this session. No local timeout
    /// beyond the transport's own.
    async fn recv_feedback(&self, session_id: &str) -> Result<String>;
}

/// Channel-backed transport for tests and in-process embedding.
pub struct ChannelTransport {
    out_tx: mpsc::UnboundedSender<(WireKind, WireEnvelope)>,
    feedback_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl ChannelTransport {
    /// Returns the transport, the outbound event receiver, and a sender for
    /// injecting human replies.
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<(WireKind, WireEnvelope)>,
        mpsc::UnboundedSender<String>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        (
            Self {
                out_tx,
                feedback_rx: Mutex::new(feedback_rx),
            },
            out_rx,
            feedback_tx,
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, kind: WireKind, envelope: WireEnvelope) -> Result<()> {
        self.out_tx
            .send((kind, envelope))
            .map_err(|_| MusterError::Transport("event channel closed".into()))
    }

    async fn recv_feedback(&self, _session_id: &str) -> Result<String> {
        let mut rx = self.feedback_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| MusterError::Transport("feedback channel closed".into()))
    }
}
