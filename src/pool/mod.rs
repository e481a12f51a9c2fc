//! Admission control for concurrently executing sessions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::MusterConfig;

/// Counting-semaphore gate over in-flight sessions.
///
/// Admission is advisory: `can_submit` is a non-blocking check-and-release,
/// so a burst of callers that all observe a free slot can briefly
/// oversubscribe. `submit` backs off with a sleep/retry loop when saturated.
pub struct SessionPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    backoff: Duration,
}

impl SessionPool {
    pub fn new(capacity: usize, backoff: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            backoff,
        }
    }

    pub fn from_config(config: &MusterConfig) -> Self {
        Self::new(
            config.pool_capacity,
            Duration::from_millis(config.submit_backoff_ms),
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking: whether a slot is currently free. The probe permit is
    /// released immediately, so this is only a hint.
    pub fn can_submit(&self) -> bool {
        match self.permits.try_acquire() {
            Ok(permit) => {
                drop(permit);
                true
            }
            Err(_) => false,
        }
    }

    /// Run a session future on the pool, waiting for a slot with the
    /// configured backoff. The permit is held for the future's lifetime.
    pub async fn submit<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = loop {
            match self.permits.clone().try_acquire_owned() {
                Ok(permit) => break permit,
                Err(_) => {
                    debug!("session pool saturated; backing off");
                    tokio::time::sleep(self.backoff).await;
                }
            }
        };
        tokio::spawn(async move {
            let _permit = permit;
            future.await
        })
    }
}
