use std::time::Duration;

use async_trait::async_trait;

/// Suspension point used between retry attempts.
///
/// Implementations must be cancel-safe: dropping the returned future abandons
/// the wait without side effects.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Sleeps on the tokio timer, so it follows a paused test clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}
