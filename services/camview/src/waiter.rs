//! Cancellable polling wait shared by the long-running loops.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full interval elapsed.
    Elapsed,
    /// The token fired before the interval elapsed.
    Cancelled,
}

/// The only steady-state suspension point of the orchestrator loops.
///
/// Implementations must return [`WaitOutcome::Cancelled`] promptly once
/// `cancel` fires instead of waiting out the interval.
#[async_trait]
pub trait Waiter: Send + Sync {
    async fn wait(&self, cancel: &CancellationToken) -> WaitOutcome;
}

/// Sleeps for a fixed interval.
#[derive(Debug, Clone)]
pub struct IntervalWaiter {
    period: Duration,
}

impl IntervalWaiter {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

#[async_trait]
impl Waiter for IntervalWaiter {
    async fn wait(&self, cancel: &CancellationToken) -> WaitOutcome {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }

        tokio::select! {
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            _ = tokio::time::sleep(self.period) => WaitOutcome::Elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_interval_elapses() {
        let waiter = IntervalWaiter::new(Duration::from_millis(5));
        let token = CancellationToken::new();
        assert_eq!(waiter.wait(&token).await, WaitOutcome::Elapsed);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let waiter = IntervalWaiter::new(Duration::from_secs(3600));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        assert_eq!(waiter.wait(&token).await, WaitOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let waiter = IntervalWaiter::new(Duration::from_secs(3600));
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(waiter.wait(&token).await, WaitOutcome::Cancelled);
    }
}
