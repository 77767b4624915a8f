//! Pluggable delay execution, extended to race against a [`CancelToken`]
//! so a retry delay is itself cancellable rather than blocking past the
//! caller's deadline.

use std::fmt::Debug;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::cancel::CancelToken;

/// Whether a [`Sleeper::sleep`] call ran its full course or was cut short
/// by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Completed,
    Cancelled,
}

/// Abstracts "wait for this long, but stop early if cancelled", a seam
/// that lets tests substitute deterministic delay execution.
#[async_trait]
pub trait Sleeper: Send + Sync + Debug {
    async fn sleep(&self, duration: Duration, token: &CancelToken) -> SleepOutcome;
}

/// Real delay via `tokio::time::sleep`, racing the cancellation token.
#[derive(Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration, token: &CancelToken) -> SleepOutcome {
        tokio::select! {
            biased;
            _ = token.cancelled() => SleepOutcome::Cancelled,
            _ = tokio::time::sleep(duration) => SleepOutcome::Completed,
        }
    }
}

/// Never actually waits; used in tests that want retry logic exercised
/// without real wall-clock delay.
#[derive(Debug, Default)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration, token: &CancelToken) -> SleepOutcome {
        if token.is_cancelled() {
            SleepOutcome::Cancelled
        } else {
            SleepOutcome::Completed
        }
    }
}

/// Records every duration it was asked to sleep for, without waiting.
/// Lets tests assert the exact backoff sequence a retry driver computed.
#[derive(Debug, Default)]
pub struct TrackingSleeper {
    calls: Mutex<Vec<Duration>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_at(&self, index: usize) -> Option<Duration> {
        self.calls().get(index).copied()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration, token: &CancelToken) -> SleepOutcome {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        if token.is_cancelled() {
            SleepOutcome::Cancelled
        } else {
            SleepOutcome::Completed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instant_sleeper_does_not_wait() {
        let sleeper = InstantSleeper;
        let token = CancelToken::new();
        let start = tokio::time::Instant::now();
        let outcome = sleeper.sleep(Duration::from_secs(10), &token).await;
        assert_eq!(outcome, SleepOutcome::Completed);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn instant_sleeper_reports_cancellation() {
        let sleeper = InstantSleeper;
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(
            sleeper.sleep(Duration::from_secs(1), &token).await,
            SleepOutcome::Cancelled
        );
    }

    #[tokio::test]
    async fn tracking_sleeper_records_calls() {
        let sleeper = TrackingSleeper::new();
        let token = CancelToken::new();
        sleeper.sleep(Duration::from_millis(10), &token).await;
        sleeper.sleep(Duration::from_millis(20), &token).await;
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
        sleeper.clear();
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_actually_waits() {
        let sleeper = TokioSleeper;
        let token = CancelToken::new();
        let start = tokio::time::Instant::now();
        sleeper.sleep(Duration::from_secs(5), &token).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn tokio_sleeper_cut_short_by_cancellation() {
        let sleeper = TokioSleeper;
        let token = CancelToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            child.cancel();
        });
        let outcome = sleeper.sleep(Duration::from_secs(30), &token).await;
        assert_eq!(outcome, SleepOutcome::Cancelled);
    }
}
