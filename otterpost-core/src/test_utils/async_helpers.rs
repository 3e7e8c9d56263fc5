//! Async test helpers
//!
//! Session state changes land asynchronously; these helpers wait for an
//! event or a condition with a bounded timeout instead of sleeping.

use crate::core_session::SessionEvent;
use std::future::Future;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep, timeout, Duration, Instant};

/// Default timeout for tests (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Short timeout for asserting that nothing happens (100ms)
pub const SHORT_TEST_TIMEOUT: Duration = Duration::from_millis(100);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    Timeout,
    Closed,
}

impl std::fmt::Display for RecvTimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvTimeoutError::Timeout => write!(f, "receive operation timed out"),
            RecvTimeoutError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for RecvTimeoutError {}

/// Wait for the first event matching `predicate`, skipping others
///
/// Lagged receivers keep going; only a closed channel or the deadline ends
/// the wait.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<SessionEvent>,
    duration: Duration,
    mut predicate: F,
) -> Result<SessionEvent, RecvTimeoutError>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, rx.recv()).await {
            Err(_) => return Err(RecvTimeoutError::Timeout),
            Ok(Ok(event)) if predicate(&event) => return Ok(event),
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => return Err(RecvTimeoutError::Closed),
        }
    }
}

/// Poll `check` until it yields true or `duration` elapses
pub async fn eventually<F, Fut>(duration: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + duration;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Helper to assert a future completes within duration
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_session::EventBroadcaster;

    #[tokio::test]
    async fn test_wait_for_event_skips_non_matching() {
        let events = EventBroadcaster::new(8);
        let mut rx = events.subscribe();
        events.emit(SessionEvent::ConversationsChanged);
        events.emit(SessionEvent::Closed);

        let found = wait_for_event(&mut rx, SHORT_TEST_TIMEOUT, |e| *e == SessionEvent::Closed)
            .await
            .unwrap();
        assert_eq!(found, SessionEvent::Closed);
    }

    #[tokio::test]
    async fn test_wait_for_event_times_out() {
        let events = EventBroadcaster::new(8);
        let mut rx = events.subscribe();
        let result = wait_for_event(&mut rx, Duration::from_millis(20), |_| true).await;
        assert_eq!(result, Err(RecvTimeoutError::Timeout));
    }

    #[tokio::test]
    async fn test_eventually() {
        let mut calls = 0;
        assert!(
            eventually(SHORT_TEST_TIMEOUT, || {
                calls += 1;
                let done = calls >= 3;
                async move { done }
            })
            .await
        );
        assert!(!eventually(Duration::from_millis(20), || async { false }).await);
    }
}
