//! Retry pacing

use proven_common::Timestamp;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

const INITIAL_DELAY: Duration = Duration::from_millis(1);
const MAX_DELAY: Duration = Duration::from_millis(100);

/// Exponential backoff with jitter, capped at [`MAX_DELAY`]
pub(crate) struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: INITIAL_DELAY,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let ceiling = self.current;
        self.current = (self.current * 2).min(MAX_DELAY);

        let micros = ceiling.as_micros() as u64;
        let jittered = rand::thread_rng().gen_range(micros / 2..=micros);
        Duration::from_micros(jittered)
    }

    /// Sleep before the next try; `false` if the deadline leaves no time to try again
    pub async fn wait(&mut self, deadline: Timestamp) -> bool {
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return false;
        }
        tokio::time::sleep(self.next_delay().min(remaining)).await;
        !deadline.has_passed()
    }
}

/// Errors that can be classified as worth retrying in place
pub(crate) trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for proven_kv::StoreError {
    fn is_transient(&self) -> bool {
        proven_kv::StoreError::is_transient(self)
    }
}

impl Transient for crate::error::AtrError {
    fn is_transient(&self) -> bool {
        crate::error::AtrError::is_transient(self)
    }
}

/// Run `op` until it succeeds, fails permanently, or `deadline` passes
pub(crate) async fn retry_transient<T, E, F, Fut>(deadline: Timestamp, mut op: F) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::new();
    loop {
        match op().await {
            Err(e) if e.is_transient() => {
                tracing::debug!("Retrying after transient failure: {}", e);
                if !backoff.wait(deadline).await {
                    return Err(e);
                }
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proven_kv::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new();
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = backoff.next_delay();
            assert!(last <= MAX_DELAY);
        }
        assert!(last >= MAX_DELAY / 2);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let deadline = Timestamp::now().add_duration(Duration::from_secs(5));

        let result: Result<usize, StoreError> = retry_transient(deadline, || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                Err(StoreError::Transient("busy".into()))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let deadline = Timestamp::now().add_duration(Duration::from_secs(5));

        let result: Result<(), StoreError> = retry_transient(deadline, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Permanent("gone".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_at_deadline() {
        let deadline = Timestamp::now().add_duration(Duration::from_millis(20));

        let result: Result<(), StoreError> = retry_transient(deadline, || async {
            Err(StoreError::Transient("busy".into()))
        })
        .await;

        assert!(matches!(result, Err(StoreError::Transient(_))));
        assert!(deadline.has_passed());
    }
}
