//! Bounded exponential backoff for transient storage errors.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::Store;

/// How often and how patiently to retry transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry, doubled on each subsequent one
    pub base_delay_ms: u64,
    /// Upper bound on a single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay to sleep after the `attempt`-th failure (0-based), with jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_delay_ms);
        let jitter = if self.base_delay_ms > 0 {
            rand::rng().random_range(0..=self.base_delay_ms)
        } else {
            0
        };
        Duration::from_millis(exp + jitter)
    }

    /// Run `f` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn run<F, Fut, R>(&self, op: &str, mut f: F) -> Result<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(r) => return Ok(r),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        op,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient storage error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Wraps a store so transient errors are retried before being surfaced.
#[derive(Debug)]
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: Store> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait::async_trait]
impl<S: Store> Store for RetryingStore<S> {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.policy.run("get", || self.inner.get(key)).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.policy
            .run("put", || self.inner.put(key, data.clone()))
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.policy.run("delete", || self.inner.delete(key)).await
    }

    async fn list_after(&self, prefix: &str, start_after: Option<&str>) -> Result<Vec<String>> {
        self.policy
            .run("list", || self.inner.list_after(prefix, start_after))
            .await
    }

    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        self.policy
            .run("list", || self.inner.list_prefixes(prefix))
            .await
    }

    fn kind(&self) -> &'static str {
        self.inner.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run("get", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Transient("flaky".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run("put", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Transient("down".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run("get", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Permanent("forbidden".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Permanent(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 400,
        };
        assert!(policy.delay(9) <= Duration::from_millis(500));
        assert!(policy.delay(0) >= Duration::from_millis(100));
    }
}
