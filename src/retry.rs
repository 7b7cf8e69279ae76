//! Retry policy for daemon control-API calls.
//!
//! Failures are classified as connect, read or status errors. Each class has
//! its own budget and all of them draw from a shared total budget. Delays grow
//! exponentially: `backoff_factor * 2^(n - 1)` for the n-th retry, capped at
//! `max_backoff`.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The connection to the daemon could not be established.
    Connect,
    /// The connection dropped or timed out while waiting for a response.
    Read,
    /// The daemon answered with an HTTP status code.
    Status(u16),
    /// Not worth retrying.
    Fatal,
}

/// Bounded retry configuration shared by every daemon call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries of any kind.
    pub total: u32,
    /// Maximum number of retries after connect failures.
    pub connect: u32,
    /// Maximum number of retries after read failures.
    pub read: u32,
    /// Base backoff in seconds.
    pub backoff_factor: f64,
    /// Upper bound on a single backoff delay, in seconds when deserialized.
    #[serde(with = "crate::config::duration_secs")]
    pub max_backoff: Duration,
    /// HTTP status codes considered transient.
    pub status_forcelist: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            total: 9,
            connect: 5,
            read: 5,
            backoff_factor: 0.2,
            max_backoff: Duration::from_secs(120),
            status_forcelist: vec![500],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            total: 0,
            connect: 0,
            read: 0,
            ..Self::default()
        }
    }

    /// Variant for requests that must not be replayed once the daemon may have
    /// seen them. Only failures to connect are retried.
    pub fn connect_only(&self) -> Self {
        Self {
            read: 0,
            status_forcelist: Vec::new(),
            ..self.clone()
        }
    }

    /// Delay before the given retry (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 || self.backoff_factor <= 0.0 {
            return Duration::ZERO;
        }
        let exp = 2f64.powi(retry.saturating_sub(1).min(31) as i32);
        let secs = (self.backoff_factor * exp).min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    fn allows(&self, kind: FailureKind, counters: &RetryCounters) -> bool {
        if counters.total >= self.total {
            return false;
        }
        match kind {
            FailureKind::Connect => counters.connect < self.connect,
            FailureKind::Read => counters.read < self.read,
            FailureKind::Status(code) => self.status_forcelist.contains(&code),
            FailureKind::Fatal => false,
        }
    }

    /// Run `operation` until it succeeds or the budget for its failure kind
    /// runs out. `classify` maps an error to its [`FailureKind`].
    pub async fn run<T, E, F, Fut, C>(
        &self,
        operation: &str,
        classify: C,
        mut attempt: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> FailureKind,
        E: std::fmt::Display,
    {
        let mut counters = RetryCounters::default();
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let kind = classify(&err);
                    if !self.allows(kind, &counters) {
                        if counters.total > 0 {
                            tracing::warn!(
                                operation = operation,
                                retries = counters.total,
                                error = %err,
                                "Daemon call failed after retries"
                            );
                        }
                        return Err(err);
                    }
                    counters.record(kind);
                    let delay = self.backoff(counters.total);
                    tracing::debug!(
                        operation = operation,
                        retry = counters.total,
                        kind = ?kind,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient daemon failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct RetryCounters {
    total: u32,
    connect: u32,
    read: u32,
}

impl RetryCounters {
    fn record(&mut self, kind: FailureKind) {
        self.total += 1;
        match kind {
            FailureKind::Connect => self.connect += 1,
            FailureKind::Read => self.read += 1,
            FailureKind::Status(_) | FailureKind::Fatal => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            backoff_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    async fn run_failing(
        policy: &RetryPolicy,
        kind: FailureKind,
        succeed_after: u32,
    ) -> (Result<u32, String>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = policy
            .run(
                "test",
                |_: &String| kind,
                || {
                    let counter = Arc::clone(&counter);
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        if n < succeed_after {
                            Err(format!("failure {}", n))
                        } else {
                            Ok(n)
                        }
                    }
                },
            )
            .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_secs_f64(0.2));
        assert_eq!(policy.backoff(2), Duration::from_secs_f64(0.4));
        assert_eq!(policy.backoff(3), Duration::from_secs_f64(0.8));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_backoff: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(30), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_first_attempt_succeeds() {
        let (result, calls) = run_failing(&fast_policy(), FailureKind::Connect, 0).await;
        assert_eq!(result.unwrap(), 0);
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_connect_failures_retry_then_succeed() {
        let (result, calls) = run_failing(&fast_policy(), FailureKind::Connect, 3).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn test_connect_budget_is_bounded() {
        let (result, calls) = run_failing(&fast_policy(), FailureKind::Connect, 100).await;
        assert!(result.is_err());
        // one initial attempt plus five connect retries
        assert_eq!(calls, 6);
    }

    #[tokio::test]
    async fn test_status_retry_respects_total() {
        let (result, calls) = run_failing(&fast_policy(), FailureKind::Status(500), 100).await;
        assert!(result.is_err());
        assert_eq!(calls, 10);
    }

    #[tokio::test]
    async fn test_status_outside_forcelist_is_not_retried() {
        let (result, calls) = run_failing(&fast_policy(), FailureKind::Status(404), 100).await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let (result, calls) = run_failing(&fast_policy(), FailureKind::Fatal, 100).await;
        assert_eq!(result.unwrap_err(), "failure 0");
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_connect_only_retries_connect_failures() {
        let policy = fast_policy().connect_only();
        let (result, calls) = run_failing(&policy, FailureKind::Connect, 2).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_connect_only_does_not_replay_after_response() {
        let policy = fast_policy().connect_only();
        let (result, calls) = run_failing(&policy, FailureKind::Status(500), 100).await;
        assert!(result.is_err());
        assert_eq!(calls, 1);

        let (result, calls) = run_failing(&policy, FailureKind::Read, 100).await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_none_policy_never_retries() {
        let (result, calls) = run_failing(&RetryPolicy::none(), FailureKind::Read, 1).await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
