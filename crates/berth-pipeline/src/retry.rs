//! Bounded retries for stage execution and the backoff schedules shared with
//! the repair loop.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use berth_types::{BerthError, CancellationToken, Result};
use serde::{Deserialize, Serialize};

/// How long to wait before the next attempt. Durations are milliseconds on
/// the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    None,
    Fixed {
        #[serde(with = "millis")]
        delay: Duration,
    },
    /// `step * (n + 1)`, never above `max`.
    Linear {
        #[serde(with = "millis")]
        step: Duration,
        #[serde(with = "millis")]
        max: Duration,
    },
    /// `base * 2^n`, never above `max`.
    Exponential {
        #[serde(with = "millis")]
        base: Duration,
        #[serde(with = "millis")]
        max: Duration,
    },
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed { delay }
    }

    /// Delay after the `n`th failure, counting from zero.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Fixed { delay } => *delay,
            BackoffPolicy::Linear { step, max } => {
                let millis = (step.as_millis() as u64).saturating_mul(attempt as u64 + 1);
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::Exponential { base, max } => {
                let millis =
                    (base.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt as u32));
                Duration::from_millis(millis).min(*max)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Decides whether a failure is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&BerthError) -> bool + Send + Sync>;

/// Bounded retry with backoff and a retryable/fatal classifier.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first. Never below 1.
    pub max_attempts: usize,
    pub backoff: BackoffPolicy,
    pub retry_on: RetryPredicate,
}

impl RetryPolicy {
    /// Classifies with [`BerthError::is_retryable`].
    pub fn new(max_attempts: usize, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retry_on: Arc::new(BerthError::is_retryable),
        }
    }

    /// A policy that never retries.
    pub fn once() -> Self {
        Self::new(1, BackoffPolicy::None)
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&BerthError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_on = Arc::new(predicate);
        self
    }

    pub fn should_retry(&self, err: &BerthError) -> bool {
        (self.retry_on)(err)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, BackoffPolicy::default())
    }
}

/// What a retried call produced and how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: usize,
}

/// Sleep for `delay` unless `cancel` fires first.
pub async fn backoff_sleep(delay: Duration, cancel: &CancellationToken, operation: &str) -> Result<()> {
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(BerthError::Cancelled { operation: operation.to_string() }),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Run `f` until it succeeds, fails with an error the policy won't retry, or
/// uses up `policy.max_attempts`. `f` receives the 1-based attempt number.
///
/// `on_retry(failed_attempt, &error, delay)` runs before each backoff sleep.
/// The token is checked before every attempt and raced against the sleep.
pub async fn execute_with_retry<T, F, Fut, R>(
    policy: &RetryPolicy,
    stage: &str,
    cancel: &CancellationToken,
    mut on_retry: R,
    mut f: F,
) -> RetryOutcome<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut(usize, &BerthError, Duration),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;
    loop {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(BerthError::Cancelled {
                    operation: stage.to_string(),
                }),
                attempts,
            };
        }

        attempts += 1;
        let err = match f(attempts).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                }
            }
            Err(e) => e,
        };

        if attempts >= max_attempts || !policy.should_retry(&err) {
            return RetryOutcome {
                result: Err(err),
                attempts,
            };
        }

        let delay = policy.backoff.delay_for_attempt(attempts - 1);
        tracing::warn!(
            stage = %stage,
            attempt = attempts,
            delay_ms = %delay.as_millis(),
            error = %err,
            "Retryable error, retrying"
        );
        on_retry(attempts, &err, delay);
        if let Err(cancelled) = backoff_sleep(delay, cancel, stage).await {
            return RetryOutcome {
                result: Err(cancelled),
                attempts,
            };
        }
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_types::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_hiccup() -> BerthError {
        BerthError::retryable_execution("build_image", "registry hiccup")
    }

    async fn run<T, F, Fut>(policy: &RetryPolicy, f: F) -> RetryOutcome<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        execute_with_retry(policy, "build", &CancellationToken::new(), |_, _, _| {}, f).await
    }

    #[tokio::test]
    async fn first_success_makes_one_attempt() {
        let outcome = run(&RetryPolicy::new(3, BackoffPolicy::None), |_| async {
            Ok("image built")
        })
        .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.unwrap(), "image built");
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut retried = Vec::new();

        let outcome = execute_with_retry(
            &RetryPolicy::new(4, BackoffPolicy::None),
            "build",
            &CancellationToken::new(),
            |failed, _, _| retried.push(failed),
            move |attempt| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(registry_hiccup())
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;

        assert_eq!(outcome.result.unwrap(), 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retried, vec![1, 2]);
    }

    #[tokio::test]
    async fn exhaustion_returns_the_last_error() {
        let outcome: RetryOutcome<()> = run(&RetryPolicy::new(3, BackoffPolicy::None), |_| async {
            Err(registry_hiccup())
        })
        .await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::ExecutionFailed);
    }

    #[tokio::test]
    async fn fatal_errors_stop_immediately() {
        let outcome: RetryOutcome<()> = run(&RetryPolicy::new(5, BackoffPolicy::None), |_| async {
            Err(BerthError::validation("build", "bad input"))
        })
        .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn predicate_overrides_error_classification() {
        let policy = RetryPolicy::new(4, BackoffPolicy::None)
            .with_predicate(|e| e.kind() != ErrorKind::Timeout);
        let outcome: RetryOutcome<()> = run(&policy, |_| async {
            Err(BerthError::Timeout {
                operation: "deploy".into(),
                timeout_ms: 10,
            })
        })
        .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn cancel_interrupts_a_long_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome: RetryOutcome<()> = execute_with_retry(
            &RetryPolicy::new(5, BackoffPolicy::fixed(Duration::from_secs(30))),
            "build",
            &cancel,
            |_, _, _| {},
            |_| async { Err(registry_hiccup()) },
        )
        .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, BackoffPolicy::None).max_attempts, 1);
        assert_eq!(RetryPolicy::once().max_attempts, 1);
    }

    #[test]
    fn backoff_schedules() {
        let ms = Duration::from_millis;

        let fixed = BackoffPolicy::fixed(ms(250));
        assert_eq!([0, 7].map(|n| fixed.delay_for_attempt(n)), [ms(250), ms(250)]);

        let linear = BackoffPolicy::Linear {
            step: ms(100),
            max: ms(250),
        };
        assert_eq!(
            [0, 1, 2].map(|n| linear.delay_for_attempt(n)),
            [ms(100), ms(200), ms(250)]
        );

        let exponential = BackoffPolicy::Exponential {
            base: ms(50),
            max: ms(300),
        };
        assert_eq!(
            [0, 1, 2, 3, 64].map(|n| exponential.delay_for_attempt(n)),
            [ms(50), ms(100), ms(200), ms(300), ms(300)]
        );

        let default = BackoffPolicy::default();
        assert_eq!(default.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(default.delay_for_attempt(40), Duration::from_secs(30));
    }

    #[test]
    fn backoff_reads_millis_from_config() {
        let policy: BackoffPolicy =
            serde_json::from_str(r#"{"kind": "linear", "step": 250, "max": 1000}"#).unwrap();
        assert_eq!(
            policy,
            BackoffPolicy::Linear {
                step: Duration::from_millis(250),
                max: Duration::from_secs(1),
            }
        );
        assert_eq!(
            serde_json::to_value(BackoffPolicy::None).unwrap(),
            serde_json::json!({"kind": "none"})
        );
    }
}
