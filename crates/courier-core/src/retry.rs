//! Bounded exponential backoff around fallible async operations.

use std::{
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{config::ConfigHandle, logger::DiagnosticLogger};

const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(300);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Failures produced by the executor itself rather than by the operation.
///
/// Operation errors must be constructible from this (`E: From<RetryInterrupt>`)
/// so callers only ever see their own error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RetryInterrupt {
    /// The caller's cancellation token fired.
    #[error("operation aborted")]
    Cancelled,
    /// One attempt ran past the per-attempt timeout.
    #[error("attempt {attempt} timed out after {after:?}")]
    TimedOut { attempt: u32, after: Duration },
}

/// Per-attempt input handed to the wrapped operation.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Token the operation should honour to abort promptly.
    pub cancel: CancellationToken,
}

type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type RetryObserver<E> = Arc<dyn Fn(&E, u32) + Send + Sync>;

/// Retry configuration for one [`retry_with_backoff`] invocation.
pub struct RetryPolicy<E> {
    retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    attempt_timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    should_retry: Option<RetryPredicate<E>>,
    on_retry: Option<RetryObserver<E>>,
    logger: DiagnosticLogger,
}

impl<E> RetryPolicy<E> {
    pub fn new(retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
            max_delay,
            jitter: true,
            attempt_timeout: None,
            cancel: None,
            should_retry: None,
            on_retry: None,
            logger: DiagnosticLogger::default(),
        }
    }

    /// Policy seeded from the performance section of the current config.
    pub fn from_config(config: &ConfigHandle) -> Self {
        let snapshot = config.load();
        let performance = &snapshot.performance;
        let mut policy = Self::new(
            performance.max_retries,
            performance.retry_delay,
            performance.max_retry_delay,
        );
        policy.logger = DiagnosticLogger::new(config.clone());
        policy
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Bound every attempt; a zero duration disables the bound.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Stop retrying as soon as `predicate` rejects an error.
    pub fn retry_if(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Observe each failed attempt that will be retried.
    pub fn on_retry(mut self, observer: impl Fn(&E, u32) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    pub fn with_logger(mut self, logger: DiagnosticLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    /// Un-jittered delay following failed attempt `attempt` (zero-based):
    /// `min(max_delay, base_delay * 2^attempt)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1_u32 << attempt.min(31);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Actual sleep after attempt `attempt`, uniform in `[0, delay]` with jitter.
    pub fn sleep_for_attempt(&self, attempt: u32) -> Duration {
        let computed = self.delay_for_attempt(attempt);
        if !self.jitter {
            return computed;
        }
        let ceiling = u64::try_from(computed.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(0..=ceiling))
    }
}

impl<E> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self::new(DEFAULT_RETRIES, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            retries: self.retries,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
            attempt_timeout: self.attempt_timeout,
            cancel: self.cancel.clone(),
            should_retry: self.should_retry.clone(),
            on_retry: self.on_retry.clone(),
            logger: self.logger.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retries", &self.retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("cancellable", &self.cancel.is_some())
            .field("has_predicate", &self.should_retry.is_some())
            .field("has_observer", &self.on_retry.is_some())
            .finish()
    }
}

enum AttemptFailure<E> {
    Failed(E),
    Interrupted,
}

/// Run `operation` until it succeeds or the policy gives up.
///
/// At most `retries + 1` attempts run, one at a time. Exhaustion or a
/// predicate rejection returns the last operation error untouched; external
/// cancellation returns `E::from(RetryInterrupt::Cancelled)` without retrying.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy<E>,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(AttemptContext) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<RetryInterrupt> + fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        let err = match run_attempt(policy, &mut operation, attempt).await {
            Ok(value) => return Ok(value),
            Err(AttemptFailure::Interrupted) => {
                policy
                    .logger
                    .debug(format_args!("attempt {} aborted by caller", attempt + 1));
                return Err(E::from(RetryInterrupt::Cancelled));
            }
            Err(AttemptFailure::Failed(err)) => err,
        };

        if attempt >= policy.retries {
            policy.logger.debug(format_args!(
                "giving up after {} attempts: {err}",
                attempt + 1
            ));
            return Err(err);
        }
        if let Some(should_retry) = &policy.should_retry
            && !should_retry(&err)
        {
            policy
                .logger
                .debug(format_args!("error is not retryable: {err}"));
            return Err(err);
        }

        notify_observer(policy, &err, attempt + 1);

        let delay = policy.sleep_for_attempt(attempt);
        policy.logger.warn(format_args!(
            "attempt {} failed: {err}; retrying in {delay:?}",
            attempt + 1
        ));
        if !sleep_unless_cancelled(delay, policy.cancel.as_ref()).await {
            return Err(E::from(RetryInterrupt::Cancelled));
        }
        attempt += 1;
    }
}

async fn run_attempt<T, E, F, Fut>(
    policy: &RetryPolicy<E>,
    operation: &mut F,
    attempt: u32,
) -> Result<T, AttemptFailure<E>>
where
    F: FnMut(AttemptContext) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<RetryInterrupt>,
{
    let number = attempt + 1;
    let external = policy.cancel.as_ref();
    if external.is_some_and(CancellationToken::is_cancelled) {
        return Err(AttemptFailure::Interrupted);
    }

    let Some(limit) = policy.attempt_timeout else {
        let cancel = external.cloned().unwrap_or_else(CancellationToken::new);
        let pending = operation(AttemptContext {
            attempt: number,
            cancel,
        });
        return match until_cancelled(external, pending).await {
            Some(result) => result.map_err(AttemptFailure::Failed),
            None => Err(AttemptFailure::Interrupted),
        };
    };

    let scoped = external
        .map(CancellationToken::child_token)
        .unwrap_or_else(CancellationToken::new);
    let pending = operation(AttemptContext {
        attempt: number,
        cancel: scoped.clone(),
    });
    let outcome = until_cancelled(external, tokio::time::timeout(limit, pending)).await;
    match outcome {
        Some(Ok(result)) => result.map_err(AttemptFailure::Failed),
        Some(Err(_elapsed)) => {
            scoped.cancel();
            Err(AttemptFailure::Failed(E::from(RetryInterrupt::TimedOut {
                attempt: number,
                after: limit,
            })))
        }
        None => {
            scoped.cancel();
            Err(AttemptFailure::Interrupted)
        }
    }
}

async fn until_cancelled<F: Future>(
    cancel: Option<&CancellationToken>,
    pending: F,
) -> Option<F::Output> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => None,
            output = pending => Some(output),
        },
        None => Some(pending.await),
    }
}

/// Returns `false` when the sleep was cut short by cancellation.
async fn sleep_unless_cancelled(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    until_cancelled(cancel, tokio::time::sleep(delay))
        .await
        .is_some()
}

fn notify_observer<E>(policy: &RetryPolicy<E>, err: &E, attempt: u32) {
    let Some(observer) = &policy.on_retry else {
        return;
    };
    if panic::catch_unwind(AssertUnwindSafe(|| observer(err, attempt))).is_err() {
        policy
            .logger
            .warn(format_args!("retry observer panicked on attempt {attempt}"));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use tokio::time::Instant;

    use super::*;
    use crate::error::{CourierError, ErrorCategory};

    fn network_error(attempt: u32) -> CourierError {
        CourierError::new(
            ErrorCategory::Network,
            "send_failed",
            format!("attempt {attempt} failed"),
        )
    }

    fn fixed_policy(retries: u32) -> RetryPolicy<CourierError> {
        RetryPolicy::new(retries, Duration::from_millis(100), Duration::from_secs(2))
            .with_jitter(false)
    }

    #[test]
    fn defaults_match_documented_values() {
        let policy = RetryPolicy::<CourierError>::default();
        assert_eq!(policy.retries(), 3);
        assert_eq!(policy.base_delay(), Duration::from_millis(300));
        assert_eq!(policy.max_delay(), Duration::from_secs(5));
        assert!(policy.jitter());
        assert_eq!(policy.attempt_timeout(), None);
    }

    #[test]
    fn config_supplies_policy_defaults() {
        let handle = ConfigHandle::default();
        let policy = RetryPolicy::<CourierError>::from_config(&handle);
        assert_eq!(policy.retries(), 5);
        assert_eq!(policy.base_delay(), Duration::from_secs(5));
        assert_eq!(policy.max_delay(), Duration::from_secs(60));
    }

    #[test]
    fn scales_exponentially_and_caps() {
        let policy = RetryPolicy::<CourierError>::new(
            3,
            Duration::from_millis(100),
            Duration::from_millis(1_000),
        );
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(1_000));
    }

    #[test]
    fn jittered_sleep_stays_within_computed_delay() {
        let policy = RetryPolicy::<CourierError>::new(
            3,
            Duration::from_millis(100),
            Duration::from_millis(1_000),
        );
        for attempt in 0..6 {
            let ceiling = policy.delay_for_attempt(attempt);
            for _ in 0..50 {
                assert!(policy.sleep_for_attempt(attempt) <= ceiling);
            }
        }
        let exact = policy.clone().with_jitter(false);
        assert_eq!(exact.sleep_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn zero_timeout_disables_attempt_bound() {
        let policy = fixed_policy(1).with_attempt_timeout(Duration::ZERO);
        assert_eq!(policy.attempt_timeout(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn permanently_failing_operation_runs_retries_plus_one_times() {
        for retries in [0_u32, 1, 4] {
            let calls = AtomicU32::new(0);
            let err = retry_with_backoff(&fixed_policy(retries), |ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(network_error(ctx.attempt)) }
            })
            .await
            .expect_err("operation never succeeds");

            assert_eq!(calls.load(Ordering::SeqCst), retries + 1);
            assert_eq!(err.message, format!("attempt {} failed", retries + 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_fail_without_delay() {
        let started = Instant::now();
        let err = retry_with_backoff(&fixed_policy(0), |ctx| async move {
            Err::<(), _>(network_error(ctx.attempt))
        })
        .await
        .expect_err("single attempt fails");

        assert_eq!(err.code, "send_failed");
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_exact_backoff_between_attempts_without_jitter() {
        let started = Instant::now();
        let _ = retry_with_backoff(&fixed_policy(3), |ctx| async move {
            Err::<(), _>(network_error(ctx.attempt))
        })
        .await;

        // 100 + 200 + 400 ms
        assert_eq!(started.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_value_once_an_attempt_succeeds() {
        let value = retry_with_backoff(&fixed_policy(5), |ctx| async move {
            if ctx.attempt < 3 {
                Err(network_error(ctx.attempt))
            } else {
                Ok(ctx.attempt * 10)
            }
        })
        .await
        .expect("third attempt succeeds");
        assert_eq!(value, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_rejection_stops_after_current_attempt() {
        let calls = AtomicU32::new(0);
        let policy = fixed_policy(10).retry_if(|err: &CourierError| err.message != "attempt 3 failed");

        let err = retry_with_backoff(&policy, |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(network_error(ctx.attempt)) }
        })
        .await
        .expect_err("predicate stops the loop");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.message, "attempt 3 failed");
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_each_retryable_failure_and_panics_are_swallowed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let policy = fixed_policy(3).on_retry(move |_err: &CourierError, attempt| {
            recorder.lock().expect("observer lock").push(attempt);
            if attempt == 2 {
                panic!("observer failure");
            }
        });
        let calls = AtomicU32::new(0);

        let _ = retry_with_backoff(&policy, |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(network_error(ctx.attempt)) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(*seen.lock().expect("observer lock"), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_sleep_aborts_before_delay_expires() {
        let token = CancellationToken::new();
        let policy = RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(60))
            .with_jitter(false)
            .with_cancellation(token.clone());

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&policy, |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(network_error(ctx.attempt)) }
        })
        .await
        .expect_err("cancelled");

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_token_never_runs_the_operation() {
        let token = CancellationToken::new();
        token.cancel();
        let policy = fixed_policy(3).with_cancellation(token);
        let calls = AtomicU32::new(0);

        let err = retry_with_backoff(&policy, |_ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, CourierError>(()) }
        })
        .await
        .expect_err("cancelled before first attempt");

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    fn cancel_after(token: &CancellationToken, delay: Duration) {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            token.cancel();
        });
    }

    async fn run_until_cancelled(policy: &RetryPolicy<CourierError>) -> (CourierError, u32) {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(policy, |_ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                std::future::pending::<()>().await;
                Ok::<(), CourierError>(())
            }
        })
        .await
        .expect_err("operation never finishes");
        (err, calls.load(Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_running_attempt_without_timeout() {
        let token = CancellationToken::new();
        let policy = fixed_policy(3).with_cancellation(token.clone());
        cancel_after(&token, Duration::from_secs(1));

        let started = Instant::now();
        let (err, calls) = run_until_cancelled(&policy).await;

        assert!(err.is_cancelled());
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_running_attempt_before_its_timeout() {
        let token = CancellationToken::new();
        let policy = fixed_policy(3)
            .with_attempt_timeout(Duration::from_secs(100))
            .with_cancellation(token.clone());
        cancel_after(&token, Duration::from_secs(1));

        let started = Instant::now();
        let (err, calls) = run_until_cancelled(&policy).await;

        assert!(err.is_cancelled());
        assert_ne!(err.category, ErrorCategory::Timeout);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn external_token_is_passed_through_without_timeout() {
        let token = CancellationToken::new();
        let policy = fixed_policy(0).with_cancellation(token.clone());

        let handed = retry_with_backoff(&policy, |ctx| async move {
            Ok::<_, CourierError>(ctx.cancel)
        })
        .await
        .expect("succeeds");

        assert!(!handed.is_cancelled());
        token.cancel();
        assert!(handed.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_uses_fresh_token_per_attempt() {
        let external = CancellationToken::new();
        let tokens = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&tokens);
        let policy = fixed_policy(2)
            .with_attempt_timeout(Duration::from_millis(250))
            .with_cancellation(external.clone());

        let started = Instant::now();
        let err = retry_with_backoff(&policy, move |ctx| {
            recorder.lock().expect("token lock").push(ctx.cancel.clone());
            async move {
                std::future::pending::<()>().await;
                Ok::<(), CourierError>(())
            }
        })
        .await
        .expect_err("every attempt times out");

        assert_eq!(err.category, ErrorCategory::Timeout);
        // three 250 ms attempts plus 100 + 200 ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(1_050));
        assert!(!external.is_cancelled());

        let tokens = tokens.lock().expect("token lock");
        assert_eq!(tokens.len(), 3);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_that_finishes_in_time_is_not_cut_short() {
        let policy = fixed_policy(1).with_attempt_timeout(Duration::from_secs(1));
        let value = retry_with_backoff(&policy, |ctx| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(!ctx.cancel.is_cancelled());
            Ok::<_, CourierError>("sent")
        })
        .await
        .expect("attempt completes before timeout");
        assert_eq!(value, "sent");
    }
}
