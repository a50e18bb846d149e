//! Retry with exponential backoff plus a three-state circuit breaker.
//!
//! The two layers compose in a fixed order: retry runs innermost and must
//! exhaust its budget before the resulting single failure is recorded by the
//! breaker. Three retried sub-failures therefore count as one breaker failure.
//!
//! ```text
//! caller -> CircuitBreaker -> RetryPolicy -> Transport::send
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::error::{Error, ErrorKind, Result};
use crate::transport::{Request, Transport};

/// When and how often to retry a failed call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries including the first one (at least 1).
    pub max_attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub backoff_multiplier: f64,
    pub retryable_kinds: HashSet<ErrorKind>,
    /// Also retry vendor responses with a 5xx status.
    pub retry_server_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            retryable_kinds: [ErrorKind::Connection, ErrorKind::Timeout]
                .into_iter()
                .collect(),
            retry_server_errors: false,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based: the wait after the first
    /// failed try is `delay_for_attempt(1) == min_wait`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.min_wait.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_wait.as_secs_f64() {
            self.max_wait
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn is_retryable(&self, err: &Error) -> bool {
        self.retryable_kinds.contains(&err.kind())
            || (self.retry_server_errors && err.is_server_error())
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub async fn run<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(op, |_| true).await
    }

    /// Like [`run`](Self::run), but an error is only retried when `allow`
    /// also accepts it.
    pub async fn run_if<F, Fut, T, P>(&self, mut op: F, allow: P) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && self.is_retryable(&err) && allow(&err) => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        kind = %err.kind(),
                        "retrying after error: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tunables.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub fail_threshold: u32,
    pub reset_timeout: Duration,
    /// Error kinds that never count as failures.
    pub excluded_kinds: HashSet<ErrorKind>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            excluded_kinds: [
                ErrorKind::Validation,
                ErrorKind::NotFound,
                ErrorKind::Configuration,
            ]
            .into_iter()
            .collect(),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    fail_count: u32,
    opened_at: Option<Instant>,
    /// A HalfOpen trial call is currently running.
    trial_in_flight: bool,
}

/// Three-state failure isolation for one vendor client.
///
/// Every transition happens under a single mutex acquisition that is never
/// held across an `.await`; the wrapped call itself runs outside the lock.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Admission granted by [`CircuitBreaker::acquire`].
///
/// A HalfOpen trial permit that is dropped before its outcome is recorded
/// (the caller's future was cancelled) re-opens the circuit, so the breaker
/// never stays in HalfOpen without a trial to end it.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl Permit<'_> {
    fn record(mut self, failed: bool) {
        if failed {
            self.breaker.record_failure();
        } else {
            self.breaker.record_success();
        }
        self.trial = false;
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.abandon_trial();
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                fail_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn fail_count(&self) -> u32 {
        self.lock().fail_count
    }

    /// Run `op` through the breaker.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        let result = op().await;
        let failed = matches!(&result, Err(err) if !self.config.excluded_kinds.contains(&err.kind()));
        permit.record(failed);
        result
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // The guarded section never panics mid-update, so a poisoned lock
        // still holds a consistent state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed < self.config.reset_timeout {
                    return Err(self.open_error(self.config.reset_timeout - elapsed));
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                tracing::info!(circuit = %self.name, "circuit half-open, allowing trial call");
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.open_error(Duration::ZERO));
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Ok(Permit {
            breaker: self,
            trial,
        })
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.fail_count = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.fail_count = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                tracing::info!(circuit = %self.name, "circuit closed");
            }
            // A call admitted before the circuit opened finished late
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                tracing::warn!(circuit = %self.name, "trial call failed, circuit re-opened");
            }
            CircuitState::Closed => {
                inner.fail_count += 1;
                if inner.fail_count >= self.config.fail_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.fail_count,
                        "circuit opened"
                    );
                }
            }
            // A call admitted before the circuit opened finished late
            CircuitState::Open => {}
        }
    }

    fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
            tracing::warn!(circuit = %self.name, "trial call cancelled, circuit re-opened");
        }
    }

    fn open_error(&self, retry_after: Duration) -> Error {
        Error::CircuitOpen {
            name: self.name.clone(),
            retry_after,
        }
    }
}

/// Retry + breaker composed around arbitrary async operations.
#[derive(Clone)]
pub struct Resilient {
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl Resilient {
    pub fn new(retry: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self { retry, breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn run<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker.call(|| self.retry.run(op)).await
    }

    /// [`run`](Self::run) with an extra retry filter, see [`RetryPolicy::run_if`].
    pub async fn run_if<F, Fut, T, P>(&self, op: F, allow: P) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        self.breaker.call(|| self.retry.run_if(op, allow)).await
    }
}

/// A [`Transport`] hardened with [`Resilient`]. This is what vendor clients
/// hold and call.
pub struct ResilientTransport {
    transport: Transport,
    resilient: Resilient,
}

impl ResilientTransport {
    pub fn new(transport: Transport, retry: RetryPolicy, breaker: BreakerConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(transport.base_url(), breaker));
        Self {
            transport,
            resilient: Resilient::new(retry, breaker),
        }
    }

    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        self.resilient.breaker()
    }

    /// Send `request` with retries and the breaker.
    ///
    /// Requests with a non-idempotent method (POST, PATCH) are only retried
    /// when they provably never reached the vendor; a timeout or a connection
    /// lost mid-request is returned as is.
    pub async fn send(&self, request: Request) -> Result<Value> {
        let idempotent = request.is_idempotent();
        let result = self
            .resilient
            .run_if(
                || self.transport.send(&request),
                |err| idempotent || !err.may_have_reached_vendor(),
            )
            .await;
        if let Err(err) = &result {
            tracing::debug!(
                method = %request.method(),
                path = request.path(),
                kind = %err.kind(),
                "vendor call failed"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            min_wait: Duration::from_millis(100),
            max_wait: Duration::from_millis(350),
            ..RetryPolicy::default()
        }
    }

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                fail_threshold: threshold,
                reset_timeout: reset,
                ..BreakerConfig::default()
            },
        )
    }

    async fn failing(calls: &AtomicU32) -> Result<()> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Connection("refused".into()))
    }

    #[test]
    fn delays_grow_then_cap() {
        let policy = fast_policy(10);
        let delays: Vec<Duration> = (1..=6).map(|n| policy.delay_for_attempt(n)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= policy.max_wait));
        assert_eq!(delays[5], policy.max_wait);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_calls_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(4);
        let started = Instant::now();

        let err = policy.run(|| failing(&calls)).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(err.to_string(), "connection failed: refused");
        // 100 + 200 + 350 (capped)
        assert_eq!(started.elapsed(), Duration::from_millis(650));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_short_circuits() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(5);
        let err = policy
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::validation("bad vmid"))
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_retry_only_when_enabled() {
        let calls = AtomicU32::new(0);
        let op = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::VendorApi {
                status: 503,
                message: "busy".into(),
            })
        };

        fast_policy(3).run(op).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        calls.store(0, Ordering::SeqCst);
        let policy = RetryPolicy {
            retry_server_errors: true,
            ..fast_policy(3)
        };
        policy.run(op).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let value = fast_policy(3)
            .run(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Timeout("slow".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_trip_and_reset_cycle() {
        let cb = breaker(3, Duration::from_secs(30));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            cb.call(|| failing(&calls)).await.unwrap_err();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Rejected without reaching the operation
        let err = cb.call(|| failing(&calls)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_secs(30)).await;

        // Trial call succeeds -> closed
        cb.call(|| async { Ok::<_, Error>(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.fail_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let cb = breaker(3, Duration::from_secs(30));
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            cb.call(|| failing(&calls)).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let err = cb.call(|| failing(&calls)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(cb.state(), CircuitState::Open);

        // opened_at was reset: still open 29s later
        tokio::time::advance(Duration::from_secs(29)).await;
        let err = cb.call(|| failing(&calls)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_errors_never_trip_the_breaker() {
        let cb = breaker(2, Duration::from_secs(30));
        for _ in 0..10 {
            cb.call(|| async { Err::<(), _>(Error::validation("bad input")) })
                .await
                .unwrap_err();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.fail_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_fail_count() {
        let cb = breaker(3, Duration::from_secs(30));
        let calls = AtomicU32::new(0);
        cb.call(|| failing(&calls)).await.unwrap_err();
        cb.call(|| failing(&calls)).await.unwrap_err();
        assert_eq!(cb.fail_count(), 2);
        cb.call(|| async { Ok::<_, Error>(()) }).await.unwrap();
        assert_eq!(cb.fail_count(), 0);
        cb.call(|| failing(&calls)).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_trial() {
        let cb = Arc::new(breaker(1, Duration::from_secs(5)));
        let calls = AtomicU32::new(0);
        cb.call(|| failing(&calls)).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(5)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = Arc::clone(&cb);
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, Error>(())
                })
                .await
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let err = cb.call(|| async { Ok::<_, Error>(()) }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_reopens_the_circuit() {
        let cb = breaker(1, Duration::from_secs(5));
        let calls = AtomicU32::new(0);
        cb.call(|| failing(&calls)).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(5)).await;

        let trial = cb.call(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, Error>(())
        });
        tokio::time::timeout(Duration::from_millis(10), trial)
            .await
            .unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        // A fresh reset timeout runs from the cancellation
        let err = cb.call(|| failing(&calls)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        cb.call(|| async { Ok::<_, Error>(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_filter_can_veto_a_retryable_error() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(3)
            .run_if(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::Timeout("slow".into()))
                },
                |err| !err.may_have_reached_vendor(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        calls.store(0, Ordering::SeqCst);
        fast_policy(3)
            .run_if(|| failing(&calls), |err| !err.may_have_reached_vendor())
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_count_as_one_breaker_failure() {
        let resilient = Resilient::new(
            fast_policy(3),
            Arc::new(breaker(2, Duration::from_secs(30))),
        );
        let calls = AtomicU32::new(0);

        resilient.run(|| failing(&calls)).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(resilient.breaker().fail_count(), 1);
        assert_eq!(resilient.breaker().state(), CircuitState::Closed);

        resilient.run(|| failing(&calls)).await.unwrap_err();
        assert_eq!(resilient.breaker().state(), CircuitState::Open);

        let err = resilient.run(|| failing(&calls)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }
}
