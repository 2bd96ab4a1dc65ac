//! Retry with exponential backoff and a circuit breaker around a remote service.
//!
//! Every attempt made by the retry loop passes through the breaker, and the
//! loop stops as soon as the breaker refuses a call.

use crate::api::{ApiError, HealthRecordService, RemoteRecord};
use crate::config::ApiConfig;
use crate::records::HealthRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls fail fast without I/O
    Open,
    /// One trial call is allowed through
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Three-state circuit breaker.
///
/// Opens after `failure_threshold` consecutive failed calls. After `cooldown`
/// the next call is let through as a trial: success closes the breaker,
/// failure opens it again.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // Every update leaves the state consistent, so poisoning is ignored
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(opened_at)) if opened_at.elapsed() >= self.cooldown => {
                BreakerState::HalfOpen
            }
            (state, _) => state,
        }
    }

    fn try_acquire(&self) -> Result<Permit<'_>, ApiError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(Permit::new(self, false)),
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|opened_at| opened_at.elapsed() >= self.cooldown);
                if !cooled {
                    return Err(ApiError::CircuitOpen);
                }
                info!("Circuit breaker half-open, allowing trial call");
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                Ok(Permit::new(self, true))
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(ApiError::CircuitOpen);
                }
                inner.trial_in_flight = true;
                Ok(Permit::new(self, true))
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!("Circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.trial_in_flight = false;
        match inner.state {
            BreakerState::HalfOpen | BreakerState::Open => {
                warn!("Trial call failed, circuit breaker re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
        }
    }

    /// Run `call` if the breaker allows it and record the outcome.
    ///
    /// Only retryable errors count as failures; a definitive answer from the
    /// server means the server is healthy.
    pub async fn call<T, F, Fut>(&self, call: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut permit = self.try_acquire()?;
        let result = call().await;
        permit.settled = true;
        match &result {
            Err(e) if e.is_retryable() => self.on_failure(),
            _ => self.on_success(),
        }
        result
    }

    /// The half-open trial was dropped before it finished.
    fn on_trial_abandoned(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            debug!("Trial call abandoned, circuit breaker re-opened");
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
        inner.trial_in_flight = false;
    }
}

/// Admission to one call. Dropping an unsettled trial frees the half-open slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.on_trial_abandoned();
        }
    }
}

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ApiConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_backoff(),
            max_delay: config.max_backoff(),
        }
    }

    /// Delay after the given failed attempt (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Any [`HealthRecordService`] wrapped with retry and circuit breaking.
pub struct ResilientService<S> {
    inner: S,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl<S: HealthRecordService> ResilientService<S> {
    pub fn new(inner: S, config: &ApiConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(
                config.breaker_failure_threshold,
                config.breaker_cooldown(),
            ),
            retry: RetryPolicy::from_config(config),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn execute<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ApiError>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match self.breaker.call(&mut call).await {
                Ok(value) => return Ok(value),
                Err(ApiError::CircuitOpen) => {
                    debug!(operation, attempt, "Circuit open, not calling service");
                    return Err(ApiError::CircuitOpen);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<S: HealthRecordService> HealthRecordService for ResilientService<S> {
    async fn upload_record(&self, record: &HealthRecord) -> Result<RemoteRecord, ApiError> {
        self.execute("upload_record", || self.inner.upload_record(record))
            .await
    }

    async fn fetch_updated_since(
        &self,
        patient_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>, ApiError> {
        self.execute("fetch_updated_since", || {
            self.inner.fetch_updated_since(patient_id, since)
        })
        .await
    }

    async fn fetch_page(
        &self,
        patient_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<RemoteRecord>, ApiError> {
        self.execute("fetch_page", || {
            self.inner.fetch_page(patient_id, page, page_size)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_record, FakeRecordService};

    fn config(max_attempts: u32, threshold: u32) -> ApiConfig {
        ApiConfig {
            max_attempts,
            breaker_failure_threshold: threshold,
            breaker_cooldown_secs: 30,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
            ..ApiConfig::default()
        }
    }

    fn offline() -> ApiError {
        ApiError::Network("connection refused".into())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(4), Duration::from_secs(4));
        assert_eq!(policy.backoff(6), Duration::from_secs(8));
        assert_eq!(policy.backoff(40), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_after_five_failures_then_half_opens() {
        let service = ResilientService::new(FakeRecordService::new(), &config(1, 5));
        service.inner().set_failing(Some(offline()));
        let record = sample_record("p1");

        for _ in 0..5 {
            let err = service.upload_record(&record).await.unwrap_err();
            assert!(matches!(err, ApiError::Network(_)));
        }
        assert_eq!(service.breaker_state(), BreakerState::Open);

        // Sixth call fails fast without touching the service
        let err = service.upload_record(&record).await.unwrap_err();
        assert_eq!(err, ApiError::CircuitOpen);
        assert_eq!(service.inner().calls(), 5);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(service.breaker_state(), BreakerState::HalfOpen);

        service.inner().set_failing(None);
        service.upload_record(&record).await.unwrap();
        assert_eq!(service.inner().calls(), 6);
        assert_eq!(service.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_breaker() {
        let service = ResilientService::new(FakeRecordService::new(), &config(1, 2));
        service.inner().set_failing(Some(offline()));

        for _ in 0..2 {
            let _ = service.fetch_page("p1", 0, 10).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(matches!(
            service.fetch_page("p1", 0, 10).await,
            Err(ApiError::Network(_))
        ));
        assert_eq!(service.breaker_state(), BreakerState::Open);
        assert_eq!(
            service.fetch_page("p1", 0, 10).await,
            Err(ApiError::CircuitOpen)
        );
        assert_eq!(service.inner().calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_does_not_wedge_breaker() {
        let service = ResilientService::new(FakeRecordService::new(), &config(1, 2));
        service.inner().set_failing(Some(offline()));
        let record = sample_record("p1");

        for _ in 0..2 {
            let _ = service.upload_record(&record).await;
        }
        assert_eq!(service.breaker_state(), BreakerState::Open);
        tokio::time::advance(Duration::from_secs(31)).await;

        service.inner().set_failing(None);
        service.inner().set_delay(Duration::from_secs(10));
        let timed_out =
            tokio::time::timeout(Duration::from_secs(1), service.upload_record(&record)).await;
        assert!(timed_out.is_err());
        // The abandoned trial counts as a failed one
        assert_eq!(service.breaker_state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        service.upload_record(&record).await.unwrap();
        assert_eq!(service.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let service = ResilientService::new(FakeRecordService::new(), &config(3, 5));
        service.inner().fail_next(2, offline());

        let remote = service.upload_record(&sample_record("p1")).await.unwrap();
        assert_eq!(remote.server_version, 1);
        assert_eq!(service.inner().calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let service = ResilientService::new(FakeRecordService::new(), &config(3, 10));
        service.inner().set_failing(Some(offline()));

        assert!(service.fetch_updated_since("p1", None).await.is_err());
        assert_eq!(service.inner().calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_errors_are_not_retried() {
        let service = ResilientService::new(FakeRecordService::new(), &config(3, 5));
        service
            .inner()
            .set_failing(Some(ApiError::Validation("bad coding".into())));

        let err = service.upload_record(&sample_record("p1")).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(service.inner().calls(), 1);
        assert_eq!(service.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_when_breaker_opens() {
        let service = ResilientService::new(FakeRecordService::new(), &config(5, 2));
        service.inner().set_failing(Some(offline()));

        let err = service.upload_record(&sample_record("p1")).await.unwrap_err();
        assert_eq!(err, ApiError::CircuitOpen);
        assert_eq!(service.inner().calls(), 2);
    }
}
