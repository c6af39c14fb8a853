//! Resilience primitives for compute submissions: retry with backoff and a circuit breaker.
//!
//! `ResilientCompute` wraps any `ComputeClient`, retrying only transient
//! failures and failing fast with `ComputeUnavailable` while the breaker is open.

use crate::compute::{ComputeClient, EndpointConfigSpec, InvocationRequest, ModelDefinition, SubmissionHandle, TransformJobSpec, TransformJobState};
use crate::config::ComputeConfig;
use crate::error::{LifecycleError, LifecycleResult};
use crate::metrics::LIFECYCLE_METRICS;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig { fn default() -> Self { Self { max_retries: 2, base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(2), jitter: 0.25 } } }

impl From<&ComputeConfig> for RetryConfig {
    fn from(c: &ComputeConfig) -> Self {
        Self { max_retries: c.submit_retries, base_delay: Duration::from_millis(c.retry_base_delay_ms), max_delay: Duration::from_millis(c.retry_max_delay_ms), jitter: 0.25 }
    }
}

impl RetryConfig {
    fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt as i32));
        let delay = std::cmp::min(exp, self.max_delay);
        if self.jitter <= 0.0 { return delay; }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter) as i64;
        let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

/// Retry only errors accepted by `should_retry`; anything else returns immediately.
pub async fn retry_if<F, Fut, T, E, P>(cfg: &RetryConfig, should_retry: P, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries || !should_retry(&e) => return Err(e),
            Err(_) => tokio::time::sleep(cfg.delay_for(attempt)).await,
        }
        attempt += 1;
    }
}

/// Returned by the breaker instead of running the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen;

impl From<CircuitOpen> for LifecycleError {
    fn from(_: CircuitOpen) -> Self { LifecycleError::ComputeUnavailable("circuit open".into()) }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BreakerState { Closed, Open { opened_at: Instant }, HalfOpen }

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: usize,
    half_open_successes: usize,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: usize,
    open_timeout: Duration,
    required_half_open_successes: usize,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, open_timeout: Duration, required_half_open_successes: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BreakerInner { state: BreakerState::Closed, failures: 0, half_open_successes: 0 }),
            failure_threshold: failure_threshold.max(1),
            open_timeout,
            required_half_open_successes: required_half_open_successes.max(1),
        })
    }

    pub fn state(&self) -> BreakerState { self.inner.lock().state.clone() }

    pub async fn exec<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where F: FnOnce() -> Fut, Fut: Future<Output = Result<T, E>>, E: From<CircuitOpen> {
        self.exec_counting(op, |_| true).await
    }

    /// Like `exec`, but only errors matched by `trips` count towards opening.
    pub async fn exec_counting<F, Fut, T, E, P>(&self, op: F, trips: P) -> Result<T, E>
    where F: FnOnce() -> Fut, Fut: Future<Output = Result<T, E>>, E: From<CircuitOpen>, P: Fn(&E) -> bool {
        {
            let mut inner = self.inner.lock();
            if let BreakerState::Open { opened_at } = inner.state {
                if opened_at.elapsed() >= self.open_timeout { inner.state = BreakerState::HalfOpen; } else { return Err(CircuitOpen.into()); }
            }
        }
        match op().await {
            Ok(v) => { self.on_success(); Ok(v) }
            Err(e) => {
                if trips(&e) { self.on_failure(); }
                Err(e)
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => inner.failures = 0,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.required_half_open_successes {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.half_open_successes = 0;
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.failure_threshold { self.open(&mut inner); }
            }
            BreakerState::HalfOpen => self.open(&mut inner),
            BreakerState::Open { .. } => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = BreakerState::Open { opened_at: Instant::now() };
        inner.half_open_successes = 0;
        LIFECYCLE_METRICS.compute.breaker_open_total.inc();
        warn!(failures = inner.failures, "compute_circuit_opened");
    }
}

/// `ComputeClient` decorator adding bounded retries and a shared breaker.
pub struct ResilientCompute {
    inner: Arc<dyn ComputeClient>,
    retry: RetryConfig,
    breaker: Arc<CircuitBreaker>,
}

impl ResilientCompute {
    pub fn new(inner: Arc<dyn ComputeClient>, cfg: &ComputeConfig) -> Self {
        Self { inner, retry: RetryConfig::from(cfg), breaker: CircuitBreaker::new(cfg.breaker_failure_threshold, Duration::from_secs(cfg.breaker_open_secs), 1) }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> { &self.breaker }

    async fn call<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> LifecycleResult<T>
    where F: FnMut() -> Fut, Fut: Future<Output = LifecycleResult<T>> {
        let breaker = &self.breaker;
        retry_if(&self.retry, LifecycleError::is_retryable, move |attempt| {
            if attempt > 0 {
                LIFECYCLE_METRICS.compute.retries_total.inc();
                debug!(op = op_name, attempt, "compute_retry");
            }
            let fut = op();
            breaker.exec_counting(move || fut, LifecycleError::is_retryable)
        })
        .await
    }
}

#[async_trait]
impl ComputeClient for ResilientCompute {
    async fn create_model(&self, model: &ModelDefinition) -> LifecycleResult<SubmissionHandle> { self.call("create_model", || self.inner.create_model(model)).await }

    async fn create_endpoint_config(&self, config: &EndpointConfigSpec) -> LifecycleResult<SubmissionHandle> {
        self.call("create_endpoint_config", || self.inner.create_endpoint_config(config)).await
    }

    async fn create_endpoint(&self, endpoint: &str, config_name: &str) -> LifecycleResult<SubmissionHandle> {
        self.call("create_endpoint", || self.inner.create_endpoint(endpoint, config_name)).await
    }

    async fn update_endpoint(&self, endpoint: &str, config_name: &str) -> LifecycleResult<SubmissionHandle> {
        self.call("update_endpoint", || self.inner.update_endpoint(endpoint, config_name)).await
    }

    async fn submit_transform_job(&self, job: &TransformJobSpec) -> LifecycleResult<SubmissionHandle> {
        self.call("submit_transform_job", || self.inner.submit_transform_job(job)).await
    }

    async fn transform_job_state(&self, job_name: &str) -> LifecycleResult<TransformJobState> {
        self.call("transform_job_state", || self.inner.transform_job_state(job_name)).await
    }

    async fn invoke_endpoint(&self, request: &InvocationRequest) -> LifecycleResult<Vec<u8>> {
        self.call("invoke_endpoint", || self.inner.invoke_endpoint(request)).await
    }
}
