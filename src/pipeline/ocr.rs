//! OCR client: one page in, one [`PageResult`] out.
//!
//! Wraps an [`OcrBackend`] with the things every call needs: a rate-limit
//! permit, a per-call timeout, bounded retries, and cooperative cancellation.
//! It never returns an error. Every outcome, including cancellation, is a
//! `PageResult` the engine can act on.
//!
//! ## Retry Strategy
//!
//! Transient failures (timeouts, connection errors, 429, 5xx, garbled
//! bodies) are retried up to `max_retries` times. The n-th retry waits
//! `retry_backoff_ms * 2^(n-1)`, capped at `max_backoff_ms`, with equal
//! jitter (50–100 % of that value) so restarted batches do not retry in
//! lock-step. A `Retry-After` from the service is a floor on the wait.
//!
//! Each attempt takes a fresh permit from the [`RateLimiter`], and every 429
//! is reported to it, so retries slow the whole engine down rather than
//! just this page.

use crate::backend::OcrBackend;
use crate::config::BatchConfig;
use crate::credential::Credential;
use crate::error::{FailureClass, OcrCallError, PageFailure};
use crate::output::PageResult;
use crate::pipeline::render::PageUnit;
use crate::rate_limit::RateLimiter;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_millis(config.retry_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            jitter: true,
        }
    }

    /// Deterministic delays, for tests and reproducible runs.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Un-jittered delay before retry `n` (1-based).
    pub fn backoff(&self, n: u32) -> Duration {
        let factor = 2u32.saturating_pow(n.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }

    fn delay(&self, n: u32) -> Duration {
        let d = self.backoff(n);
        if self.jitter {
            d.mul_f64(rand::rng().random_range(0.5..=1.0))
        } else {
            d
        }
    }
}

/// Rate-limited, retrying front for an [`OcrBackend`].
pub struct OcrClient {
    backend: Arc<dyn OcrBackend>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    api_timeout: Duration,
}

impl OcrClient {
    pub fn new(
        backend: Arc<dyn OcrBackend>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        api_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            limiter,
            policy,
            api_timeout,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn requires_credential(&self) -> bool {
        self.backend.requires_credential()
    }

    /// Convert one page. Never fails; see [`PageResult::failure`].
    pub async fn submit(
        &self,
        unit: &PageUnit,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> PageResult {
        let start = Instant::now();
        let max_attempts = self.policy.max_retries + 1;
        let page = unit.page_num();
        let mut attempts = 0u32;

        let finish = |result: PageResult| result.with_duration_ms(start.elapsed().as_millis() as u64);

        loop {
            if cancel.is_cancelled() {
                return finish(PageResult::failed(unit.index, PageFailure::Cancelled, attempts));
            }
            attempts += 1;

            let outcome = {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return finish(PageResult::failed(unit.index, PageFailure::Cancelled, attempts - 1));
                    }
                    permit = self.limiter.acquire() => permit,
                };
                debug!("Page {}: attempt {}/{} via {}", page, attempts, max_attempts, self.backend.name());

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return finish(PageResult::failed(unit.index, PageFailure::Cancelled, attempts));
                    }
                    r = timeout(self.api_timeout, self.backend.recognize(unit, credential)) => {
                        r.unwrap_or(Err(OcrCallError::Timeout {
                            secs: self.api_timeout.as_secs(),
                        }))
                    }
                }
            };

            let err = match outcome {
                Ok(markdown) => {
                    debug!("Page {}: recognised after {} attempt(s)", page, attempts);
                    return finish(PageResult::success(unit.index, markdown, attempts));
                }
                Err(err) => err,
            };

            let retry_after = match &err {
                OcrCallError::RateLimited { retry_after } => {
                    self.limiter.on_throttled(*retry_after);
                    *retry_after
                }
                _ => None,
            };

            match err.class() {
                FailureClass::Fatal => {
                    warn!("Page {}: fatal OCR error — {}", page, err);
                    return finish(PageResult::failed(
                        unit.index,
                        PageFailure::Fatal {
                            detail: err.to_string(),
                        },
                        attempts,
                    ));
                }
                FailureClass::Permanent => {
                    warn!("Page {}: permanent OCR error — {}", page, err);
                    return finish(PageResult::failed(
                        unit.index,
                        PageFailure::Permanent {
                            detail: err.to_string(),
                        },
                        attempts,
                    ));
                }
                FailureClass::Transient if attempts >= max_attempts => {
                    warn!("Page {}: giving up after {} attempt(s) — {}", page, attempts, err);
                    return finish(PageResult::failed(
                        unit.index,
                        PageFailure::Transient {
                            attempts,
                            detail: err.to_string(),
                        },
                        attempts,
                    ));
                }
                FailureClass::Transient => {
                    let mut wait = self.policy.delay(attempts);
                    if let Some(floor) = retry_after {
                        wait = wait.max(floor);
                    }
                    warn!(
                        "Page {}: retry {}/{} after {}ms — {}",
                        page,
                        attempts,
                        self.policy.max_retries,
                        wait.as_millis(),
                        err
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return finish(PageResult::failed(unit.index, PageFailure::Cancelled, attempts));
                        }
                        _ = sleep(wait) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageFormat;
    use crate::document::DocumentId;
    use crate::rate_limit::RateLimitConfig;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed script of outcomes, then succeeds.
    struct Scripted {
        script: Mutex<VecDeque<Result<String, OcrCallError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, OcrCallError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl OcrBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn recognize(&self, _: &PageUnit, _: &Credential) -> Result<String, OcrCallError> {
            *self.calls.lock().unwrap() += 1;
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok("done".into()))
        }
    }

    struct Hangs;

    #[async_trait]
    impl OcrBackend for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }

        async fn recognize(&self, _: &PageUnit, _: &Credential) -> Result<String, OcrCallError> {
            sleep(Duration::from_secs(3600)).await;
            Ok("late".into())
        }
    }

    fn unit() -> PageUnit {
        PageUnit {
            document: DocumentId::from("doc"),
            index: 2,
            payload: vec![1, 2, 3],
            format: ImageFormat::Jpeg,
            quality: 85,
            dpi: 150,
        }
    }

    fn client(backend: Arc<dyn OcrBackend>, max_retries: u32) -> OcrClient {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            max_requests: 600,
            ..RateLimitConfig::default()
        }));
        let policy = RetryPolicy {
            max_retries,
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            jitter: false,
        };
        OcrClient::new(backend, limiter, policy, Duration::from_secs(5))
    }

    fn throttled() -> Result<String, OcrCallError> {
        Err(OcrCallError::RateLimited { retry_after: None })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_retries: 10,
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            jitter: false,
        };
        let ms: Vec<u128> = (1..=6).map(|n| p.backoff(n).as_millis()).collect();
        assert_eq!(ms, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let p = RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(1000),
            max: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..50 {
            let d = p.delay(2);
            assert!(d >= Duration::from_millis(1000) && d <= Duration::from_millis(2000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_twice_then_succeeds() {
        let backend = Scripted::new(vec![throttled(), throttled()]);
        let c = client(backend.clone(), 3);
        let nominal = c.limiter().effective_interval();

        let r = c.submit(&unit(), &Credential::new("k"), &CancellationToken::new()).await;
        assert!(r.is_success());
        assert_eq!(r.attempts, 3);
        assert_eq!(backend.calls(), 3);
        assert!(c.limiter().effective_interval() > nominal);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_throttling_is_transient_failure() {
        let backend = Scripted::new(vec![throttled(); 10]);
        let c = client(backend.clone(), 2);
        let r = c.submit(&unit(), &Credential::new("k"), &CancellationToken::new()).await;
        assert_eq!(
            r.failure,
            Some(PageFailure::Transient {
                attempts: 3,
                detail: "rate limited by the OCR service".into()
            })
        );
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_is_a_floor() {
        let backend = Scripted::new(vec![Err(OcrCallError::RateLimited {
            retry_after: Some(Duration::from_secs(20)),
        })]);
        let c = client(backend, 3);
        let start = Instant::now();
        let r = c.submit(&unit(), &Credential::new("k"), &CancellationToken::new()).await;
        assert!(r.is_success());
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let backend = Scripted::new(vec![Err(OcrCallError::PayloadTooLarge { bytes: 9 })]);
        let c = client(backend.clone(), 3);
        let r = c.submit(&unit(), &Credential::new("k"), &CancellationToken::new()).await;
        assert!(matches!(r.failure, Some(PageFailure::Permanent { .. })));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_credential_is_fatal() {
        let backend = Scripted::new(vec![Err(OcrCallError::InvalidCredential("revoked".into()))]);
        let c = client(backend, 3);
        let r = c.submit(&unit(), &Credential::new("k"), &CancellationToken::new()).await;
        assert!(r.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_call_times_out_as_transient() {
        let c = client(Arc::new(Hangs), 1);
        let r = c.submit(&unit(), &Credential::new("k"), &CancellationToken::new()).await;
        match r.failure {
            Some(PageFailure::Transient { attempts, detail }) => {
                assert_eq!(attempts, 2);
                assert!(detail.contains("timed out"), "got {detail}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_in_flight_call() {
        let c = client(Arc::new(Hangs), 3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let r = c.submit(&unit(), &Credential::new("k"), &cancel).await;
        assert!(r.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_makes_no_call() {
        let backend = Scripted::new(vec![]);
        let c = client(backend.clone(), 3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let r = c.submit(&unit(), &Credential::new("k"), &cancel).await;
        assert!(r.is_cancelled());
        assert_eq!(backend.calls(), 0);
    }
}
