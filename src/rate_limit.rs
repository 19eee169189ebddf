//! Adaptive request pacing for the remote OCR service.
//!
//! [`RateLimiter::acquire`] hands out one [`Permit`] per OCR call, spaced at
//! least `per / max_requests` apart. When the service pushes back (HTTP 429),
//! [`RateLimiter::on_throttled`] doubles the spacing up to `max_interval` and
//! honours any `Retry-After`. Every `quiet_period` without a new throttle
//! signal halves the spacing again until it is back at the nominal rate.
//!
//! ## Why not a token bucket?
//!
//! A fixed-quota limiter keeps hammering a service that has already said
//! "slow down". Hosted OCR APIs apply account-wide limits that shift with
//! load, so the pacing has to learn from the responses it gets.
//!
//! ## Leases
//!
//! A permit is released when dropped. A permit that is leaked (the holder
//! was aborted without unwinding, or forgotten) expires after
//! `lease_timeout`, and the next `acquire` reclaims it, so the limiter
//! cannot wedge.
//!
//! All timing uses [`tokio::time::Instant`], so tests can drive it with a
//! paused clock.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Pacing parameters.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per `per` window at the nominal rate.
    pub max_requests: u32,
    pub per: Duration,
    /// Ceiling for the throttled interval.
    pub max_interval: Duration,
    /// Quiet time after which a widened interval halves.
    pub quiet_period: Duration,
    /// Lifetime of an unreleased permit.
    pub lease_timeout: Duration,
}

impl RateLimitConfig {
    /// Spacing between grants when the service is not throttling.
    pub fn nominal_interval(&self) -> Duration {
        self.per / self.max_requests.max(1)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            per: Duration::from_secs(60),
            max_interval: Duration::from_secs(60),
            quiet_period: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct Lease {
    id: u64,
    expires_at: Instant,
}

#[derive(Debug)]
struct State {
    interval: Duration,
    last_grant: Option<Instant>,
    /// Earliest next grant imposed by a `Retry-After`.
    not_before: Instant,
    /// Start of the current quiet period; `None` while at the nominal rate.
    quiet_since: Option<Instant>,
    lease: Option<Lease>,
    next_id: u64,
}

enum Wait {
    Slot(Instant),
    Lease(Instant),
}

/// Paces OCR calls; owned by one [`crate::pipeline::ocr::OcrClient`].
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    nominal: Duration,
    state: Mutex<State>,
    released: Notify,
}

/// Right to make one OCR call. Dropping it releases the slot.
#[derive(Debug)]
pub struct Permit<'a> {
    limiter: &'a RateLimiter,
    id: u64,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.limiter.release(self.id);
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let nominal = config.nominal_interval();
        Self {
            state: Mutex::new(State {
                interval: nominal,
                last_grant: None,
                not_before: Instant::now(),
                quiet_since: None,
                lease: None,
                next_id: 0,
            }),
            nominal,
            released: Notify::new(),
            config,
        }
    }

    /// Wait for the next free slot.
    pub async fn acquire(&self) -> Permit<'_> {
        loop {
            let wait = {
                let mut state = self.lock();
                let now = Instant::now();
                self.decay(&mut state, now);

                match &state.lease {
                    Some(lease) if lease.expires_at <= now => {
                        warn!(permit = lease.id, "Reclaiming expired rate-limit permit");
                        state.lease = None;
                    }
                    _ => {}
                }

                match &state.lease {
                    Some(lease) => Wait::Lease(lease.expires_at),
                    None => {
                        let ready = state
                            .last_grant
                            .map(|t| t + state.interval)
                            .unwrap_or(now)
                            .max(state.not_before);
                        if ready <= now {
                            let id = state.next_id;
                            state.next_id += 1;
                            state.last_grant = Some(now);
                            state.lease = Some(Lease {
                                id,
                                expires_at: now + self.config.lease_timeout,
                            });
                            return Permit { limiter: self, id };
                        }
                        Wait::Slot(ready)
                    }
                }
            };

            match wait {
                Wait::Slot(at) => sleep_until(at).await,
                Wait::Lease(expiry) => {
                    tokio::select! {
                        _ = self.released.notified() => {}
                        _ = sleep_until(expiry) => {}
                    }
                }
            }
        }
    }

    /// Report a throttling response from the service.
    pub fn on_throttled(&self, retry_after: Option<Duration>) {
        let mut state = self.lock();
        let now = Instant::now();
        self.decay(&mut state, now);

        let cap = self.config.max_interval.max(self.nominal);
        state.interval = (state.interval * 2).min(cap);
        state.quiet_since = Some(now);
        if let Some(after) = retry_after {
            let until = now.checked_add(after).unwrap_or(now + cap);
            state.not_before = state.not_before.max(until);
        }
        warn!(
            interval_ms = state.interval.as_millis() as u64,
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "OCR service throttled; widening request interval"
        );
    }

    /// Current spacing between grants.
    pub fn effective_interval(&self) -> Duration {
        let mut state = self.lock();
        self.decay(&mut state, Instant::now());
        state.interval
    }

    pub fn nominal_interval(&self) -> Duration {
        self.nominal
    }

    fn release(&self, id: u64) {
        let mut state = self.lock();
        if state.lease.as_ref().is_some_and(|l| l.id == id) {
            state.lease = None;
            drop(state);
            self.released.notify_one();
        }
    }

    /// Halve the interval once per elapsed quiet period.
    fn decay(&self, state: &mut State, now: Instant) {
        let Some(mut since) = state.quiet_since else {
            return;
        };
        if self.config.quiet_period.is_zero() {
            state.interval = self.nominal;
            state.quiet_since = None;
            return;
        }
        while state.interval > self.nominal && now.duration_since(since) >= self.config.quiet_period
        {
            state.interval = (state.interval / 2).max(self.nominal);
            since += self.config.quiet_period;
            debug!(
                interval_ms = state.interval.as_millis() as u64,
                "Quiet period elapsed; narrowing request interval"
            );
        }
        state.quiet_since = if state.interval > self.nominal {
            Some(since)
        } else {
            None
        };
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests: per_minute,
            per: Duration::from_secs(60),
            max_interval: Duration::from_secs(8),
            quiet_period: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(120),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn grants_are_spaced_at_nominal_interval() {
        let rl = limiter(60);
        let start = Instant::now();
        for _ in 0..3 {
            drop(rl.acquire().await);
        }
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn throttling_doubles_up_to_cap() {
        let rl = limiter(60);
        let mut seen = Vec::new();
        for _ in 0..5 {
            rl.on_throttled(None);
            seen.push(rl.effective_interval().as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 8, 8]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_decays_after_quiet_periods() {
        let rl = limiter(60);
        rl.on_throttled(None);
        rl.on_throttled(None);
        assert_eq!(rl.effective_interval(), Duration::from_secs(4));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(rl.effective_interval(), Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(rl.effective_interval(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(rl.effective_interval(), rl.nominal_interval());
    }

    #[tokio::test(start_paused = true)]
    async fn new_throttle_restarts_quiet_period() {
        let rl = limiter(60);
        rl.on_throttled(None);
        tokio::time::advance(Duration::from_secs(20)).await;
        rl.on_throttled(None);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(rl.effective_interval(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_pushes_next_grant() {
        let rl = limiter(600);
        drop(rl.acquire().await);
        rl.on_throttled(Some(Duration::from_secs(10)));
        let start = Instant::now();
        drop(rl.acquire().await);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_retry_after_does_not_overflow() {
        let rl = limiter(600);
        drop(rl.acquire().await);
        rl.on_throttled(Some(Duration::from_secs(u64::MAX)));
        rl.on_throttled(Some(Duration::from_secs_f64(1e19)));
        assert_eq!(rl.effective_interval(), Duration::from_millis(400));
        // Falls back to waiting out the interval cap.
        let start = Instant::now();
        drop(rl.acquire().await);
        assert!(start.elapsed() >= Duration::from_secs(8));
        assert!(start.elapsed() < Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn leaked_permit_is_reclaimed_after_lease() {
        let rl = limiter(600);
        let start = Instant::now();
        std::mem::forget(rl.acquire().await);
        drop(rl.acquire().await);
        assert!(start.elapsed() >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_permit_frees_slot_without_waiting_for_lease() {
        let rl = limiter(600);
        let start = Instant::now();
        let p = rl.acquire().await;
        drop(p);
        drop(rl.acquire().await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn held_permit_blocks_until_released() {
        let rl = limiter(600);
        let held = rl.acquire().await;
        let mut next = tokio_test::task::spawn(rl.acquire());
        tokio_test::assert_pending!(next.poll());

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio_test::assert_pending!(next.poll());

        drop(held);
        assert!(next.is_woken());
        let _permit = tokio_test::assert_ready!(next.poll());
    }
}
