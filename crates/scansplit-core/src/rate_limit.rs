//! Request spacing for model backends.
//!
//! Every scan that talks to the same backend shares one [`AdaptiveLimiter`],
//! so the configured rate holds across concurrent runs. A 429 slows the
//! shared limiter down and is handed back to the retry loop as a transient
//! [`ModelError::RateLimited`].

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::model::ModelError;

type Governor = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const MAX_SLOWDOWN: u32 = 16;
const RECOVER_AFTER: Duration = Duration::from_secs(60);
/// Used for `Retry-After` dates, which are not resolved against the clock.
const RETRY_AFTER_DATE_WAIT: Duration = Duration::from_secs(5);

/// Shared, self-tuning spacing of calls to one model backend.
///
/// The governor in use is swapped out whole when the rate changes, so
/// callers already waiting keep the old one and everyone after sees the new.
pub struct AdaptiveLimiter {
    active: ArcSwap<Governor>,
    period: Duration,
    /// Multiple of `period` currently enforced; 1 means the configured rate.
    slowdown: AtomicU32,
    throttled_at: Mutex<Option<Instant>>,
}

fn governor(period: Duration) -> Arc<Governor> {
    let quota = Quota::with_period(period).unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX));
    Arc::new(Governor::direct(quota))
}

impl AdaptiveLimiter {
    /// One call per `period`. A zero period never waits.
    pub fn new(period: Duration) -> Self {
        Self {
            active: ArcSwap::new(governor(period)),
            period,
            slowdown: AtomicU32::new(1),
            throttled_at: Mutex::new(None),
        }
    }

    /// `rate` calls per second; zero, negative or NaN disables spacing.
    pub fn per_second(rate: f64) -> Self {
        if rate.is_finite() && rate > 0.0 {
            Self::new(Duration::from_secs_f64(1.0 / rate))
        } else {
            Self::new(Duration::ZERO)
        }
    }

    /// Wait for this call's slot.
    pub async fn acquire(&self) {
        self.maybe_recover();
        self.active.load_full().until_ready().await;
    }

    /// Record a 429: halve the rate, down to 1/16 of the configured one.
    pub fn on_rate_limited(&self) {
        if let Ok(mut at) = self.throttled_at.lock() {
            *at = Some(Instant::now());
        }

        let previous = self
            .slowdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                Some((s * 2).min(MAX_SLOWDOWN))
            })
            .unwrap_or(MAX_SLOWDOWN);
        let slowdown = (previous * 2).min(MAX_SLOWDOWN);
        if slowdown == previous {
            return;
        }
        if let Some(period) = self.period.checked_mul(slowdown) {
            tracing::info!(slowdown, period_ms = period.as_millis() as u64, "backend throttled, slowing down");
            self.active.store(governor(period));
        }
    }

    /// Multiple of the configured period currently enforced.
    pub fn factor(&self) -> u32 {
        self.slowdown.load(Ordering::SeqCst)
    }

    fn maybe_recover(&self) {
        let quiet = match self.throttled_at.lock() {
            Ok(at) => at.is_some_and(|t| t.elapsed() >= RECOVER_AFTER),
            Err(_) => false,
        };
        if quiet && self.slowdown.swap(1, Ordering::SeqCst) > 1 {
            tracing::debug!("backend rate back to configured value");
            self.active.store(governor(self.period));
        }
    }
}

/// Turn a 429 response into [`ModelError::RateLimited`], carrying its
/// `Retry-After` when present.
pub fn ensure_not_throttled(resp: &reqwest::Response) -> Result<(), ModelError> {
    if resp.status() != reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Ok(());
    }
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    Err(ModelError::RateLimited { retry_after })
}

/// `Retry-After` as delta-seconds, or a fixed short wait for HTTP dates.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    match value.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) if value.ends_with("GMT") => Some(RETRY_AFTER_DATE_WAIT),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, retry_after: Option<&str>) -> reqwest::Response {
        let mut builder = http::Response::builder().status(status);
        if let Some(v) = retry_after {
            builder = builder.header("retry-after", v);
        }
        reqwest::Response::from(builder.body("").unwrap())
    }

    #[test]
    fn retry_after_forms() {
        assert_eq!(parse_retry_after("12"), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(RETRY_AFTER_DATE_WAIT)
        );
        assert_eq!(parse_retry_after("later"), None);
    }

    #[test]
    fn only_429_is_throttling() {
        assert!(ensure_not_throttled(&response(200, None)).is_ok());
        assert!(ensure_not_throttled(&response(500, Some("3"))).is_ok());
        assert_eq!(
            ensure_not_throttled(&response(429, Some("7"))),
            Err(ModelError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            })
        );
        assert_eq!(
            ensure_not_throttled(&response(429, None)),
            Err(ModelError::RateLimited { retry_after: None })
        );
    }

    #[test]
    fn slowdown_doubles_up_to_cap() {
        let limiter = AdaptiveLimiter::per_second(4.0);
        let seen: Vec<u32> = (0..6)
            .map(|_| {
                limiter.on_rate_limited();
                limiter.factor()
            })
            .collect();
        assert_eq!(seen, [2, 4, 8, 16, 16, 16]);
    }

    #[tokio::test]
    async fn unlimited_when_rate_not_positive() {
        for rate in [0.0, -1.0, f64::NAN] {
            let limiter = AdaptiveLimiter::per_second(rate);
            for _ in 0..20 {
                limiter.acquire().await;
            }
        }
    }

    #[tokio::test]
    async fn recovers_after_quiet_period() {
        let limiter = AdaptiveLimiter::per_second(10.0);
        limiter.on_rate_limited();
        limiter.on_rate_limited();
        assert_eq!(limiter.factor(), 4);

        *limiter.throttled_at.lock().unwrap() = Some(Instant::now() - RECOVER_AFTER);
        limiter.acquire().await;
        assert_eq!(limiter.factor(), 1);
    }
}
