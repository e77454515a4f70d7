//! Per-caller request rate limiting.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

use crate::error::{GraphError, GraphResult};

pub trait RateLimiter: Send + Sync {
    /// Count one request for `caller`, rejecting it with
    /// [`GraphError::RateLimited`] once the caller is over budget.
    fn check(&self, caller: &str) -> GraphResult<()>;
}

/// Limiter that admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn check(&self, _caller: &str) -> GraphResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

#[derive(Debug, Default)]
struct Windows {
    by_caller: HashMap<String, Window>,
    last_sweep: Option<DateTime<Utc>>,
}

impl Windows {
    /// Forget callers whose window has expired, at most once per window.
    fn sweep(&mut self, now: DateTime<Utc>, window: Duration) {
        if matches!(self.last_sweep, Some(at) if now - at < window) {
            return;
        }
        self.by_caller.retain(|_, w| now - w.started_at < window);
        self.last_sweep = Some(now);
    }
}

/// Fixed one-minute windows counted per caller.
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<Windows>,
}

impl FixedWindowRateLimiter {
    pub fn per_minute(limit: u32) -> Self {
        Self::with_window(limit, Duration::minutes(1))
    }

    pub fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: Mutex::new(Windows::default()),
        }
    }

    fn check_at(&self, caller: &str, now: DateTime<Utc>) -> GraphResult<()> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.sweep(now, self.window);
        let entry = windows.by_caller.entry(caller.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now - entry.started_at >= self.window {
            *entry = Window {
                started_at: now,
                count: 0,
            };
        }
        if entry.count >= self.limit {
            let reset = entry.started_at + self.window - now;
            let retry_after_secs = reset.num_seconds().max(1) as u64;
            warn!(caller, retry_after_secs, "rate limit exceeded");
            return Err(GraphError::RateLimited { retry_after_secs });
        }
        entry.count += 1;
        Ok(())
    }

    /// Callers with a live window on record.
    pub fn tracked_callers(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_caller
            .len()
    }
}

impl RateLimiter for FixedWindowRateLimiter {
    fn check(&self, caller: &str) -> GraphResult<()> {
        self.check_at(caller, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_after_limit_until_window_resets() {
        let limiter = FixedWindowRateLimiter::per_minute(2);
        let t0 = Utc::now();
        assert!(limiter.check_at("alice", t0).is_ok());
        assert!(limiter.check_at("alice", t0).is_ok());

        match limiter.check_at("alice", t0 + Duration::seconds(10)) {
            Err(GraphError::RateLimited { retry_after_secs }) => assert_eq!(retry_after_secs, 50),
            other => panic!("expected rate limit, got {other:?}"),
        }
        // Other callers have their own window
        assert!(limiter.check_at("bob", t0).is_ok());
        assert!(limiter.check_at("alice", t0 + Duration::seconds(61)).is_ok());
    }

    #[test]
    fn expired_windows_are_swept() {
        let limiter = FixedWindowRateLimiter::per_minute(5);
        let t0 = Utc::now();
        for caller in ["a", "b", "c"] {
            limiter.check_at(caller, t0).unwrap();
        }
        assert_eq!(limiter.tracked_callers(), 3);

        limiter.check_at("d", t0 + Duration::seconds(90)).unwrap();
        assert_eq!(limiter.tracked_callers(), 1);
    }

    #[test]
    fn unlimited_never_rejects() {
        for _ in 0..1000 {
            assert!(Unlimited.check("alice").is_ok());
        }
    }
}
