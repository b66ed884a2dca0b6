//! Sliding-window request limiter keyed by `(project, source ip)`

use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Trailing window the per-minute limit applies to
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Exact sliding-log limiter.
///
/// Each key keeps the timestamps of its admitted requests inside the
/// window. Check-and-record happens under the key's shard lock, so
/// concurrent requests from one IP can never admit more than the limit.
/// Rejected requests are not recorded, which bounds each log to `limit`
/// entries.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    logs: DashMap<(String, IpAddr), VecDeque<Instant>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            logs: DashMap::new(),
        }
    }

    /// Admit one request unless `limit` requests were already admitted
    /// within the trailing window. Returns `true` when admitted.
    pub fn check(&self, project_id: &str, ip: IpAddr, limit: u32) -> bool {
        self.check_at(project_id, ip, limit, Instant::now())
    }

    pub fn check_at(&self, project_id: &str, ip: IpAddr, limit: u32, now: Instant) -> bool {
        let mut log = self
            .logs
            .entry((project_id.to_string(), ip))
            .or_default();

        while let Some(oldest) = log.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }

        if log.len() >= limit as usize {
            return false;
        }
        log.push_back(now);
        true
    }

    /// Requests currently counted for a key
    pub fn current(&self, project_id: &str, ip: IpAddr) -> usize {
        self.logs
            .get(&(project_id.to_string(), ip))
            .map(|log| log.len())
            .unwrap_or(0)
    }

    /// Drop keys with no request inside the window
    pub fn purge_idle(&self, now: Instant) -> usize {
        let before = self.logs.len();
        self.logs.retain(|_, log| {
            log.back()
                .is_some_and(|newest| now.saturating_duration_since(*newest) < self.window)
        });
        let purged = before.saturating_sub(self.logs.len());
        if purged > 0 {
            debug!("Purged {} idle rate-limit windows", purged);
        }
        purged
    }

    pub fn tracked_keys(&self) -> usize {
        self.logs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_hundred_and_first_request_is_limited() {
        let limiter = RateLimiter::default();
        let now = Instant::now();
        for i in 0..100 {
            assert!(
                limiter.check_at("proj", ip("1.2.3.4"), 100, now + Duration::from_millis(i)),
                "request {} should pass",
                i + 1
            );
        }
        assert!(!limiter.check_at("proj", ip("1.2.3.4"), 100, now + Duration::from_secs(1)));
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::default();
        let start = Instant::now();
        assert!(limiter.check_at("proj", ip("1.2.3.4"), 2, start));
        assert!(limiter.check_at("proj", ip("1.2.3.4"), 2, start + Duration::from_secs(30)));
        assert!(!limiter.check_at("proj", ip("1.2.3.4"), 2, start + Duration::from_secs(59)));

        // First request leaves the window
        assert!(limiter.check_at("proj", ip("1.2.3.4"), 2, start + Duration::from_secs(60)));
        assert!(!limiter.check_at("proj", ip("1.2.3.4"), 2, start + Duration::from_secs(61)));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::default();
        let now = Instant::now();
        assert!(limiter.check_at("proj", ip("1.1.1.1"), 1, now));
        assert!(!limiter.check_at("proj", ip("1.1.1.1"), 1, now));
        assert!(limiter.check_at("proj", ip("2.2.2.2"), 1, now));
        assert!(limiter.check_at("other", ip("1.1.1.1"), 1, now));
    }

    #[test]
    fn test_purge_idle() {
        let limiter = RateLimiter::default();
        let start = Instant::now();
        limiter.check_at("proj", ip("1.1.1.1"), 10, start);
        limiter.check_at("proj", ip("2.2.2.2"), 10, start + Duration::from_secs(50));

        assert_eq!(limiter.purge_idle(start + Duration::from_secs(70)), 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.current("proj", ip("2.2.2.2")), 1);
    }

    #[test]
    fn test_concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::default());
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| limiter.check_at("proj", ip("9.9.9.9"), 100, now))
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }
}
