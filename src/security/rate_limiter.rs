use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;

/// Limits applied to one class of requests
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_requests: usize,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_requests: usize, window: std::time::Duration) -> Self {
        Self {
            max_requests,
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::seconds(60)),
        }
    }
}

impl Default for RateLimitPolicy {
    /// 20 requests per 60 seconds for business endpoints
    fn default() -> Self {
        Self {
            max_requests: 20,
            window: Duration::seconds(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: usize,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitResult {
    /// Whole seconds until `reset_at`, never negative.
    pub fn retry_after_seconds(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}

/// Rate limiter using a sliding window per client
///
/// Each client owns an oldest-first queue of admitted timestamps. The map entry
/// lock makes read-prune-check-append a single critical section.
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<DateTime<Utc>>>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            windows: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Admit or reject one request; only admitted requests are recorded.
    #[allow(dead_code)]
    pub fn admit(&self, client_id: &str, now: DateTime<Utc>) -> bool {
        self.check_rate_limit(client_id, now).allowed
    }

    /// Check if a request is allowed under the rate limit and record it if so
    ///
    /// # Arguments
    /// * `client_id` - Client identifier (IP address)
    /// * `now` - Time of the request
    ///
    /// # Returns
    /// Whether the request was admitted, how many remain, and when the window frees up
    pub fn check_rate_limit(&self, client_id: &str, now: DateTime<Utc>) -> RateLimitResult {
        let cutoff = now - self.policy.window;
        let mut window = self.windows.entry(client_id.to_string()).or_default();

        prune(&mut window, cutoff);

        if window.len() >= self.policy.max_requests {
            // Reset time is when the oldest request leaves the window
            let reset_at = window
                .front()
                .map(|oldest| *oldest + self.policy.window)
                .unwrap_or(now + self.policy.window);

            return RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_at,
            };
        }

        window.push_back(now);

        RateLimitResult {
            allowed: true,
            remaining: self.policy.max_requests - window.len(),
            reset_at: now + self.policy.window,
        }
    }

    /// Check the current rate limit status without consuming a request
    pub fn status(&self, client_id: &str, now: DateTime<Utc>) -> RateLimitResult {
        let cutoff = now - self.policy.window;
        let Some(window) = self.windows.get(client_id) else {
            return RateLimitResult {
                allowed: self.policy.max_requests > 0,
                remaining: self.policy.max_requests,
                reset_at: now,
            };
        };

        let live: Vec<&DateTime<Utc>> = window.iter().filter(|t| **t > cutoff).collect();
        let remaining = self.policy.max_requests.saturating_sub(live.len());
        let reset_at = live
            .first()
            .map(|oldest| **oldest + self.policy.window)
            .unwrap_or(now);

        RateLimitResult {
            allowed: remaining > 0,
            remaining,
            reset_at,
        }
    }

    /// Drop windows that hold nothing inside the current window.
    /// Returns how many clients were forgotten.
    pub fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.policy.window;
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            prune(window, cutoff);
            !window.is_empty()
        });
        before - self.windows.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// Remove timestamps at or before `cutoff` from the front of an oldest-first queue.
pub(crate) fn prune(window: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while window.front().is_some_and(|t| *t <= cutoff) {
        window.pop_front();
    }
}
