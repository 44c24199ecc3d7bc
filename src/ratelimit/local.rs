//! Process-local sliding window limiter.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::{LimiterConfig, RateLimiterBackend};
use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::key::RateLimitKey;
use crate::error::BackendError;

const MIN_JANITOR_INTERVAL: Duration = Duration::from_millis(1);

/// Timestamps of the events currently counted for one key.
type Window = Arc<Mutex<VecDeque<SystemTime>>>;

/// A sliding window limiter that keeps every window in process memory.
///
/// Each key owns its own lock, created lazily and dropped once the key's
/// window is empty, so unrelated keys never contend. The quota is per
/// instance: several processes running this limiter each admit `limit`
/// requests per window.
pub struct LocalSlidingWindowLimiter {
    config: Arc<LimiterConfig>,
    clock: Arc<dyn Clock>,
    windows: DashMap<RateLimitKey, Window>,
}

impl LocalSlidingWindowLimiter {
    /// Create a limiter driven by the wall clock.
    pub fn new(config: Arc<LimiterConfig>) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: Arc<LimiterConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            windows: DashMap::new(),
        }
    }

    /// Count one request for `key` and decide whether it may proceed.
    ///
    /// The key's lock is held across evict, count and append, so concurrent
    /// calls for the same key can never admit more than `limit` requests.
    pub fn check(&self, key: &RateLimitKey) -> Decision {
        let window = self.window_for(key);
        let now = self.clock.now();
        let window_len = self.config.window();

        let (decision, emptied) = {
            let mut events = window.lock();
            evict_stale(&mut events, now, window_len);

            let count = events.len() as u64;
            let decision = Decision::from_count(count, self.config.limit(), now + window_len);
            if decision.allowed {
                events.push_back(now);
            }

            trace!(
                key = %key,
                count = count,
                allowed = decision.allowed,
                remaining = decision.remaining,
                "Checked local window"
            );

            (decision, events.is_empty())
        };

        if !decision.allowed {
            debug!(key = %key, limit = self.config.limit(), "Local rate limit exceeded");
        }

        if emptied {
            drop(window);
            self.reclaim(key);
        }

        decision
    }

    /// Evict stale events from every window and drop windows left empty.
    ///
    /// Windows that are in use by a concurrent `check` are left alone.
    /// Returns the number of keys reclaimed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let window_len = self.config.window();
        let before = self.windows.len();

        self.windows.retain(|_, window| {
            if Arc::strong_count(window) > 1 {
                return true;
            }
            let mut events = window.lock();
            evict_stale(&mut events, now, window_len);
            !events.is_empty()
        });

        before.saturating_sub(self.windows.len())
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` until the
    /// limiter is dropped. Intervals below one millisecond are raised to it.
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = interval.max(MIN_JANITOR_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let reclaimed = limiter.purge_expired();
                if reclaimed > 0 {
                    debug!(
                        reclaimed = reclaimed,
                        tracked = limiter.tracked_keys(),
                        "Reclaimed idle rate limit windows"
                    );
                }
            }
        })
    }

    /// Number of events currently counted for `key`, after eviction.
    pub fn current_count(&self, key: &RateLimitKey) -> u64 {
        let Some(window) = self.windows.get(key).map(|w| Arc::clone(w.value())) else {
            return 0;
        };
        let mut events = window.lock();
        evict_stale(&mut events, self.clock.now(), self.config.window());
        events.len() as u64
    }

    /// Number of keys with a live window.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Drop every window.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.windows.clear();
    }

    pub fn config(&self) -> &Arc<LimiterConfig> {
        &self.config
    }

    fn window_for(&self, key: &RateLimitKey) -> Window {
        if let Some(window) = self.windows.get(key) {
            return Arc::clone(window.value());
        }
        Arc::clone(self.windows.entry(key.clone()).or_default().value())
    }

    fn reclaim(&self, key: &RateLimitKey) {
        // Holding the shard lock, a strong count of one means no caller can
        // be appending to this window.
        self.windows.remove_if(key, |_, window| {
            Arc::strong_count(window) == 1 && window.lock().is_empty()
        });
    }
}

/// Drop events older than `window` relative to `now`.
///
/// Events stamped in the future (clock stepped backwards) are kept.
fn evict_stale(events: &mut VecDeque<SystemTime>, now: SystemTime, window: Duration) {
    events.retain(|at| match now.duration_since(*at) {
        Ok(age) => age <= window,
        Err(_) => true,
    });
}

#[async_trait]
impl RateLimiterBackend for LocalSlidingWindowLimiter {
    async fn allow(&self, key: &RateLimitKey) -> Result<Decision, BackendError> {
        Ok(self.check(key))
    }

    fn limit(&self) -> u64 {
        self.config.limit()
    }

    fn window(&self) -> Duration {
        self.config.window()
    }
}
