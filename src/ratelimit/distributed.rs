//! Distributed rate limiter backed by a shared sorted-set store.
//!
//! Every process instance writes request events into the same sorted set,
//! keyed by `key_prefix:client_key` and scored by the event timestamp, so all
//! instances enforce one shared quota. The store is the sole arbiter of the
//! window contents.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, trace};
use uuid::Uuid;

use super::backend::{LimiterConfig, RateLimiterBackend};
use super::clock::{epoch_nanos, Clock, SystemClock};
use super::decision::Decision;
use super::key::RateLimitKey;
use super::store::{SortedSetStore, WindowBatch};
use crate::error::BackendError;

/// Default bound on one backend round trip.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_millis(200);

/// Extra key lifetime past the window, so the newest event still counts at
/// an age of exactly `window`.
const EXPIRY_GRACE: Duration = Duration::from_millis(1);

/// A sliding window limiter whose windows live in a [`SortedSetStore`].
///
/// Each call submits one atomic batch: evict stale events, count what is
/// left, insert this request, refresh the key's expiry. Rejected requests are
/// recorded too, so a client hammering a closed window keeps it closed.
pub struct DistributedSlidingWindowLimiter {
    store: Arc<dyn SortedSetStore>,
    config: Arc<LimiterConfig>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl DistributedSlidingWindowLimiter {
    /// Create a new distributed limiter driven by the wall clock.
    pub fn new(store: Arc<dyn SortedSetStore>, config: Arc<LimiterConfig>) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound each backend round trip; exceeding it is reported as
    /// [`BackendError::Timeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Count one request for `key` against the shared window.
    pub async fn check(&self, key: &RateLimitKey) -> Result<Decision, BackendError> {
        let now = self.clock.now();
        let window = self.config.window();
        let store_key = key.namespaced(self.config.key_prefix());

        let (batch, count_at) = self.window_batch(&store_key, now);

        trace!(
            key = %store_key,
            store = self.store.name(),
            "Checking distributed rate limit"
        );

        let reply = tokio::time::timeout(self.timeout, self.store.execute(&batch))
            .await
            .map_err(|_| BackendError::Timeout(self.timeout))??;

        let count = reply
            .get(count_at)
            .ok_or_else(|| BackendError::Protocol("missing cardinality reply".to_string()))?;
        let count = u64::try_from(count)
            .map_err(|_| BackendError::Protocol(format!("negative cardinality {}", count)))?;

        let decision = Decision::from_count(count, self.config.limit(), now + window);

        if !decision.allowed {
            debug!(
                key = %store_key,
                count = count,
                limit = self.config.limit(),
                "Distributed rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Build the evict/count/insert/expire batch for one request at `now`.
    ///
    /// Returns the batch and the index of the cardinality reply.
    pub fn window_batch(&self, store_key: &str, now: SystemTime) -> (WindowBatch, usize) {
        let window = self.config.window();
        let window_start = now.checked_sub(window).unwrap_or(UNIX_EPOCH);
        let now_nanos = epoch_nanos(now);

        // The timestamp alone would collide for concurrent same-key requests
        // and merge two events into one member.
        let member = format!("{}-{}", now_nanos, Uuid::new_v4().simple());

        let mut batch = WindowBatch::new();
        batch.remove_range_by_score(store_key, epoch_nanos(window_start) as f64);
        let count_at = batch.cardinality(store_key);
        batch.add(store_key, now_nanos as f64, member);
        batch.expire(store_key, window + EXPIRY_GRACE);

        (batch, count_at)
    }

    pub fn config(&self) -> &Arc<LimiterConfig> {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }
}

#[async_trait]
impl RateLimiterBackend for DistributedSlidingWindowLimiter {
    async fn allow(&self, key: &RateLimitKey) -> Result<Decision, BackendError> {
        self.check(key).await
    }

    fn limit(&self) -> u64 {
        self.config.limit()
    }

    fn window(&self) -> Duration {
        self.config.window()
    }
}
