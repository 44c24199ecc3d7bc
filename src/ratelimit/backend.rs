//! Rate limiter trait for abstracting local and distributed implementations.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use super::decision::Decision;
use super::key::RateLimitKey;
use crate::error::{BackendError, GateError, Result};

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the `LocalSlidingWindowLimiter` and the
/// `DistributedSlidingWindowLimiter` so the facade can work with either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Count one request for `key` and decide whether it may proceed.
    ///
    /// A quota rejection is a normal `Ok` decision; `Err` is reserved for
    /// failures of the backing store.
    async fn allow(&self, key: &RateLimitKey) -> std::result::Result<Decision, BackendError>;

    /// Maximum admissions per window.
    fn limit(&self) -> u64;

    /// Length of the sliding window.
    fn window(&self) -> Duration;
}

/// Longest accepted window. Reset times and key expiry are computed as
/// `now + window`, which must stay representable.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Immutable limiter configuration, built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    limit: u64,
    window: Duration,
    key_prefix: String,
    skip_keys: HashSet<String>,
    skip_paths: HashSet<String>,
}

impl LimiterConfig {
    /// Create a configuration, rejecting a zero limit, an empty window or a
    /// window longer than [`MAX_WINDOW`].
    ///
    /// A zero limit would mean "never admit", which is never what a caller
    /// asking for "unlimited" wants, so it is refused here rather than at
    /// request time.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(GateError::Config(
                "limit must be greater than zero (0 would reject every request)".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(GateError::Config(
                "window must be greater than zero".to_string(),
            ));
        }
        if window > MAX_WINDOW || SystemTime::now().checked_add(window).is_none() {
            return Err(GateError::Config(format!(
                "window of {:?} exceeds the maximum of {:?}",
                window, MAX_WINDOW
            )));
        }

        Ok(Self {
            limit,
            window,
            key_prefix: String::new(),
            skip_keys: HashSet::new(),
            skip_paths: HashSet::new(),
        })
    }

    /// Skip validation; lets tests exercise the closed (`limit = 0`) edge.
    #[cfg(test)]
    pub(crate) fn unchecked(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            key_prefix: String::new(),
            skip_keys: HashSet::new(),
            skip_paths: HashSet::new(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_skip_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skip_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Whether `key` is exempt from rate limiting.
    pub fn skips_key(&self, key: &RateLimitKey) -> bool {
        self.skip_keys.contains(key.as_str())
    }

    /// Whether requests to `path` are exempt from rate limiting.
    pub fn skips_path(&self, path: &str) -> bool {
        self.skip_paths.contains(path)
    }
}
