//! Rate limit decisions and the response header contract.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use super::clock::epoch_secs;

/// Header advertising the configured quota.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
/// Header advertising the admissions left in the current window.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Header advertising when the window resets, in epoch seconds.
pub const HEADER_RESET: &str = "X-RateLimit-Reset";

/// Error code carried in the body of a rejected request.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// The outcome of a single `allow` call.
///
/// `remaining` is always within `0..=limit`; `allowed` is true exactly when
/// fewer than `limit` events were in the window before this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: SystemTime,
}

impl Decision {
    /// An admission that leaves `remaining` further admissions.
    pub fn admitted(limit: u64, remaining: u64, reset_at: SystemTime) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: remaining.min(limit),
            reset_at,
        }
    }

    /// A rejection; nothing remains in the window.
    pub fn rejected(limit: u64, reset_at: SystemTime) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
        }
    }

    /// An admission that did not touch any window (skip list or fail-open).
    pub fn bypass(limit: u64, now: SystemTime, window: Duration) -> Self {
        Self::admitted(limit, limit, now + window)
    }

    /// Decide from the number of events already in the window.
    ///
    /// Shared by both strategies so they agree on the arithmetic.
    pub fn from_count(count_before: u64, limit: u64, reset_at: SystemTime) -> Self {
        if count_before >= limit {
            Self::rejected(limit, reset_at)
        } else {
            Self::admitted(limit, limit - count_before - 1, reset_at)
        }
    }

    /// `reset_at` as whole seconds since the Unix epoch.
    pub fn reset_epoch_secs(&self) -> u64 {
        epoch_secs(self.reset_at)
    }

    /// Time until the window resets, zero if it already has.
    pub fn retry_after(&self, now: SystemTime) -> Duration {
        self.reset_at.duration_since(now).unwrap_or(Duration::ZERO)
    }

    /// The three `X-RateLimit-*` headers, advertised on every response.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_epoch_secs().to_string()),
        ]
    }

    /// Body for the 429 response, only for rejections.
    pub fn rejection_body(&self) -> Option<RejectionBody> {
        if self.allowed {
            None
        } else {
            Some(RejectionBody::default())
        }
    }
}

/// JSON body rendered by the transport when a request is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub code: String,
    pub message: String,
}

impl Default for RejectionBody {
    fn default() -> Self {
        Self {
            code: RATE_LIMIT_EXCEEDED.to_string(),
            message: "Rate limit exceeded".to_string(),
        }
    }
}
