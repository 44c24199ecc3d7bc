//! Rate limit keys and client identity resolution.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// The subject a quota is counted against, e.g. `user:42` or `ip:10.0.0.1`.
///
/// The limiter treats the value as opaque; one sliding window exists per
/// distinct key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Wrap an already-resolved key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for an authenticated user.
    pub fn user(id: &str) -> Self {
        Self(format!("user:{}", id))
    }

    /// Key for an anonymous client identified by its source address.
    pub fn ip(addr: IpAddr) -> Self {
        Self(format!("ip:{}", addr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The backend key for this subject: `prefix:key`.
    ///
    /// An empty prefix yields the bare key.
    pub fn namespaced(&self, prefix: &str) -> String {
        if prefix.is_empty() {
            self.0.clone()
        } else {
            format!("{}:{}", prefix, self.0)
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RateLimitKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RateLimitKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// The transport-agnostic view of an inbound request the limiter needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Request path, matched against the configured skip paths
    pub path: String,
    /// Authenticated user id, if the auth layer resolved one
    pub user_id: Option<String>,
    /// Source address of the connection
    pub remote_addr: IpAddr,
}

impl RequestIdentity {
    pub fn new(path: impl Into<String>, remote_addr: IpAddr) -> Self {
        Self {
            path: path.into(),
            user_id: None,
            remote_addr,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Produces the stable client key for a request.
pub trait KeyResolver: Send + Sync {
    fn resolve_key(&self, request: &RequestIdentity) -> RateLimitKey;
}

/// Authenticated user id when present, source address otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIdentityResolver;

impl KeyResolver for ClientIdentityResolver {
    fn resolve_key(&self, request: &RequestIdentity) -> RateLimitKey {
        match request.user_id.as_deref() {
            Some(id) if !id.is_empty() => RateLimitKey::user(id),
            _ => RateLimitKey::ip(request.remote_addr),
        }
    }
}
