//! The entry point request handlers call.
//!
//! The facade routes each request to the configured strategy, short-circuits
//! skip-listed keys and paths, and absorbs backend failures so that an outage
//! of the shared store never turns into an outage of the service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};

use super::backend::{LimiterConfig, RateLimiterBackend};
use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::distributed::DistributedSlidingWindowLimiter;
use super::key::{ClientIdentityResolver, KeyResolver, RateLimitKey, RequestIdentity};
use super::local::LocalSlidingWindowLimiter;
use super::redis_store::RedisStore;
use crate::config::{BackendKind, GateConfig};
use crate::error::{BackendError, GateError, Result};

/// What the facade does when the shared backend fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request without counting it
    #[default]
    FailOpen,
    /// Enforce a per-instance quota in process memory until the backend recovers
    FallbackLocal,
}

/// Counters describing what the facade has decided so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Decisions returned, including bypasses
    pub decisions: u64,
    /// Decisions with `allowed == false`
    pub rejections: u64,
    /// Decisions short-circuited by a skip list
    pub bypasses: u64,
    /// Backend errors absorbed by the failure policy
    pub backend_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    decisions: AtomicU64,
    rejections: AtomicU64,
    bypasses: AtomicU64,
    backend_failures: AtomicU64,
}

enum Strategy {
    Local(Arc<LocalSlidingWindowLimiter>),
    Distributed {
        primary: DistributedSlidingWindowLimiter,
        policy: FailurePolicy,
        fallback: Option<Arc<LocalSlidingWindowLimiter>>,
    },
}

/// Selects a strategy per configuration and applies skip lists and the
/// failure policy.
pub struct LimiterFacade {
    config: Arc<LimiterConfig>,
    strategy: Strategy,
    resolver: Arc<dyn KeyResolver>,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl LimiterFacade {
    /// A facade over a process-local limiter.
    pub fn local(limiter: Arc<LocalSlidingWindowLimiter>) -> Self {
        Self {
            config: Arc::clone(limiter.config()),
            strategy: Strategy::Local(limiter),
            resolver: Arc::new(ClientIdentityResolver),
            clock: Arc::new(SystemClock),
            counters: Counters::default(),
        }
    }

    /// A facade over a distributed limiter, degrading per `policy` when the
    /// backend fails.
    pub fn distributed(primary: DistributedSlidingWindowLimiter, policy: FailurePolicy) -> Self {
        let config = Arc::clone(primary.config());
        let clock = Arc::clone(primary.clock());
        let fallback = match policy {
            FailurePolicy::FailOpen => None,
            FailurePolicy::FallbackLocal => Some(Arc::new(LocalSlidingWindowLimiter::with_clock(
                Arc::clone(&config),
                Arc::clone(&clock),
            ))),
        };

        Self {
            config,
            strategy: Strategy::Distributed {
                primary,
                policy,
                fallback,
            },
            resolver: Arc::new(ClientIdentityResolver),
            clock,
            counters: Counters::default(),
        }
    }

    /// Build the facade described by `config`, connecting to Redis if the
    /// Redis backend is selected, and start the local janitor.
    ///
    /// Configuration errors and an unreachable Redis at startup are fatal.
    pub async fn from_config(config: &GateConfig) -> Result<Self> {
        let settings = &config.limiter;
        let limiter_config = Arc::new(settings.to_limiter_config()?);

        let facade = match settings.backend {
            BackendKind::Local => {
                let limiter = Arc::new(LocalSlidingWindowLimiter::new(limiter_config));
                Self::local(limiter)
            }
            BackendKind::Redis => {
                let connect_timeout = settings.backend_timeout() * 10;
                let redis_url = config.redis.url();
                let connect = RedisStore::connect(&redis_url, settings.backend_timeout());
                let store = tokio::time::timeout(connect_timeout, connect)
                    .await
                    .map_err(|_| GateError::Backend(BackendError::Timeout(connect_timeout)))??;

                let primary = DistributedSlidingWindowLimiter::new(Arc::new(store), limiter_config)
                    .with_timeout(settings.backend_timeout());
                Self::distributed(primary, settings.failure_policy)
            }
        };

        if let Some(local) = facade.local_limiter() {
            local.spawn_janitor(settings.janitor_interval());
        }

        info!(
            strategy = facade.strategy_name(),
            limit = facade.config.limit(),
            window = ?facade.config.window(),
            key_prefix = %facade.config.key_prefix(),
            failure_policy = ?settings.failure_policy,
            "Rate limiter initialized"
        );

        Ok(facade)
    }

    /// Replace the identity resolver used by [`allow_request`](Self::allow_request).
    pub fn with_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the clock used for bypass decisions.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Decide for an already-resolved client key.
    ///
    /// Never fails: backend errors are absorbed per the failure policy and
    /// reported through logs and [`stats`](Self::stats).
    pub async fn allow(&self, key: &RateLimitKey) -> Decision {
        if self.config.skips_key(key) {
            trace!(key = %key, "Key is skip-listed");
            return self.bypass();
        }

        let decision = match &self.strategy {
            Strategy::Local(limiter) => limiter.check(key),
            Strategy::Distributed {
                primary,
                policy,
                fallback,
            } => match primary.allow(key).await {
                Ok(decision) => decision,
                Err(err) => self.on_backend_error(key, err, *policy, fallback.as_deref()),
            },
        };

        self.record(&decision);
        decision
    }

    /// Resolve the client key for `request`, honour skip paths, then decide.
    pub async fn allow_request(&self, request: &RequestIdentity) -> Decision {
        if self.config.skips_path(&request.path) {
            trace!(path = %request.path, "Path is skip-listed");
            return self.bypass();
        }

        let key = self.resolver.resolve_key(request);
        self.allow(&key).await
    }

    fn on_backend_error(
        &self,
        key: &RateLimitKey,
        err: BackendError,
        policy: FailurePolicy,
        fallback: Option<&LocalSlidingWindowLimiter>,
    ) -> Decision {
        let failures = self.counters.backend_failures.fetch_add(1, Ordering::Relaxed) + 1;

        warn!(
            key = %key,
            error = %err,
            policy = ?policy,
            backend_failures = failures,
            "Rate limit backend failed; request not counted against shared quota"
        );

        match fallback {
            Some(local) => local.check(key),
            None => Decision::bypass(self.config.limit(), self.clock.now(), self.config.window()),
        }
    }

    fn bypass(&self) -> Decision {
        self.counters.bypasses.fetch_add(1, Ordering::Relaxed);
        self.counters.decisions.fetch_add(1, Ordering::Relaxed);
        Decision::bypass(self.config.limit(), self.clock.now(), self.config.window())
    }

    fn record(&self, decision: &Decision) {
        self.counters.decisions.fetch_add(1, Ordering::Relaxed);
        if !decision.allowed {
            self.counters.rejections.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot of the decision counters.
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            decisions: self.counters.decisions.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
            bypasses: self.counters.bypasses.load(Ordering::Relaxed),
            backend_failures: self.counters.backend_failures.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        match &self.strategy {
            Strategy::Local(_) => "local",
            Strategy::Distributed { .. } => "distributed",
        }
    }

    /// The in-memory limiter, either the primary strategy or the fallback.
    pub fn local_limiter(&self) -> Option<&Arc<LocalSlidingWindowLimiter>> {
        match &self.strategy {
            Strategy::Local(limiter) => Some(limiter),
            Strategy::Distributed { fallback, .. } => fallback.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::store::MemoryStore;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn config(limit: u64) -> LimiterConfig {
        LimiterConfig::new(limit, Duration::from_secs(1))
            .unwrap()
            .with_key_prefix("rate_limit")
            .with_skip_keys(["ip:127.0.0.1"])
            .with_skip_paths(["/health"])
    }

    fn distributed(
        limit: u64,
        policy: FailurePolicy,
    ) -> (LimiterFacade, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let primary = DistributedSlidingWindowLimiter::new(store.clone(), Arc::new(config(limit)))
            .with_clock(Arc::new(clock.clone()));
        (LimiterFacade::distributed(primary, policy), store, clock)
    }

    fn local(limit: u64) -> (LimiterFacade, ManualClock) {
        let clock = ManualClock::default();
        let limiter = Arc::new(LocalSlidingWindowLimiter::with_clock(
            Arc::new(config(limit)),
            Arc::new(clock.clone()),
        ));
        let facade = LimiterFacade::local(limiter).with_clock(Arc::new(clock.clone()));
        (facade, clock)
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn test_local_scenario() {
        let (facade, clock) = local(3);
        let key = RateLimitKey::new("ip:1.2.3.4");

        let mut remaining = Vec::new();
        let mut allowed = Vec::new();
        for _ in 0..4 {
            let decision = facade.allow(&key).await;
            allowed.push(decision.allowed);
            remaining.push(decision.remaining);
        }
        assert_eq!(allowed, vec![true, true, true, false]);
        assert_eq!(remaining, vec![2, 1, 0, 0]);

        clock.advance(Duration::from_millis(1100));
        let decision = facade.allow(&key).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);

        let stats = facade.stats();
        assert_eq!(stats.decisions, 5);
        assert_eq!(stats.rejections, 1);
    }

    #[tokio::test]
    async fn test_fail_open_on_backend_outage() {
        let (facade, store, clock) = distributed(1, FailurePolicy::FailOpen);
        let key = RateLimitKey::new("ip:1.2.3.4");
        store.set_unavailable(true);

        for _ in 0..5 {
            let decision = facade.allow(&key).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 1);
            assert_eq!(decision.reset_at, clock.now() + Duration::from_secs(1));
        }

        let stats = facade.stats();
        assert_eq!(stats.backend_failures, 5);
        assert_eq!(stats.rejections, 0);
    }

    #[tokio::test]
    async fn test_fail_open_on_backend_timeout() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        store.set_latency(Some(Duration::from_millis(500)));
        let primary = DistributedSlidingWindowLimiter::new(store, Arc::new(config(1)))
            .with_clock(Arc::new(clock))
            .with_timeout(Duration::from_millis(20));
        let facade = LimiterFacade::distributed(primary, FailurePolicy::FailOpen);

        let decision = facade.allow(&RateLimitKey::new("k")).await;

        assert!(decision.allowed);
        assert_eq!(facade.stats().backend_failures, 1);
    }

    #[tokio::test]
    async fn test_fallback_local_enforces_instance_quota() {
        let (facade, store, _clock) = distributed(2, FailurePolicy::FallbackLocal);
        let key = RateLimitKey::new("ip:1.2.3.4");
        store.set_unavailable(true);

        let allowed: Vec<bool> = {
            let mut allowed = Vec::new();
            for _ in 0..3 {
                allowed.push(facade.allow(&key).await.allowed);
            }
            allowed
        };

        assert_eq!(allowed, vec![true, true, false]);
        assert_eq!(facade.stats().backend_failures, 3);
        assert!(facade.local_limiter().is_some());
    }

    #[tokio::test]
    async fn test_recovers_when_backend_returns() {
        let (facade, store, _clock) = distributed(2, FailurePolicy::FailOpen);
        let key = RateLimitKey::new("ip:1.2.3.4");

        store.set_unavailable(true);
        assert!(facade.allow(&key).await.allowed);

        store.set_unavailable(false);
        assert!(facade.allow(&key).await.allowed);
        assert!(facade.allow(&key).await.allowed);
        assert!(!facade.allow(&key).await.allowed);
        assert_eq!(store.cardinality("rate_limit:ip:1.2.3.4"), 3);
    }

    #[tokio::test]
    async fn test_skip_key_bypasses_and_does_not_consume_quota() {
        let (facade, store, _clock) = distributed(1, FailurePolicy::FailOpen);
        let skipped = RateLimitKey::new("ip:127.0.0.1");
        let other = RateLimitKey::new("ip:10.0.0.9");

        for _ in 0..10 {
            let decision = facade.allow(&skipped).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 1);
        }

        assert!(!store.contains_key("rate_limit:ip:127.0.0.1"));
        assert!(facade.allow(&other).await.allowed);
        assert!(!facade.allow(&other).await.allowed);
        assert_eq!(facade.stats().bypasses, 10);
    }

    #[tokio::test]
    async fn test_skip_path_bypasses() {
        let (facade, _clock) = local(1);

        for _ in 0..3 {
            let request = RequestIdentity::new("/health", ip(1));
            assert!(facade.allow_request(&request).await.allowed);
        }

        let request = RequestIdentity::new("/api/restaurants", ip(1));
        assert!(facade.allow_request(&request).await.allowed);
        assert!(!facade.allow_request(&request).await.allowed);
    }

    #[tokio::test]
    async fn test_allow_request_keys_by_user_then_ip() {
        let (facade, _clock) = local(2);

        let user_a = RequestIdentity::new("/api", ip(1)).with_user("user123");
        let user_b = RequestIdentity::new("/api", ip(1));

        assert!(facade.allow_request(&user_a).await.allowed);
        assert!(facade.allow_request(&user_a).await.allowed);
        assert!(!facade.allow_request(&user_a).await.allowed);

        // Same address, no user: counted under the ip key instead.
        assert!(facade.allow_request(&user_b).await.allowed);
    }

    #[tokio::test]
    async fn test_distinct_keys_never_interfere() {
        let (facade, _store, _clock) = distributed(2, FailurePolicy::FailOpen);
        let a = RateLimitKey::new("ip:10.0.0.1");
        let b = RateLimitKey::new("ip:10.0.0.2");

        for _ in 0..4 {
            facade.allow(&a).await;
        }

        let first = facade.allow(&b).await;
        let second = facade.allow(&b).await;
        assert!(first.allowed && second.allowed);
        assert_eq!((first.remaining, second.remaining), (1, 0));
    }

    #[tokio::test]
    async fn test_from_config_local() {
        let mut config = GateConfig::default();
        config.limiter.limit = 2;

        let facade = LimiterFacade::from_config(&config).await.unwrap();

        assert_eq!(facade.strategy_name(), "local");
        assert_eq!(facade.config().limit(), 2);
        let key = RateLimitKey::new("ip:1.2.3.4");
        assert!(facade.allow(&key).await.allowed);
        assert!(facade.allow(&key).await.allowed);
        assert!(!facade.allow(&key).await.allowed);
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid_limit() {
        let mut config = GateConfig::default();
        config.limiter.limit = 0;

        let result = LimiterFacade::from_config(&config).await;
        assert!(matches!(result, Err(GateError::Config(_))));
    }
}
