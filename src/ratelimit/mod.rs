//! Sliding window rate limiting: strategies, their shared contract and the facade.

mod backend;
mod clock;
mod decision;
mod distributed;
mod facade;
mod key;
mod local;
mod redis_store;
mod store;

pub use backend::{LimiterConfig, RateLimiterBackend, MAX_WINDOW};
pub use clock::{epoch_nanos, epoch_secs, Clock, ManualClock, SystemClock};
pub use decision::{
    Decision, RejectionBody, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, RATE_LIMIT_EXCEEDED,
};
pub use distributed::{DistributedSlidingWindowLimiter, DEFAULT_BACKEND_TIMEOUT};
pub use facade::{FailurePolicy, LimiterFacade, LimiterStats};
pub use key::{ClientIdentityResolver, KeyResolver, RateLimitKey, RequestIdentity};
pub use local::LocalSlidingWindowLimiter;
pub use redis_store::RedisStore;
pub use store::{BatchOp, BatchReply, MemoryStore, SortedSetStore, WindowBatch};
