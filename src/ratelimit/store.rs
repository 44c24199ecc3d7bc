//! Sorted-set window stores and the atomic batch submitted to them.
//!
//! The distributed limiter never issues its eviction, count, insert and
//! expire as separate calls. It builds a [`WindowBatch`] and hands it to a
//! [`SortedSetStore`], which must apply every operation in one atomic round
//! trip or fail the whole batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::clock::{Clock, SystemClock};
use crate::error::BackendError;

/// One primitive sorted-set operation.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Remove members scored strictly below `max_exclusive`; replies with the number removed
    RemoveRangeByScore { key: String, max_exclusive: f64 },
    /// Replies with the number of members
    Cardinality { key: String },
    /// Insert (or rescore) a member; replies with the number of new members
    Add { key: String, score: f64, member: String },
    /// Set the key's time to live; replies 1 if the key exists, 0 otherwise
    Expire { key: String, ttl: Duration },
}

/// An ordered list of operations applied atomically in one round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowBatch {
    ops: Vec<BatchOp>,
}

impl WindowBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation, returning the index of its reply.
    pub fn push(&mut self, op: BatchOp) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    pub fn remove_range_by_score(&mut self, key: &str, max_exclusive: f64) -> usize {
        self.push(BatchOp::RemoveRangeByScore {
            key: key.to_string(),
            max_exclusive,
        })
    }

    pub fn cardinality(&mut self, key: &str) -> usize {
        self.push(BatchOp::Cardinality {
            key: key.to_string(),
        })
    }

    pub fn add(&mut self, key: &str, score: f64, member: impl Into<String>) -> usize {
        self.push(BatchOp::Add {
            key: key.to_string(),
            score,
            member: member.into(),
        })
    }

    pub fn expire(&mut self, key: &str, ttl: Duration) -> usize {
        self.push(BatchOp::Expire {
            key: key.to_string(),
            ttl,
        })
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Integer replies of an executed batch, one per operation, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReply {
    replies: Vec<i64>,
}

impl BatchReply {
    pub fn new(replies: Vec<i64>) -> Self {
        Self { replies }
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        self.replies.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }
}

/// A shared ordered key/value store able to run a [`WindowBatch`] atomically.
///
/// Implementations report connection problems as
/// [`BackendError::Unavailable`]; a missing key is an empty set, not an error.
#[async_trait]
pub trait SortedSetStore: Send + Sync {
    async fn execute(&self, batch: &WindowBatch) -> Result<BatchReply, BackendError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct MemorySet {
    members: HashMap<String, f64>,
    expires_at: Option<SystemTime>,
}

/// In-process sorted-set store.
///
/// Useful for tests and single-node development. A whole batch runs under
/// one lock, which gives it the same all-or-nothing behaviour a Redis
/// `MULTI/EXEC` has. Outages and slow round trips can be injected.
#[derive(Debug)]
pub struct MemoryStore {
    sets: Mutex<HashMap<String, MemorySet>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Key expiry is evaluated against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            sets: Mutex::new(HashMap::new()),
            clock,
            unavailable: AtomicBool::new(false),
            latency: Mutex::new(None),
        }
    }

    /// Make every subsequent batch fail with [`BackendError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every subsequent batch before it is applied.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Members currently stored under `key`, honouring expiry.
    pub fn cardinality(&self, key: &str) -> usize {
        let now = self.clock.now();
        let mut sets = self.sets.lock();
        purge_if_expired(&mut sets, key, now);
        sets.get(key).map(|set| set.members.len()).unwrap_or(0)
    }

    /// Whether `key` exists, honouring expiry.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut sets = self.sets.lock();
        purge_if_expired(&mut sets, key, now);
        sets.contains_key(key)
    }

    /// Remaining time to live of `key`, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut sets = self.sets.lock();
        purge_if_expired(&mut sets, key, now);
        sets.get(key)
            .and_then(|set| set.expires_at)
            .map(|at| at.duration_since(now).unwrap_or(Duration::ZERO))
    }

    fn apply(&self, batch: &WindowBatch) -> BatchReply {
        let now = self.clock.now();
        let mut sets = self.sets.lock();
        let mut replies = Vec::with_capacity(batch.len());

        for op in batch.ops() {
            let reply = match op {
                BatchOp::RemoveRangeByScore { key, max_exclusive } => {
                    purge_if_expired(&mut sets, key, now);
                    let removed = match sets.get_mut(key) {
                        Some(set) => {
                            let before = set.members.len();
                            set.members.retain(|_, score| *score >= *max_exclusive);
                            before - set.members.len()
                        }
                        None => 0,
                    };
                    drop_if_empty(&mut sets, key);
                    removed as i64
                }
                BatchOp::Cardinality { key } => {
                    purge_if_expired(&mut sets, key, now);
                    sets.get(key).map(|set| set.members.len()).unwrap_or(0) as i64
                }
                BatchOp::Add { key, score, member } => {
                    purge_if_expired(&mut sets, key, now);
                    let set = sets.entry(key.clone()).or_default();
                    match set.members.insert(member.clone(), *score) {
                        Some(_) => 0,
                        None => 1,
                    }
                }
                BatchOp::Expire { key, ttl } => {
                    purge_if_expired(&mut sets, key, now);
                    match sets.get_mut(key) {
                        Some(set) => {
                            set.expires_at = now.checked_add(*ttl);
                            1
                        }
                        None => 0,
                    }
                }
            };
            replies.push(reply);
        }

        BatchReply::new(replies)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn purge_if_expired(sets: &mut HashMap<String, MemorySet>, key: &str, now: SystemTime) {
    let expired = sets
        .get(key)
        .and_then(|set| set.expires_at)
        .map(|at| now >= at)
        .unwrap_or(false);
    if expired {
        sets.remove(key);
    }
}

fn drop_if_empty(sets: &mut HashMap<String, MemorySet>, key: &str) {
    if sets.get(key).map(|set| set.members.is_empty()).unwrap_or(false) {
        sets.remove(key);
    }
}

#[async_trait]
impl SortedSetStore for MemoryStore {
    async fn execute(&self, batch: &WindowBatch) -> Result<BatchReply, BackendError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            // Nothing is applied until the delay has elapsed, so a caller
            // that gives up early leaves no partial state behind.
            tokio::time::sleep(latency).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }

        Ok(self.apply(batch))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::default();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_batch_indices() {
        let mut batch = WindowBatch::new();
        assert_eq!(batch.remove_range_by_score("k", 10.0), 0);
        assert_eq!(batch.cardinality("k"), 1);
        assert_eq!(batch.add("k", 11.0, "m"), 2);
        assert_eq!(batch.expire("k", Duration::from_secs(1)), 3);
        assert_eq!(batch.len(), 4);
    }

    #[tokio::test]
    async fn test_memory_store_replies() {
        let (store, _clock) = store();

        let mut batch = WindowBatch::new();
        batch.add("k", 1.0, "a");
        batch.add("k", 2.0, "b");
        batch.add("k", 2.0, "b");
        batch.cardinality("k");
        batch.remove_range_by_score("k", 2.0);
        batch.cardinality("k");
        batch.expire("k", Duration::from_secs(1));
        batch.expire("missing", Duration::from_secs(1));

        let reply = store.execute(&batch).await.unwrap();
        let replies: Vec<i64> = (0..reply.len()).map(|i| reply.get(i).unwrap()).collect();
        assert_eq!(replies, vec![1, 1, 0, 2, 1, 1, 1, 0]);
    }

    #[tokio::test]
    async fn test_memory_store_expiry() {
        let (store, clock) = store();

        let mut batch = WindowBatch::new();
        batch.add("k", 1.0, "a");
        batch.expire("k", Duration::from_secs(2));
        store.execute(&batch).await.unwrap();

        assert_eq!(store.ttl("k"), Some(Duration::from_secs(2)));
        clock.advance(Duration::from_secs(1));
        assert_eq!(store.cardinality("k"), 1);

        clock.advance(Duration::from_secs(1));
        assert!(!store.contains_key("k"));
        assert_eq!(store.ttl("k"), None);
    }

    #[tokio::test]
    async fn test_memory_store_unrepresentable_ttl_never_expires() {
        let (store, clock) = store();

        let mut batch = WindowBatch::new();
        batch.add("k", 1.0, "a");
        batch.expire("k", Duration::MAX);
        let reply = store.execute(&batch).await.unwrap();

        assert_eq!(reply.get(1), Some(1));
        clock.advance(Duration::from_secs(3600));
        assert_eq!(store.cardinality("k"), 1);
    }

    #[tokio::test]
    async fn test_memory_store_outage() {
        let (store, _clock) = store();
        store.set_unavailable(true);

        let mut batch = WindowBatch::new();
        batch.add("k", 1.0, "a");
        let err = store.execute(&batch).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
        assert!(!store.contains_key("k"));

        store.set_unavailable(false);
        assert!(store.execute(&batch).await.is_ok());
        assert!(store.contains_key("k"));
    }
}
