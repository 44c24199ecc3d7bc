//! Redis-backed sorted-set store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{info, trace};

use super::distributed::DEFAULT_BACKEND_TIMEOUT;
use super::store::{BatchOp, BatchReply, SortedSetStore, WindowBatch};
use crate::error::BackendError;

/// A [`SortedSetStore`] that runs each batch as one `MULTI/EXEC` pipeline.
///
/// The connection manager reconnects on its own after a dropped connection;
/// the batch in flight at that moment fails and is reported as unavailable.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    deadline: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the server at `url` (`redis://[:password@]host:port/db`).
    ///
    /// `deadline` is the round-trip bound reported when the client itself
    /// times out.
    pub async fn connect(url: &str, deadline: Duration) -> Result<Self, BackendError> {
        let classify = |err| BackendError::from_redis(err, deadline);
        let client = redis::Client::open(url).map_err(classify)?;
        let conn = ConnectionManager::new(client).await.map_err(classify)?;

        info!(
            addr = %redacted(url),
            "Connected to Redis window store"
        );

        Ok(Self { conn, deadline })
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            deadline: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Translate a batch into an atomic pipeline.
fn to_pipeline(batch: &WindowBatch) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();

    for op in batch.ops() {
        match op {
            BatchOp::RemoveRangeByScore { key, max_exclusive } => {
                pipe.zrembyscore(key, "-inf", format!("({}", max_exclusive));
            }
            BatchOp::Cardinality { key } => {
                pipe.zcard(key);
            }
            BatchOp::Add { key, score, member } => {
                pipe.zadd(key, member, *score);
            }
            BatchOp::Expire { key, ttl } => {
                let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
                pipe.pexpire(key, millis);
            }
        }
    }

    pipe
}

/// Strip credentials from a connection URL before logging it.
fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl SortedSetStore for RedisStore {
    async fn execute(&self, batch: &WindowBatch) -> Result<BatchReply, BackendError> {
        if batch.is_empty() {
            return Ok(BatchReply::default());
        }

        let pipe = to_pipeline(batch);
        let mut conn = self.conn.clone();

        let replies: Vec<i64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|err| BackendError::from_redis(err, self.deadline))?;
        trace!(ops = batch.len(), replies = ?replies, "Executed Redis window batch");

        if replies.len() != batch.len() {
            return Err(BackendError::Protocol(format!(
                "expected {} replies, got {}",
                batch.len(),
                replies.len()
            )));
        }

        Ok(BatchReply::new(replies))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
