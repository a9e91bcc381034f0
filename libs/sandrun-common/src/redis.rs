/// Redis key semantics and the Redis-backed collaborators
/// Keeps API and worker in agreement on key names, and owns the single
/// connection each process uses.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

use crate::error::InfrastructureError;
use crate::store::{BlobStore, JobQueue, StatusStore, StatusWrite};
use crate::types::{JobDescriptor, JobStatus, StatusRecord};

pub const QUEUE_KEY: &str = "sandrun:queue";
pub const STATUS_PREFIX: &str = "sandrun:job";
pub const BLOB_PREFIX: &str = "sandrun:blob";

/// Status key for a job
pub fn status_key(job_id: &Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

/// Redis key holding the blob stored under `code_key`
pub fn blob_key(code_key: &str) -> String {
    format!("{}:{}", BLOB_PREFIX, code_key)
}

/// Monotonic SETEX: refuses to overwrite a terminal record or move a job to
/// an earlier state. Returns {applied, status now stored}.
const GUARDED_SET: &str = r#"
local rank = { queued = 0, active = 1, completed = 2, failed = 2 }
local current = redis.call('GET', KEYS[1])
if current then
  local ok, decoded = pcall(cjson.decode, current)
  if ok and type(decoded) == 'table' and rank[decoded.status] ~= nil then
    local cur = decoded.status
    if rank[cur] == 2 or rank[ARGV[3]] < rank[cur] then
      return { 0, cur }
    end
  end
end
redis.call('SETEX', KEYS[1], ARGV[2], ARGV[1])
return { 1, ARGV[3] }
"#;

/// Connection-on-first-use Redis backend
///
/// Acquired once per process and shared by reference; the connection manager
/// reconnects on its own after transient failures.
pub struct RedisBackend {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    status_ttl: Duration,
    blob_ttl: Duration,
    guarded_set: Script,
}

impl RedisBackend {
    /// Validates the URL; no connection is made until the first command
    pub fn open(
        redis_url: &str,
        status_ttl: Duration,
        blob_ttl: Duration,
    ) -> Result<Self, InfrastructureError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            conn: OnceCell::new(),
            status_ttl,
            blob_ttl,
            guarded_set: Script::new(GUARDED_SET),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, InfrastructureError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn = ConnectionManager::new(self.client.clone()).await?;
                info!("Connected to Redis");
                Ok::<_, InfrastructureError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    /// Round-trip check used at startup
    pub async fn ping(&self) -> Result<(), InfrastructureError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for RedisBackend {
    async fn put(
        &self,
        job_id: Uuid,
        record: &StatusRecord,
    ) -> Result<StatusWrite, InfrastructureError> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.connection().await?;

        let (applied, current): (i64, String) = self
            .guarded_set
            .key(status_key(&job_id))
            .arg(payload)
            .arg(self.status_ttl.as_secs().max(1))
            .arg(record.status.as_str())
            .invoke_async(&mut conn)
            .await?;

        if applied == 1 {
            return Ok(StatusWrite::Applied);
        }

        let current = current
            .parse::<JobStatus>()
            .map_err(InfrastructureError::Unavailable)?;
        Ok(StatusWrite::Superseded { current })
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<StatusRecord>, InfrastructureError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(status_key(&job_id))
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BlobStore for RedisBackend {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), InfrastructureError> {
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(blob_key(key))
            .arg(bytes)
            .arg("EX")
            .arg(self.blob_ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, InfrastructureError> {
        let mut conn = self.connection().await?;
        let bytes: Option<Vec<u8>> = redis::cmd("GET")
            .arg(blob_key(key))
            .query_async(&mut conn)
            .await?;
        bytes.ok_or_else(|| InfrastructureError::BlobNotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), InfrastructureError> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(blob_key(key))
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisBackend {
    async fn enqueue(&self, descriptor: &JobDescriptor) -> Result<(), InfrastructureError> {
        let payload = serde_json::to_string(descriptor)?;
        let mut conn = self.connection().await?;
        redis::cmd("RPUSH")
            .arg(QUEUE_KEY)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue_batch(
        &self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<String>, InfrastructureError> {
        let mut conn = self.connection().await?;

        // BLPOP with timeout so the caller can observe shutdown between polls.
        // A zero timeout would block forever, so fall back to LPOP.
        let first: Option<String> = if wait.is_zero() {
            redis::cmd("LPOP")
                .arg(QUEUE_KEY)
                .query_async(&mut conn)
                .await?
        } else {
            redis::cmd("BLPOP")
                .arg(QUEUE_KEY)
                .arg(wait.as_secs_f64())
                .query_async::<_, Option<(String, String)>>(&mut conn)
                .await?
                .map(|(_, payload)| payload)
        };

        let Some(payload) = first else {
            return Ok(Vec::new());
        };

        let mut batch = vec![payload];
        while batch.len() < max {
            let next: Option<String> = redis::cmd("LPOP")
                .arg(QUEUE_KEY)
                .query_async(&mut conn)
                .await?;
            match next {
                Some(payload) => batch.push(payload),
                None => break,
            }
        }

        Ok(batch)
    }

    async fn depth(&self) -> Result<u64, InfrastructureError> {
        let mut conn = self.connection().await?;
        let depth: u64 = redis::cmd("LLEN")
            .arg(QUEUE_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(depth)
    }
}
