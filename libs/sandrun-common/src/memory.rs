//! In-process collaborators for tests and local runs
//!
//! Each instance is independent; tests build a fresh one rather than sharing
//! a process-wide store.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::InfrastructureError;
use crate::store::{BlobStore, JobQueue, StatusStore, StatusWrite};
use crate::types::{JobDescriptor, StatusRecord};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn check_available(flag: &AtomicBool, what: &str) -> Result<(), InfrastructureError> {
    if flag.load(Ordering::SeqCst) {
        return Err(InfrastructureError::Unavailable(format!("{} unavailable", what)));
    }
    Ok(())
}

/// Status store with the same monotonic-write and TTL rules as Redis
pub struct MemoryStatusStore {
    ttl: Duration,
    records: Mutex<HashMap<Uuid, (StatusRecord, Instant)>>,
    unavailable: AtomicBool,
}

impl MemoryStatusStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every call fail, simulating an unreachable store
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn put(
        &self,
        job_id: Uuid,
        record: &StatusRecord,
    ) -> Result<StatusWrite, InfrastructureError> {
        check_available(&self.unavailable, "status store")?;

        let now = Instant::now();
        let mut records = lock(&self.records);
        if let Some((current, expires_at)) = records.get(&job_id) {
            if *expires_at > now && !current.status.can_transition_to(record.status) {
                return Ok(StatusWrite::Superseded {
                    current: current.status,
                });
            }
        }

        records.insert(job_id, (record.clone(), now + self.ttl));
        Ok(StatusWrite::Applied)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<StatusRecord>, InfrastructureError> {
        check_available(&self.unavailable, "status store")?;

        let mut records = lock(&self.records);
        match records.get(&job_id) {
            Some((record, expires_at)) if *expires_at > Instant::now() => Ok(Some(record.clone())),
            Some(_) => {
                records.remove(&job_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.blobs).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), InfrastructureError> {
        check_available(&self.unavailable, "blob store")?;
        lock(&self.blobs).insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, InfrastructureError> {
        check_available(&self.unavailable, "blob store")?;
        lock(&self.blobs)
            .get(key)
            .cloned()
            .ok_or_else(|| InfrastructureError::BlobNotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), InfrastructureError> {
        check_available(&self.unavailable, "blob store")?;
        lock(&self.blobs).remove(key);
        Ok(())
    }
}

/// FIFO queue of raw payloads
#[derive(Default)]
pub struct MemoryQueue {
    payloads: Mutex<VecDeque<String>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an arbitrary payload, well-formed or not
    pub fn push_raw(&self, payload: impl Into<String>) {
        lock(&self.payloads).push_back(payload.into());
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, descriptor: &JobDescriptor) -> Result<(), InfrastructureError> {
        let payload = serde_json::to_string(descriptor)?;
        self.push_raw(payload);
        Ok(())
    }

    async fn dequeue_batch(
        &self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<String>, InfrastructureError> {
        let take = |queue: &Mutex<VecDeque<String>>| {
            let mut payloads = lock(queue);
            let n = max.min(payloads.len());
            payloads.drain(..n).collect::<Vec<_>>()
        };

        let batch = take(&self.payloads);
        if !batch.is_empty() || wait.is_zero() {
            return Ok(batch);
        }

        tokio::time::sleep(wait).await;
        Ok(take(&self.payloads))
    }

    async fn depth(&self) -> Result<u64, InfrastructureError> {
        Ok(lock(&self.payloads).len() as u64)
    }
}
