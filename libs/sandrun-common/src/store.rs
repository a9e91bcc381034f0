//! Contracts for the external collaborators: status store, blob store, queue.
//!
//! Implementations live in [`crate::redis`] (production) and
//! [`crate::memory`] (tests and local runs).

use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::error::InfrastructureError;
use crate::types::{JobDescriptor, JobStatus, Language, StatusRecord};
use crate::languages::config_for;

/// Storage key for a job's submitted source
pub fn code_key(job_id: &Uuid, language: Language) -> String {
    format!("jobs/{}/code.{}", job_id, config_for(language).extension)
}

/// Result of a status write that reached the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Applied,
    /// The stored record was already at or past the requested state and was
    /// left untouched
    Superseded { current: JobStatus },
}

/// Key-value job status space with per-write expiry
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Write `record` unless it would move the job backwards
    async fn put(&self, job_id: Uuid, record: &StatusRecord)
        -> Result<StatusWrite, InfrastructureError>;

    /// `None` means unknown or expired, never "failed"
    async fn get(&self, job_id: Uuid) -> Result<Option<StatusRecord>, InfrastructureError>;
}

/// Durable store holding submitted source between submission and execution
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), InfrastructureError>;

    /// Missing keys are reported as [`InfrastructureError::BlobNotFound`]
    async fn get(&self, key: &str) -> Result<Vec<u8>, InfrastructureError>;

    async fn delete(&self, key: &str) -> Result<(), InfrastructureError>;
}

/// Hands job descriptors from the submission path to workers
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, descriptor: &JobDescriptor) -> Result<(), InfrastructureError>;

    /// Wait up to `wait` for the first payload, then take whatever else is
    /// immediately available up to `max`. Payloads are returned raw so the
    /// worker can attribute malformed ones.
    async fn dequeue_batch(
        &self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<String>, InfrastructureError>;

    async fn depth(&self) -> Result<u64, InfrastructureError>;
}

/// Best-effort status write: failures are logged and swallowed
///
/// Returns `None` when the write did not reach the store. Callers that need
/// strong consistency use [`StatusStore::put`] directly.
pub async fn record_status(
    store: &dyn StatusStore,
    job_id: Uuid,
    record: &StatusRecord,
) -> Option<StatusWrite> {
    match store.put(job_id, record).await {
        Ok(write) => {
            if let StatusWrite::Superseded { current } = write {
                warn!(
                    job_id = %job_id,
                    requested = %record.status,
                    current = %current,
                    "Status write superseded by a later state"
                );
            }
            Some(write)
        }
        Err(e) => {
            warn!(
                job_id = %job_id,
                status = %record.status,
                error = %e,
                "Failed to persist job status"
            );
            None
        }
    }
}

/// Best-effort blob removal
pub async fn discard_blob(store: &dyn BlobStore, key: &str) -> bool {
    match store.delete(key).await {
        Ok(()) => true,
        Err(e) => {
            warn!(code_key = key, error = %e, "Failed to delete source blob");
            false
        }
    }
}
