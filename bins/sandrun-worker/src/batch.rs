/// Batch Worker Loop
///
/// Pulls descriptor batches from the queue and drives each one through:
/// mark active -> fetch source -> execute -> terminal status -> delete blob.
///
/// Every descriptor runs in its own task. A panic while processing one job is
/// caught at the join handle and turned into a failed status for that job;
/// the rest of the batch carries on.

use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use sandrun_common::store::{discard_blob, record_status, BlobStore, JobQueue, StatusStore};
use sandrun_common::{InfrastructureError, JobDescriptor, StatusRecord};
use sandrun_engine::ExecutionOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::ExecutionEngine;

/// Back-off after a failed dequeue
const DEQUEUE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Language label used when a malformed descriptor carries none
const UNKNOWN_LANGUAGE: &str = "unknown";

/// Aggregate outcome of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub completed: usize,
    pub failed: usize,
    /// Descriptors that could not be attributed to any job
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Failed,
    Dropped,
}

/// Whatever could be recovered from a descriptor that failed to parse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedDescriptor {
    pub job_id: Option<Uuid>,
    pub code_key: Option<String>,
    pub language: Option<String>,
    pub reason: String,
}

/// Parse a raw queue payload, salvaging identifiers on failure
pub fn parse_descriptor(raw: &str) -> Result<JobDescriptor, MalformedDescriptor> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| MalformedDescriptor {
        job_id: None,
        code_key: None,
        language: None,
        reason: e.to_string(),
    })?;

    JobDescriptor::deserialize(&value).map_err(|e| {
        let field = |name: &str| value.get(name).and_then(|v| v.as_str()).map(String::from);
        MalformedDescriptor {
            job_id: field("jobId").and_then(|id| Uuid::parse_str(&id).ok()),
            code_key: field("codeKey"),
            language: field("language"),
            reason: e.to_string(),
        }
    })
}

pub struct Worker {
    engine: Arc<dyn ExecutionEngine>,
    status: Arc<dyn StatusStore>,
    blobs: Arc<dyn BlobStore>,
    concurrency: usize,
}

impl Worker {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        status: Arc<dyn StatusStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            engine,
            status,
            blobs,
            concurrency: 1,
        }
    }

    /// Descriptors of one batch processed at the same time (at least 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Poll the queue until `shutdown` flips to true
    ///
    /// The flag is checked between polls, so a batch in flight is always
    /// drained before the loop returns.
    pub async fn run_loop(
        self: Arc<Self>,
        queue: Arc<dyn JobQueue>,
        batch_size: usize,
        poll_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) {
        info!(
            batch_size = batch_size,
            concurrency = self.concurrency,
            "Worker listening for jobs"
        );

        while !*shutdown.borrow() {
            match queue.dequeue_batch(batch_size, poll_timeout).await {
                Ok(batch) if batch.is_empty() => continue,
                Ok(batch) => {
                    let report = self.process_batch(batch).await;
                    info!(
                        received = report.received,
                        completed = report.completed,
                        failed = report.failed,
                        dropped = report.dropped,
                        "Batch processed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to dequeue jobs");
                    tokio::time::sleep(DEQUEUE_RETRY_DELAY).await;
                }
            }
        }

        info!("Worker loop stopped");
    }

    pub async fn process_batch(self: &Arc<Self>, payloads: Vec<String>) -> BatchReport {
        let mut report = BatchReport {
            received: payloads.len(),
            ..Default::default()
        };

        let outcomes: Vec<JobOutcome> = stream::iter(payloads)
            .map(|raw| Arc::clone(self).process_isolated(raw))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                JobOutcome::Completed => report.completed += 1,
                JobOutcome::Failed => report.failed += 1,
                JobOutcome::Dropped => report.dropped += 1,
            }
        }

        report
    }

    async fn process_isolated(self: Arc<Self>, raw: String) -> JobOutcome {
        let worker = Arc::clone(&self);
        let payload = raw.clone();

        match tokio::spawn(async move { worker.process_payload(&payload).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Job task aborted");
                self.fail_salvaged(&raw, format!("Unexpected error during code execution: {}", e))
                    .await
            }
        }
    }

    async fn process_payload(&self, raw: &str) -> JobOutcome {
        match parse_descriptor(raw) {
            Ok(descriptor) => self.process_job(&descriptor).await,
            Err(malformed) => {
                let message = format!("Malformed job descriptor: {}", malformed.reason);
                self.fail_attributed(malformed, message).await
            }
        }
    }

    async fn process_job(&self, descriptor: &JobDescriptor) -> JobOutcome {
        let job_id = descriptor.job_id;
        let language = descriptor.language.as_str();

        info!(
            job_id = %job_id,
            language = language,
            memory_limit = descriptor.memory_limit.as_deref().unwrap_or("default"),
            "Processing job"
        );

        record_status(&*self.status, job_id, &StatusRecord::active()).await;

        let outcome = match self.fetch_source(&descriptor.code_key).await {
            Ok(code) => {
                let options = ExecutionOptions {
                    timeout_ms: descriptor.timeout,
                    deadline: None,
                };
                let result = self.engine.execute(&code, language, job_id, options).await;

                if result.success {
                    info!(job_id = %job_id, duration_ms = result.duration_ms, "Job completed");
                } else {
                    warn!(
                        job_id = %job_id,
                        duration_ms = result.duration_ms,
                        error = result.error.as_deref().unwrap_or_default(),
                        "Job failed"
                    );
                }

                record_status(
                    &*self.status,
                    job_id,
                    &StatusRecord::from_result(&result, language),
                )
                .await;

                if result.success {
                    JobOutcome::Completed
                } else {
                    JobOutcome::Failed
                }
            }
            Err(e) => {
                error!(job_id = %job_id, code_key = %descriptor.code_key, error = %e, "Failed to fetch source");
                let record =
                    StatusRecord::failed(format!("Failed to fetch source: {}", e), None, language);
                record_status(&*self.status, job_id, &record).await;
                JobOutcome::Failed
            }
        };

        discard_blob(&*self.blobs, &descriptor.code_key).await;
        outcome
    }

    async fn fetch_source(&self, code_key: &str) -> Result<String, InfrastructureError> {
        let bytes = self.blobs.get(code_key).await?;
        String::from_utf8(bytes).map_err(|_| InfrastructureError::InvalidEncoding(code_key.to_string()))
    }

    /// Mark failed whichever job the raw payload can be attributed to
    async fn fail_salvaged(&self, raw: &str, message: String) -> JobOutcome {
        let salvaged = match parse_descriptor(raw) {
            Ok(descriptor) => MalformedDescriptor {
                job_id: Some(descriptor.job_id),
                code_key: Some(descriptor.code_key),
                language: Some(descriptor.language),
                reason: String::new(),
            },
            Err(malformed) => malformed,
        };
        self.fail_attributed(salvaged, message).await
    }

    async fn fail_attributed(&self, salvaged: MalformedDescriptor, message: String) -> JobOutcome {
        if let Some(code_key) = salvaged.code_key.as_deref() {
            discard_blob(&*self.blobs, code_key).await;
        }

        let Some(job_id) = salvaged.job_id else {
            warn!(reason = %salvaged.reason, "Dropping descriptor with no job id");
            return JobOutcome::Dropped;
        };

        debug!(job_id = %job_id, error = %message, "Recording failure for salvaged job");
        let language = salvaged.language.as_deref().unwrap_or(UNKNOWN_LANGUAGE);
        record_status(
            &*self.status,
            job_id,
            &StatusRecord::failed(message, None, language),
        )
        .await;
        JobOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sandrun_common::memory::{MemoryBlobStore, MemoryQueue, MemoryStatusStore};
    use sandrun_common::{ExecutionError, ExecutionResult, JobStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Engine whose behaviour is driven by the submitted code:
    /// `panic` panics, `fail:<msg>` fails, `slow` sleeps, anything else echoes
    #[derive(Default)]
    struct ScriptedEngine {
        seen: Mutex<Vec<ExecutionOptions>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionEngine for ScriptedEngine {
        async fn execute(
            &self,
            code: &str,
            _language: &str,
            _job_id: Uuid,
            options: ExecutionOptions,
        ) -> ExecutionResult {
            self.seen.lock().unwrap().push(options);

            if code == "panic" {
                panic!("engine blew up");
            }
            if let Some(message) = code.strip_prefix("fail:") {
                return ExecutionResult::failed(&ExecutionError::Runtime(message.to_string()), 7);
            }
            if code == "slow" {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }

            ExecutionResult::succeeded(code.trim().to_string(), 5)
        }
    }

    struct Harness {
        worker: Arc<Worker>,
        engine: Arc<ScriptedEngine>,
        status: Arc<MemoryStatusStore>,
        blobs: Arc<MemoryBlobStore>,
    }

    impl Harness {
        fn new(concurrency: usize) -> Self {
            let engine = Arc::new(ScriptedEngine::default());
            let status = Arc::new(MemoryStatusStore::new(Duration::from_secs(3600)));
            let blobs = Arc::new(MemoryBlobStore::new());
            let worker = Arc::new(
                Worker::new(engine.clone(), status.clone(), blobs.clone())
                    .with_concurrency(concurrency),
            );
            Self {
                worker,
                engine,
                status,
                blobs,
            }
        }

        /// Store the source and return (job id, code key, descriptor payload)
        async fn submit(&self, code: &[u8], timeout: Option<u64>) -> (Uuid, String, String) {
            let job_id = Uuid::new_v4();
            let code_key = format!("jobs/{}/code.py", job_id);
            self.blobs.put(&code_key, code).await.unwrap();
            self.status
                .put(job_id, &StatusRecord::queued("python", &code_key))
                .await
                .unwrap();

            let descriptor = JobDescriptor {
                job_id,
                language: "python".to_string(),
                code_key: code_key.clone(),
                timestamp: 1_700_000_000_000,
                timeout,
                memory_limit: None,
            };
            (job_id, code_key, serde_json::to_string(&descriptor).unwrap())
        }

        async fn status_of(&self, job_id: Uuid) -> StatusRecord {
            self.status.get(job_id).await.unwrap().expect("status present")
        }
    }

    #[test]
    fn test_parse_descriptor_salvages_identifiers() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"jobId":"{}","codeKey":"jobs/{}/code.py"}}"#, id, id);

        let malformed = parse_descriptor(&raw).unwrap_err();
        assert_eq!(malformed.job_id, Some(id));
        assert_eq!(malformed.code_key, Some(format!("jobs/{}/code.py", id)));
        assert_eq!(malformed.language, None);
        assert!(!malformed.reason.is_empty());
    }

    #[test]
    fn test_parse_descriptor_rejects_non_json() {
        let malformed = parse_descriptor("not json").unwrap_err();
        assert_eq!(malformed.job_id, None);
        assert_eq!(malformed.code_key, None);
    }

    #[tokio::test]
    async fn test_successful_job_reaches_completed() {
        let h = Harness::new(1);
        let (id, key, payload) = h.submit(b"  hello  ", None).await;

        let report = h.worker.process_batch(vec![payload]).await;

        assert_eq!(
            report,
            BatchReport {
                received: 1,
                completed: 1,
                failed: 0,
                dropped: 0
            }
        );
        let status = h.status_of(id).await;
        assert_eq!(status.status, JobStatus::Completed);
        let data = status.data.unwrap();
        assert_eq!(data.result.as_deref(), Some("hello"));
        assert_eq!(data.execution_time, Some(5));
        assert!(!h.blobs.contains(&key));
    }

    #[tokio::test]
    async fn test_failed_job_records_error_and_deletes_blob() {
        let h = Harness::new(1);
        let (id, key, payload) = h.submit(b"fail:NameError: x", None).await;

        let report = h.worker.process_batch(vec![payload]).await;

        assert_eq!(report.failed, 1);
        let status = h.status_of(id).await;
        assert_eq!(status.status, JobStatus::Failed);
        let data = status.data.unwrap();
        assert_eq!(data.error.as_deref(), Some("NameError: x"));
        assert_eq!(data.execution_time, Some(7));
        assert!(!h.blobs.contains(&key));
    }

    #[tokio::test]
    async fn test_descriptor_timeout_reaches_engine() {
        let h = Harness::new(1);
        let (_, _, payload) = h.submit(b"print(1)", Some(2000)).await;

        h.worker.process_batch(vec![payload]).await;

        let seen = h.engine.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![ExecutionOptions {
                timeout_ms: Some(2000),
                deadline: None
            }]
        );
    }

    #[tokio::test]
    async fn test_malformed_descriptor_does_not_stop_batch() {
        let h = Harness::new(1);
        let (good_id, _, good) = h.submit(b"ok", None).await;

        let salvage_id = Uuid::new_v4();
        let salvage_key = format!("jobs/{}/code.py", salvage_id);
        h.blobs.put(&salvage_key, b"print(1)").await.unwrap();
        let salvageable = format!(
            r#"{{"jobId":"{}","codeKey":"{}","language":"python"}}"#,
            salvage_id, salvage_key
        );

        let report = h
            .worker
            .process_batch(vec!["{not json".to_string(), salvageable, good])
            .await;

        assert_eq!(
            report,
            BatchReport {
                received: 3,
                completed: 1,
                failed: 1,
                dropped: 1
            }
        );
        assert_eq!(h.status_of(good_id).await.status, JobStatus::Completed);

        let salvaged = h.status_of(salvage_id).await;
        assert_eq!(salvaged.status, JobStatus::Failed);
        let data = salvaged.data.unwrap();
        assert!(data
            .error
            .unwrap()
            .starts_with("Malformed job descriptor"));
        assert_eq!(data.language.as_deref(), Some("python"));
        assert!(!h.blobs.contains(&salvage_key));
    }

    #[tokio::test]
    async fn test_panic_is_isolated_to_its_job() {
        let h = Harness::new(1);
        let (bad_id, bad_key, bad) = h.submit(b"panic", None).await;
        let (good_id, _, good) = h.submit(b"fine", None).await;

        let report = h.worker.process_batch(vec![bad, good]).await;

        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);

        let status = h.status_of(bad_id).await;
        assert_eq!(status.status, JobStatus::Failed);
        assert!(status
            .data
            .unwrap()
            .error
            .unwrap()
            .starts_with("Unexpected error during code execution"));
        assert!(!h.blobs.contains(&bad_key));
        assert_eq!(h.status_of(good_id).await.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_missing_blob_fails_job() {
        let h = Harness::new(1);
        let (id, key, payload) = h.submit(b"print(1)", None).await;
        h.blobs.delete(&key).await.unwrap();

        let report = h.worker.process_batch(vec![payload]).await;

        assert_eq!(report.failed, 1);
        let status = h.status_of(id).await;
        assert_eq!(status.status, JobStatus::Failed);
        assert!(status
            .data
            .unwrap()
            .error
            .unwrap()
            .starts_with("Failed to fetch source"));
        assert!(h.engine.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_utf8_source_fails_job() {
        let h = Harness::new(1);
        let (id, key, payload) = h.submit(&[0xff, 0xfe, 0x00], None).await;

        h.worker.process_batch(vec![payload]).await;

        let status = h.status_of(id).await;
        assert_eq!(status.status, JobStatus::Failed);
        assert!(status.data.unwrap().error.unwrap().contains("not valid UTF-8"));
        assert!(!h.blobs.contains(&key));
    }

    #[tokio::test]
    async fn test_unavailable_status_store_does_not_block_execution() {
        let h = Harness::new(1);
        let (_, key, payload) = h.submit(b"ok", None).await;
        h.status.set_unavailable(true);

        let report = h.worker.process_batch(vec![payload]).await;

        assert_eq!(report.completed, 1);
        assert!(!h.blobs.contains(&key));
    }

    #[tokio::test]
    async fn test_redelivered_descriptor_keeps_terminal_status() {
        let h = Harness::new(1);
        let (id, _, payload) = h.submit(b"first run", None).await;

        h.worker.process_batch(vec![payload.clone()]).await;
        // Blob is gone now, so the redelivery fails to fetch
        let report = h.worker.process_batch(vec![payload]).await;
        assert_eq!(report.failed, 1);

        let status = h.status_of(id).await;
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.data.unwrap().result.as_deref(), Some("first run"));
    }

    #[tokio::test]
    async fn test_batch_is_sequential_by_default() {
        let h = Harness::new(1);
        let mut payloads = Vec::new();
        for _ in 0..3 {
            payloads.push(h.submit(b"slow", None).await.2);
        }

        let report = h.worker.process_batch(payloads).await;

        assert_eq!(report.completed, 3);
        assert_eq!(h.engine.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrency_bounds_jobs_in_flight() {
        let h = Harness::new(3);
        let mut payloads = Vec::new();
        for _ in 0..6 {
            payloads.push(h.submit(b"slow", None).await.2);
        }

        let report = h.worker.process_batch(payloads).await;

        assert_eq!(report.completed, 6);
        assert_eq!(h.engine.max_in_flight.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_loop_drains_queue_until_shutdown() {
        let h = Harness::new(1);
        let queue = Arc::new(MemoryQueue::new());
        let (id, _, payload) = h.submit(b"queued", None).await;
        queue.push_raw(payload);

        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(h.worker.clone().run_loop(
            queue.clone(),
            10,
            Duration::from_millis(10),
            shutdown,
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Some(record)) = h.status.get(id).await {
                    if record.status.is_terminal() {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job processed");

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop stopped")
            .unwrap();

        assert_eq!(h.status_of(id).await.status, JobStatus::Completed);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }
}
