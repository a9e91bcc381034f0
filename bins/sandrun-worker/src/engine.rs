/// Execution Engine - seam between the batch loop and the pipeline
///
/// The worker only needs "run this code in this language and give me one
/// result". Keeping that behind a trait lets the batch loop be exercised with
/// a scripted engine, without compilers or interpreters on the test host.

use async_trait::async_trait;
use sandrun_common::ExecutionResult;
use sandrun_engine::{ExecutionOptions, Orchestrator};
use uuid::Uuid;

/// Any implementation must:
/// 1. Never return an error; failures are folded into the result
/// 2. Honor `options.timeout_ms` as an upper bound on run time
/// 3. Leave nothing behind in the scratch area
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        language: &str,
        job_id: Uuid,
        options: ExecutionOptions,
    ) -> ExecutionResult;
}

#[async_trait]
impl ExecutionEngine for Orchestrator {
    async fn execute(
        &self,
        code: &str,
        language: &str,
        job_id: Uuid,
        options: ExecutionOptions,
    ) -> ExecutionResult {
        self.execute_with(code, language, job_id, options).await
    }
}
