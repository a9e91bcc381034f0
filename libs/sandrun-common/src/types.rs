use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ErrorKind, ExecutionError};

/// Output reported for a program that exited 0 without writing to stdout.
/// Distinguishes "ran, produced nothing" from "did not run".
pub const NO_OUTPUT_PLACEHOLDER: &str = "Program executed successfully (no output)";

/// Strongly-typed language enum
/// Closed set - every other identifier is rejected before any resource is allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Cpp,
    Java,
    Python,
    JavaScript,
}

impl Language {
    /// Returns all language variants
    /// This is the single source of truth for available languages
    pub fn all_variants() -> &'static [Language] {
        &[
            Language::Cpp,
            Language::Java,
            Language::Python,
            Language::JavaScript,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Python => "python",
            Language::JavaScript => "javascript",
        }
    }
}

impl FromStr for Language {
    type Err = ExecutionError;

    /// Case-insensitive parse
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpp" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            "python" => Ok(Language::Python),
            "javascript" => Ok(Language::JavaScript),
            _ => Err(ExecutionError::UnsupportedLanguage(s.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job State Machine
/// queued -> active -> {completed | failed}, never out of a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Active => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    /// Whether a record in `self` may be overwritten by one in `next`.
    ///
    /// Re-writing the same non-terminal state is allowed so a redelivered
    /// descriptor can mark its job active again.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Queued payload handed from the submission path to workers
///
/// `language` stays a raw string: an unknown identifier is the orchestrator's
/// to reject, so the job can still be attributed and marked failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub job_id: Uuid,
    pub language: String,
    pub code_key: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Optional payload attached to a status record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_key: Option<String>,
}

/// Status-store value, expires a fixed window after its last write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: JobStatus,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<StatusData>,
}

impl StatusRecord {
    fn new(status: JobStatus, data: Option<StatusData>) -> Self {
        Self {
            status,
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
        }
    }

    pub fn queued(language: &str, code_key: &str) -> Self {
        Self::new(
            JobStatus::Queued,
            Some(StatusData {
                language: Some(language.to_string()),
                code_key: Some(code_key.to_string()),
                ..Default::default()
            }),
        )
    }

    pub fn active() -> Self {
        Self::new(JobStatus::Active, None)
    }

    pub fn completed(result: String, execution_time: u64, language: &str) -> Self {
        Self::new(
            JobStatus::Completed,
            Some(StatusData {
                result: Some(result),
                execution_time: Some(execution_time),
                language: Some(language.to_string()),
                ..Default::default()
            }),
        )
    }

    pub fn failed(error: String, execution_time: Option<u64>, language: &str) -> Self {
        Self::new(
            JobStatus::Failed,
            Some(StatusData {
                error: Some(error),
                execution_time,
                language: Some(language.to_string()),
                ..Default::default()
            }),
        )
    }

    /// Terminal record for an orchestrator result
    pub fn from_result(result: &ExecutionResult, language: &str) -> Self {
        if result.success {
            Self::completed(
                result.output.clone().unwrap_or_default(),
                result.duration_ms,
                language,
            )
        } else {
            Self::failed(
                result.error.clone().unwrap_or_default(),
                Some(result.duration_ms),
                language,
            )
        }
    }
}

/// Outcome of running one job through the orchestrator
/// Exactly one of `output` / `error` is populated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ExecutionResult {
    pub fn succeeded(output: String, duration_ms: u64) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            duration_ms,
            error_kind: None,
        }
    }

    pub fn failed(error: &ExecutionError, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.to_string()),
            duration_ms,
            error_kind: Some(error.kind()),
        }
    }
}
