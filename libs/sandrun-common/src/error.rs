//! Error taxonomy shared by the submission path, the engine and the worker.
//!
//! Validation errors never create a job. Execution errors are captured per job
//! and become a failed status. Infrastructure errors come from the blob store,
//! queue or status store; whether they are fatal depends on the call site.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::Language;

/// Sub-step of running one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Compile,
    Execute,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Compile => f.write_str("Compilation"),
            Phase::Execute => f.write_str("Execution"),
        }
    }
}

/// Coarse classification surfaced to callers alongside the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Validation,
    Compile,
    Runtime,
    Timeout,
    Launch,
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Compile => "compile",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Launch => "launch",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

/// Rejections raised before a job exists
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Code is required. Please provide code to execute.")]
    EmptyCode,
    #[error("Code exceeds the maximum size of {max} characters.")]
    CodeTooLarge { max: usize },
    #[error("Language {0} is not supported.")]
    UnsupportedLanguage(String),
    #[error("Code appears to have syntax issues. Please check your {0} syntax.")]
    StructureCheck(Language),
}

impl ValidationError {
    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::EmptyCode => "empty_code",
            ValidationError::CodeTooLarge { .. } => "code_too_large",
            ValidationError::UnsupportedLanguage(_) => "unsupported_language",
            ValidationError::StructureCheck(_) => "structure_check",
        }
    }
}

/// Per-job failures produced by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    /// Compiler diagnostic text
    #[error("{0}")]
    Compile(String),
    /// Interpreter traceback or program stderr
    #[error("{0}")]
    Runtime(String),
    #[error("{phase} timed out after {timeout_ms}ms")]
    Timeout { phase: Phase, timeout_ms: u64 },
    /// The outer deadline of the whole-pipeline variant fired
    #[error("Code execution timed out after {timeout_ms}ms")]
    DeadlineExceeded { timeout_ms: u64 },
    #[error("Failed to launch {program}: {message}")]
    Launch { program: String, message: String },
    #[error("Failed to prepare execution: {0}")]
    Artifact(String),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::UnsupportedLanguage(_) => ErrorKind::Validation,
            ExecutionError::Compile(_) => ErrorKind::Compile,
            ExecutionError::Runtime(_) => ErrorKind::Runtime,
            ExecutionError::Timeout { .. } | ExecutionError::DeadlineExceeded { .. } => {
                ErrorKind::Timeout
            }
            ExecutionError::Launch { .. } => ErrorKind::Launch,
            ExecutionError::Artifact(_) => ErrorKind::Infrastructure,
        }
    }
}

/// Blob store, queue or status store call failed
#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("blob not found: {0}")]
    BlobNotFound(String),
    #[error("blob {0} is not valid UTF-8")]
    InvalidEncoding(String),
    #[error("{0}")]
    Unavailable(String),
}
