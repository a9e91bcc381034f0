pub mod types;
pub mod error;
pub mod languages;
pub mod guard;
pub mod store;
pub mod memory;
pub mod redis;
pub mod config;

// Re-export commonly used types for convenience
pub use types::{ExecutionResult, JobDescriptor, JobStatus, Language, StatusRecord};
pub use error::{ErrorKind, ExecutionError, InfrastructureError, Phase, ValidationError};
pub use config::Config;
