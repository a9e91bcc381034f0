//! Execution pipeline: artifact lifecycle, process supervision and the
//! orchestrator that sequences them for one job.

pub mod artifact;
pub mod supervisor;
pub mod orchestrator;

pub use artifact::{ArtifactManager, Artifacts, CleanupReport};
pub use orchestrator::{ExecutionOptions, Orchestrator};
pub use supervisor::{CapturedOutput, ProcessOutcome, ProcessSupervisor};
