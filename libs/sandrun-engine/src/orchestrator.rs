/// Execution Orchestrator
///
/// Drives one job through: resolve language -> materialize source ->
/// compile (if any) -> execute -> cleanup, and folds whatever happened into a
/// single `ExecutionResult`. Cleanup runs on every exit path; if the whole
/// call is cancelled by an outer deadline, the artifact guard and
/// kill-on-drop children take care of it.

use sandrun_common::languages::{LanguageConfig, LanguageRegistry};
use sandrun_common::types::NO_OUTPUT_PLACEHOLDER;
use sandrun_common::{Config, ExecutionError, ExecutionResult, Phase};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactManager, Artifacts};
use crate::supervisor::ProcessSupervisor;

/// Per-call overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Caps the execute-phase deadline (descriptor `timeout`); zero is ignored
    pub timeout_ms: Option<u64>,
    /// Races the whole pipeline, compile and execute included
    pub deadline: Option<Duration>,
}

pub struct Orchestrator {
    registry: LanguageRegistry,
    artifacts: ArtifactManager,
    supervisor: ProcessSupervisor,
}

impl Orchestrator {
    pub fn new(artifacts: ArtifactManager, supervisor: ProcessSupervisor) -> Self {
        Self {
            registry: LanguageRegistry::new(),
            artifacts,
            supervisor,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            ArtifactManager::new(config.scratch_dir.clone()),
            ProcessSupervisor::new(config.output_limit_bytes),
        )
    }

    pub async fn execute(&self, code: &str, language: &str, job_id: Uuid) -> ExecutionResult {
        self.execute_with(code, language, job_id, ExecutionOptions::default())
            .await
    }

    /// Whole-pipeline variant used by the synchronous entry point
    pub async fn execute_within(
        &self,
        code: &str,
        language: &str,
        job_id: Uuid,
        deadline: Duration,
    ) -> ExecutionResult {
        let options = ExecutionOptions {
            deadline: Some(deadline),
            ..Default::default()
        };
        self.execute_with(code, language, job_id, options).await
    }

    pub async fn execute_with(
        &self,
        code: &str,
        language: &str,
        job_id: Uuid,
        options: ExecutionOptions,
    ) -> ExecutionResult {
        // Unknown languages fail before any file or process exists
        match self.registry.resolve(language) {
            Ok(config) => self.run(code, config, job_id, options).await,
            Err(e) => {
                warn!(job_id = %job_id, language = language, "Unsupported language");
                ExecutionResult::failed(&e, 0)
            }
        }
    }

    /// Run with an explicit language strategy
    pub async fn run(
        &self,
        code: &str,
        config: &'static LanguageConfig,
        job_id: Uuid,
        options: ExecutionOptions,
    ) -> ExecutionResult {
        let Some(deadline) = options.deadline else {
            return self.pipeline(code, config, job_id, options).await;
        };

        let started = Instant::now();
        match tokio::time::timeout(deadline, self.pipeline(code, config, job_id, options)).await {
            Ok(result) => result,
            Err(_) => {
                // Dropping the pipeline killed the child and released the artifacts
                warn!(
                    job_id = %job_id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Execution exceeded outer deadline"
                );
                let err = ExecutionError::DeadlineExceeded {
                    timeout_ms: deadline.as_millis() as u64,
                };
                ExecutionResult::failed(&err, elapsed_ms(started))
            }
        }
    }

    async fn pipeline(
        &self,
        code: &str,
        config: &'static LanguageConfig,
        job_id: Uuid,
        options: ExecutionOptions,
    ) -> ExecutionResult {
        let started = Instant::now();

        let artifacts = match self.artifacts.materialize(code, config, job_id).await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to materialize source");
                return ExecutionResult::failed(&e, elapsed_ms(started));
            }
        };

        let outcome = self.run_phases(config, &artifacts, options).await;
        let duration_ms = elapsed_ms(started);

        let report = self.artifacts.release(artifacts).await;
        debug!(
            job_id = %job_id,
            removed = report.removed.len(),
            failures = report.failures.len(),
            "Artifacts released"
        );

        match outcome {
            Ok(stdout) => {
                info!(job_id = %job_id, language = %config.language, duration_ms, "Execution succeeded");
                let output = if stdout.is_empty() {
                    NO_OUTPUT_PLACEHOLDER.to_string()
                } else {
                    stdout
                };
                ExecutionResult::succeeded(output, duration_ms)
            }
            Err(e) => {
                info!(
                    job_id = %job_id,
                    language = %config.language,
                    duration_ms,
                    kind = e.kind().as_str(),
                    "Execution failed"
                );
                ExecutionResult::failed(&e, duration_ms)
            }
        }
    }

    async fn run_phases(
        &self,
        config: &LanguageConfig,
        artifacts: &Artifacts,
        options: ExecutionOptions,
    ) -> Result<String, ExecutionError> {
        let ctx = artifacts.template_context();

        if let Some(compile) = &config.compile {
            let command = self.registry.render(compile, &ctx)?;
            debug!(command = %command.display(), "Compiling");
            self.supervisor
                .run(&command)
                .await
                .into_result(Phase::Compile)?;
        }

        let mut command = self.registry.render(&config.execute, &ctx)?;
        if let Some(cap) = options.timeout_ms.filter(|ms| *ms > 0) {
            command.timeout = command.timeout.min(Duration::from_millis(cap));
        }

        debug!(command = %command.display(), "Executing");
        let output = self
            .supervisor
            .run(&command)
            .await
            .into_result(Phase::Execute)?;

        if output.truncated {
            warn!(program = %command.program, "Program output truncated");
        }

        Ok(output.stdout)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use sandrun_common::languages::{CommandSpec, EntryPoint};
    use sandrun_common::{ErrorKind, Language};
    use std::path::Path;

    /// Interpreted strategy driven by /bin/sh
    static SHELL: LanguageConfig = LanguageConfig {
        language: Language::Python,
        extension: "sh",
        compile: None,
        execute: CommandSpec {
            program: "sh",
            args: &["{{source}}"],
            timeout_ms: 5_000,
        },
        default_timeout_ms: 5_000,
        memory_limit: "64m",
        entry_point: EntryPoint::JobScoped,
        derived_extensions: &[],
        structure_hint: "",
    };

    /// Compiled strategy: `sh -n` is the syntax check, the copy is the binary.
    /// The execute step leaves a marker so tests can tell whether it ran.
    static SHELL_COMPILED: LanguageConfig = LanguageConfig {
        language: Language::Cpp,
        extension: "sh",
        compile: Some(CommandSpec {
            program: "sh",
            args: &["-c", "sh -n {{source}} && cp {{source}} {{executable}}"],
            timeout_ms: 5_000,
        }),
        execute: CommandSpec {
            program: "sh",
            args: &["-c", "touch {{directory}}/executed && sh {{executable}}"],
            timeout_ms: 5_000,
        },
        default_timeout_ms: 5_000,
        memory_limit: "64m",
        entry_point: EntryPoint::JobScoped,
        derived_extensions: &[],
        structure_hint: "",
    };

    /// Name mandated by a declared identifier, like javac
    static SHELL_CLASS: LanguageConfig = LanguageConfig {
        language: Language::Java,
        extension: "sh",
        compile: Some(CommandSpec {
            program: "cp",
            args: &["{{source}}", "{{directory}}/{{stem}}.class"],
            timeout_ms: 5_000,
        }),
        execute: CommandSpec {
            program: "sh",
            args: &["{{directory}}/{{stem}}.class"],
            timeout_ms: 5_000,
        },
        default_timeout_ms: 5_000,
        memory_limit: "64m",
        entry_point: EntryPoint::DeclaredClass { default: "Main" },
        derived_extensions: &["class"],
        structure_hint: "",
    };

    fn orchestrator(scratch: &Path) -> Orchestrator {
        Orchestrator::new(ArtifactManager::new(scratch), ProcessSupervisor::default())
    }

    fn scratch_entries(scratch: &Path) -> usize {
        std::fs::read_dir(scratch).map(|rd| rd.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_hello_world() {
        let scratch = tempfile::tempdir().unwrap();
        let result = orchestrator(scratch.path())
            .run("echo hello world", &SHELL, Uuid::new_v4(), ExecutionOptions::default())
            .await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.output.as_deref(), Some("hello world"));
        assert!(result.error.is_none());
        assert_eq!(scratch_entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_empty_stdout_yields_placeholder() {
        let scratch = tempfile::tempdir().unwrap();
        let result = orchestrator(scratch.path())
            .run("true", &SHELL, Uuid::new_v4(), ExecutionOptions::default())
            .await;

        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some(NO_OUTPUT_PLACEHOLDER));
    }

    #[tokio::test]
    async fn test_runtime_error_surfaces_stderr() {
        let scratch = tempfile::tempdir().unwrap();
        let result = orchestrator(scratch.path())
            .run(
                "echo 'Traceback: boom' >&2; exit 1",
                &SHELL,
                Uuid::new_v4(),
                ExecutionOptions::default(),
            )
            .await;

        assert!(!result.success);
        assert!(result.output.is_none());
        assert_eq!(result.error.as_deref(), Some("Traceback: boom"));
        assert_eq!(result.error_kind, Some(ErrorKind::Runtime));
        assert_eq!(scratch_entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_compile_then_execute() {
        let scratch = tempfile::tempdir().unwrap();
        let result = orchestrator(scratch.path())
            .run("echo compiled", &SHELL_COMPILED, Uuid::new_v4(), ExecutionOptions::default())
            .await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.output.as_deref(), Some("compiled"));

        // Source and executable gone; only the test marker is left
        let left: Vec<_> = std::fs::read_dir(scratch.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(left, vec!["executed"]);
    }

    #[tokio::test]
    async fn test_compile_failure_skips_execute() {
        let scratch = tempfile::tempdir().unwrap();
        let result = orchestrator(scratch.path())
            .run(
                "if true; then echo unterminated",
                &SHELL_COMPILED,
                Uuid::new_v4(),
                ExecutionOptions::default(),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Compile));
        // The diagnostic comes from the syntax checker
        assert!(!result.error.unwrap_or_default().is_empty());
        assert!(!scratch.path().join("executed").exists());
        assert_eq!(scratch_entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_execute_timeout_is_enforced_and_cleaned() {
        let scratch = tempfile::tempdir().unwrap();
        let options = ExecutionOptions {
            timeout_ms: Some(300),
            deadline: None,
        };

        let started = Instant::now();
        let result = orchestrator(scratch.path())
            .run("while :; do :; done", &SHELL, Uuid::new_v4(), options)
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(result.error.as_deref(), Some("Execution timed out after 300ms"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.duration_ms >= 300);
        assert_eq!(scratch_entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_descriptor_timeout_only_lowers_deadline() {
        let scratch = tempfile::tempdir().unwrap();
        let options = ExecutionOptions {
            timeout_ms: Some(60_000),
            deadline: None,
        };

        let result = orchestrator(scratch.path())
            .run("sleep 30", &SHELL, Uuid::new_v4(), options)
            .await;

        // The language's own 5s execute deadline still applies
        assert_eq!(result.error.as_deref(), Some("Execution timed out after 5000ms"));
    }

    #[tokio::test]
    async fn test_outer_deadline_reaps_and_cleans() {
        let scratch = tempfile::tempdir().unwrap();
        let options = ExecutionOptions {
            timeout_ms: None,
            deadline: Some(Duration::from_millis(300)),
        };

        let started = Instant::now();
        let result = orchestrator(scratch.path())
            .run("sleep 30", &SHELL, Uuid::new_v4(), options)
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(
            result.error.as_deref(),
            Some("Code execution timed out after 300ms")
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(scratch_entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_unsupported_language_allocates_nothing() {
        let scratch = tempfile::tempdir().unwrap();
        let result = orchestrator(scratch.path())
            .execute("print(1)", "cobol", Uuid::new_v4())
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Unsupported language: cobol"));
        assert_eq!(result.error_kind, Some(ErrorKind::Validation));
        assert_eq!(result.duration_ms, 0);
        assert_eq!(scratch_entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_launch_error_when_toolchain_missing() {
        static MISSING: LanguageConfig = LanguageConfig {
            language: Language::Cpp,
            extension: "x",
            compile: Some(CommandSpec {
                program: "/nonexistent/toolchain/cc",
                args: &["{{source}}"],
                timeout_ms: 5_000,
            }),
            execute: CommandSpec {
                program: "{{executable}}",
                args: &[],
                timeout_ms: 5_000,
            },
            default_timeout_ms: 5_000,
            memory_limit: "64m",
            entry_point: EntryPoint::JobScoped,
            derived_extensions: &[],
            structure_hint: "",
        };

        let scratch = tempfile::tempdir().unwrap();
        let result = orchestrator(scratch.path())
            .run("int main(){}", &MISSING, Uuid::new_v4(), ExecutionOptions::default())
            .await;

        assert_eq!(result.error_kind, Some(ErrorKind::Launch));
        assert!(result.error.unwrap().starts_with("Failed to launch /nonexistent/toolchain/cc"));
        assert_eq!(scratch_entries(scratch.path()), 0);
    }

    #[tokio::test]
    async fn test_concurrent_jobs_do_not_interfere() {
        let scratch = tempfile::tempdir().unwrap();
        let orch = orchestrator(scratch.path());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        // Same mandated name for both jobs
        let code_a = "# class Greeter\nsleep 0.2; cat \"$0\" | head -1; echo a";
        let code_b = "# class Greeter\nsleep 0.1; echo b";

        let (ra, rb) = tokio::join!(
            orch.run(code_a, &SHELL_CLASS, a, ExecutionOptions::default()),
            orch.run(code_b, &SHELL_CLASS, b, ExecutionOptions::default()),
        );

        assert_eq!(ra.output.as_deref(), Some("# class Greeter\na"));
        assert_eq!(rb.output.as_deref(), Some("b"));
        assert_eq!(scratch_entries(scratch.path()), 0);
    }

    /// Real toolchains, skipped when not installed on the host
    #[tokio::test]
    async fn test_hello_world_on_installed_toolchains() {
        let programs: [(Language, &[(&str, &str)], &str); 4] = [
            (
                Language::Cpp,
                &[("g++", "--version")],
                "#include <iostream>\nint main() { std::cout << \"Hello, World!\" << std::endl; return 0; }",
            ),
            (
                Language::Java,
                &[("javac", "-version"), ("java", "-version")],
                "public class Hello { public static void main(String[] args) { System.out.println(\"Hello, World!\"); } }",
            ),
            (
                Language::Python,
                &[("python3", "--version")],
                "print('Hello, World!')",
            ),
            (
                Language::JavaScript,
                &[("node", "--version")],
                "console.log('Hello, World!')",
            ),
        ];

        let scratch = tempfile::tempdir().unwrap();
        let orch = orchestrator(scratch.path());

        for (language, toolchains, code) in programs {
            // Both the compiler and the runtime must actually start
            let missing = toolchains.iter().find(|(program, flag)| {
                !std::process::Command::new(program)
                    .arg(flag)
                    .output()
                    .map(|out| out.status.success())
                    .unwrap_or(false)
            });
            if let Some((program, _)) = missing {
                eprintln!("skipping {}: {} not usable", language, program);
                continue;
            }

            let result = orch.execute(code, language.as_str(), Uuid::new_v4()).await;
            assert!(result.success, "{}: {:?}", language, result);
            assert_eq!(result.output.as_deref(), Some("Hello, World!"));
            assert_eq!(scratch_entries(scratch.path()), 0);
        }
    }
}
