// CLI commands for running and inspecting Sandrun jobs
use anyhow::{bail, Context, Result};
use sandrun_common::guard::SubmissionGuard;
use sandrun_common::languages::{config_for, CommandSpec};
use sandrun_common::redis::RedisBackend;
use sandrun_common::store::StatusStore;
use sandrun_common::{Config, Language};
use sandrun_engine::{ExecutionOptions, Orchestrator};
use std::fs;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Read a source file as UTF-8 text
fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn validate_file(
    guard: &SubmissionGuard,
    language: &str,
    path: &Path,
) -> Result<(Language, String)> {
    let code = read_source(path)?;
    let language = guard.validate(&code, language)?;
    Ok((language, code))
}

/// Execute a file through the same pipeline the worker uses
pub async fn run_file(
    language: &str,
    path: &Path,
    timeout_ms: Option<u64>,
    structure_check: bool,
    json: bool,
) -> Result<()> {
    let config = Config::from_env();
    let guard = SubmissionGuard::new(
        config.max_code_chars,
        structure_check && config.structure_check,
    );
    let (language, code) = validate_file(&guard, language, path)?;

    fs::create_dir_all(&config.scratch_dir)
        .with_context(|| format!("Failed to create {}", config.scratch_dir.display()))?;

    let orchestrator = Orchestrator::from_config(&config);
    let options = ExecutionOptions {
        timeout_ms,
        deadline: Some(Duration::from_millis(config.sync_deadline_ms)),
    };
    let result = orchestrator
        .execute_with(&code, language.as_str(), Uuid::new_v4(), options)
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.success {
        println!("{}", result.output.as_deref().unwrap_or_default());
        println!("\n✅ Completed in {}ms", result.duration_ms);
    } else {
        println!("{}", result.error.as_deref().unwrap_or_default());
        println!("\n❌ Failed after {}ms", result.duration_ms);
    }

    if !result.success {
        let kind = result.error_kind.map(|k| k.as_str()).unwrap_or("unknown");
        bail!("Execution failed ({})", kind);
    }

    Ok(())
}

/// Run the submission guard against a file
pub fn check_file(language: &str, path: &Path) -> Result<()> {
    let config = Config::from_env();
    let guard = SubmissionGuard::new(config.max_code_chars, config.structure_check);
    let (language, code) = validate_file(&guard, language, path)?;

    println!(
        "✅ {} passes validation ({} characters, language {})",
        path.display(),
        code.chars().count(),
        language
    );
    Ok(())
}

fn describe(spec: &CommandSpec) -> String {
    std::iter::once(spec.program)
        .chain(spec.args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// One table row per supported language
fn language_rows() -> Vec<String> {
    Language::all_variants()
        .iter()
        .map(|lang| {
            let config = config_for(*lang);
            let compile = config
                .compile
                .as_ref()
                .map(describe)
                .unwrap_or_else(|| "-".to_string());
            format!(
                "{:<12} {:<6} {:<50} {:<30} {:>8}ms {:<6}",
                lang.as_str(),
                config.extension,
                compile,
                describe(&config.execute),
                config.default_timeout_ms,
                config.memory_limit
            )
        })
        .collect()
}

pub fn list_languages() {
    println!("📋 Supported Languages:\n");
    println!(
        "{:<12} {:<6} {:<50} {:<30} {:>10} {:<6}",
        "Name", "Ext", "Compile", "Execute", "Timeout", "Memory"
    );
    println!("{}", "─".repeat(120));

    let rows = language_rows();
    for row in &rows {
        println!("{}", row);
    }

    println!("\n✅ Total: {} language(s)", rows.len());
}

/// Print the stored status record of a job
pub async fn show_status(job_id: &str) -> Result<()> {
    let job_id = Uuid::parse_str(job_id).with_context(|| format!("Invalid job id: {}", job_id))?;

    let config = Config::from_env();
    let backend = RedisBackend::open(
        &config.redis_url,
        Duration::from_secs(config.status_ttl_secs),
        Duration::from_secs(config.blob_ttl_secs),
    )?;

    let Some(record) = backend.get(job_id).await? else {
        println!("❓ Job {} not found (unknown or expired)", job_id);
        return Ok(());
    };

    println!("Job:       {}", job_id);
    println!("Status:    {}", record.status);
    println!("Timestamp: {}", record.timestamp);

    if let Some(data) = record.data {
        if let Some(language) = data.language {
            println!("Language:  {}", language);
        }
        if let Some(ms) = data.execution_time {
            println!("Duration:  {}ms", ms);
        }
        if let Some(result) = data.result {
            println!("\n{}", result);
        }
        if let Some(error) = data.error {
            println!("\n{}", error);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn source_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_validate_file_accepts_plausible_source() {
        let file = source_file("print('hi')\n");
        let (language, code) =
            validate_file(&SubmissionGuard::default(), "python", file.path()).unwrap();
        assert_eq!(language, Language::Python);
        assert_eq!(code, "print('hi')\n");
    }

    #[test]
    fn test_validate_file_surfaces_guard_message() {
        let file = source_file("hello there");
        let err = validate_file(&SubmissionGuard::default(), "python", file.path()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Code appears to have syntax issues. Please check your python syntax."
        );
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = read_source(Path::new("/definitely/not/here.py")).unwrap_err();
        assert!(err.to_string().starts_with("Failed to read"));
    }

    #[test]
    fn test_language_rows_cover_every_language() {
        let rows = language_rows();
        assert_eq!(rows.len(), Language::all_variants().len());
        assert!(rows[0].contains("g++ -std=c++17 -O2 -o {{executable}} {{source}}"));
        assert!(rows.iter().any(|row| row.starts_with("javascript")));
    }
}
