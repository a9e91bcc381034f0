//! Artifact Manager - per-job files in the shared scratch directory
//!
//! Ownership of the scratch directory is partitioned by file name: every
//! generated name embeds the job id, either directly (`code_{id}.py`) or via a
//! per-job directory when the toolchain dictates the file name
//! (`job-{id}/Main.java`). No locking is involved.
//!
//! [`Artifacts`] is a scope guard. [`ArtifactManager::release`] removes everything
//! the job may have produced; if the guard is dropped without being released
//! (for example when an outer deadline cancels the pipeline) the same cleanup
//! runs synchronously in `Drop`.

use lazy_static::lazy_static;
use regex::Regex;
use sandrun_common::languages::{EntryPoint, LanguageConfig, TemplateContext};
use sandrun_common::ExecutionError;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const JOB_DIR_PREFIX: &str = "job-";

lazy_static! {
    static ref PUBLIC_CLASS: Regex =
        Regex::new(r"\bpublic\s+(?:(?:final|abstract|strictfp)\s+)*class\s+([A-Za-z_][A-Za-z0-9_]*)")
            .expect("public class pattern is valid");
    static ref ANY_CLASS: Regex =
        Regex::new(r"\bclass\s+([A-Za-z_][A-Za-z0-9_]*)").expect("class pattern is valid");
}

/// Heuristic: the first public class, else the first class, else `default`
pub fn declared_class_name(code: &str, default: &str) -> String {
    PUBLIC_CLASS
        .captures(code)
        .or_else(|| ANY_CLASS.captures(code))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| default.to_string())
}

/// What a cleanup pass did; failures are recorded, never raised
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn attempt(&mut self, path: &Path, result: io::Result<()>) {
        match result {
            Ok(()) => self.removed.push(path.to_path_buf()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => self.failures.push((path.to_path_buf(), e.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactManager {
    scratch_dir: PathBuf,
}

impl ArtifactManager {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Deterministic source path for a job
    pub fn source_path(&self, code: &str, config: &LanguageConfig, job_id: Uuid) -> PathBuf {
        match config.entry_point {
            EntryPoint::JobScoped => self
                .scratch_dir
                .join(format!("code_{}.{}", job_id, config.extension)),
            EntryPoint::DeclaredClass { default } => self
                .scratch_dir
                .join(format!("{}{}", JOB_DIR_PREFIX, job_id))
                .join(format!("{}.{}", declared_class_name(code, default), config.extension)),
        }
    }

    /// Write the job's source into the scratch directory
    ///
    /// The file is written beside its final path and renamed into place, so
    /// a reader never observes a partial source.
    pub async fn materialize(
        &self,
        code: &str,
        config: &'static LanguageConfig,
        job_id: Uuid,
    ) -> Result<Artifacts, ExecutionError> {
        let source = self.source_path(code, config, job_id);
        let job_dir = match config.entry_point {
            EntryPoint::JobScoped => None,
            EntryPoint::DeclaredClass { .. } => source.parent().map(Path::to_path_buf),
        };

        let parent = source.parent().unwrap_or(&self.scratch_dir).to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| ExecutionError::Artifact(format!("{}: {}", parent.display(), e)))?;

        // From here on the guard owns whatever lands on disk
        let artifacts = Artifacts {
            source,
            job_dir,
            derived_extensions: config.derived_extensions,
            released: false,
        };

        let partial = artifacts.partial_path();
        tokio::fs::write(&partial, code)
            .await
            .map_err(|e| ExecutionError::Artifact(format!("{}: {}", partial.display(), e)))?;
        tokio::fs::rename(&partial, &artifacts.source)
            .await
            .map_err(|e| ExecutionError::Artifact(format!("{}: {}", artifacts.source.display(), e)))?;

        debug!(path = %artifacts.source.display(), "Materialized source");
        Ok(artifacts)
    }

    /// Explicit end of a job's artifact scope; runs [`cleanup`](Self::cleanup)
    /// off the async executor
    pub async fn release(&self, mut artifacts: Artifacts) -> CleanupReport {
        artifacts.released = true;
        let manager = self.clone();
        let source = artifacts.source.clone();
        let derived = artifacts.derived_extensions;

        tokio::task::spawn_blocking(move || manager.cleanup(&source, derived))
            .await
            .unwrap_or_else(|e| {
                let mut report = CleanupReport::default();
                report.failures.push((artifacts.source.clone(), e.to_string()));
                report
            })
    }

    /// Best-effort removal of a source file and everything derived from it
    pub fn cleanup(&self, source: &Path, derived_extensions: &[&str]) -> CleanupReport {
        let job_dir = source
            .parent()
            .filter(|dir| *dir != self.scratch_dir && is_job_dir(dir))
            .map(Path::to_path_buf);
        remove_artifacts(source, derived_extensions, job_dir.as_deref())
    }
}

fn is_job_dir(dir: &Path) -> bool {
    dir.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with(JOB_DIR_PREFIX))
        .unwrap_or(false)
}

/// Every removal is attempted independently of the others
fn remove_artifacts(
    source: &Path,
    derived_extensions: &[&str],
    job_dir: Option<&Path>,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    report.attempt(source, std::fs::remove_file(source));

    let partial = partial_path_of(source);
    report.attempt(&partial, std::fs::remove_file(&partial));

    // Compiled executable: same stem, no extension
    let executable = source.with_extension("");
    if executable != source {
        report.attempt(&executable, std::fs::remove_file(&executable));
    }

    for ext in derived_extensions {
        let derived = source.with_extension(ext);
        report.attempt(&derived, std::fs::remove_file(&derived));
    }

    // Catches toolchain outputs not known by name, e.g. nested Java classes
    if let Some(dir) = job_dir {
        report.attempt(dir, std::fs::remove_dir_all(dir));
    }

    for (path, error) in &report.failures {
        warn!(path = %path.display(), error = %error, "Failed to remove artifact");
    }

    report
}

fn partial_path_of(source: &Path) -> PathBuf {
    let mut name = OsString::from(source.as_os_str());
    name.push(".partial");
    PathBuf::from(name)
}

/// The files one job owns while it runs
#[derive(Debug)]
pub struct Artifacts {
    source: PathBuf,
    job_dir: Option<PathBuf>,
    derived_extensions: &'static [&'static str],
    released: bool,
}

impl Artifacts {
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn executable(&self) -> PathBuf {
        self.source.with_extension("")
    }

    fn partial_path(&self) -> PathBuf {
        partial_path_of(&self.source)
    }

    pub fn template_context(&self) -> TemplateContext {
        let directory = self
            .source
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = self
            .source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        TemplateContext {
            source: self.source.to_string_lossy().into_owned(),
            executable: self.executable().to_string_lossy().into_owned(),
            directory,
            stem,
        }
    }
}

impl Drop for Artifacts {
    fn drop(&mut self) {
        if !self.released {
            debug!(path = %self.source.display(), "Releasing artifacts on drop");
            remove_artifacts(&self.source, self.derived_extensions, self.job_dir.as_deref());
        }
    }
}
