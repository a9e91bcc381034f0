//! Language Registry - static compile/execute strategy table
//!
//! Every entry is plain data. Command arguments are handlebars templates
//! resolved against the concrete artifact paths at call time; the available
//! variables are `source`, `executable`, `directory` and `stem`.

use handlebars::Handlebars;
use serde::Serialize;
use std::time::Duration;

use crate::error::ExecutionError;
use crate::types::Language;

/// How the source file for a job is named
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    /// `code_{jobId}.{ext}` directly in the scratch directory
    JobScoped,
    /// The toolchain requires the file to be named after a class declared in
    /// the source; the file lives in a per-job directory so the mandated name
    /// cannot collide with another job.
    DeclaredClass { default: &'static str },
}

/// One phase of a language strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: &'static str,
    pub args: &'static [&'static str],
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageConfig {
    pub language: Language,
    pub extension: &'static str,
    /// Present only for ahead-of-time compiled languages
    pub compile: Option<CommandSpec>,
    pub execute: CommandSpec,
    /// Default wall-clock ceiling advertised in job descriptors
    pub default_timeout_ms: u64,
    /// Memory ceiling label, enforced by the surrounding sandbox
    pub memory_limit: &'static str,
    pub entry_point: EntryPoint,
    /// Toolchain outputs sharing the source's stem (e.g. `Main.class`)
    pub derived_extensions: &'static [&'static str],
    /// Advisory pattern a plausible submission is expected to match
    pub structure_hint: &'static str,
}

static LANGUAGES: [LanguageConfig; 4] = [
    LanguageConfig {
        language: Language::Cpp,
        extension: "cpp",
        compile: Some(CommandSpec {
            program: "g++",
            args: &["-std=c++17", "-O2", "-o", "{{executable}}", "{{source}}"],
            timeout_ms: 30_000,
        }),
        execute: CommandSpec {
            program: "{{executable}}",
            args: &[],
            timeout_ms: 15_000,
        },
        default_timeout_ms: 30_000,
        memory_limit: "512m",
        entry_point: EntryPoint::JobScoped,
        derived_extensions: &[],
        structure_hint: r"(?m)^#include\s+<[^>]+>|^using\s+namespace\s+std;|int\s+main\s*\(",
    },
    LanguageConfig {
        language: Language::Java,
        extension: "java",
        compile: Some(CommandSpec {
            program: "javac",
            args: &["{{source}}"],
            timeout_ms: 30_000,
        }),
        execute: CommandSpec {
            program: "java",
            args: &["-cp", "{{directory}}", "{{stem}}"],
            timeout_ms: 15_000,
        },
        default_timeout_ms: 60_000,
        memory_limit: "1g",
        entry_point: EntryPoint::DeclaredClass { default: "Main" },
        derived_extensions: &["class"],
        structure_hint: r"(?m)class\s+\w+|public\s+static\s+void\s+main",
    },
    LanguageConfig {
        language: Language::Python,
        extension: "py",
        compile: None,
        execute: CommandSpec {
            program: "python3",
            args: &["{{source}}"],
            timeout_ms: 15_000,
        },
        default_timeout_ms: 30_000,
        memory_limit: "512m",
        entry_point: EntryPoint::JobScoped,
        derived_extensions: &[],
        structure_hint: r"(?m)^(def|import|from|print|if|for|while)",
    },
    LanguageConfig {
        language: Language::JavaScript,
        extension: "js",
        compile: None,
        execute: CommandSpec {
            program: "node",
            args: &["{{source}}"],
            timeout_ms: 15_000,
        },
        default_timeout_ms: 30_000,
        memory_limit: "512m",
        entry_point: EntryPoint::JobScoped,
        derived_extensions: &[],
        structure_hint: r"(?m)^(function|const|let|var|console\.log)",
    },
];

/// Static entry for a known language
pub fn config_for(language: Language) -> &'static LanguageConfig {
    match language {
        Language::Cpp => &LANGUAGES[0],
        Language::Java => &LANGUAGES[1],
        Language::Python => &LANGUAGES[2],
        Language::JavaScript => &LANGUAGES[3],
    }
}

/// Resolve a raw identifier, failing fast on anything outside the closed set
pub fn lookup(language: &str) -> Result<&'static LanguageConfig, ExecutionError> {
    language.parse::<Language>().map(config_for)
}

/// Artifact paths a command template may reference
#[derive(Debug, Clone, Serialize)]
pub struct TemplateContext {
    pub source: String,
    pub executable: String,
    pub directory: String,
    pub stem: String,
}

/// A command with every template resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ResolvedCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Shell-like rendering for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Owns the template renderer; the table itself is static
pub struct LanguageRegistry {
    renderer: Handlebars<'static>,
}

impl LanguageRegistry {
    pub fn new() -> Self {
        let mut renderer = Handlebars::new();
        renderer.set_strict_mode(true);
        renderer.register_escape_fn(handlebars::no_escape);
        Self { renderer }
    }

    pub fn resolve(&self, language: &str) -> Result<&'static LanguageConfig, ExecutionError> {
        lookup(language)
    }

    pub fn render(
        &self,
        spec: &CommandSpec,
        ctx: &TemplateContext,
    ) -> Result<ResolvedCommand, ExecutionError> {
        let program = self.render_one(spec.program, ctx)?;
        let args = spec
            .args
            .iter()
            .map(|arg| self.render_one(arg, ctx))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ResolvedCommand::new(
            program,
            args,
            Duration::from_millis(spec.timeout_ms),
        ))
    }

    fn render_one(&self, template: &str, ctx: &TemplateContext) -> Result<String, ExecutionError> {
        self.renderer
            .render_template(template, ctx)
            .map_err(|e| ExecutionError::Artifact(format!("invalid command template {}: {}", template, e)))
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext {
            source: "/tmp/sandrun/code_42.cpp".to_string(),
            executable: "/tmp/sandrun/code_42".to_string(),
            directory: "/tmp/sandrun".to_string(),
            stem: "code_42".to_string(),
        }
    }

    #[test]
    fn test_every_language_has_an_entry() {
        for lang in Language::all_variants() {
            assert_eq!(config_for(*lang).language, *lang);
        }
    }

    #[test]
    fn test_compile_step_only_for_compiled_languages() {
        assert!(config_for(Language::Cpp).compile.is_some());
        assert!(config_for(Language::Java).compile.is_some());
        assert!(config_for(Language::Python).compile.is_none());
        assert!(config_for(Language::JavaScript).compile.is_none());
    }

    #[test]
    fn test_lookup_unknown_language() {
        assert!(matches!(
            lookup("brainfuck"),
            Err(ExecutionError::UnsupportedLanguage(_))
        ));
        assert_eq!(lookup("CPP").unwrap().extension, "cpp");
    }

    #[test]
    fn test_render_cpp_commands() {
        let registry = LanguageRegistry::new();
        let cpp = config_for(Language::Cpp);

        let compile = registry.render(cpp.compile.as_ref().unwrap(), &ctx()).unwrap();
        assert_eq!(compile.program, "g++");
        assert_eq!(
            compile.args,
            vec![
                "-std=c++17",
                "-O2",
                "-o",
                "/tmp/sandrun/code_42",
                "/tmp/sandrun/code_42.cpp"
            ]
        );
        assert_eq!(compile.timeout, Duration::from_millis(30_000));

        let execute = registry.render(&cpp.execute, &ctx()).unwrap();
        assert_eq!(execute.program, "/tmp/sandrun/code_42");
        assert!(execute.args.is_empty());
    }

    #[test]
    fn test_render_does_not_html_escape_paths() {
        let registry = LanguageRegistry::new();
        let mut ctx = ctx();
        ctx.directory = "/tmp/a&b".to_string();
        ctx.stem = "Main".to_string();

        let java = config_for(Language::Java);
        let execute = registry.render(&java.execute, &ctx).unwrap();
        assert_eq!(execute.args, vec!["-cp", "/tmp/a&b", "Main"]);
    }

    #[test]
    fn test_render_rejects_unknown_variable() {
        let registry = LanguageRegistry::new();
        let spec = CommandSpec {
            program: "{{interpreter}}",
            args: &[],
            timeout_ms: 1,
        };
        assert!(matches!(
            registry.render(&spec, &ctx()),
            Err(ExecutionError::Artifact(_))
        ));
    }
}
