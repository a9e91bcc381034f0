/// Pre-submission Guard
///
/// Cheap checks run before a job, blob or queue message exists. The
/// structural pattern is a heuristic filter for plainly wrong submissions;
/// passing it says nothing about whether the code compiles.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

use crate::error::ValidationError;
use crate::languages::config_for;
use crate::types::Language;

pub const MAX_CODE_CHARS: usize = 10_000;

lazy_static! {
    static ref STRUCTURE_PATTERNS: HashMap<Language, Regex> = Language::all_variants()
        .iter()
        .map(|lang| {
            let pattern = Regex::new(config_for(*lang).structure_hint)
                .expect("structure hint is a valid regex");
            (*lang, pattern)
        })
        .collect();
}

#[derive(Debug, Clone)]
pub struct SubmissionGuard {
    max_code_chars: usize,
    structure_check: bool,
}

impl SubmissionGuard {
    pub fn new(max_code_chars: usize, structure_check: bool) -> Self {
        Self {
            max_code_chars,
            structure_check,
        }
    }

    /// Validate a submission, returning the parsed language on success
    ///
    /// Checks run in order: empty, oversized, unsupported, structure.
    pub fn validate(&self, code: &str, language: &str) -> Result<Language, ValidationError> {
        if code.trim().is_empty() {
            return Err(ValidationError::EmptyCode);
        }

        if code.chars().count() > self.max_code_chars {
            return Err(ValidationError::CodeTooLarge {
                max: self.max_code_chars,
            });
        }

        let lang: Language = language
            .parse()
            .map_err(|_| ValidationError::UnsupportedLanguage(language.to_string()))?;

        if self.structure_check && !looks_plausible(code, lang) {
            return Err(ValidationError::StructureCheck(lang));
        }

        Ok(lang)
    }
}

impl Default for SubmissionGuard {
    fn default() -> Self {
        Self::new(MAX_CODE_CHARS, true)
    }
}

/// Whether `code` contains the constructs expected of a `language` program
pub fn looks_plausible(code: &str, language: Language) -> bool {
    STRUCTURE_PATTERNS
        .get(&language)
        .map(|re| re.is_match(code))
        .unwrap_or(true)
}
