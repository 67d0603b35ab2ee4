//! Prompt templates, one text file per logical task.
//!
//! Prompts are authored by the business side (Arabic and English field
//! labels, per-template instructions) and change far more often than code,
//! so they live on disk in `prompts/<name>.txt` rather than as constants.
//! The file content is sent upstream verbatim apart from trimming the
//! surrounding whitespace.

use crate::error::IntakeError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// General loan-application extraction; also used for the identifier page.
pub const LOAN_APPLICATION: &str = "loan_application";
/// Per-page blank-field detection.
pub const MISSING_FIELDS: &str = "missing";
/// Consolidates the per-page blank-field results.
pub const MISSING_SUMMARY: &str = "missing_result";
/// Consolidates per-page extractions into self-contradictions.
pub const INCONSISTENCY: &str = "inconsistent";
/// Industry-license image extraction.
pub const INDUSTRY_LICENSE: &str = "il_prompt";
/// Commercial-registration image extraction.
pub const COMMERCIAL_REGISTRATION: &str = "cr_prompt";

/// Every prompt the pipeline may ask for.
pub const ALL: [&str; 6] = [
    LOAN_APPLICATION,
    MISSING_FIELDS,
    MISSING_SUMMARY,
    INCONSISTENCY,
    INDUSTRY_LICENSE,
    COMMERCIAL_REGISTRATION,
];

/// Loads prompt text blobs from a directory keyed by logical task name.
#[derive(Debug, Clone)]
pub struct PromptStore {
    dir: PathBuf,
}

impl PromptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.txt"))
    }

    /// Load the prompt for `name`.
    pub async fn load(&self, name: &str) -> Result<String, IntakeError> {
        let path = self.path_for(name);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IntakeError::PromptNotFound {
                    name: name.to_string(),
                    path,
                });
            }
            Err(e) => {
                return Err(IntakeError::PromptUnreadable {
                    name: name.to_string(),
                    path,
                    detail: e.to_string(),
                });
            }
        };

        let prompt = text.trim();
        if prompt.is_empty() {
            return Err(IntakeError::PromptUnreadable {
                name: name.to_string(),
                path,
                detail: "file is empty".into(),
            });
        }
        debug!("Loaded prompt '{}' ({} chars)", name, prompt.len());
        Ok(prompt.to_string())
    }

    /// Names whose prompt file is absent. Handy for a startup check.
    pub fn missing(&self) -> Vec<&'static str> {
        ALL.iter()
            .copied()
            .filter(|name| !self.path_for(name).is_file())
            .collect()
    }
}
