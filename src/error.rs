//! Error types for the loan-intake library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`IntakeError`] — **Fatal to one document task**: the loan application
//!   cannot be rasterised at all (unsupported extension, corrupt PDF, office
//!   conversion failed) or the pipeline cannot be assembled (provider not
//!   configured, bad config). It never aborts sibling tasks; the top-level
//!   pipeline turns it into an "unavailable" state in the final report.
//!
//! * [`TaskError`] — **Non-fatal**: one sub-task or one page failed (remote
//!   call error, model output not JSON, timeout). Stored inside the result
//!   types so the report always renders whatever succeeded.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors for a single document task.
#[derive(Debug, Error)]
pub enum IntakeError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The uploaded document is neither a PDF nor a DOCX file.
    #[error("Unsupported file type for '{name}'. Please upload a PDF or DOCX file.")]
    UnsupportedFormat { name: String },

    /// The document is unreadable: bad magic bytes, broken PDF structure,
    /// or the renderer reported zero pages.
    #[error("'{name}' is not a valid document or is corrupted: {detail}")]
    CorruptInput { name: String, detail: String },

    /// DOCX → PDF conversion failed or produced an empty/unrenderable PDF.
    #[error("DOCX to PDF conversion failed for '{name}': {detail}")]
    ConversionFailure { name: String, detail: String },

    /// Reading an upload from disk failed.
    #[error("Failed to read '{path}': {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Prompt errors ─────────────────────────────────────────────────────
    /// No prompt file exists for the logical task name.
    #[error("Prompt '{name}' not found at '{path}'")]
    PromptNotFound { name: String, path: PathBuf },

    /// The prompt file exists but could not be read or is empty.
    #[error("Prompt '{name}' at '{path}' is unreadable: {detail}")]
    PromptUnreadable {
        name: String,
        path: PathBuf,
        detail: String,
    },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install libpdfium system-wide, or point PDFIUM_LIB_PATH at the directory\n\
containing libpdfium.so / libpdfium.dylib / pdfium.dll."
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error owned by one sub-task or one page.
///
/// Stored inside [`crate::output::PageExtraction`],
/// [`crate::output::FieldStatus`] and friends rather than propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum TaskError {
    /// The remote model call failed after retries.
    #[error("model '{model}' call failed after {retries} retries: {detail}")]
    Upstream {
        model: String,
        retries: u32,
        detail: String,
    },

    /// The model answered, but not with the structured data we asked for.
    #[error("{task}: model output is not valid structured data: {detail}")]
    Parse { task: String, detail: String },

    /// The task did not finish within its time budget.
    #[error("{task} timed out after {secs}s")]
    Timeout { task: String, secs: u64 },

    /// The task's page window selects nothing in this document.
    #[error("{task}: page window selects no pages (document has {total} pages)")]
    PageOutOfRange { task: String, total: usize },

    /// Page image could not be encoded for transport.
    #[error("page {page}: image encoding failed: {detail}")]
    Encode { page: usize, detail: String },

    /// The task's prompt template could not be loaded.
    #[error("prompt unavailable: {0}")]
    Prompt(String),

    /// The document itself could not be processed.
    #[error("document unavailable: {0}")]
    Document(String),

    /// The upload this task needs was not provided.
    #[error("no {0} uploaded")]
    NotProvided(String),
}

impl From<&IntakeError> for TaskError {
    fn from(e: &IntakeError) -> Self {
        match e {
            IntakeError::PromptNotFound { .. } | IntakeError::PromptUnreadable { .. } => {
                TaskError::Prompt(e.to_string())
            }
            other => TaskError::Document(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_format_display() {
        let e = IntakeError::UnsupportedFormat {
            name: "form.xlsx".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("form.xlsx"), "got: {msg}");
        assert!(msg.contains("PDF or DOCX"));
    }

    #[test]
    fn upstream_display() {
        let e = TaskError::Upstream {
            model: "claude-3-5-sonnet-20240620".into(),
            retries: 2,
            detail: "503 Service Unavailable".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("claude-3-5-sonnet"));
        assert!(msg.contains("2 retries"));
    }

    #[test]
    fn prompt_errors_map_to_prompt_task_error() {
        let e = IntakeError::PromptNotFound {
            name: "missing".into(),
            path: PathBuf::from("prompts/missing.txt"),
        };
        assert!(matches!(TaskError::from(&e), TaskError::Prompt(_)));
    }

    #[test]
    fn document_errors_map_to_document_task_error() {
        let e = IntakeError::CorruptInput {
            name: "a.pdf".into(),
            detail: "zero pages".into(),
        };
        match TaskError::from(&e) {
            TaskError::Document(msg) => assert!(msg.contains("a.pdf")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn task_error_roundtrips_through_json() {
        let e = TaskError::Timeout {
            task: "missing-fields".into(),
            secs: 30,
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: TaskError = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }
}
