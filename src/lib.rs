//! # loan-intake
//!
//! Check a loan application against its supporting licences using Vision
//! Language Models (VLMs).
//!
//! ## What it does
//!
//! A loan application arrives as a PDF or DOCX form, together with photos
//! of the applicant's industry license and commercial registration. This
//! crate rasterises the form, asks a vision model to read it page by page,
//! and reports:
//!
//! - fields left blank on the form,
//! - fields that contradict each other,
//! - whether the registration numbers written on the form match the ones on
//!   the supporting certificates.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / DOCX
//!  │
//!  ├─ 1. Fixup   keep DOCX table rows on one page, convert with LibreOffice
//!  ├─ 2. Render  rasterise pages via pdfium at 300 DPI (spawn_blocking)
//!  ├─ 3. Encode  flatten on white → JPEG → base64
//!  ├─ 4. VLM     identifier / missing-field / inconsistency sub-tasks, concurrent
//!  ├─ 5. Parse   tolerant JSON parsing into typed outcomes
//!  └─ 6. Check   reconcile identifiers with the supporting images
//! ```
//!
//! Every stage can fail on its own without aborting the others: the
//! [`IntakeReport`] always comes back, with explicit "unavailable" states
//! where something went wrong.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use loan_intake::{IntakeConfig, IntakePipeline, IntakeUpload};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from ANTHROPIC_API_KEY / OPENAI_API_KEY / …
//!     let pipeline = IntakePipeline::from_config(IntakeConfig::default())?;
//!     let upload = IntakeUpload::from_paths(
//!         Path::new("application.docx"),
//!         Some(Path::new("industry_license.jpg")),
//!         Some(Path::new("commercial_registration.png")),
//!     )
//!     .await?;
//!     let report = pipeline.run(&upload).await;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `loan-intake` binary (clap + anyhow + tracing-subscriber + indicatif + dotenvy) |
//!
//! ## External tools
//!
//! - **pdfium** shared library, found via `IntakeConfig::pdfium_lib_path`,
//!   `PDFIUM_LIB_PATH` or the system library path.
//! - **LibreOffice** (`soffice`) for DOCX input only.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod intake;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod prompts;
pub mod reconcile;
pub mod retry;
pub mod supporting;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{GenerationParams, IntakeConfig, IntakeConfigBuilder, PageWindow};
pub use document::{DocumentFormat, SupportingImage, UploadedDocument};
pub use error::{IntakeError, TaskError};
pub use intake::{IntakePipeline, IntakeUpload};
pub use orchestrator::{ExtractionTask, FieldExtractor, TaskKind};
pub use output::{
    CombinedResult, ExtractionOutcome, FieldList, FieldStatus, IdentifierCheck, IdentifierKind,
    IdentifierPair, IntakeReport, ReconciliationVerdict,
};
pub use pipeline::llm::{ExtractionClient, ExtractionRequest, ModelReply, VisionClient};
pub use prompts::PromptStore;
pub use reconcile::reconcile;
