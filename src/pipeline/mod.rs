//! Pipeline stages for loan-application intake.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap implementations (e.g. a different model provider) without touching
//! other stages.
//!
//! ## Data Flow
//!
//! ```text
//!  docx ──▶ office ──┐
//! (fixup)  (soffice) ▼
//!          pdf ──▶ render ──▶ encode ──▶ llm ──▶ parse
//!                  (pdfium)   (base64)   (VLM)   (JSON)
//! ```
//!
//! 1. [`docx`]    — force table cells to stay on one page
//! 2. [`office`]  — DOCX → PDF through headless LibreOffice
//! 3. [`render`]  — rasterise every page; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 4. [`encode`]  — flatten onto white, JPEG-encode and base64-wrap
//! 5. [`llm`]     — the model call with timeout and retry/backoff; the only
//!    stage with network I/O
//! 6. [`parse`]   — turn model replies into identifiers and field lists
//!
//! [`scratch`] owns the temporary files the office stage needs.

pub mod docx;
pub mod encode;
pub mod llm;
pub mod office;
pub mod parse;
pub mod render;
pub mod scratch;
