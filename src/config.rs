//! Configuration types for the loan-intake pipeline.
//!
//! All pipeline behaviour is controlled through [`IntakeConfig`], built via
//! its [`IntakeConfigBuilder`]. One struct holds every knob so it can be
//! shared read-only across the concurrent document tasks.
//!
//! The page windows ([`PageWindow`]) encode where the loan-application
//! template puts things: identifiers on page 3, declaration and attachment
//! sections on the last four pages. They are template conventions, so they
//! live here rather than in the orchestrator.

use crate::error::IntakeError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default model for both the loan application and the supporting images.
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20240620";

/// Field label the industry-license prompt answers under ("decision number").
pub const DEFAULT_INDUSTRY_LICENSE_FIELD: &str = "رقم القرار";

/// Field label the commercial-registration prompt answers under ("establishment number").
pub const DEFAULT_COMMERCIAL_REGISTRATION_FIELD: &str = "رقم المنشأة";

/// Configuration for one intake run.
///
/// # Example
/// ```rust
/// use loan_intake::{IntakeConfig, PageWindow};
///
/// let config = IntakeConfig::builder()
///     .dpi(200)
///     .concurrency(2)
///     .missing_field_pages(PageWindow::Last(3))
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 200);
/// ```
#[derive(Clone)]
pub struct IntakeConfig {
    /// Rendering DPI for every page. Range: 72–600. Default: 300.
    pub dpi: u32,

    /// Cap on either rendered dimension in pixels. Default: 3600.
    ///
    /// An A4 page at 300 DPI is 2480 × 3508 px; the cap only bites on
    /// oversized pages.
    pub max_rendered_pixels: u32,

    /// Number of concurrent per-page model calls inside one sub-task. Default: 4.
    pub concurrency: usize,

    /// LLM provider name (e.g. "anthropic", "openai").
    /// If None along with `provider`, the environment decides.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Model used for every loan-application call.
    pub document_model: String,

    /// Model used for the industry-license and commercial-registration images.
    pub supporting_model: String,

    /// Sampling parameters sent with every call.
    pub generation: GenerationParams,

    /// Output token budget for the two aggregation calls. Default: 10000.
    pub aggregation_max_tokens: usize,

    /// Retry attempts on a failed model call. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubling per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Per model call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Budget for one whole task (document-level or sub-task). Default: 600.
    ///
    /// A task that overruns is reported unavailable; its siblings are
    /// unaffected.
    pub task_timeout_secs: u64,

    /// Budget for the DOCX → PDF conversion. Default: 180.
    pub conversion_timeout_secs: u64,

    /// Directory holding `<name>.txt` prompt files. Default: `prompts`.
    pub prompts_dir: PathBuf,

    /// LibreOffice executable used for DOCX → PDF. Default: `soffice`.
    pub soffice_path: PathBuf,

    /// Directory containing the pdfium shared library. None = system library.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Pages sent to the identifier extraction. Default: page 3.
    pub identifier_pages: PageWindow,

    /// Pages scanned for blank fields. Default: last 4.
    pub missing_field_pages: PageWindow,

    /// Pages checked for self-contradictions. Default: all.
    pub inconsistency_pages: PageWindow,

    /// JSON key of the industry-license number in the supporting response.
    pub industry_license_field: String,

    /// JSON key of the commercial-registration number in the supporting response.
    pub commercial_registration_field: String,

    /// Apply digit-only normalisation to supporting-document values before
    /// comparing. Default: false (raw comparison).
    pub normalize_supporting_identifiers: bool,

    /// Attempts when removing a temporary file the OS still holds. Default: 3.
    pub cleanup_attempts: u32,

    /// Initial delay between removal attempts in milliseconds. Default: 100.
    pub cleanup_backoff_ms: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_rendered_pixels: 3600,
            concurrency: 4,
            provider_name: None,
            provider: None,
            document_model: DEFAULT_MODEL.to_string(),
            supporting_model: DEFAULT_MODEL.to_string(),
            generation: GenerationParams::default(),
            aggregation_max_tokens: 10_000,
            max_retries: 2,
            retry_backoff_ms: 500,
            api_timeout_secs: 120,
            task_timeout_secs: 600,
            conversion_timeout_secs: 180,
            prompts_dir: PathBuf::from("prompts"),
            soffice_path: PathBuf::from("soffice"),
            pdfium_lib_path: None,
            identifier_pages: PageWindow::Page(3),
            missing_field_pages: PageWindow::Last(4),
            inconsistency_pages: PageWindow::All,
            industry_license_field: DEFAULT_INDUSTRY_LICENSE_FIELD.to_string(),
            commercial_registration_field: DEFAULT_COMMERCIAL_REGISTRATION_FIELD.to_string(),
            normalize_supporting_identifiers: false,
            cleanup_attempts: 3,
            cleanup_backoff_ms: 100,
        }
    }
}

impl fmt::Debug for IntakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntakeConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("document_model", &self.document_model)
            .field("supporting_model", &self.supporting_model)
            .field("generation", &self.generation)
            .field("max_retries", &self.max_retries)
            .field("task_timeout_secs", &self.task_timeout_secs)
            .field("prompts_dir", &self.prompts_dir)
            .field("identifier_pages", &self.identifier_pages)
            .field("missing_field_pages", &self.missing_field_pages)
            .field("inconsistency_pages", &self.inconsistency_pages)
            .field(
                "normalize_supporting_identifiers",
                &self.normalize_supporting_identifiers,
            )
            .finish()
    }
}

impl IntakeConfig {
    /// Create a new builder for `IntakeConfig`.
    pub fn builder() -> IntakeConfigBuilder {
        IntakeConfigBuilder {
            config: Self::default(),
        }
    }

    /// Backoff schedule for remote model calls.
    pub fn call_backoff(&self) -> crate::retry::Backoff {
        crate::retry::Backoff::new(self.max_retries, self.retry_backoff_ms)
    }

    /// Backoff schedule for releasing temporary files.
    pub fn cleanup_backoff(&self) -> crate::retry::Backoff {
        crate::retry::Backoff::new(self.cleanup_attempts.saturating_sub(1), self.cleanup_backoff_ms)
    }
}

/// Builder for [`IntakeConfig`].
#[derive(Debug)]
pub struct IntakeConfigBuilder {
    config: IntakeConfig,
}

impl IntakeConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn document_model(mut self, model: impl Into<String>) -> Self {
        self.config.document_model = model.into();
        self
    }

    pub fn supporting_model(mut self, model: impl Into<String>) -> Self {
        self.config.supporting_model = model.into();
        self
    }

    pub fn generation(mut self, params: GenerationParams) -> Self {
        self.config.generation = params;
        self
    }

    pub fn aggregation_max_tokens(mut self, n: usize) -> Self {
        self.config.aggregation_max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn task_timeout_secs(mut self, secs: u64) -> Self {
        self.config.task_timeout_secs = secs;
        self
    }

    pub fn conversion_timeout_secs(mut self, secs: u64) -> Self {
        self.config.conversion_timeout_secs = secs;
        self
    }

    pub fn prompts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.prompts_dir = dir.into();
        self
    }

    pub fn soffice_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.soffice_path = path.into();
        self
    }

    pub fn pdfium_lib_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(dir.into());
        self
    }

    pub fn identifier_pages(mut self, window: PageWindow) -> Self {
        self.config.identifier_pages = window;
        self
    }

    pub fn missing_field_pages(mut self, window: PageWindow) -> Self {
        self.config.missing_field_pages = window;
        self
    }

    pub fn inconsistency_pages(mut self, window: PageWindow) -> Self {
        self.config.inconsistency_pages = window;
        self
    }

    pub fn industry_license_field(mut self, label: impl Into<String>) -> Self {
        self.config.industry_license_field = label.into();
        self
    }

    pub fn commercial_registration_field(mut self, label: impl Into<String>) -> Self {
        self.config.commercial_registration_field = label.into();
        self
    }

    pub fn normalize_supporting_identifiers(mut self, v: bool) -> Self {
        self.config.normalize_supporting_identifiers = v;
        self
    }

    pub fn cleanup_attempts(mut self, n: u32) -> Self {
        self.config.cleanup_attempts = n;
        self
    }

    pub fn cleanup_backoff_ms(mut self, ms: u64) -> Self {
        self.config.cleanup_backoff_ms = ms;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<IntakeConfig, IntakeError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(IntakeError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 {
            return Err(IntakeError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.task_timeout_secs == 0 || c.api_timeout_secs == 0 {
            return Err(IntakeError::InvalidConfig(
                "Timeouts must be at least 1 second".into(),
            ));
        }
        if c.cleanup_attempts == 0 {
            return Err(IntakeError::InvalidConfig(
                "Cleanup attempts must be ≥ 1".into(),
            ));
        }
        for (name, window) in [
            ("identifier_pages", &c.identifier_pages),
            ("missing_field_pages", &c.missing_field_pages),
            ("inconsistency_pages", &c.inconsistency_pages),
        ] {
            window
                .validate()
                .map_err(|why| IntakeError::InvalidConfig(format!("{name}: {why}")))?;
        }
        if c.document_model.trim().is_empty() || c.supporting_model.trim().is_empty() {
            return Err(IntakeError::InvalidConfig(
                "Model identifiers must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Sampling parameters for every model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Default: 0.1. Transcription wants faithful, near-deterministic output.
    pub temperature: f32,
    /// Nucleus-sampling cutoff. Default: 0.999.
    pub top_p: f32,
    /// Output budget for a per-page call. Default: 4000.
    pub max_tokens: usize,
    /// Default: `["\n\nHuman"]`.
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.999,
            max_tokens: 4000,
            stop_sequences: vec!["\n\nHuman".to_string()],
        }
    }
}

/// Which pages of the rendered document a sub-task consumes.
///
/// Page numbers are 1-indexed, as a reader of the form would count them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageWindow {
    /// Every page (default).
    #[default]
    All,
    /// One page (1-indexed).
    Page(usize),
    /// The first N pages.
    First(usize),
    /// The last N pages.
    Last(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
}

impl PageWindow {
    /// Expand the window into ascending 0-indexed page positions.
    ///
    /// Windows that reach past the document are clipped; an empty result
    /// means the window selects nothing in this document.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        match self {
            PageWindow::All => (0..total_pages).collect(),
            PageWindow::Page(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageWindow::First(n) => (0..(*n).min(total_pages)).collect(),
            PageWindow::Last(n) => (total_pages.saturating_sub(*n)..total_pages).collect(),
            PageWindow::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            PageWindow::Page(0) => Err("pages are 1-indexed".into()),
            PageWindow::First(0) | PageWindow::Last(0) => Err("window must cover ≥ 1 page".into()),
            PageWindow::Range(s, e) if *s == 0 || s > e => {
                Err(format!("invalid range {s}-{e}"))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for PageWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageWindow::All => write!(f, "all pages"),
            PageWindow::Page(p) => write!(f, "page {p}"),
            PageWindow::First(n) => write!(f, "first {n} pages"),
            PageWindow::Last(n) => write!(f, "last {n} pages"),
            PageWindow::Range(s, e) => write!(f, "pages {s}-{e}"),
        }
    }
}
