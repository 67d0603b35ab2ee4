//! Top-level intake entry point.
//!
//! One run takes the loan application plus up to two supporting images and
//! fans out three document-level tasks:
//!
//! ```text
//!            ┌─ loan application ──▶ FieldExtractor (3 sub-tasks) ─┐
//! upload ────┼─ industry license ──▶ supporting extraction ────────┼─▶ reconcile ─▶ IntakeReport
//!            └─ commercial reg.  ──▶ supporting extraction ────────┘
//! ```
//!
//! The join barrier waits for all three. Nothing a single task does can
//! fail the run: every failure ends up as an explicit unavailable state in
//! the [`IntakeReport`].

use crate::config::IntakeConfig;
use crate::document::{SupportingImage, UploadedDocument};
use crate::error::{IntakeError, TaskError};
use crate::orchestrator::FieldExtractor;
use crate::output::{
    CombinedResult, FieldStatus, IdentifierKind, IntakeReport, IntakeStats, TokenUsage,
};
use crate::pipeline::llm::{ExtractionClient, VisionClient};
use crate::prompts::PromptStore;
use crate::reconcile::reconcile;
use crate::supporting::extract_supporting;
use image::DynamicImage;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Everything the user uploaded for one application.
#[derive(Debug, Clone)]
pub struct IntakeUpload {
    pub application: UploadedDocument,
    pub industry_license: Option<SupportingImage>,
    pub commercial_registration: Option<SupportingImage>,
}

impl IntakeUpload {
    pub fn new(application: UploadedDocument) -> Self {
        Self {
            application,
            industry_license: None,
            commercial_registration: None,
        }
    }

    pub fn with_industry_license(mut self, image: SupportingImage) -> Self {
        self.industry_license = Some(image);
        self
    }

    pub fn with_commercial_registration(mut self, image: SupportingImage) -> Self {
        self.commercial_registration = Some(image);
        self
    }

    /// Read all uploads from disk.
    pub async fn from_paths(
        application: &Path,
        industry_license: Option<&Path>,
        commercial_registration: Option<&Path>,
    ) -> Result<Self, IntakeError> {
        let mut upload = Self::new(UploadedDocument::read(application).await?);
        if let Some(path) = industry_license {
            upload.industry_license = Some(SupportingImage::read(path).await?);
        }
        if let Some(path) = commercial_registration {
            upload.commercial_registration = Some(SupportingImage::read(path).await?);
        }
        Ok(upload)
    }
}

/// The assembled pipeline: one client, one prompt store, one config.
pub struct IntakePipeline {
    client: Arc<dyn ExtractionClient>,
    extractor: FieldExtractor,
    prompts: PromptStore,
    config: IntakeConfig,
}

impl IntakePipeline {
    pub fn new(client: Arc<dyn ExtractionClient>, prompts: PromptStore, config: IntakeConfig) -> Self {
        let extractor = FieldExtractor::new(Arc::clone(&client), prompts.clone(), config.clone());
        Self {
            client,
            extractor,
            prompts,
            config,
        }
    }

    /// Resolve model providers and the prompt directory from `config`.
    pub fn from_config(config: IntakeConfig) -> Result<Self, IntakeError> {
        let client = VisionClient::from_config(&config)?;
        let prompts = PromptStore::new(&config.prompts_dir);
        let missing = prompts.missing();
        if !missing.is_empty() {
            warn!(
                "Prompt directory {} lacks: {}",
                prompts.dir().display(),
                missing.join(", ")
            );
        }
        Ok(Self::new(Arc::new(client), prompts, config))
    }

    pub fn config(&self) -> &IntakeConfig {
        &self.config
    }

    /// Process one upload end to end. Always returns a report.
    pub async fn run(&self, upload: &IntakeUpload) -> IntakeReport {
        self.run_with(upload, self.extractor.process(&upload.application))
            .await
    }

    /// Like [`run`](Self::run), for a loan application the caller has
    /// already rendered to page images (scans, a cached rasterisation).
    /// `upload.application` only supplies the document name.
    pub async fn run_rendered(&self, upload: &IntakeUpload, pages: Vec<DynamicImage>) -> IntakeReport {
        let document = async move { Ok(self.extractor.process_pages(pages).await) };
        self.run_with(upload, document).await
    }

    async fn run_with(
        &self,
        upload: &IntakeUpload,
        document: impl Future<Output = Result<CombinedResult, IntakeError>>,
    ) -> IntakeReport {
        let total_start = Instant::now();
        info!("Starting intake: {}", upload.application.name);

        // The document task may spend up to the conversion budget before its
        // sub-tasks start their own clocks.
        let document_budget = self
            .config
            .task_timeout_secs
            .saturating_add(self.config.conversion_timeout_secs);
        let supporting_budget = self.config.task_timeout_secs;

        let (document, industry, commercial) = tokio::join!(
            bounded("document", document_budget, document),
            bounded(
                "industry-license",
                supporting_budget,
                extract_supporting(
                    IdentifierKind::IndustrialLicense,
                    upload.industry_license.as_ref(),
                    self.client.as_ref(),
                    &self.prompts,
                    &self.config,
                )
            ),
            bounded(
                "commercial-registration",
                supporting_budget,
                extract_supporting(
                    IdentifierKind::CommercialRegister,
                    upload.commercial_registration.as_ref(),
                    self.client.as_ref(),
                    &self.prompts,
                    &self.config,
                )
            ),
        );

        let mut usage = TokenUsage::default();

        let (document, document_error) = match document {
            Ok(Ok(result)) => (Ok(result), None),
            Ok(Err(e)) => {
                warn!("Loan application failed: {}", e);
                (Err(TaskError::from(&e)), Some(e.to_string()))
            }
            Err(e) => (Err(e.clone()), Some(e.to_string())),
        };

        let mut supporting = |outcome: Result<(FieldStatus<String>, TokenUsage), TaskError>| match outcome {
            Ok((status, u)) => {
                usage.merge(u);
                status
            }
            Err(e) => FieldStatus::unavailable(e),
        };
        let industry = supporting(industry);
        let commercial = supporting(commercial);

        let normalize = self.config.normalize_supporting_identifiers;
        let (missing_fields, inconsistent_fields, industry_license, commercial_registration) =
            match &document {
                Ok(result) => {
                    usage.merge(result.usage);
                    (
                        result.missing.missing_data.clone(),
                        result.inconsistencies.clone(),
                        reconcile(
                            IdentifierKind::IndustrialLicense,
                            result.identifiers.identifier(IdentifierKind::IndustrialLicense),
                            &industry,
                            normalize,
                        ),
                        reconcile(
                            IdentifierKind::CommercialRegister,
                            result.identifiers.identifier(IdentifierKind::CommercialRegister),
                            &commercial,
                            normalize,
                        ),
                    )
                }
                Err(reason) => (
                    FieldStatus::unavailable(reason.clone()),
                    FieldStatus::unavailable(reason.clone()),
                    reconcile(IdentifierKind::IndustrialLicense, None, &industry, normalize),
                    reconcile(IdentifierKind::CommercialRegister, None, &commercial, normalize),
                ),
            };

        let total_duration_ms = total_start.elapsed().as_millis() as u64;
        info!(
            "Intake complete: {} model calls, {} input / {} output tokens, {}ms",
            usage.calls, usage.input_tokens, usage.output_tokens, total_duration_ms
        );

        IntakeReport {
            document_name: upload.application.name.clone(),
            document: document.ok(),
            document_error,
            missing_fields,
            inconsistent_fields,
            industry_license,
            commercial_registration,
            stats: IntakeStats {
                total_duration_ms,
                usage,
            },
        }
    }
}

async fn bounded<T>(task: &str, secs: u64, fut: impl Future<Output = T>) -> Result<T, TaskError> {
    info!("{} task started", task);
    match tokio::time::timeout(Duration::from_secs(secs), fut).await {
        Ok(v) => Ok(v),
        Err(_) => {
            warn!("{} task timed out after {}s", task, secs);
            Err(TaskError::Timeout {
                task: task.to_string(),
                secs,
            })
        }
    }
}
