//! Field extraction over a rasterised loan application.
//!
//! [`FieldExtractor::process_pages`] runs three independent sub-tasks over
//! the page images and joins them:
//!
//! | Sub-task | Pages (default) | Prompt | Aggregation |
//! |---|---|---|---|
//! | identifier extraction | page 3 | `loan_application` | none, parsed directly |
//! | missing fields | last 4 | `missing` | `missing_result` |
//! | inconsistency check | all | `loan_application` | `inconsistent` |
//!
//! Sub-tasks share nothing but the read-only page images and the client.
//! Each is bounded by `task_timeout_secs`; a failed or timed-out sub-task
//! only degrades its own part of the [`CombinedResult`].

use crate::config::IntakeConfig;
use crate::document::UploadedDocument;
use crate::error::{IntakeError, TaskError};
use crate::output::{
    CombinedResult, EncodedImage, ExtractionOutcome, FieldList, FieldStatus, MissingFieldsReport,
    PageExtraction, TokenUsage,
};
use crate::pipeline::encode::encode_page;
use crate::pipeline::llm::{ExtractionClient, ExtractionRequest};
use crate::pipeline::parse::{parse_field_list, parse_identifiers};
use crate::pipeline::render::rasterize;
use crate::prompts::{self, PromptStore};
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What an [`ExtractionTask`] is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    IdentifierExtraction,
    MissingFields,
    InconsistencyCheck,
    /// One call over one uploaded image (industry license, commercial registration).
    SingleDocumentExtraction,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::IdentifierExtraction => "identifier-extraction",
            TaskKind::MissingFields => "missing-fields",
            TaskKind::InconsistencyCheck => "inconsistency-check",
            TaskKind::SingleDocumentExtraction => "single-document-extraction",
        }
    }
}

/// A planned unit of model work. Built once, never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionTask {
    pub kind: TaskKind,
    /// 0-indexed pages, ascending. Empty for single-document tasks.
    pub pages: Vec<usize>,
    /// Prompt sent with each page (or with the single image).
    pub prompt: &'static str,
    /// Prompt for the aggregation call over the per-page replies.
    pub summary_prompt: Option<&'static str>,
    pub model: String,
    pub max_tokens: usize,
}

impl ExtractionTask {
    fn out_of_range(&self, total: usize) -> TaskError {
        TaskError::PageOutOfRange {
            task: self.kind.name().to_string(),
            total,
        }
    }
}

/// Plan the three document sub-tasks for a document of `page_count` pages.
pub fn plan(config: &IntakeConfig, page_count: usize) -> [ExtractionTask; 3] {
    let task = |kind, window: &crate::config::PageWindow, prompt, summary_prompt| ExtractionTask {
        kind,
        pages: window.to_indices(page_count),
        prompt,
        summary_prompt,
        model: config.document_model.clone(),
        max_tokens: config.generation.max_tokens,
    };
    [
        task(
            TaskKind::IdentifierExtraction,
            &config.identifier_pages,
            prompts::LOAN_APPLICATION,
            None,
        ),
        task(
            TaskKind::MissingFields,
            &config.missing_field_pages,
            prompts::MISSING_FIELDS,
            Some(prompts::MISSING_SUMMARY),
        ),
        task(
            TaskKind::InconsistencyCheck,
            &config.inconsistency_pages,
            prompts::LOAN_APPLICATION,
            Some(prompts::INCONSISTENCY),
        ),
    ]
}

/// Per-page fan-out result of an aggregating sub-task.
struct Aggregated {
    pages: Vec<PageExtraction>,
    report: FieldStatus<FieldList>,
    usage: TokenUsage,
}

type EncodedPages = Vec<Result<EncodedImage, TaskError>>;

/// Drives rasterisation and the three extraction sub-tasks.
pub struct FieldExtractor {
    client: Arc<dyn ExtractionClient>,
    prompts: PromptStore,
    config: IntakeConfig,
}

impl FieldExtractor {
    pub fn new(client: Arc<dyn ExtractionClient>, prompts: PromptStore, config: IntakeConfig) -> Self {
        Self {
            client,
            prompts,
            config,
        }
    }

    /// Rasterise `document` and extract everything from its pages.
    pub async fn process(&self, document: &UploadedDocument) -> Result<CombinedResult, IntakeError> {
        let pages = rasterize(document, &self.config).await?;
        Ok(self.process_pages(pages).await)
    }

    /// Run the three sub-tasks over already rendered pages.
    pub async fn process_pages(&self, pages: Vec<DynamicImage>) -> CombinedResult {
        let page_count = pages.len();
        let encoded = encode_all(pages).await;
        let [identifier_task, missing_task, inconsistency_task] = plan(&self.config, page_count);

        let (identifiers, missing, inconsistencies) = tokio::join!(
            self.bounded(identifier_task.kind, self.extract_identifiers(&identifier_task, &encoded)),
            self.bounded(missing_task.kind, self.aggregate(&missing_task, &encoded)),
            self.bounded(
                inconsistency_task.kind,
                self.aggregate(&inconsistency_task, &encoded)
            ),
        );

        let mut usage = TokenUsage::default();

        let identifiers = match identifiers {
            Ok((outcome, u)) => {
                usage.merge(u);
                outcome
            }
            Err(e) => ExtractionOutcome::failed(e),
        };

        let missing = match missing {
            Ok(agg) => {
                usage.merge(agg.usage);
                MissingFieldsReport {
                    pages: agg.pages,
                    missing_data: agg.report,
                }
            }
            Err(e) => MissingFieldsReport {
                pages: Vec::new(),
                missing_data: FieldStatus::unavailable(e),
            },
        };

        let inconsistencies = match inconsistencies {
            Ok(agg) => {
                usage.merge(agg.usage);
                agg.report
            }
            Err(e) => FieldStatus::unavailable(e),
        };

        info!(
            "Document extraction done: {} pages, {} model calls",
            page_count, usage.calls
        );

        CombinedResult {
            page_count,
            identifiers,
            missing,
            inconsistencies,
            usage,
        }
    }

    async fn bounded<T>(&self, kind: TaskKind, fut: impl Future<Output = T>) -> Result<T, TaskError> {
        let secs = self.config.task_timeout_secs;
        info!("{} started", kind.name());
        let out = tokio::time::timeout(Duration::from_secs(secs), fut).await;
        match out {
            Ok(v) => {
                info!("{} finished", kind.name());
                Ok(v)
            }
            Err(_) => {
                warn!("{} timed out after {}s", kind.name(), secs);
                Err(TaskError::Timeout {
                    task: kind.name().to_string(),
                    secs,
                })
            }
        }
    }

    async fn extract_identifiers(
        &self,
        task: &ExtractionTask,
        encoded: &[Result<EncodedImage, TaskError>],
    ) -> (ExtractionOutcome, TokenUsage) {
        let mut usage = TokenUsage::default();
        if task.pages.is_empty() {
            return (ExtractionOutcome::failed(task.out_of_range(encoded.len())), usage);
        }
        let prompt = match self.prompts.load(task.prompt).await {
            Ok(p) => p,
            Err(e) => return (ExtractionOutcome::failed(TaskError::from(&e)), usage),
        };

        let pages = self.run_pages(task, &prompt, encoded).await;
        let mut outcome = ExtractionOutcome::failed("no page produced a reply");
        for page in &pages {
            usage.record(page.input_tokens, page.output_tokens);
            if let Some(ref e) = page.error {
                outcome = ExtractionOutcome::failed(e);
                continue;
            }
            outcome = parse_identifiers(&page.text);
            match outcome {
                ExtractionOutcome::Failed { ref reason } => {
                    warn!("{}: page {}: {}", task.kind.name(), page.page_num, reason);
                }
                _ => break,
            }
        }
        debug!("{}: {:?}", task.kind.name(), outcome);
        (outcome, usage)
    }

    /// Per-page extraction followed by one aggregation call over the replies.
    async fn aggregate(
        &self,
        task: &ExtractionTask,
        encoded: &[Result<EncodedImage, TaskError>],
    ) -> Aggregated {
        let mut usage = TokenUsage::default();
        let unavailable = |reason: TaskError, pages: Vec<PageExtraction>, usage: TokenUsage| {
            warn!("{}: {}", task.kind.name(), reason);
            Aggregated {
                pages,
                report: FieldStatus::unavailable(reason),
                usage,
            }
        };

        if task.pages.is_empty() {
            return unavailable(task.out_of_range(encoded.len()), Vec::new(), usage);
        }
        let prompt = match self.prompts.load(task.prompt).await {
            Ok(p) => p,
            Err(e) => return unavailable(TaskError::from(&e), Vec::new(), usage),
        };
        let summary_prompt = match task.summary_prompt {
            Some(name) => match self.prompts.load(name).await {
                Ok(p) => p,
                Err(e) => return unavailable(TaskError::from(&e), Vec::new(), usage),
            },
            None => {
                return unavailable(
                    TaskError::Prompt(format!("{} has no aggregation prompt", task.kind.name())),
                    Vec::new(),
                    usage,
                )
            }
        };

        let pages = self.run_pages(task, &prompt, encoded).await;
        for page in &pages {
            usage.record(page.input_tokens, page.output_tokens);
        }

        let texts: Vec<serde_json::Value> = pages
            .iter()
            .filter(|p| p.is_ok())
            .map(|p| serde_json::Value::String(p.text.clone()))
            .collect();
        if texts.is_empty() {
            let reason = pages
                .iter()
                .find_map(|p| p.error.clone())
                .unwrap_or_else(|| task.out_of_range(encoded.len()));
            return unavailable(reason, pages, usage);
        }
        debug!(
            "{}: aggregating {} of {} page replies",
            task.kind.name(),
            texts.len(),
            pages.len()
        );

        let context = serde_json::Value::Array(texts);
        let request = ExtractionRequest::new(&summary_prompt, &task.model, self.config.aggregation_max_tokens)
            .with_context(&context);
        let report = match self.client.send(request).await {
            Ok(reply) => {
                usage.record(reply.input_tokens, reply.output_tokens);
                parse_field_list(&reply.text, task.kind.name())
            }
            Err(e) => Err(e),
        };
        if let Err(ref e) = report {
            warn!("{}: aggregation failed: {}", task.kind.name(), e);
        }

        Aggregated {
            pages,
            report: report.into(),
            usage,
        }
    }

    /// One call per page with the bounded pool, results in page order.
    async fn run_pages(
        &self,
        task: &ExtractionTask,
        prompt: &str,
        encoded: &[Result<EncodedImage, TaskError>],
    ) -> Vec<PageExtraction> {
        stream::iter(task.pages.iter().map(|&idx| self.extract_page(task, prompt, idx, encoded)))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await
    }

    async fn extract_page(
        &self,
        task: &ExtractionTask,
        prompt: &str,
        idx: usize,
        encoded: &[Result<EncodedImage, TaskError>],
    ) -> PageExtraction {
        let page_num = idx + 1;
        let image = match encoded.get(idx) {
            Some(Ok(img)) => img,
            Some(Err(e)) => return PageExtraction::failed(page_num, e.clone()),
            None => return PageExtraction::failed(page_num, task.out_of_range(encoded.len())),
        };

        let start = Instant::now();
        let request = ExtractionRequest::new(prompt, &task.model, task.max_tokens).with_image(image);
        match self.client.send(request).await {
            Ok(reply) => {
                debug!(
                    "{}: page {} → {} chars",
                    task.kind.name(),
                    page_num,
                    reply.text.len()
                );
                PageExtraction {
                    page_num,
                    text: reply.text,
                    input_tokens: reply.input_tokens,
                    output_tokens: reply.output_tokens,
                    duration_ms: start.elapsed().as_millis() as u64,
                    error: None,
                }
            }
            Err(e) => {
                warn!("{}: page {} failed: {}", task.kind.name(), page_num, e);
                PageExtraction {
                    duration_ms: start.elapsed().as_millis() as u64,
                    ..PageExtraction::failed(page_num, e)
                }
            }
        }
    }
}

/// Encode every page off the async runtime. Order matches the input.
async fn encode_all(pages: Vec<DynamicImage>) -> EncodedPages {
    let count = pages.len();
    let encoded = tokio::task::spawn_blocking(move || {
        pages
            .iter()
            .enumerate()
            .map(|(idx, page)| {
                encode_page(page).map_err(|e| TaskError::Encode {
                    page: idx + 1,
                    detail: e.to_string(),
                })
            })
            .collect::<EncodedPages>()
    })
    .await;

    match encoded {
        Ok(pages) => pages,
        Err(e) => (1..=count)
            .map(|page| {
                Err(TaskError::Encode {
                    page,
                    detail: format!("encoder task panicked: {e}"),
                })
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PageWindow;
    use crate::pipeline::llm::ModelReply;
    use async_trait::async_trait;
    use image::{Rgba, RgbaImage};
    use std::sync::Mutex;

    /// Replies by prompt text; records which prompt hit which call.
    struct EchoClient {
        calls: Mutex<Vec<(String, bool, bool)>>,
    }

    #[async_trait]
    impl ExtractionClient for EchoClient {
        async fn send(&self, request: ExtractionRequest<'_>) -> Result<ModelReply, TaskError> {
            self.calls.lock().unwrap().push((
                request.prompt.to_string(),
                request.image.is_some(),
                request.context.is_some(),
            ));
            let text = match request.prompt {
                "LOAN" => r#"{"Commercial Register No.": "CR 700", "Industrial License": "IL 800"}"#,
                "MISSING" => "page ok",
                "MISSING_SUMMARY" => r#"["Guarantor signature"]"#,
                "INCONSISTENT" => "[]",
                other => panic!("unexpected prompt {other}"),
            };
            Ok(ModelReply {
                text: text.into(),
                input_tokens: 10,
                output_tokens: 5,
            })
        }
    }

    fn prompt_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in [
            (prompts::LOAN_APPLICATION, "LOAN"),
            (prompts::MISSING_FIELDS, "MISSING"),
            (prompts::MISSING_SUMMARY, "MISSING_SUMMARY"),
            (prompts::INCONSISTENCY, "INCONSISTENT"),
        ] {
            std::fs::write(dir.path().join(format!("{name}.txt")), body).unwrap();
        }
        dir
    }

    fn blank_pages(n: usize) -> Vec<DynamicImage> {
        (0..n)
            .map(|_| DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([255, 255, 255, 255]))))
            .collect()
    }

    #[test]
    fn plan_uses_page_windows() {
        let config = IntakeConfig::default();
        let [ident, missing, incons] = plan(&config, 6);
        assert_eq!(ident.pages, vec![2]);
        assert_eq!(missing.pages, vec![2, 3, 4, 5]);
        assert_eq!(incons.pages, (0..6).collect::<Vec<_>>());
        assert_eq!(missing.summary_prompt, Some(prompts::MISSING_SUMMARY));
        assert_eq!(ident.summary_prompt, None);
    }

    #[test]
    fn plan_on_short_document() {
        let [ident, missing, _] = plan(&IntakeConfig::default(), 2);
        assert!(ident.pages.is_empty());
        assert_eq!(missing.pages, vec![0, 1]);
    }

    #[tokio::test]
    async fn six_pages_fan_out() {
        let dir = prompt_dir();
        let client = Arc::new(EchoClient {
            calls: Mutex::new(Vec::new()),
        });
        let extractor = FieldExtractor::new(
            client.clone(),
            PromptStore::new(dir.path()),
            IntakeConfig::default(),
        );

        let result = extractor.process_pages(blank_pages(6)).await;
        assert_eq!(result.page_count, 6);
        assert_eq!(
            result.identifiers.identifier(crate::output::IdentifierKind::CommercialRegister),
            Some("700")
        );
        assert_eq!(result.missing.pages.len(), 4);
        assert_eq!(
            result.missing.pages.iter().map(|p| p.page_num).collect::<Vec<_>>(),
            vec![3, 4, 5, 6]
        );
        assert_eq!(
            result.missing.missing_data.value().unwrap().fields,
            vec!["Guarantor signature"]
        );
        assert!(result.inconsistencies.value().unwrap().fields.is_empty());

        // 1 identifier + 4 missing + 1 summary + 6 inconsistency + 1 summary
        assert_eq!(result.usage.calls, 13);
        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 13);
        assert!(calls
            .iter()
            .filter(|(p, _, _)| p.ends_with("SUMMARY") || p == "INCONSISTENT")
            .all(|(_, image, context)| !image && *context));
    }

    #[tokio::test]
    async fn short_document_degrades_identifier_only() {
        let dir = prompt_dir();
        let extractor = FieldExtractor::new(
            Arc::new(EchoClient {
                calls: Mutex::new(Vec::new()),
            }),
            PromptStore::new(dir.path()),
            IntakeConfig::builder()
                .identifier_pages(PageWindow::Page(3))
                .build()
                .unwrap(),
        );
        let result = extractor.process_pages(blank_pages(2)).await;
        assert!(matches!(result.identifiers, ExtractionOutcome::Failed { .. }));
        assert!(result.missing.missing_data.is_available());
        assert!(result.inconsistencies.is_available());
    }

    #[tokio::test]
    async fn missing_prompt_makes_task_unavailable() {
        let dir = prompt_dir();
        std::fs::remove_file(dir.path().join(format!("{}.txt", prompts::INCONSISTENCY))).unwrap();
        let extractor = FieldExtractor::new(
            Arc::new(EchoClient {
                calls: Mutex::new(Vec::new()),
            }),
            PromptStore::new(dir.path()),
            IntakeConfig::default(),
        );
        let result = extractor.process_pages(blank_pages(4)).await;
        assert!(matches!(
            result.inconsistencies,
            FieldStatus::Unavailable {
                reason: TaskError::Prompt(_)
            }
        ));
        assert!(result.missing.missing_data.is_available());
    }
}
