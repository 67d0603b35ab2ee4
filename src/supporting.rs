//! Supporting documents: the industry license and the commercial
//! registration images.
//!
//! Each is a single uploaded image sent as-is (no rasterisation) with its
//! own prompt. The reply is a JSON object keyed by the Arabic field label
//! printed on the certificate; the configured label's value is returned
//! verbatim.

use crate::config::IntakeConfig;
use crate::document::SupportingImage;
use crate::error::TaskError;
use crate::orchestrator::{ExtractionTask, TaskKind};
use crate::output::{FieldStatus, IdentifierKind, TokenUsage};
use crate::pipeline::encode::encode_upload;
use crate::pipeline::llm::{ExtractionClient, ExtractionRequest};
use crate::pipeline::parse::parse_supporting_value;
use crate::prompts::{self, PromptStore};
use tracing::{info, warn};

/// Plan the single call for one supporting document.
pub fn supporting_task(kind: IdentifierKind, config: &IntakeConfig) -> ExtractionTask {
    ExtractionTask {
        kind: TaskKind::SingleDocumentExtraction,
        pages: Vec::new(),
        prompt: match kind {
            IdentifierKind::IndustrialLicense => prompts::INDUSTRY_LICENSE,
            IdentifierKind::CommercialRegister => prompts::COMMERCIAL_REGISTRATION,
        },
        summary_prompt: None,
        model: config.supporting_model.clone(),
        max_tokens: config.generation.max_tokens,
    }
}

/// The label whose value identifies the document.
pub fn field_label(kind: IdentifierKind, config: &IntakeConfig) -> &str {
    match kind {
        IdentifierKind::IndustrialLicense => &config.industry_license_field,
        IdentifierKind::CommercialRegister => &config.commercial_registration_field,
    }
}

/// Read the identifier off one supporting image.
///
/// A missing upload is not an error of the run: the result is simply
/// unavailable and reconciliation reports it as such.
pub async fn extract_supporting(
    kind: IdentifierKind,
    upload: Option<&SupportingImage>,
    client: &dyn ExtractionClient,
    prompts: &PromptStore,
    config: &IntakeConfig,
) -> (FieldStatus<String>, TokenUsage) {
    let mut usage = TokenUsage::default();
    let Some(upload) = upload else {
        info!("{}: no image uploaded", kind.label());
        return (
            FieldStatus::unavailable(TaskError::NotProvided(kind.label().to_string())),
            usage,
        );
    };

    let task = supporting_task(kind, config);
    let prompt = match prompts.load(task.prompt).await {
        Ok(p) => p,
        Err(e) => return (FieldStatus::unavailable(TaskError::from(&e)), usage),
    };

    info!("{}: extracting from {}", kind.label(), upload.name);
    let image = encode_upload(upload);
    let request = ExtractionRequest::new(&prompt, &task.model, task.max_tokens).with_image(&image);
    let result = match client.send(request).await {
        Ok(reply) => {
            usage.record(reply.input_tokens, reply.output_tokens);
            parse_supporting_value(&reply.text, field_label(kind, config))
        }
        Err(e) => Err(e),
    };

    if let Err(ref e) = result {
        warn!("{}: {}", kind.label(), e);
    }
    (result.into(), usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::ModelReply;
    use async_trait::async_trait;

    struct Fixed(Result<&'static str, TaskError>);

    #[async_trait]
    impl ExtractionClient for Fixed {
        async fn send(&self, request: ExtractionRequest<'_>) -> Result<ModelReply, TaskError> {
            assert_eq!(request.image.map(|i| i.media_type.as_str()), Some("image/png"));
            self.0.clone().map(|text| ModelReply {
                text: text.into(),
                input_tokens: 3,
                output_tokens: 2,
            })
        }
    }

    fn store() -> (tempfile::TempDir, PromptStore) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("il_prompt.txt"), "Read the license.").unwrap();
        std::fs::write(dir.path().join("cr_prompt.txt"), "Read the registration.").unwrap();
        let store = PromptStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn absent_upload_is_unavailable() {
        let (_dir, store) = store();
        let (status, usage) = extract_supporting(
            IdentifierKind::IndustrialLicense,
            None,
            &Fixed(Ok("{}")),
            &store,
            &IntakeConfig::default(),
        )
        .await;
        assert!(matches!(
            status,
            FieldStatus::Unavailable {
                reason: TaskError::NotProvided(_)
            }
        ));
        assert_eq!(usage.calls, 0);
    }

    #[tokio::test]
    async fn reads_configured_label() {
        let (_dir, store) = store();
        let upload = SupportingImage::new("cr.png", vec![0x89, b'P', b'N', b'G']);
        let (status, usage) = extract_supporting(
            IdentifierKind::CommercialRegister,
            Some(&upload),
            &Fixed(Ok(r#"{"رقم المنشأة": "1010123456", "الاسم": "Acme"}"#)),
            &store,
            &IntakeConfig::default(),
        )
        .await;
        assert_eq!(status.value().map(String::as_str), Some("1010123456"));
        assert_eq!(usage.calls, 1);
    }

    #[tokio::test]
    async fn upstream_failure_is_unavailable() {
        let (_dir, store) = store();
        let upload = SupportingImage::new("il.png", vec![1]);
        let (status, _) = extract_supporting(
            IdentifierKind::IndustrialLicense,
            Some(&upload),
            &Fixed(Err(TaskError::Upstream {
                model: "m".into(),
                retries: 2,
                detail: "503".into(),
            })),
            &store,
            &IntakeConfig::default(),
        )
        .await;
        assert!(!status.is_available());
    }

    #[test]
    fn task_uses_supporting_model() {
        let config = IntakeConfig::builder()
            .supporting_model("vision-small")
            .build()
            .unwrap();
        let task = supporting_task(IdentifierKind::IndustrialLicense, &config);
        assert_eq!(task.kind, TaskKind::SingleDocumentExtraction);
        assert_eq!(task.prompt, prompts::INDUSTRY_LICENSE);
        assert_eq!(task.model, "vision-small");
    }
}
