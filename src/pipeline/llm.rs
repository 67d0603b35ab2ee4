//! Model interaction: the [`ExtractionClient`] capability and its
//! edgequake-llm backed implementation, [`VisionClient`].
//!
//! Every request has the same shape: one user turn holding the prompt text,
//! optionally a JSON context block (per-page results handed to an
//! aggregation prompt) and optionally one image. The orchestrator only ever
//! talks to the trait, so tests drive it with a scripted client and the
//! production binary plugs in whichever provider the environment names.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from LLM APIs are transient and frequent under
//! concurrent load. Exponential backoff (`retry_backoff_ms * 2^attempt`)
//! avoids thundering-herd: with 500 ms base and 2 retries the wait sequence
//! is 500 ms → 1 s. Each attempt is also bounded by `api_timeout_secs`, so
//! a hung connection counts as one failed attempt instead of blocking the
//! task forever.

use crate::config::{GenerationParams, IntakeConfig};
use crate::error::{IntakeError, TaskError};
use crate::output::EncodedImage;
use crate::retry::{retry_async, Backoff};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// One single-turn request to a model.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    /// Instruction text, sent verbatim.
    pub prompt: &'a str,
    pub image: Option<&'a EncodedImage>,
    /// Structured context serialised after the prompt.
    pub context: Option<&'a serde_json::Value>,
    pub model: &'a str,
    pub max_tokens: usize,
}

impl<'a> ExtractionRequest<'a> {
    pub fn new(prompt: &'a str, model: &'a str, max_tokens: usize) -> Self {
        Self {
            prompt,
            image: None,
            context: None,
            model,
            max_tokens,
        }
    }

    pub fn with_image(mut self, image: &'a EncodedImage) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_context(mut self, context: &'a serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Text of the user turn: the prompt, then the context block if any.
    pub fn text(&self) -> String {
        match self.context {
            Some(ctx) => format!("{}\n\n{}", self.prompt, ctx),
            None => self.prompt.to_string(),
        }
    }
}

/// Raw model output plus token accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelReply {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Anything that can answer an [`ExtractionRequest`].
///
/// Implementations must be safe to share across concurrent tasks; the
/// pipeline holds one instance behind an `Arc` for its whole lifetime.
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    async fn send(&self, request: ExtractionRequest<'_>) -> Result<ModelReply, TaskError>;
}

/// [`ExtractionClient`] over edgequake-llm providers.
///
/// Holds one provider per model id. The registry is filled at construction
/// and only read afterwards.
pub struct VisionClient {
    providers: HashMap<String, Arc<dyn LLMProvider>>,
    generation: GenerationParams,
    backoff: Backoff,
    call_timeout: Duration,
}

impl VisionClient {
    /// Build a client from an explicit model → provider registry.
    pub fn new(providers: HashMap<String, Arc<dyn LLMProvider>>, config: &IntakeConfig) -> Self {
        Self {
            providers,
            generation: config.generation.clone(),
            backoff: config.call_backoff(),
            call_timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

    /// Resolve a provider for every model the config names.
    pub fn from_config(config: &IntakeConfig) -> Result<Self, IntakeError> {
        let mut providers = HashMap::new();
        for model in [&config.document_model, &config.supporting_model] {
            if !providers.contains_key(model.as_str()) {
                let provider = resolve_provider(config, model)?;
                info!("Resolved provider for model {}", model);
                providers.insert(model.clone(), provider);
            }
        }
        Ok(Self::new(providers, config))
    }

    pub fn models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        models.sort_unstable();
        models
    }
}

#[async_trait]
impl ExtractionClient for VisionClient {
    async fn send(&self, request: ExtractionRequest<'_>) -> Result<ModelReply, TaskError> {
        let upstream = |retries: u32, detail: String| TaskError::Upstream {
            model: request.model.to_string(),
            retries,
            detail,
        };
        let provider = self
            .providers
            .get(request.model)
            .ok_or_else(|| upstream(0, "no provider registered for this model".into()))?;

        let messages = build_messages(&request);
        let options = build_options(&self.generation, request.max_tokens);
        let (messages, options, timeout) = (&messages, &options, self.call_timeout);

        let start = Instant::now();
        let label = format!("model {}", request.model);
        let response = retry_async(
            self.backoff,
            &label,
            || async move {
                match tokio::time::timeout(timeout, provider.chat(messages, Some(options))).await {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("no response within {}s", timeout.as_secs())),
                }
            },
            |_| true,
        )
        .await
        .map_err(|detail| upstream(self.backoff.max_retries, detail))?;

        debug!(
            "{}: {} input tokens, {} output tokens, {:?}",
            request.model,
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        Ok(ModelReply {
            text: response.content,
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
        })
    }
}

/// One user turn: text first, then the image attachment if present.
fn build_messages(request: &ExtractionRequest<'_>) -> Vec<ChatMessage> {
    let text = request.text();
    match request.image {
        Some(img) => {
            let image = ImageData::new(img.data.clone(), img.media_type.clone()).with_detail("high");
            vec![ChatMessage::user_with_images(text, vec![image])]
        }
        None => vec![ChatMessage::user(text)],
    }
}

/// Build `CompletionOptions` from the generation parameters.
fn build_options(params: &GenerationParams, max_tokens: usize) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(params.temperature),
        top_p: Some(params.top_p),
        max_tokens: Some(max_tokens),
        stop: if params.stop_sequences.is_empty() {
            None
        } else {
            Some(params.stop_sequences.clone())
        },
        ..Default::default()
    }
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, IntakeError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        IntakeError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the provider serving `model`, from most-specific to least-specific:
///
/// 1. a pre-built provider in the config, used for every model;
/// 2. `config.provider_name`;
/// 3. `EDGEQUAKE_LLM_PROVIDER` from the environment;
/// 4. Anthropic when `ANTHROPIC_API_KEY` is set, since the default models
///    are Claude models;
/// 5. whatever [`ProviderFactory::from_env`] detects.
fn resolve_provider(config: &IntakeConfig, model: &str) -> Result<Arc<dyn LLMProvider>, IntakeError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let Ok(name) = std::env::var("EDGEQUAKE_LLM_PROVIDER") {
        if !name.is_empty() {
            return create_provider(&name, model);
        }
    }

    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        if !key.is_empty() {
            return create_provider("anthropic", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| IntakeError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set ANTHROPIC_API_KEY, OPENAI_API_KEY, or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
