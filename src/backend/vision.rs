//! Vision-LLM OCR through edgequake-llm.
//!
//! Any provider edgequake-llm can drive (OpenAI, Anthropic, Gemini, Ollama,
//! …) works as an OCR backend: the page image goes in as a user message
//! next to [`OCR_SYSTEM_PROMPT`], the reply is the page's Markdown.
//!
//! The provider reads its own API key from the environment, so the
//! [`Credential`] handed in by the engine is not used.
//!
//! ## Error classification
//!
//! Provider errors arrive as text. They are mapped onto [`OcrCallError`] by
//! looking for status codes and the phrases providers use for them, so that
//! a 429 still slows the limiter down and a revoked key still stops the batch.

use super::OcrBackend;
use crate::config::BatchConfig;
use crate::credential::Credential;
use crate::error::{OcrBatchError, OcrCallError};
use crate::pipeline::encode::to_base64;
use crate::pipeline::render::PageUnit;
use crate::prompts::OCR_SYSTEM_PROMPT;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// OCR via a multimodal chat model.
pub struct VisionLlmBackend {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl VisionLlmBackend {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            options: CompletionOptions {
                temperature: Some(0.1),
                max_tokens: Some(4096),
                ..Default::default()
            },
        }
    }

    /// Build the provider named in `config`, or auto-detect one.
    pub fn from_config(config: &BatchConfig) -> Result<Self, OcrBatchError> {
        Ok(Self::new(resolve_provider(config)?))
    }
}

#[async_trait]
impl OcrBackend for VisionLlmBackend {
    fn name(&self) -> &str {
        "vision"
    }

    async fn recognize(
        &self,
        unit: &PageUnit,
        _credential: &Credential,
    ) -> Result<String, OcrCallError> {
        let image = ImageData::new(to_base64(&unit.payload), unit.format.mime_type())
            .with_detail("high");
        let messages = vec![
            ChatMessage::system(OCR_SYSTEM_PROMPT),
            ChatMessage::user_with_images("", vec![image]),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| classify_provider_error(&e.to_string(), unit.payload.len()))?;

        debug!(
            "Page {}: {} input tokens, {} output tokens",
            unit.page_num(),
            response.prompt_tokens,
            response.completion_tokens
        );
        if response.content.trim().is_empty() {
            return Err(OcrCallError::InvalidResponse("empty completion".into()));
        }
        Ok(response.content)
    }

    fn requires_credential(&self) -> bool {
        false
    }
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, OcrBatchError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        OcrBatchError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Named provider first, then `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`,
/// then whatever API key the environment offers.
fn resolve_provider(config: &BatchConfig) -> Result<Arc<dyn LLMProvider>, OcrBatchError> {
    let model = config.model_or_default();

    if let Some(ref name) = config.provider_name {
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_vision_provider(&prov, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        return create_vision_provider("openai", model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| OcrBatchError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No vision provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;
    Ok(llm_provider)
}

static RE_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([45]\d\d)\b").unwrap());

/// Map a provider error message onto the OCR error taxonomy.
pub fn classify_provider_error(message: &str, payload_bytes: usize) -> OcrCallError {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["rate limit", "rate_limit", "too many requests"]) {
        return OcrCallError::RateLimited { retry_after: None };
    }
    if has(&["invalid api key", "invalid_api_key", "incorrect api key", "unauthorized"]) {
        return OcrCallError::InvalidCredential(message.to_string());
    }
    if has(&["timed out", "timeout"]) {
        return OcrCallError::Timeout { secs: 0 };
    }
    if let Some(status) = RE_STATUS
        .captures(&lower)
        .and_then(|c| c[1].parse::<u16>().ok())
    {
        if let Some(err) = OcrCallError::from_status(status, message, None, payload_bytes) {
            return err;
        }
    }
    if has(&["too large", "payload"]) {
        return OcrCallError::PayloadTooLarge {
            bytes: payload_bytes,
        };
    }
    if has(&["invalid request", "bad request"]) {
        return OcrCallError::BadRequest {
            status: 400,
            detail: message.to_string(),
        };
    }
    OcrCallError::Connection(message.to_string())
}
