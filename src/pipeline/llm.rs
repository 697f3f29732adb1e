//! VLM role classifier: crop every text box, ask a vision model for one
//! analysis per crop, parse the reply.
//!
//! The classifier makes exactly one provider call per [`Classifier::classify`]
//! invocation. Retrying is the orchestrator's job, so a provider error maps
//! straight to [`ClassificationError::Unavailable`] (transient) and a reply
//! that cannot be parsed to [`ClassificationError::MalformedResponse`]
//! (never retried).
//!
//! ## Message layout
//!
//! 1. **System message**: the role/typography prompt from [`crate::prompts`]
//! 2. **System message**: how many crops to expect
//! 3. **User message**: the crops as PNG attachments, in region order

use crate::config::PipelineConfig;
use crate::error::{ClassificationError, PipelineError};
use crate::geometry::BBox;
use crate::pipeline::classify::{Classifier, RegionAnalysis};
use crate::pipeline::{encode, postprocess};
use crate::prompts::{region_count_hint, CLASSIFY_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use image::RgbaImage;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// [`Classifier`] backed by an `edgequake-llm` vision provider.
pub struct LlmClassifier {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
}

impl LlmClassifier {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            temperature: 0.1,
            max_tokens: 4096,
        }
    }

    /// Resolve the provider from the config (see [`resolve_provider`]).
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            provider: resolve_provider(config)?,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(
        &self,
        image: &RgbaImage,
        boxes: &[BBox],
    ) -> Result<Vec<Option<RegionAnalysis>>, ClassificationError> {
        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let source = image.clone();
        let crops = boxes.to_vec();
        let images = tokio::task::spawn_blocking(move || {
            crops
                .iter()
                .map(|b| encode::encode_crop(&source, b))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| ClassificationError::Unavailable {
            detail: format!("crop encoding task panicked: {e}"),
        })?
        .map_err(|e| ClassificationError::MalformedResponse {
            detail: format!("crop encoding failed: {e}"),
        })?;

        let messages = build_messages(images);
        let response = self
            .provider
            .chat(&messages, Some(&self.options()))
            .await
            .map_err(|e| ClassificationError::Unavailable {
                detail: e.to_string(),
            })?;

        debug!(
            "Classifier: {} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        postprocess::parse_analyses(&response.content)
    }
}

fn build_messages(images: Vec<ImageData>) -> Vec<ChatMessage> {
    let count = images.len();
    vec![
        ChatMessage::system(CLASSIFY_SYSTEM_PROMPT),
        ChatMessage::system(region_count_hint(count)),
        ChatMessage::user_with_images("", images),
    ]
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the vision provider, most specific first:
///
/// 1. `config.provider`, used as-is
/// 2. `config.provider_name` with `config.model` (default `gpt-4.1-nano`)
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, when both are set
/// 4. OpenAI, when `OPENAI_API_KEY` is set
/// 5. [`ProviderFactory::from_env`] auto-detection
pub fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        info!("Classifier provider: {} / {}", name, model);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn messages_carry_prompt_hint_and_crops() {
        let img = RgbaImage::from_pixel(20, 20, Rgba([255, 255, 255, 255]));
        let crops = vec![
            encode::encode_crop(&img, &BBox::new(0, 0, 5, 5).unwrap()).unwrap(),
            encode::encode_crop(&img, &BBox::new(5, 5, 5, 5).unwrap()).unwrap(),
        ];
        let messages = build_messages(crops);
        assert_eq!(messages.len(), 3);
    }
}
