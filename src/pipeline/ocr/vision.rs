//! OCR through a vision-capable LLM.
//!
//! Each region crop is PNG-encoded, base64-wrapped and sent as an image
//! attachment together with the transcription prompt from
//! [`crate::prompts`]. The answer is plain text: no word boxes and no
//! confidences, so every word gets the configured default confidence and
//! the document provenance records the substitution.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from LLM APIs are transient and frequent under
//! concurrent load. Exponential backoff (`retry_backoff_ms * 2^attempt`)
//! avoids thundering-herd: with 500 ms base and 3 retries the wait sequence
//! is 500 ms → 1 s → 2 s.

use super::{OcrBackend, OcrOutput};
use crate::config::VisionConfig;
use crate::document::BlockType;
use crate::error::PerceptionError;
use crate::pipeline::postprocess::clean_transcription;
use crate::prompts::{region_instruction, TRANSCRIBE_SYSTEM_PROMPT};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use image::{DynamicImage, GrayImage};
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

const DEFAULT_VISION_MODEL: &str = "gpt-4.1-nano";

/// Vision-LLM OCR backend.
pub struct VisionOcr {
    config: VisionConfig,
    provider: OnceCell<Arc<dyn LLMProvider>>,
}

impl std::fmt::Debug for VisionOcr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionOcr")
            .field("config", &self.config)
            .field("resolved", &self.provider.initialized())
            .finish()
    }
}

impl VisionOcr {
    pub fn new(config: VisionConfig) -> Self {
        Self {
            config,
            provider: OnceCell::new(),
        }
    }

    fn provider(&self) -> Result<&Arc<dyn LLMProvider>, PerceptionError> {
        self.provider.get().ok_or_else(|| PerceptionError::BackendUnavailable {
            backend: "vision".into(),
            reason: "provider not initialised".into(),
        })
    }
}

#[async_trait]
impl OcrBackend for VisionOcr {
    fn name(&self) -> &str {
        "vision"
    }

    async fn initialize(&self) -> Result<(), PerceptionError> {
        self.provider
            .get_or_try_init(|| async { resolve_provider(&self.config) })
            .await?;
        info!(
            "Vision OCR ready (model: {})",
            self.config.model.as_deref().unwrap_or("provider default")
        );
        Ok(())
    }

    async fn recognize(&self, image: Arc<GrayImage>, hint: BlockType) -> Result<OcrOutput, PerceptionError> {
        let provider = self.provider()?;
        let image_data = encode_png(&image)?;
        let messages = build_messages(image_data, hint);
        let options = build_options(&self.config);

        let mut last_err: Option<String> = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = self.config.retry_backoff_ms * 2u64.pow(attempt - 1);
                warn!(
                    "Vision OCR: retry {}/{} after {}ms",
                    attempt, self.config.max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            match provider.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    debug!(
                        "Vision OCR ({}): {} input tokens, {} output tokens",
                        hint, response.prompt_tokens, response.completion_tokens
                    );
                    let text = clean_transcription(&response.content);
                    return Ok(OcrOutput::from_plain_text(&text));
                }
                Err(e) => {
                    warn!("Vision OCR: attempt {} failed: {}", attempt + 1, e);
                    last_err = Some(e.to_string());
                }
            }
        }

        Err(PerceptionError::BackendFailed {
            backend: "vision".into(),
            detail: format!(
                "{} retries exhausted: {}",
                self.config.max_retries,
                last_err.unwrap_or_else(|| "unknown error".to_string())
            ),
        })
    }
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. A pre-built provider in [`VisionConfig::provider`].
/// 2. `provider_name` (+ optional `model`) through
///    [`ProviderFactory::create_llm_provider`].
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, when both are set.
/// 4. OpenAI, when `OPENAI_API_KEY` is set.
/// 5. Full auto-detection with [`ProviderFactory::from_env`].
fn resolve_provider(config: &VisionConfig) -> Result<Arc<dyn LLMProvider>, PerceptionError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_VISION_MODEL);
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if !key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_VISION_MODEL);
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PerceptionError::BackendUnavailable {
            backend: "vision".to_string(),
            reason: format!(
                "no LLM provider could be auto-detected from the environment \
                 (set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider): {e}"
            ),
        })?;
    Ok(llm_provider)
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PerceptionError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| PerceptionError::BackendUnavailable {
        backend: format!("vision/{name}"),
        reason: e.to_string(),
    })
}

/// Encode a crop as a base64 PNG attachment.
///
/// PNG keeps glyph edges crisp; JPEG artefacts on small text degrade
/// recognition. `detail: "high"` lets tiled models see fine print.
fn encode_png(img: &GrayImage) -> Result<ImageData, PerceptionError> {
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(img.clone())
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| PerceptionError::Internal(format!("PNG encoding failed: {e}")))?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded {}x{} crop → {} bytes base64", img.width(), img.height(), b64.len());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

fn build_messages(image: ImageData, hint: BlockType) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(TRANSCRIBE_SYSTEM_PROMPT),
        ChatMessage::user_with_images(region_instruction(hint).unwrap_or(""), vec![image]),
    ]
}

fn build_options(config: &VisionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn encode_gray_crop() {
        let img = GrayImage::from_pixel(12, 8, Luma([128]));
        let data = encode_png(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        let round = image::load_from_memory(&decoded).unwrap();
        assert_eq!((round.width(), round.height()), (12, 8));
    }

    #[test]
    fn options_follow_config() {
        let config = VisionConfig::default();
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(config.temperature));
        assert_eq!(opts.max_tokens, Some(config.max_tokens));
    }

    #[test]
    fn table_hint_adds_instruction() {
        let img = encode_png(&GrayImage::from_pixel(2, 2, Luma([0]))).unwrap();
        let messages = build_messages(img, BlockType::Table);
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn recognize_before_initialize_is_unavailable() {
        let ocr = VisionOcr::new(VisionConfig::default());
        let err = ocr
            .recognize(Arc::new(GrayImage::new(4, 4)), BlockType::Paragraph)
            .await
            .unwrap_err();
        assert!(matches!(err, PerceptionError::BackendUnavailable { .. }));
    }
}
