//! Local OCR with Tesseract through `leptess`.
//!
//! Compiled only with the `tesseract` feature, because it links against the
//! system `libtesseract`/`libleptonica`. Without the feature the backend
//! still exists but `initialize` reports it unavailable, so the
//! orchestrator falls back exactly as it would on a machine without the
//! language data.
//!
//! Tesseract is synchronous and not `Send`-friendly; every call creates its
//! own `LepTess` inside `spawn_blocking`.

use super::{OcrBackend, OcrOutput};
use crate::document::BlockType;
use crate::error::PerceptionError;
use async_trait::async_trait;
use image::GrayImage;
use std::sync::Arc;

/// Tesseract OCR backend.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    language: String,
}

impl TesseractOcr {
    /// `language` is a Tesseract language code such as `"eng"` or `"eng+deu"`.
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
        }
    }
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self::new("eng")
    }
}

/// Page segmentation mode for a region type: single line for table row
/// strips, uniform block otherwise.
fn segmentation_mode(hint: BlockType) -> &'static str {
    match hint {
        BlockType::Table => "7",
        _ => "6",
    }
}

#[cfg(feature = "tesseract")]
mod engine {
    use super::segmentation_mode;
    use crate::document::{BlockType, BoundingBox};
    use crate::error::PerceptionError;
    use crate::pipeline::ocr::{assign_lines, OcrOutput, OcrWord};
    use image::{DynamicImage, GrayImage};
    use leptess::{LepTess, Variable};
    use tracing::debug;

    pub(super) fn open(language: &str) -> Result<LepTess, PerceptionError> {
        LepTess::new(None, language).map_err(|e| PerceptionError::BackendUnavailable {
            backend: "tesseract".into(),
            reason: format!(
                "failed to initialise Tesseract with language '{language}': {e} \
                 (is the language data installed?)"
            ),
        })
    }

    pub(super) fn recognize(
        image: &GrayImage,
        language: &str,
        hint: BlockType,
    ) -> Result<OcrOutput, PerceptionError> {
        let failed = |detail: String| PerceptionError::BackendFailed {
            backend: "tesseract".into(),
            detail,
        };

        let mut lt = open(language)?;
        lt.set_variable(Variable::TesseditPagesegMode, segmentation_mode(hint))
            .map_err(|e| failed(format!("failed to set PSM: {e}")))?;

        let mut png = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(image.clone())
            .write_to(&mut png, image::ImageFormat::Png)
            .map_err(|e| failed(format!("failed to encode crop: {e}")))?;
        lt.set_image_from_mem(png.get_ref())
            .map_err(|e| failed(format!("failed to set image: {e}")))?;

        // None means no text at all, not an error.
        let Some(boxes) = lt.get_component_boxes(leptess::capi::TessPageIteratorLevel_RIL_WORD, true) else {
            return Ok(OcrOutput::default());
        };

        let mut words = Vec::new();
        for bbox in &boxes {
            let geom = bbox.get_geometry();
            lt.set_rectangle(geom.x, geom.y, geom.w, geom.h);
            let text = lt.get_utf8_text().unwrap_or_default().trim().to_string();
            if text.is_empty() {
                continue;
            }
            let confidence = lt.mean_text_conf() as f32 / 100.0;
            words.push(OcrWord {
                text,
                line: 0,
                bbox: BoundingBox::new(geom.x as f32, geom.y as f32, geom.w as f32, geom.h as f32),
                confidence: Some(confidence),
            });
        }
        assign_lines(&mut words);
        debug!("Tesseract recognised {} words", words.len());
        Ok(OcrOutput { words })
    }
}

#[async_trait]
impl OcrBackend for TesseractOcr {
    fn name(&self) -> &str {
        "tesseract"
    }

    #[cfg(feature = "tesseract")]
    async fn initialize(&self) -> Result<(), PerceptionError> {
        let language = self.language.clone();
        tokio::task::spawn_blocking(move || engine::open(&language).map(|_| ()))
            .await
            .map_err(|e| PerceptionError::Internal(format!("tesseract init task failed: {e}")))?
    }

    #[cfg(not(feature = "tesseract"))]
    async fn initialize(&self) -> Result<(), PerceptionError> {
        Err(PerceptionError::BackendUnavailable {
            backend: "tesseract".into(),
            reason: format!(
                "built without the `tesseract` feature (language '{}')",
                self.language
            ),
        })
    }

    #[cfg(feature = "tesseract")]
    async fn recognize(&self, image: Arc<GrayImage>, hint: BlockType) -> Result<OcrOutput, PerceptionError> {
        let language = self.language.clone();
        tokio::task::spawn_blocking(move || engine::recognize(&image, &language, hint))
            .await
            .map_err(|e| PerceptionError::Internal(format!("tesseract task failed: {e}")))?
    }

    #[cfg(not(feature = "tesseract"))]
    async fn recognize(&self, _image: Arc<GrayImage>, hint: BlockType) -> Result<OcrOutput, PerceptionError> {
        Err(PerceptionError::BackendUnavailable {
            backend: "tesseract".into(),
            reason: format!(
                "built without the `tesseract` feature (psm {})",
                segmentation_mode(hint)
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_strips_use_single_line_mode() {
        assert_eq!(segmentation_mode(BlockType::Table), "7");
        assert_eq!(segmentation_mode(BlockType::Paragraph), "6");
    }

    #[cfg(not(feature = "tesseract"))]
    #[tokio::test]
    async fn unavailable_without_feature() {
        let err = TesseractOcr::default().initialize().await.unwrap_err();
        assert!(matches!(err, PerceptionError::BackendUnavailable { .. }));
        assert!(err.is_transient());
    }
}
