//! OCR: recognise the text of a single layout region.
//!
//! Backends implement [`OcrBackend`] and report whatever they natively know:
//! Tesseract gives word boxes and percent confidences, a vision LLM gives
//! plain lines of text and nothing else. [`recognize_region`] hides the
//! difference. It crops the region out of the page raster, splits tables
//! into row strips, enforces the stage timeout, and normalises the backend
//! output into [`RecognizedText`] in page units with confidences in `[0,1]`.
//!
//! ## Missing confidences
//!
//! A backend that reports no per-word score gets the configured default
//! (`ocr_default_confidence`) substituted, and the result is flagged with
//! `substituted = true` so provenance can surface the degraded mode.

pub mod tesseract;
pub mod vision;

pub use tesseract::TesseractOcr;
pub use vision::VisionOcr;

use crate::document::{BlockType, BoundingBox};
use crate::error::{PerceptionError, Stage};
use crate::pipeline::projection::ink_runs;
use async_trait::async_trait;
use image::{imageops, GrayImage};
use imageproc::contrast::otsu_level;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Padding kept around each table row strip, in pixels.
const STRIP_PADDING: u32 = 2;

/// One word as reported by a backend, in crop-local pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrWord {
    pub text: String,
    /// 0-based visual line within the recognised image.
    pub line: usize,
    pub bbox: Option<BoundingBox>,
    /// Native score; values above 1 are read as percentages.
    pub confidence: Option<f32>,
}

/// Raw backend output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OcrOutput {
    pub words: Vec<OcrWord>,
}

impl OcrOutput {
    /// Split plain text into words, one line per `\n`, without geometry.
    pub fn from_plain_text(text: &str) -> Self {
        let words = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .flat_map(|(line, l)| {
                l.split_whitespace().map(move |w| OcrWord {
                    text: w.to_string(),
                    line,
                    bbox: None,
                    confidence: None,
                })
            })
            .collect();
        Self { words }
    }
}

/// Number boxed words by visual line: words are sorted top to bottom, left
/// to right, and a word joins the current line when it overlaps it
/// vertically by at least half its height. Words without a box keep their
/// line.
pub fn assign_lines(words: &mut [OcrWord]) {
    if words.iter().any(|w| w.bbox.is_none()) {
        return;
    }
    words.sort_by(|a, b| match (&a.bbox, &b.bbox) {
        (Some(ba), Some(bb)) => ba.y().total_cmp(&bb.y()).then(ba.x().total_cmp(&bb.x())),
        _ => std::cmp::Ordering::Equal,
    });
    let mut line = 0;
    let mut band: Option<BoundingBox> = None;
    for word in words.iter_mut() {
        let Some(b) = word.bbox else { continue };
        band = match band {
            Some(current) if current.vertical_overlap_ratio(&b) >= 0.5 => Some(current.union(&b)),
            Some(_) => {
                line += 1;
                Some(b)
            }
            None => Some(b),
        };
        word.line = line;
    }
    // Within a line, left to right.
    words.sort_by(|a, b| {
        a.line.cmp(&b.line).then(match (&a.bbox, &b.bbox) {
            (Some(ba), Some(bb)) => ba.x().total_cmp(&bb.x()),
            _ => std::cmp::Ordering::Equal,
        })
    });
}

/// Capability shared by all OCR engines.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with [`PerceptionError::BackendUnavailable`] when the engine
    /// cannot run here (library missing, no provider configured).
    async fn initialize(&self) -> Result<(), PerceptionError>;

    /// Recognise one cropped region. `hint` is the region's layout type.
    async fn recognize(&self, image: Arc<GrayImage>, hint: BlockType) -> Result<OcrOutput, PerceptionError>;
}

/// A word in page units with a normalised confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedWord {
    pub text: String,
    pub line: usize,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Normalised OCR result of one region.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognizedText {
    pub words: Vec<RecognizedWord>,
    /// Mean word confidence; 0 when nothing was recognised.
    pub confidence: f32,
    /// At least one confidence was the configured default.
    pub substituted: bool,
}

impl RecognizedText {
    fn from_words(words: Vec<RecognizedWord>, substituted: bool) -> Self {
        let confidence = if words.is_empty() {
            0.0
        } else {
            words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32
        };
        Self {
            words,
            confidence,
            substituted,
        }
    }

    /// Words joined by single spaces, in recognition order.
    pub fn text(&self) -> String {
        self.words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Where and how to recognise one region.
#[derive(Debug, Clone)]
pub struct RegionRequest<'a> {
    pub raster: &'a GrayImage,
    /// Page units per raster pixel.
    pub scale: f32,
    pub region: BoundingBox,
    pub hint: BlockType,
    pub timeout: Duration,
    pub default_confidence: f32,
}

/// Crop, recognise and normalise one region.
pub async fn recognize_region(
    backend: &dyn OcrBackend,
    req: &RegionRequest<'_>,
) -> Result<RecognizedText, PerceptionError> {
    let Some((cx, cy, cw, ch)) = crop_rect(req.raster, req.scale, &req.region) else {
        return Ok(RecognizedText::default());
    };
    let crop = imageops::crop_imm(req.raster, cx, cy, cw, ch).to_image();

    let strips = if req.hint == BlockType::Table {
        row_strips(&crop)
    } else {
        vec![(0, ch)]
    };
    debug!(
        "OCR region {} ({}) with {}: {} strip(s)",
        req.region,
        req.hint,
        backend.name(),
        strips.len()
    );

    let mut words = Vec::new();
    let mut substituted = false;
    let mut line_base = 0;
    for (y0, y1) in strips {
        let strip = if y0 == 0 && y1 == ch {
            crop.clone()
        } else {
            imageops::crop_imm(&crop, 0, y0, cw, y1 - y0).to_image()
        };
        let (sw, sh) = strip.dimensions();
        let mut output = with_timeout(req.timeout, backend.recognize(Arc::new(strip), req.hint)).await?;
        compact_lines(&mut output.words);
        let lines = output.words.iter().map(|w| w.line + 1).max().unwrap_or(0);
        let origin = (cx as f32, (cy + y0) as f32);
        let (mut normalized, sub) = normalize_words(output, (sw, sh), origin, req);
        for w in &mut normalized {
            w.line += line_base;
        }
        line_base += lines;
        substituted |= sub;
        words.extend(normalized);
    }
    Ok(RecognizedText::from_words(words, substituted))
}

async fn with_timeout<F>(timeout: Duration, fut: F) -> Result<OcrOutput, PerceptionError>
where
    F: std::future::Future<Output = Result<OcrOutput, PerceptionError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(PerceptionError::StageTimeout {
            stage: Stage::Ocr.to_string(),
            secs: timeout.as_secs(),
        }),
    }
}

/// Region → pixel rectangle inside the raster, or `None` if empty.
fn crop_rect(raster: &GrayImage, scale: f32, region: &BoundingBox) -> Option<(u32, u32, u32, u32)> {
    if scale <= 0.0 {
        return None;
    }
    let (w, h) = raster.dimensions();
    let x0 = ((region.x() / scale).floor().max(0.0) as u32).min(w);
    let y0 = ((region.y() / scale).floor().max(0.0) as u32).min(h);
    let x1 = ((region.right() / scale).ceil().max(0.0) as u32).min(w);
    let y1 = ((region.bottom() / scale).ceil().max(0.0) as u32).min(h);
    (x1 > x0 && y1 > y0).then(|| (x0, y0, x1 - x0, y1 - y0))
}

/// Horizontal strips containing ink, one per table row.
fn row_strips(crop: &GrayImage) -> Vec<(u32, u32)> {
    let (w, h) = crop.dimensions();
    let level = otsu_level(crop).min(200);
    let profile: Vec<u32> = (0..h)
        .map(|y| (0..w).filter(|&x| crop.get_pixel(x, y)[0] <= level).count() as u32)
        .collect();
    // Long rules are borders, not content.
    let content: Vec<u32> = profile
        .iter()
        .map(|&c| if c as f32 >= 0.8 * w as f32 { 0 } else { c })
        .collect();
    let strips: Vec<(u32, u32)> = ink_runs(&content, 0, 3)
        .into_iter()
        .map(|(a, b)| {
            let a = (a as u32).saturating_sub(STRIP_PADDING);
            let b = (b as u32 + STRIP_PADDING).min(h);
            (a, b)
        })
        .collect();
    if strips.len() <= 1 {
        vec![(0, h)]
    } else {
        strips
    }
}

/// Renumber backend line indices to `0..k` in their original order, so a
/// sparse or corrupt index never sizes a per-line buffer.
fn compact_lines(words: &mut [OcrWord]) {
    let mut distinct: Vec<usize> = words.iter().map(|w| w.line).collect();
    distinct.sort_unstable();
    distinct.dedup();
    for w in words.iter_mut() {
        w.line = distinct.binary_search(&w.line).unwrap_or(0);
    }
}

/// Map crop-local words to page units, fill in missing geometry and
/// confidences. Returns the words and whether any default was substituted.
fn normalize_words(
    output: OcrOutput,
    (width, height): (u32, u32),
    (ox, oy): (f32, f32),
    req: &RegionRequest<'_>,
) -> (Vec<RecognizedWord>, bool) {
    let line_count = output.words.iter().map(|w| w.line + 1).max().unwrap_or(1);
    let line_height = height as f32 / line_count as f32;
    let line_chars: Vec<usize> = (0..line_count)
        .map(|l| {
            output
                .words
                .iter()
                .filter(|w| w.line == l)
                .map(|w| w.text.chars().count() + 1)
                .sum()
        })
        .collect();
    let mut line_cursor = vec![0usize; line_count];

    let mut substituted = false;
    let mut words = Vec::with_capacity(output.words.len());
    for word in output.words {
        let text = word.text.trim().to_string();
        if text.is_empty() {
            continue;
        }
        let confidence = match word.confidence {
            Some(c) if c.is_finite() && c >= 0.0 => {
                if c > 1.0 {
                    (c / 100.0).min(1.0)
                } else {
                    c
                }
            }
            Some(_) | None => {
                substituted = true;
                req.default_confidence
            }
        };

        let local = word.bbox.or_else(|| {
            // Spread the line's words across the crop width by character count.
            let chars = word.text.chars().count() + 1;
            let total = line_chars.get(word.line).copied().unwrap_or(chars).max(1);
            let start = line_cursor.get(word.line).copied().unwrap_or(0);
            if let Some(c) = line_cursor.get_mut(word.line) {
                *c += chars;
            }
            let unit = width as f32 / total as f32;
            BoundingBox::new(
                start as f32 * unit,
                word.line as f32 * line_height,
                (chars as f32 * unit).max(1.0),
                line_height.max(1.0),
            )
        });
        let Some(page_box) = local
            .and_then(|b| b.offset(ox, oy))
            .and_then(|b| b.scaled(req.scale))
            .and_then(|b| fit_inside(&b, &req.region))
        else {
            warn!("Dropping OCR word '{}' with unusable geometry", text);
            continue;
        };

        words.push(RecognizedWord {
            text,
            line: word.line,
            bbox: page_box,
            confidence: confidence.clamp(0.0, 1.0),
        });
    }
    (words, substituted)
}

/// Clip `b` to `region`; a box outside the region collapses onto its edge.
fn fit_inside(b: &BoundingBox, region: &BoundingBox) -> Option<BoundingBox> {
    b.intersection(region).or_else(|| {
        let x = b.x().clamp(region.x(), region.right());
        let y = b.y().clamp(region.y(), region.bottom());
        let w = (region.right() - x).min(b.width()).max(f32::EPSILON);
        let h = (region.bottom() - y).min(b.height()).max(f32::EPSILON);
        BoundingBox::new(x.min(region.right() - w), y.min(region.bottom() - h), w, h)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::sync::Mutex;

    /// Returns canned output and records the size of every image it sees.
    struct Canned {
        output: OcrOutput,
        seen: Mutex<Vec<(u32, u32)>>,
    }

    impl Canned {
        fn new(output: OcrOutput) -> Self {
            Self {
                output,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl OcrBackend for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn initialize(&self) -> Result<(), PerceptionError> {
            Ok(())
        }

        async fn recognize(&self, image: Arc<GrayImage>, _hint: BlockType) -> Result<OcrOutput, PerceptionError> {
            self.seen.lock().unwrap().push(image.dimensions());
            Ok(self.output.clone())
        }
    }

    struct Hanging;

    #[async_trait]
    impl OcrBackend for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn initialize(&self) -> Result<(), PerceptionError> {
            Ok(())
        }

        async fn recognize(&self, _image: Arc<GrayImage>, _hint: BlockType) -> Result<OcrOutput, PerceptionError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(OcrOutput::default())
        }
    }

    fn request(raster: &GrayImage, region: BoundingBox, hint: BlockType) -> RegionRequest<'_> {
        RegionRequest {
            raster,
            scale: 0.5,
            region,
            hint,
            timeout: Duration::from_secs(5),
            default_confidence: 0.8,
        }
    }

    #[tokio::test]
    async fn plain_text_gets_default_confidence_and_geometry() {
        let raster = GrayImage::from_pixel(200, 200, Luma([255]));
        let region = BoundingBox::new(10.0, 10.0, 50.0, 20.0).unwrap();
        let backend = Canned::new(OcrOutput::from_plain_text("Invoice total\n42.00"));
        let out = recognize_region(&backend, &request(&raster, region, BlockType::Paragraph))
            .await
            .unwrap();

        assert_eq!(out.text(), "Invoice total 42.00");
        assert!(out.substituted);
        assert!((out.confidence - 0.8).abs() < 1e-6);
        assert_eq!(out.words[2].line, 1);
        for w in &out.words {
            assert!(region.contains(&w.bbox), "{} outside {}", w.bbox, region);
        }
        // Region is 50x20 page units at 0.5 units per pixel.
        assert_eq!(backend.seen.lock().unwrap()[0], (100, 40));
    }

    #[tokio::test]
    async fn percentage_confidences_are_normalised() {
        let raster = GrayImage::from_pixel(100, 100, Luma([255]));
        let region = BoundingBox::page(50.0, 50.0).unwrap();
        let output = OcrOutput {
            words: vec![
                OcrWord {
                    text: "alpha".into(),
                    line: 0,
                    bbox: BoundingBox::new(0.0, 0.0, 20.0, 10.0),
                    confidence: Some(90.0),
                },
                OcrWord {
                    text: "beta".into(),
                    line: 0,
                    bbox: BoundingBox::new(30.0, 0.0, 20.0, 10.0),
                    confidence: Some(0.5),
                },
            ],
        };
        let out = recognize_region(&Canned::new(output), &request(&raster, region, BlockType::Paragraph))
            .await
            .unwrap();
        assert!(!out.substituted);
        assert!((out.words[0].confidence - 0.9).abs() < 1e-6);
        assert!((out.confidence - 0.7).abs() < 1e-6);
        assert_eq!(out.words[1].bbox, BoundingBox::new(15.0, 0.0, 10.0, 5.0).unwrap());
    }

    #[tokio::test]
    async fn table_regions_are_split_into_row_strips() {
        let mut raster = GrayImage::from_pixel(200, 200, Luma([255]));
        for band in [20u32, 60, 100] {
            for y in band..band + 10 {
                for x in 20..60 {
                    raster.put_pixel(x, y, Luma([0]));
                }
            }
        }
        let backend = Canned::new(OcrOutput::from_plain_text("cell"));
        let region = BoundingBox::page(100.0, 100.0).unwrap();
        let out = recognize_region(&backend, &request(&raster, region, BlockType::Table))
            .await
            .unwrap();
        assert_eq!(backend.seen.lock().unwrap().len(), 3);
        let lines: Vec<usize> = out.words.iter().map(|w| w.line).collect();
        assert_eq!(lines, vec![0, 1, 2]);
    }

    #[test]
    fn boxed_words_are_grouped_into_lines() {
        let word = |text: &str, x: f32, y: f32| OcrWord {
            text: text.into(),
            line: 0,
            bbox: BoundingBox::new(x, y, 20.0, 10.0),
            confidence: Some(0.9),
        };
        let mut words = vec![
            word("world", 30.0, 1.0),
            word("next", 0.0, 20.0),
            word("hello", 0.0, 0.0),
        ];
        assign_lines(&mut words);
        let got: Vec<(&str, usize)> = words.iter().map(|w| (w.text.as_str(), w.line)).collect();
        assert_eq!(got, vec![("hello", 0), ("world", 0), ("next", 1)]);
    }

    #[tokio::test]
    async fn sparse_line_indices_are_renumbered() {
        let raster = GrayImage::from_pixel(100, 100, Luma([255]));
        let region = BoundingBox::page(50.0, 50.0).unwrap();
        let word = |text: &str, line: usize| OcrWord {
            text: text.into(),
            line,
            bbox: None,
            confidence: Some(0.9),
        };
        let output = OcrOutput {
            words: vec![word("first", 7), word("second", usize::MAX), word("also", 7)],
        };
        let out = recognize_region(&Canned::new(output), &request(&raster, region, BlockType::Paragraph))
            .await
            .unwrap();

        let lines: Vec<usize> = out.words.iter().map(|w| w.line).collect();
        assert_eq!(lines, vec![0, 1, 0]);
        for w in &out.words {
            assert!(region.contains(&w.bbox), "{} outside {}", w.bbox, region);
        }
    }

    #[tokio::test]
    async fn empty_region_yields_nothing() {
        let raster = GrayImage::from_pixel(10, 10, Luma([255]));
        let region = BoundingBox::new(100.0, 100.0, 5.0, 5.0).unwrap();
        let out = recognize_region(&Canned::new(OcrOutput::from_plain_text("x")), &request(&raster, region, BlockType::Paragraph))
            .await
            .unwrap();
        assert!(out.words.is_empty());
        assert_eq!(out.confidence, 0.0);
    }

    #[tokio::test]
    async fn hung_backend_times_out() {
        let raster = GrayImage::from_pixel(10, 10, Luma([255]));
        let region = BoundingBox::page(5.0, 5.0).unwrap();
        let req = RegionRequest {
            timeout: Duration::from_millis(50),
            ..request(&raster, region, BlockType::Paragraph)
        };
        let err = recognize_region(&Hanging, &req)
            .await
            .unwrap_err();
        assert!(matches!(err, PerceptionError::StageTimeout { .. }));
    }
}
