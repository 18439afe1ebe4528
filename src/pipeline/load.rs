//! Loaders: decode raw bytes into pages of embedded text and/or rasters.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps global state and
//! is not safe to drive from async code. Every pdfium call happens inside
//! `tokio::task::spawn_blocking` so Tokio workers never stall on a large
//! document.
//!
//! ## Why render only some pages?
//!
//! A page whose embedded text already covers a meaningful share of its area
//! is text-native: its words and their geometry come straight from the PDF
//! and OCR would only add noise. Rasterising it anyway would cost the most
//! memory of any stage for nothing, so the raster is produced only for pages
//! below [`LoadRequest::coverage_threshold`].

use crate::config::PageSelection;
use crate::document::{BoundingBox, DocumentMetadata};
use crate::error::PerceptionError;
use crate::pipeline::detect::{detect_kind, DocumentKind};
use async_trait::async_trait;
use image::GrayImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A run of embedded text with its position, top-left origin, page units.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub text: String,
    pub bbox: BoundingBox,
}

/// Group spans into visual lines: top to bottom, then left to right within
/// a line. A span joins the current line when it overlaps it vertically by
/// at least half of the shorter height.
pub fn group_into_lines<'a>(spans: impl IntoIterator<Item = &'a TextSpan>) -> Vec<Vec<&'a TextSpan>> {
    let mut sorted: Vec<&TextSpan> = spans.into_iter().collect();
    sorted.sort_by(|a, b| a.bbox.y().total_cmp(&b.bbox.y()).then(a.bbox.x().total_cmp(&b.bbox.x())));

    let mut lines: Vec<(BoundingBox, Vec<&TextSpan>)> = Vec::new();
    for span in sorted {
        match lines.last_mut() {
            Some((band, members)) if band.vertical_overlap_ratio(&span.bbox) >= 0.5 => {
                *band = band.union(&span.bbox);
                members.push(span);
            }
            _ => lines.push((span.bbox, vec![span])),
        }
    }
    lines
        .into_iter()
        .map(|(_, mut members)| {
            members.sort_by(|a, b| a.bbox.x().total_cmp(&b.bbox.x()));
            members
        })
        .collect()
}

/// One decoded page.
#[derive(Debug, Clone)]
pub struct LoadedPage {
    /// 1-based page number within the source document.
    pub source_page: usize,
    pub width: f32,
    pub height: f32,
    /// Grayscale raster; `None` for text-native PDF pages.
    pub raster: Option<GrayImage>,
    pub spans: Vec<TextSpan>,
}

impl LoadedPage {
    /// Fraction of the page area covered by non-empty embedded text.
    pub fn text_coverage(&self) -> f32 {
        let page_area = self.width * self.height;
        if page_area <= 0.0 {
            return 0.0;
        }
        let covered: f32 = self
            .spans
            .iter()
            .filter(|s| !s.text.trim().is_empty())
            .filter_map(|s| s.bbox.clamp_to(self.width, self.height))
            .map(|(b, _)| b.area())
            .sum();
        (covered / page_area).min(1.0)
    }

    pub fn is_text_native(&self, threshold: f32) -> bool {
        self.spans.iter().any(|s| !s.text.trim().is_empty()) && self.text_coverage() >= threshold
    }

    /// Page units per raster pixel.
    pub fn raster_scale(&self) -> Option<f32> {
        self.raster
            .as_ref()
            .filter(|r| r.width() > 0)
            .map(|r| self.width / r.width() as f32)
    }
}

/// Output of a loader.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub mime_type: String,
    pub metadata: DocumentMetadata,
    pub pages: Vec<LoadedPage>,
    /// Loader-level events worth recording in provenance.
    pub notes: Vec<String>,
}

/// Everything a loader needs to know about one request.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub page_range: PageSelection,
    pub max_pages: usize,
    pub dpi: u32,
    pub max_raster_pixels: u32,
    pub coverage_threshold: f32,
    pub password: Option<String>,
    pub pdfium_library_path: Option<PathBuf>,
}

impl Default for LoadRequest {
    fn default() -> Self {
        Self {
            page_range: PageSelection::All,
            max_pages: 500,
            dpi: 200,
            max_raster_pixels: 2400,
            coverage_threshold: 0.10,
            password: None,
            pdfium_library_path: None,
        }
    }
}

impl LoadRequest {
    /// Resolve the page selection against the real page count, applying the
    /// page limit. Returns 0-based indices and an optional truncation note.
    pub fn select_pages(
        &self,
        total_pages: usize,
    ) -> Result<(Vec<usize>, Option<String>), PerceptionError> {
        let mut indices = self.page_range.to_indices(total_pages);
        if indices.is_empty() {
            return Err(PerceptionError::InvalidOptions(format!(
                "page_range {:?} selects no page of a {}-page document",
                self.page_range, total_pages
            )));
        }
        let mut note = None;
        if indices.len() > self.max_pages {
            note = Some(format!(
                "page limit: processed {} of {} selected pages",
                self.max_pages,
                indices.len()
            ));
            warn!("{}", note.as_deref().unwrap_or_default());
            indices.truncate(self.max_pages);
        }
        Ok((indices, note))
    }
}

/// Capability shared by every document decoder.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Sniff the content and return its mime type.
    fn detect(&self, bytes: &[u8]) -> Result<String, PerceptionError>;

    /// Decode the selected pages.
    async fn load(
        &self,
        bytes: Arc<[u8]>,
        request: &LoadRequest,
    ) -> Result<LoadedDocument, PerceptionError>;
}

// ── PDF ──────────────────────────────────────────────────────────────────

/// PDF loader backed by pdfium.
#[derive(Debug, Default, Clone)]
pub struct PdfLoader;

#[async_trait]
impl Loader for PdfLoader {
    fn detect(&self, bytes: &[u8]) -> Result<String, PerceptionError> {
        match detect_kind(bytes)? {
            DocumentKind::Pdf => Ok(DocumentKind::Pdf.mime_type().to_string()),
            other => Err(PerceptionError::UnsupportedDocument {
                detail: format!("expected a PDF, found {}", other.mime_type()),
            }),
        }
    }

    async fn load(
        &self,
        bytes: Arc<[u8]>,
        request: &LoadRequest,
    ) -> Result<LoadedDocument, PerceptionError> {
        let request = request.clone();
        tokio::task::spawn_blocking(move || load_pdf_blocking(&bytes, &request))
            .await
            .map_err(|e| PerceptionError::Internal(format!("PDF load task panicked: {e}")))?
    }
}

/// Bind pdfium from an explicit file or directory, else the system library.
fn bind_pdfium(library_path: Option<&Path>) -> Result<Pdfium, PerceptionError> {
    let bindings = match library_path {
        Some(p) if p.is_dir() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(p))
        }
        Some(p) => Pdfium::bind_to_library(p),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| PerceptionError::BackendUnavailable {
        backend: "pdfium".into(),
        reason: format!("{e:?}"),
    })?;
    Ok(Pdfium::new(bindings))
}

fn load_pdf_blocking(
    bytes: &[u8],
    request: &LoadRequest,
) -> Result<LoadedDocument, PerceptionError> {
    let pdfium = bind_pdfium(request.pdfium_library_path.as_deref())?;

    let password = request.password.as_deref();
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, password)
        .map_err(|e| {
            let err_str = format!("{e:?}");
            let detail = if err_str.to_ascii_lowercase().contains("password") {
                if password.is_some() {
                    "wrong password".to_string()
                } else {
                    "encrypted; a password is required".to_string()
                }
            } else {
                err_str
            };
            PerceptionError::CorruptDocument { detail }
        })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);

    let (indices, note) = request.select_pages(total_pages)?;
    let metadata = read_metadata(&document, total_pages);

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(request.dpi as f32 / 72.0)
        .set_maximum_width(request.max_raster_pixels as i32)
        .set_maximum_height(request.max_raster_pixels as i32);

    let mut loaded = Vec::with_capacity(indices.len());
    for idx in indices {
        let page = pages
            .get(idx as u16)
            .map_err(|e| PerceptionError::CorruptDocument {
                detail: format!("page {}: {e:?}", idx + 1),
            })?;

        let width = page.width().value;
        let height = page.height().value;
        let spans = extract_spans(&page, idx + 1, width, height);

        let mut lp = LoadedPage {
            source_page: idx + 1,
            width,
            height,
            raster: None,
            spans,
        };

        if !lp.is_text_native(request.coverage_threshold) {
            let bitmap = page.render_with_config(&render_config).map_err(|e| {
                PerceptionError::CorruptDocument {
                    detail: format!("rasterisation of page {} failed: {e:?}", idx + 1),
                }
            })?;
            let raster = bitmap.as_image().to_luma8();
            debug!(
                "Rendered page {} → {}x{} px (coverage {:.3})",
                idx + 1,
                raster.width(),
                raster.height(),
                lp.text_coverage()
            );
            lp.raster = Some(raster);
        } else {
            debug!(
                "Page {} is text-native ({} spans, coverage {:.3})",
                idx + 1,
                lp.spans.len(),
                lp.text_coverage()
            );
        }
        loaded.push(lp);
    }

    Ok(LoadedDocument {
        mime_type: DocumentKind::Pdf.mime_type().to_string(),
        metadata,
        pages: loaded,
        notes: note.into_iter().collect(),
    })
}

/// Embedded text segments, converted from PDF space (bottom-left origin)
/// to page space (top-left origin).
fn extract_spans(page: &PdfPage, page_number: usize, width: f32, height: f32) -> Vec<TextSpan> {
    let text = match page.text() {
        Ok(t) => t,
        Err(e) => {
            warn!("Page {}: no text layer ({:?})", page_number, e);
            return Vec::new();
        }
    };

    text.segments()
        .iter()
        .filter_map(|segment| {
            let content = segment.text();
            if content.trim().is_empty() {
                return None;
            }
            let r = segment.bounds();
            let bbox = BoundingBox::from_corners(
                r.left().value.max(0.0),
                (height - r.top().value).max(0.0),
                r.right().value.max(0.0),
                (height - r.bottom().value).max(0.0),
            )?;
            let (bbox, _) = bbox.clamp_to(width, height)?;
            Some(TextSpan {
                text: content.split_whitespace().collect::<Vec<_>>().join(" "),
                bbox,
            })
        })
        .collect()
}

fn read_metadata(document: &PdfDocument, page_count: usize) -> DocumentMetadata {
    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata.get(tag).and_then(|t| {
            let v = t.value().trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        })
    };

    DocumentMetadata {
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
        subject: get_meta(PdfDocumentMetadataTagType::Subject),
        creator: get_meta(PdfDocumentMetadataTagType::Creator),
        producer: get_meta(PdfDocumentMetadataTagType::Producer),
        creation_date: get_meta(PdfDocumentMetadataTagType::CreationDate),
        modification_date: get_meta(PdfDocumentMetadataTagType::ModificationDate),
        page_count,
    }
}

// ── Images ───────────────────────────────────────────────────────────────

/// Loader for single-page raster inputs (scans, photos).
#[derive(Debug, Default, Clone)]
pub struct ImageLoader;

#[async_trait]
impl Loader for ImageLoader {
    fn detect(&self, bytes: &[u8]) -> Result<String, PerceptionError> {
        match detect_kind(bytes)? {
            kind @ DocumentKind::Image(_) => Ok(kind.mime_type().to_string()),
            DocumentKind::Pdf => Err(PerceptionError::UnsupportedDocument {
                detail: "expected an image, found a PDF".into(),
            }),
        }
    }

    async fn load(
        &self,
        bytes: Arc<[u8]>,
        request: &LoadRequest,
    ) -> Result<LoadedDocument, PerceptionError> {
        let mime_type = self.detect(&bytes)?;
        let (indices, _) = request.select_pages(1)?;
        debug_assert_eq!(indices, vec![0]);

        let raster = tokio::task::spawn_blocking(move || {
            image::load_from_memory(&bytes).map(|img| img.to_luma8())
        })
        .await
        .map_err(|e| PerceptionError::Internal(format!("image decode task panicked: {e}")))?
        .map_err(|e| PerceptionError::CorruptDocument {
            detail: format!("image decode failed: {e}"),
        })?;

        if raster.width() == 0 || raster.height() == 0 {
            return Err(PerceptionError::CorruptDocument {
                detail: "image has zero size".into(),
            });
        }
        info!("Image loaded: {}x{} px", raster.width(), raster.height());

        Ok(LoadedDocument {
            mime_type,
            metadata: DocumentMetadata {
                page_count: 1,
                ..DocumentMetadata::default()
            },
            pages: vec![LoadedPage {
                source_page: 1,
                width: raster.width() as f32,
                height: raster.height() as f32,
                raster: Some(raster),
                spans: Vec::new(),
            }],
            notes: Vec::new(),
        })
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────

/// Default loader: sniffs the content and hands it to the matching variant.
#[derive(Debug, Default, Clone)]
pub struct SniffingLoader {
    pdf: PdfLoader,
    image: ImageLoader,
}

#[async_trait]
impl Loader for SniffingLoader {
    fn detect(&self, bytes: &[u8]) -> Result<String, PerceptionError> {
        Ok(detect_kind(bytes)?.mime_type().to_string())
    }

    async fn load(
        &self,
        bytes: Arc<[u8]>,
        request: &LoadRequest,
    ) -> Result<LoadedDocument, PerceptionError> {
        match detect_kind(&bytes)? {
            DocumentKind::Pdf => self.pdf.load(bytes, request).await,
            DocumentKind::Image(_) => self.image.load(bytes, request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Luma};
    use std::io::Cursor;

    fn span(text: &str, x: f32, y: f32, w: f32, h: f32) -> TextSpan {
        TextSpan {
            text: text.into(),
            bbox: BoundingBox::new(x, y, w, h).unwrap(),
        }
    }

    #[test]
    fn coverage_and_text_native() {
        let page = LoadedPage {
            source_page: 1,
            width: 100.0,
            height: 100.0,
            raster: None,
            spans: vec![span("Invoice", 0.0, 0.0, 50.0, 10.0), span("  ", 0.0, 50.0, 100.0, 50.0)],
        };
        assert!((page.text_coverage() - 0.05).abs() < 1e-6);
        assert!(page.is_text_native(0.05));
        assert!(!page.is_text_native(0.10));
    }

    #[test]
    fn page_without_spans_is_never_text_native() {
        let page = LoadedPage {
            source_page: 1,
            width: 10.0,
            height: 10.0,
            raster: None,
            spans: vec![],
        };
        assert!(!page.is_text_native(0.0));
    }

    #[test]
    fn select_pages_applies_limit_and_rejects_empty() {
        let req = LoadRequest {
            max_pages: 2,
            ..LoadRequest::default()
        };
        let (idx, note) = req.select_pages(5).unwrap();
        assert_eq!(idx, vec![0, 1]);
        assert!(note.is_some());

        let req = LoadRequest {
            page_range: PageSelection::Single(9),
            ..LoadRequest::default()
        };
        assert!(matches!(
            req.select_pages(3),
            Err(PerceptionError::InvalidOptions(_))
        ));
    }

    #[tokio::test]
    async fn image_loader_produces_one_raster_page() {
        let img = GrayImage::from_pixel(40, 20, Luma([200]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();

        let doc = SniffingLoader::default()
            .load(Arc::from(buf), &LoadRequest::default())
            .await
            .unwrap();
        assert_eq!(doc.mime_type, "image/png");
        assert_eq!(doc.pages.len(), 1);
        let page = &doc.pages[0];
        assert_eq!((page.width, page.height), (40.0, 20.0));
        assert_eq!(page.raster_scale(), Some(1.0));
    }

    #[tokio::test]
    async fn truncated_png_is_corrupt_not_unsupported() {
        let img = GrayImage::from_pixel(40, 20, Luma([200]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf.truncate(20);

        let err = ImageLoader
            .load(Arc::from(buf), &LoadRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PerceptionError::CorruptDocument { .. }), "{err}");
    }
}
