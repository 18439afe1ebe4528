//! Configuration types for document perception.
//!
//! Three layers, three lifetimes:
//!
//! * [`PerceptionConfig`] — engine-wide knobs fixed when a
//!   [`crate::Perceiver`] is built (DPI, thresholds, timeouts, pool sizes),
//!   created through [`PerceptionConfigBuilder`].
//! * [`ParseOptions`] — per-request switches. A closed structure: unknown
//!   keys are rejected at deserialisation instead of being ignored.
//! * [`StoreConfig`] — where documents live and how much of them stays in
//!   memory.

use crate::document::BlockType;
use crate::error::PerceptionError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Engine configuration for a [`crate::Perceiver`].
///
/// # Example
/// ```rust
/// use docsense::PerceptionConfig;
///
/// let config = PerceptionConfig::builder()
///     .dpi(200)
///     .text_coverage_threshold(0.2)
///     .stage_timeout_secs(30)
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 200);
/// ```
#[derive(Clone)]
pub struct PerceptionConfig {
    /// Rasterisation DPI for PDF pages that need OCR. Range: 72–400. Default: 200.
    pub dpi: u32,

    /// Longest rendered edge in pixels, independent of DPI. Default: 2400.
    pub max_raster_pixels: u32,

    /// Fraction of the page area that embedded text must cover for the page
    /// to count as text-native (no raster, no OCR). Default: 0.10.
    pub text_coverage_threshold: f32,

    /// Confidence substituted when an OCR backend reports none. Default: 0.8.
    pub ocr_default_confidence: f32,

    /// Per-stage, per-page time budget. Default: 60 s.
    pub stage_timeout: Duration,

    /// Documents processed concurrently. Default: available CPUs.
    pub max_concurrent_documents: usize,

    /// Pages of one document processed concurrently. Default: 4.
    pub page_concurrency: usize,

    /// Inputs larger than this are rejected. Default: 100 MiB.
    pub max_file_size_bytes: u64,

    /// Pages beyond this are not processed. Default: 500.
    pub max_pages: usize,

    /// Explicit pdfium shared library. `None` binds the system library.
    pub pdfium_library_path: Option<PathBuf>,

    /// User password for encrypted PDFs.
    pub pdf_password: Option<String>,

    /// Tesseract language code. Default: "eng".
    pub tesseract_language: String,

    pub preprocess: PreprocessConfig,
    pub layout: LayoutConfig,
    pub vision: VisionConfig,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            dpi: 200,
            max_raster_pixels: 2400,
            text_coverage_threshold: 0.10,
            ocr_default_confidence: 0.8,
            stage_timeout: Duration::from_secs(60),
            max_concurrent_documents: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            page_concurrency: 4,
            max_file_size_bytes: 100 * 1024 * 1024,
            max_pages: 500,
            pdfium_library_path: None,
            pdf_password: None,
            tesseract_language: "eng".to_string(),
            preprocess: PreprocessConfig::default(),
            layout: LayoutConfig::default(),
            vision: VisionConfig::default(),
        }
    }
}

impl fmt::Debug for PerceptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerceptionConfig")
            .field("dpi", &self.dpi)
            .field("max_raster_pixels", &self.max_raster_pixels)
            .field("text_coverage_threshold", &self.text_coverage_threshold)
            .field("ocr_default_confidence", &self.ocr_default_confidence)
            .field("stage_timeout", &self.stage_timeout)
            .field("max_concurrent_documents", &self.max_concurrent_documents)
            .field("page_concurrency", &self.page_concurrency)
            .field("max_file_size_bytes", &self.max_file_size_bytes)
            .field("max_pages", &self.max_pages)
            .field("pdfium_library_path", &self.pdfium_library_path)
            .field("pdf_password", &self.pdf_password.as_ref().map(|_| "<redacted>"))
            .field("tesseract_language", &self.tesseract_language)
            .field("preprocess", &self.preprocess)
            .field("layout", &self.layout)
            .field("vision", &self.vision)
            .finish()
    }
}

impl PerceptionConfig {
    /// Create a new builder for `PerceptionConfig`.
    pub fn builder() -> PerceptionConfigBuilder {
        PerceptionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PerceptionConfig`].
#[derive(Debug)]
pub struct PerceptionConfigBuilder {
    config: PerceptionConfig,
}

impl PerceptionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_raster_pixels(mut self, px: u32) -> Self {
        self.config.max_raster_pixels = px.max(100);
        self
    }

    pub fn text_coverage_threshold(mut self, fraction: f32) -> Self {
        self.config.text_coverage_threshold = fraction;
        self
    }

    pub fn ocr_default_confidence(mut self, c: f32) -> Self {
        self.config.ocr_default_confidence = c;
        self
    }

    pub fn stage_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stage_timeout = Duration::from_secs(secs);
        self
    }

    pub fn stage_timeout(mut self, timeout: Duration) -> Self {
        self.config.stage_timeout = timeout;
        self
    }

    pub fn max_concurrent_documents(mut self, n: usize) -> Self {
        self.config.max_concurrent_documents = n.max(1);
        self
    }

    pub fn page_concurrency(mut self, n: usize) -> Self {
        self.config.page_concurrency = n.max(1);
        self
    }

    pub fn max_file_size_bytes(mut self, bytes: u64) -> Self {
        self.config.max_file_size_bytes = bytes;
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = n;
        self
    }

    pub fn pdfium_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library_path = Some(path.into());
        self
    }

    pub fn pdf_password(mut self, pwd: impl Into<String>) -> Self {
        self.config.pdf_password = Some(pwd.into());
        self
    }

    pub fn tesseract_language(mut self, lang: impl Into<String>) -> Self {
        self.config.tesseract_language = lang.into();
        self
    }

    pub fn preprocess(mut self, p: PreprocessConfig) -> Self {
        self.config.preprocess = p;
        self
    }

    pub fn layout(mut self, l: LayoutConfig) -> Self {
        self.config.layout = l;
        self
    }

    pub fn vision(mut self, v: VisionConfig) -> Self {
        self.config.vision = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PerceptionConfig, PerceptionError> {
        let c = &self.config;
        if !(0.0..=1.0).contains(&c.text_coverage_threshold) {
            return Err(PerceptionError::InvalidConfig(format!(
                "text_coverage_threshold must be within 0–1, got {}",
                c.text_coverage_threshold
            )));
        }
        if !(0.0..=1.0).contains(&c.ocr_default_confidence) {
            return Err(PerceptionError::InvalidConfig(format!(
                "ocr_default_confidence must be within 0–1, got {}",
                c.ocr_default_confidence
            )));
        }
        if c.stage_timeout.is_zero() {
            return Err(PerceptionError::InvalidConfig(
                "stage_timeout must be > 0".into(),
            ));
        }
        if c.max_pages == 0 {
            return Err(PerceptionError::InvalidConfig("max_pages must be ≥ 1".into()));
        }
        c.layout.validate()?;
        Ok(self.config)
    }
}

// ── Stage configs ────────────────────────────────────────────────────────

/// Image normalisation applied to rasterised pages before layout and OCR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// 3×3 median filter.
    pub denoise: bool,
    pub deskew: bool,
    /// Largest skew angle searched, in degrees, either direction. Default: 10.
    pub max_skew_degrees: f32,
    /// Percentile contrast stretch.
    pub contrast: bool,
    /// Longest edge after normalisation; larger rasters are downscaled.
    pub max_dimension: u32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            denoise: true,
            deskew: true,
            max_skew_degrees: 10.0,
            contrast: true,
            max_dimension: 2400,
        }
    }
}

/// Knobs of the layout detector and the reading-order algorithm.
///
/// Fractions are relative to the page dimension named in the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Two regions share a row when their vertical overlap is at least
    /// this fraction of the shorter one's height. Default: 0.5.
    pub row_overlap: f32,
    /// A vertical whitespace band at least this wide (fraction of page
    /// width) that no region crosses separates columns. Default: 0.03.
    pub column_gap_fraction: f32,
    /// A horizontal whitespace band at least this tall (fraction of page
    /// height) separates blocks in the heuristic detector. Default: 0.012.
    pub block_gap_fraction: f32,
    /// Regions smaller than this fraction of the page area are noise.
    pub min_region_area_fraction: f32,
    /// Fixed binarisation threshold; `None` uses Otsu's method.
    pub ink_threshold: Option<u8>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            row_overlap: 0.5,
            column_gap_fraction: 0.03,
            block_gap_fraction: 0.012,
            min_region_area_fraction: 0.0002,
            ink_threshold: None,
        }
    }
}

impl LayoutConfig {
    fn validate(&self) -> Result<(), PerceptionError> {
        let fractions = [
            ("row_overlap", self.row_overlap),
            ("column_gap_fraction", self.column_gap_fraction),
            ("block_gap_fraction", self.block_gap_fraction),
            ("min_region_area_fraction", self.min_region_area_fraction),
        ];
        for (name, v) in fractions {
            if !(0.0..=1.0).contains(&v) {
                return Err(PerceptionError::InvalidConfig(format!(
                    "layout.{name} must be within 0–1, got {v}"
                )));
            }
        }
        Ok(())
    }
}

/// Settings of the vision-LLM OCR backend.
#[derive(Clone)]
pub struct VisionConfig {
    /// Pre-constructed provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,
    /// Provider name (e.g. "openai", "ollama"). `None` auto-detects.
    pub provider_name: Option<String>,
    pub model: Option<String>,
    /// Default: 0.0.
    pub temperature: f32,
    pub max_tokens: usize,
    pub max_retries: u32,
    /// Initial retry delay; doubles per attempt. Default: 500.
    pub retry_backoff_ms: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            provider: None,
            provider_name: None,
            model: None,
            temperature: 0.0,
            max_tokens: 2048,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl fmt::Debug for VisionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionConfig")
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish()
    }
}

// ── Per-request options ──────────────────────────────────────────────────

/// Which OCR backend a request wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrEngine {
    #[default]
    Tesseract,
    Vision,
    /// Never OCR; pages without embedded text come out empty and degraded.
    Disabled,
}

impl OcrEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrEngine::Tesseract => "tesseract",
            OcrEngine::Vision => "vision",
            OcrEngine::Disabled => "disabled",
        }
    }
}

impl FromStr for OcrEngine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tesseract" => Ok(OcrEngine::Tesseract),
            "vision" => Ok(OcrEngine::Vision),
            "disabled" | "none" | "off" => Ok(OcrEngine::Disabled),
            other => Err(format!("unknown OCR engine '{other}'")),
        }
    }
}

/// Per-request parse options.
///
/// ```rust
/// use docsense::{OcrEngine, ParseOptions};
///
/// let opts = ParseOptions::from_json(r#"{"ocr_engine": "vision", "extract_tables": false}"#).unwrap();
/// assert_eq!(opts.ocr_engine, OcrEngine::Vision);
/// assert!(opts.extract_layout);
///
/// assert!(ParseOptions::from_json(r#"{"ocr": "vision"}"#).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ParseOptions {
    pub ocr_engine: OcrEngine,
    /// Run layout detection. When off, each page is one full-page region.
    pub extract_layout: bool,
    /// Decompose table regions into cell grids.
    pub extract_tables: bool,
    /// Emit figure records (and their caption links).
    pub extract_figures: bool,
    pub page_range: PageSelection,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            ocr_engine: OcrEngine::default(),
            extract_layout: true,
            extract_tables: true,
            extract_figures: true,
            page_range: PageSelection::All,
        }
    }
}

impl ParseOptions {
    pub fn from_json(json: &str) -> Result<Self, PerceptionError> {
        serde_json::from_str(json).map_err(|e| PerceptionError::InvalidOptions(e.to_string()))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, PerceptionError> {
        serde_json::from_value(value).map_err(|e| PerceptionError::InvalidOptions(e.to_string()))
    }

    /// Stable string identifying these options, used in the coalescing key.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// Specifies which pages of a document to process (or to search).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSelection {
    /// All pages (default).
    #[default]
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Does the selection include this 1-indexed page?
    pub fn contains(&self, page_number: usize) -> bool {
        match self {
            PageSelection::All => true,
            PageSelection::Single(p) => *p == page_number,
            PageSelection::Range(s, e) => page_number >= *s && page_number <= *e,
            PageSelection::Set(pages) => pages.contains(&page_number),
        }
    }
}

/// Parses `"all"`, `"3"`, `"2-5"` and `"1,3,7-9"`.
impl FromStr for PageSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            return Ok(PageSelection::All);
        }
        let parse = |t: &str| -> Result<usize, String> {
            t.trim()
                .parse::<usize>()
                .ok()
                .filter(|&n| n >= 1)
                .ok_or_else(|| format!("invalid page number '{t}'"))
        };
        let mut pages = Vec::new();
        for part in s.split(',') {
            match part.split_once('-') {
                Some((a, b)) => {
                    let (a, b) = (parse(a)?, parse(b)?);
                    if a > b {
                        return Err(format!("invalid page range '{part}'"));
                    }
                    if !s.contains(',') {
                        return Ok(PageSelection::Range(a, b));
                    }
                    pages.extend(a..=b);
                }
                None => pages.push(parse(part)?),
            }
        }
        Ok(match pages.as_slice() {
            [single] => PageSelection::Single(*single),
            _ => PageSelection::Set(pages),
        })
    }
}

// ── Store ────────────────────────────────────────────────────────────────

/// Location and memory budget of a [`crate::store::LayeredStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the durable layer.
    pub root: PathBuf,
    /// Documents kept in memory. Default: 64.
    pub max_cached_documents: usize,
    /// Serialised bytes kept in memory. Default: 256 MiB.
    pub max_cached_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            max_cached_documents: 64,
            max_cached_bytes: 256 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn max_cached_documents(mut self, n: usize) -> Self {
        self.max_cached_documents = n.max(1);
        self
    }

    pub fn max_cached_bytes(mut self, n: usize) -> Self {
        self.max_cached_bytes = n;
        self
    }
}

/// `$XDG_CACHE_HOME/docsense`, else `~/.cache/docsense`, else `./.docsense`.
fn default_store_root() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir).join("docsense");
    }
    match std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        Some(home) => PathBuf::from(home).join(".cache").join("docsense"),
        None => PathBuf::from(".docsense"),
    }
}

/// Parse a comma-separated block-type filter such as `"heading,table"`.
pub fn parse_block_types(s: &str) -> Result<Vec<BlockType>, String> {
    s.split(',')
        .filter(|t| !t.trim().is_empty())
        .map(str::parse)
        .collect()
}
