//! The `Document` graph produced by the perception pipeline.
//!
//! ```text
//! Document
//!  ├─ SourceInfo        filename, mime type, size, sha256
//!  ├─ DocumentMetadata  title / author / dates (best effort)
//!  ├─ Page*             1-based, contiguous
//!  │   ├─ Block*        reading order, ids "p{page}_b{n}"
//!  │   ├─ Table*        one per table-typed block
//!  │   ├─ Figure*       caption is a block id, not an owned block
//!  │   └─ PageStatus    degraded flag, text source, stage failures
//!  └─ Provenance        stages run / skipped, timings, annotations
//! ```
//!
//! Everything here is plain data with `serde` derives; the JSON form is the
//! persisted record format of [`crate::store::FileStore`].

use crate::error::{Stage, StageFailure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Slack allowed when comparing floating-point page coordinates.
const COORD_EPSILON: f32 = 1e-3;

// ── Geometry ─────────────────────────────────────────────────────────────

/// Axis-aligned rectangle in page units, origin at the top-left corner.
///
/// Always has a non-negative origin and strictly positive extent; the only
/// way to obtain one is through the validating constructors, and
/// deserialisation goes through the same check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBox")]
pub struct BoundingBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

#[derive(Deserialize)]
struct RawBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

impl TryFrom<RawBox> for BoundingBox {
    type Error = String;

    fn try_from(raw: RawBox) -> Result<Self, Self::Error> {
        BoundingBox::new(raw.x, raw.y, raw.width, raw.height).ok_or_else(|| {
            format!(
                "invalid bounding box ({}, {}, {}, {})",
                raw.x, raw.y, raw.width, raw.height
            )
        })
    }
}

impl BoundingBox {
    /// Returns `None` unless every value is finite, the origin is
    /// non-negative and both extents are positive.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Option<Self> {
        let finite = [x, y, width, height].iter().all(|v| v.is_finite());
        if !finite || x < 0.0 || y < 0.0 || width <= 0.0 || height <= 0.0 {
            return None;
        }
        Some(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// Build from two corners; the corners may come in any order.
    pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32) -> Option<Self> {
        let (left, right) = if x0 <= x1 { (x0, x1) } else { (x1, x0) };
        let (top, bottom) = if y0 <= y1 { (y0, y1) } else { (y1, y0) };
        Self::new(left, top, right - left, bottom - top)
    }

    /// The whole page.
    pub fn page(width: f32, height: f32) -> Option<Self> {
        Self::new(0.0, 0.0, width, height)
    }

    pub fn x(&self) -> f32 {
        self.x
    }

    pub fn y(&self) -> f32 {
        self.y
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn contains_point(&self, px: f32, py: f32) -> bool {
        px >= self.x && px <= self.right() && py >= self.y && py <= self.bottom()
    }

    /// `other` lies entirely inside `self` (with float slack).
    pub fn contains(&self, other: &BoundingBox) -> bool {
        other.x + COORD_EPSILON >= self.x
            && other.y + COORD_EPSILON >= self.y
            && other.right() <= self.right() + COORD_EPSILON
            && other.bottom() <= self.bottom() + COORD_EPSILON
    }

    /// `true` when the box fits inside `[0,width]×[0,height]`.
    pub fn within_page(&self, width: f32, height: f32) -> bool {
        self.right() <= width + COORD_EPSILON && self.bottom() <= height + COORD_EPSILON
    }

    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return None;
        }
        BoundingBox::new(left, top, right - left, bottom - top)
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let left = self.x.min(other.x);
        let top = self.y.min(other.y);
        BoundingBox {
            x: left,
            y: top,
            width: self.right().max(other.right()) - left,
            height: self.bottom().max(other.bottom()) - top,
        }
    }

    /// Vertical overlap as a fraction of the shorter box's height.
    pub fn vertical_overlap_ratio(&self, other: &BoundingBox) -> f32 {
        let overlap = self.bottom().min(other.bottom()) - self.y.max(other.y);
        if overlap <= 0.0 {
            return 0.0;
        }
        overlap / self.height.min(other.height)
    }

    /// Multiply every coordinate by `factor` (raster pixels → page units).
    pub fn scaled(&self, factor: f32) -> Option<BoundingBox> {
        BoundingBox::new(
            self.x * factor,
            self.y * factor,
            self.width * factor,
            self.height * factor,
        )
    }

    /// Translate by a non-negative offset (region-local → page coordinates).
    pub fn offset(&self, dx: f32, dy: f32) -> Option<BoundingBox> {
        BoundingBox::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Clip to `[0,width]×[0,height]`.
    ///
    /// Returns the clipped box and whether anything changed, or `None` when
    /// the box lies entirely outside the page.
    pub fn clamp_to(&self, width: f32, height: f32) -> Option<(BoundingBox, bool)> {
        if self.within_page(width, height) {
            return Some((*self, false));
        }
        let right = self.right().min(width);
        let bottom = self.bottom().min(height);
        if right <= self.x || bottom <= self.y {
            return None;
        }
        BoundingBox::new(self.x, self.y, right - self.x, bottom - self.y).map(|b| (b, true))
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.1}, {:.1}, {:.1}×{:.1}]",
            self.x, self.y, self.width, self.height
        )
    }
}

// ── Blocks ───────────────────────────────────────────────────────────────

/// Semantic type of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Heading,
    Paragraph,
    List,
    Table,
    Figure,
    Caption,
    Header,
    Footer,
    Other,
}

impl BlockType {
    pub const ALL: [BlockType; 9] = [
        BlockType::Heading,
        BlockType::Paragraph,
        BlockType::List,
        BlockType::Table,
        BlockType::Figure,
        BlockType::Caption,
        BlockType::Header,
        BlockType::Footer,
        BlockType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Heading => "heading",
            BlockType::Paragraph => "paragraph",
            BlockType::List => "list",
            BlockType::Table => "table",
            BlockType::Figure => "figure",
            BlockType::Caption => "caption",
            BlockType::Header => "header",
            BlockType::Footer => "footer",
            BlockType::Other => "other",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        BlockType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown block type '{s}'"))
    }
}

/// A typed, positioned unit of extracted content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// `p{page}_b{n}`, `n` being the 1-based reading-order rank.
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub bbox: BoundingBox,
    pub text: String,
    pub confidence: f32,
    pub page_number: usize,
}

impl Block {
    pub fn make_id(page_number: usize, rank: usize) -> String {
        format!("p{page_number}_b{rank}")
    }
}

/// Grid decomposition of a `table` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub block_id: String,
    pub bbox: BoundingBox,
    pub rows: usize,
    pub columns: usize,
    /// `rows` sequences of exactly `columns` strings; empty cells are `""`.
    pub cells: Vec<Vec<String>>,
}

impl Table {
    pub fn is_rectangular(&self) -> bool {
        self.cells.len() == self.rows && self.cells.iter().all(|r| r.len() == self.columns)
    }
}

/// A figure region; the caption is a back-reference to a caption block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Figure {
    pub block_id: String,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub caption: Option<String>,
}

// ── Pages ────────────────────────────────────────────────────────────────

/// Where a page's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextSource {
    /// Embedded PDF text; OCR did not run.
    Embedded,
    /// OCR only.
    Ocr,
    /// Embedded text plus OCR for some regions.
    Mixed,
    /// No text could be obtained.
    #[default]
    None,
}

/// Per-page processing outcome.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PageStatus {
    /// At least one stage fell back or failed on this page.
    pub degraded: bool,
    pub text_source: TextSource,
    /// Stages that did not run for this page.
    #[serde(default)]
    pub stages_skipped: Vec<Stage>,
    #[serde(default)]
    pub failures: Vec<StageFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// 1-based position in this document; always `index + 1`.
    pub page_number: usize,
    /// Page number in the source file (differs when a page range was requested).
    pub source_page: usize,
    pub width: f32,
    pub height: f32,
    /// Reading order.
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub figures: Vec<Figure>,
    #[serde(default)]
    pub status: PageStatus,
}

impl Page {
    /// Empty page carrying only its failure markers.
    #[cfg(test)]
    pub(crate) fn failed(
        page_number: usize,
        source_page: usize,
        width: f32,
        height: f32,
        failures: Vec<StageFailure>,
    ) -> Self {
        Self {
            page_number,
            source_page,
            width,
            height,
            blocks: Vec::new(),
            tables: Vec::new(),
            figures: Vec::new(),
            status: PageStatus {
                degraded: true,
                text_source: TextSource::None,
                stages_skipped: Vec::new(),
                failures,
            },
        }
    }

    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .map(|b| b.text.as_str())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn ocr_skipped(&self) -> bool {
        self.status.stages_skipped.contains(&Stage::Ocr)
    }
}

// ── Provenance ───────────────────────────────────────────────────────────

/// How the OCR confidences in this document were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ConfidenceMode {
    /// OCR did not run.
    #[default]
    NotApplicable,
    /// Backend-native per-word scores, normalised to [0,1].
    Native,
    /// The backend reported none; `default` was substituted everywhere.
    Substituted { default: f32 },
}

/// Record of how a document was produced. Frozen once the orchestrator
/// hands the document over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub pipeline_version: String,
    /// Stages that ran on at least one page, in execution order.
    pub stages_run: Vec<Stage>,
    /// Stages that ran on no page at all.
    #[serde(default)]
    pub stages_skipped: Vec<Stage>,
    /// Stage name → milliseconds, summed across pages.
    pub timings_ms: BTreeMap<String, u64>,
    pub created_at: DateTime<Utc>,
    pub processing_time_ms: u64,
    pub layout_backend: String,
    #[serde(default)]
    pub ocr_backend: Option<String>,
    #[serde(default)]
    pub ocr_confidence: ConfidenceMode,
    /// Fallbacks and other noteworthy events, in the order they happened.
    #[serde(default)]
    pub annotations: Vec<String>,
}

impl Provenance {
    pub fn ran(&self, stage: Stage) -> bool {
        self.stages_run.contains(&stage)
    }
}

/// Append-only collector used while a pipeline runs.
///
/// [`finish`](ProvenanceRecorder::finish) consumes the recorder, so once a
/// `Provenance` exists nothing can append to it any more.
#[derive(Debug)]
pub struct ProvenanceRecorder {
    run: BTreeSet<Stage>,
    attempted: BTreeSet<Stage>,
    timings: BTreeMap<Stage, Duration>,
    annotations: Vec<String>,
    layout_backend: String,
    ocr_backend: Option<String>,
    ocr_confidence: ConfidenceMode,
    started: std::time::Instant,
    created_at: DateTime<Utc>,
}

impl Default for ProvenanceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvenanceRecorder {
    pub fn new() -> Self {
        Self {
            run: BTreeSet::new(),
            attempted: BTreeSet::new(),
            timings: BTreeMap::new(),
            annotations: Vec::new(),
            layout_backend: String::new(),
            ocr_backend: None,
            ocr_confidence: ConfidenceMode::NotApplicable,
            started: std::time::Instant::now(),
            created_at: Utc::now(),
        }
    }

    /// A stage executed (successfully or via its fallback) for `elapsed`.
    pub fn record(&mut self, stage: Stage, elapsed: Duration) {
        self.run.insert(stage);
        self.attempted.insert(stage);
        *self.timings.entry(stage).or_default() += elapsed;
    }

    /// A stage was considered and deliberately not executed.
    pub fn skip(&mut self, stage: Stage) {
        self.attempted.insert(stage);
    }

    pub fn annotate(&mut self, note: impl Into<String>) {
        self.annotations.push(note.into());
    }

    pub fn set_layout_backend(&mut self, name: impl Into<String>) {
        self.layout_backend = name.into();
    }

    pub fn set_ocr_backend(&mut self, name: Option<String>) {
        self.ocr_backend = name;
    }

    /// Substituted confidences win over native ones: a single region
    /// without scores makes the whole document's scores partly synthetic.
    pub fn note_confidence(&mut self, mode: ConfidenceMode) {
        self.ocr_confidence = match (self.ocr_confidence, mode) {
            (ConfidenceMode::Substituted { default }, _) => ConfidenceMode::Substituted { default },
            (_, ConfidenceMode::NotApplicable) => self.ocr_confidence,
            (_, m) => m,
        };
    }

    pub fn finish(self, pipeline_version: impl Into<String>) -> Provenance {
        let stages_skipped = self
            .attempted
            .iter()
            .filter(|s| !self.run.contains(s))
            .copied()
            .collect();
        Provenance {
            pipeline_version: pipeline_version.into(),
            stages_run: self.run.into_iter().collect(),
            stages_skipped,
            timings_ms: self
                .timings
                .into_iter()
                .map(|(s, d)| (s.as_str().to_string(), d.as_millis() as u64))
                .collect(),
            created_at: self.created_at,
            processing_time_ms: self.started.elapsed().as_millis() as u64,
            layout_backend: self.layout_backend,
            ocr_backend: self.ocr_backend,
            ocr_confidence: self.ocr_confidence,
            annotations: self.annotations,
        }
    }
}

// ── Document ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// `sha256:<hex>`
    pub content_hash: String,
}

/// Best-effort metadata from the container format.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub creation_date: Option<String>,
    pub modification_date: Option<String>,
    /// Pages in the source, which may exceed `pages.len()` when a page
    /// range was requested.
    pub page_count: usize,
}

/// Root aggregate produced by [`crate::Perceiver::process`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub source: SourceInfo,
    pub metadata: DocumentMetadata,
    pub pages: Vec<Page>,
    pub provenance: Provenance,
}

impl Document {
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.pages.iter().flat_map(|p| p.blocks.iter())
    }

    pub fn block_count(&self) -> usize {
        self.pages.iter().map(|p| p.blocks.len()).sum()
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks().find(|b| b.id == id)
    }

    pub fn page(&self, page_number: usize) -> Option<&Page> {
        self.pages.iter().find(|p| p.page_number == page_number)
    }

    pub fn is_degraded(&self) -> bool {
        self.pages.iter().any(|p| p.status.degraded)
    }

    pub fn text(&self) -> String {
        self.pages
            .iter()
            .map(Page::text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Check the structural invariants of the graph.
    ///
    /// Returns a description of every violation; an empty vector means the
    /// document is well formed.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut ids = BTreeSet::new();
        for (i, page) in self.pages.iter().enumerate() {
            if page.page_number != i + 1 {
                problems.push(format!(
                    "page at index {i} has number {}",
                    page.page_number
                ));
            }
            for block in &page.blocks {
                if !ids.insert(block.id.as_str()) {
                    problems.push(format!("duplicate block id {}", block.id));
                }
                if !block.bbox.within_page(page.width, page.height) {
                    problems.push(format!("block {} {} exceeds page", block.id, block.bbox));
                }
                if !(0.0..=1.0).contains(&block.confidence) {
                    problems.push(format!(
                        "block {} confidence {} out of range",
                        block.id, block.confidence
                    ));
                }
            }
            for table in &page.tables {
                if !table.is_rectangular() {
                    problems.push(format!("table {} is not rectangular", table.block_id));
                }
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_rejects_degenerate_values() {
        assert!(BoundingBox::new(0.0, 0.0, 0.0, 1.0).is_none());
        assert!(BoundingBox::new(-1.0, 0.0, 1.0, 1.0).is_none());
        assert!(BoundingBox::new(0.0, 0.0, f32::NAN, 1.0).is_none());
        assert!(BoundingBox::new(1.0, 2.0, 3.0, 4.0).is_some());
    }

    #[test]
    fn bbox_deserialize_validates() {
        let ok: BoundingBox =
            serde_json::from_str(r#"{"x":1,"y":2,"width":3,"height":4}"#).unwrap();
        assert_eq!(ok.right(), 4.0);
        let bad = serde_json::from_str::<BoundingBox>(r#"{"x":1,"y":2,"width":0,"height":4}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn clamp_reports_change() {
        let b = BoundingBox::new(90.0, 10.0, 20.0, 10.0).unwrap();
        let (clamped, changed) = b.clamp_to(100.0, 100.0).unwrap();
        assert!(changed);
        assert_eq!(clamped.right(), 100.0);
        let inside = BoundingBox::new(1.0, 1.0, 5.0, 5.0).unwrap();
        assert_eq!(inside.clamp_to(100.0, 100.0), Some((inside, false)));
        let outside = BoundingBox::new(200.0, 10.0, 5.0, 5.0).unwrap();
        assert!(outside.clamp_to(100.0, 100.0).is_none());
    }

    #[test]
    fn intersection_and_union() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0).unwrap();
        let b = BoundingBox::new(5.0, 5.0, 10.0, 10.0).unwrap();
        let i = a.intersection(&b).unwrap();
        assert_eq!((i.x(), i.y(), i.width(), i.height()), (5.0, 5.0, 5.0, 5.0));
        let u = a.union(&b);
        assert_eq!((u.width(), u.height()), (15.0, 15.0));
        let far = BoundingBox::new(50.0, 50.0, 1.0, 1.0).unwrap();
        assert!(a.intersection(&far).is_none());
    }

    #[test]
    fn block_type_parses_case_insensitively() {
        assert_eq!("Heading".parse::<BlockType>().unwrap(), BlockType::Heading);
        assert!("sidebar".parse::<BlockType>().is_err());
        assert_eq!(serde_json::to_string(&BlockType::Footer).unwrap(), "\"footer\"");
    }

    #[test]
    fn recorder_orders_stages_and_lists_skips() {
        let mut rec = ProvenanceRecorder::new();
        rec.record(Stage::Layout, Duration::from_millis(5));
        rec.record(Stage::Load, Duration::from_millis(3));
        rec.skip(Stage::Ocr);
        rec.skip(Stage::Preprocess);
        rec.record(Stage::Layout, Duration::from_millis(5));
        rec.record(Stage::Assemble, Duration::from_millis(1));
        let p = rec.finish("test");
        assert_eq!(p.stages_run, vec![Stage::Load, Stage::Layout, Stage::Assemble]);
        assert_eq!(p.stages_skipped, vec![Stage::Preprocess, Stage::Ocr]);
        assert_eq!(p.timings_ms["layout"], 10);
        assert!(!p.ran(Stage::Ocr));
    }

    #[test]
    fn substituted_confidence_is_sticky() {
        let mut rec = ProvenanceRecorder::new();
        rec.note_confidence(ConfidenceMode::Substituted { default: 0.8 });
        rec.note_confidence(ConfidenceMode::Native);
        let p = rec.finish("test");
        assert_eq!(p.ocr_confidence, ConfidenceMode::Substituted { default: 0.8 });
    }

    #[test]
    fn stage_run_once_on_one_page_is_not_skipped() {
        let mut rec = ProvenanceRecorder::new();
        rec.skip(Stage::Ocr);
        rec.record(Stage::Ocr, Duration::from_millis(2));
        let p = rec.finish("test");
        assert!(p.ran(Stage::Ocr));
        assert!(p.stages_skipped.is_empty());
    }
}
