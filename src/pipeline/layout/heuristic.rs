//! Dependency-free layout detection by recursive XY-cut.
//!
//! The page is reduced to a binary ink mask: an Otsu-binarised raster for
//! scanned pages, or the embedded text boxes painted onto an empty canvas
//! for text-native pages (both when a page has a raster *and* some text).
//! The mask is then cut recursively along whitespace: first at vertical
//! gutters at least `column_gap_fraction` wide, else at horizontal gaps at
//! least `block_gap_fraction` tall. Leaves of the recursion are regions,
//! typed from their size, position and ink statistics.

use super::{LayoutBackend, LayoutInput, LayoutRegion, RegionSource};
use crate::config::LayoutConfig;
use crate::document::{BlockType, BoundingBox};
use crate::error::PerceptionError;
use crate::pipeline::load::{group_into_lines, TextSpan};
use crate::pipeline::projection::ink_runs;
use async_trait::async_trait;
use image::GrayImage;
use imageproc::contrast::otsu_level;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

const MAX_CUT_DEPTH: usize = 16;
/// Longest mask edge when painting embedded text.
const MAX_SPAN_MASK_EDGE: f32 = 4000.0;
/// Pixels lighter than this are never ink, whatever Otsu says.
const MAX_INK_LEVEL: u8 = 200;

const PARAGRAPH_CONFIDENCE: f32 = 0.7;
const INFERRED_TYPE_CONFIDENCE: f32 = 0.6;

const HEADER_BAND: f32 = 0.06;
const FOOTER_BAND: f32 = 0.94;
const FIGURE_DENSITY: f32 = 0.35;
const RULE_COVERAGE: f32 = 0.8;

static RE_LIST_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[•●▪◦‣∙·*\-–]|\(?\d{1,3}[.)]|\(?[a-zA-Z][.)])\s+\S").unwrap()
});

static RE_CAPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(?:fig(?:ure)?\.?|table|chart|plate)\s*\d+").unwrap());

/// Projection-profile layout detector. Always available.
#[derive(Debug, Clone, Default)]
pub struct HeuristicLayout {
    config: LayoutConfig,
}

impl HeuristicLayout {
    pub fn new(config: LayoutConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LayoutBackend for HeuristicLayout {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn initialize(&self) -> Result<(), PerceptionError> {
        Ok(())
    }

    fn detect(&self, input: &LayoutInput) -> Result<Vec<LayoutRegion>, PerceptionError> {
        let mask = match (&input.raster, input.raster_scale()) {
            (Some(raster), Some(scale)) => {
                let mut m = InkMask::from_raster(raster, self.config.ink_threshold, scale);
                m.paint_spans(&input.spans);
                m
            }
            _ => InkMask::from_spans(&input.spans, input.width, input.height),
        };

        let row_gap = ((self.config.block_gap_fraction * input.height) / mask.scale).ceil() as usize;
        let col_gap = ((self.config.column_gap_fraction * input.width) / mask.scale).ceil() as usize;

        let mut leaves = Vec::new();
        let whole = Rect {
            x0: 0,
            y0: 0,
            x1: mask.width,
            y1: mask.height,
        };
        xy_cut(&mask, whole, row_gap.max(1), col_gap.max(1), 0, &mut leaves);

        let min_area = self.config.min_region_area_fraction * input.width * input.height;
        let features: Vec<LeafFeatures> = leaves
            .iter()
            .filter_map(|r| LeafFeatures::measure(&mask, r, input))
            .filter(|f| f.bbox.area() >= min_area)
            .collect();

        let regions = classify_page(&features, input.width, input.height);
        debug!(
            "Page {}: heuristic layout found {} regions ({} mask)",
            input.page_number,
            regions.len(),
            if mask.from_spans { "span" } else { "raster" }
        );
        Ok(regions)
    }
}

// ── Ink mask ─────────────────────────────────────────────────────────────

/// Half-open cell rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x0: usize,
    y0: usize,
    x1: usize,
    y1: usize,
}

impl Rect {
    fn width(&self) -> usize {
        self.x1 - self.x0
    }

    fn height(&self) -> usize {
        self.y1 - self.y0
    }
}

struct InkMask {
    width: usize,
    height: usize,
    ink: Vec<bool>,
    /// Page units per cell.
    scale: f32,
    from_spans: bool,
}

impl InkMask {
    fn from_raster(raster: &GrayImage, threshold: Option<u8>, scale: f32) -> Self {
        let level = threshold
            .unwrap_or_else(|| otsu_level(raster))
            .min(MAX_INK_LEVEL);
        Self {
            width: raster.width() as usize,
            height: raster.height() as usize,
            ink: raster.pixels().map(|p| p[0] <= level).collect(),
            scale,
            from_spans: false,
        }
    }

    fn from_spans(spans: &[TextSpan], page_width: f32, page_height: f32) -> Self {
        let scale = (page_width.max(page_height) / MAX_SPAN_MASK_EDGE).max(1.0);
        let width = (page_width / scale).ceil().max(1.0) as usize;
        let height = (page_height / scale).ceil().max(1.0) as usize;
        let mut mask = Self {
            width,
            height,
            ink: vec![false; width * height],
            scale,
            from_spans: true,
        };
        mask.paint_spans(spans);
        mask
    }

    fn paint_spans(&mut self, spans: &[TextSpan]) {
        for span in spans.iter().filter(|s| !s.text.trim().is_empty()) {
            let x0 = (span.bbox.x() / self.scale).floor() as usize;
            let y0 = (span.bbox.y() / self.scale).floor() as usize;
            let x1 = ((span.bbox.right() / self.scale).ceil() as usize).min(self.width);
            let y1 = ((span.bbox.bottom() / self.scale).ceil() as usize).min(self.height);
            for y in y0.min(y1)..y1 {
                let row = y * self.width;
                self.ink[row + x0.min(x1)..row + x1].fill(true);
            }
        }
    }

    fn at(&self, x: usize, y: usize) -> bool {
        self.ink[y * self.width + x]
    }

    fn row_profile(&self, r: &Rect) -> Vec<u32> {
        (r.y0..r.y1)
            .map(|y| (r.x0..r.x1).filter(|&x| self.at(x, y)).count() as u32)
            .collect()
    }

    fn col_profile(&self, r: &Rect) -> Vec<u32> {
        (r.x0..r.x1)
            .map(|x| (r.y0..r.y1).filter(|&y| self.at(x, y)).count() as u32)
            .collect()
    }

    /// Shrink to the bounding box of the ink inside `r`.
    fn trim(&self, r: Rect) -> Option<Rect> {
        let rows = self.row_profile(&r);
        let cols = self.col_profile(&r);
        let top = rows.iter().position(|&c| c > 0)?;
        let bottom = rows.iter().rposition(|&c| c > 0)?;
        let left = cols.iter().position(|&c| c > 0)?;
        let right = cols.iter().rposition(|&c| c > 0)?;
        Some(Rect {
            x0: r.x0 + left,
            y0: r.y0 + top,
            x1: r.x0 + right + 1,
            y1: r.y0 + bottom + 1,
        })
    }
}

fn xy_cut(mask: &InkMask, rect: Rect, row_gap: usize, col_gap: usize, depth: usize, out: &mut Vec<Rect>) {
    let Some(rect) = mask.trim(rect) else {
        return;
    };
    if depth >= MAX_CUT_DEPTH {
        out.push(rect);
        return;
    }

    let columns = ink_runs(&mask.col_profile(&rect), 0, col_gap);
    if columns.len() > 1 {
        for (a, b) in columns {
            let sub = Rect {
                x0: rect.x0 + a,
                x1: rect.x0 + b,
                ..rect
            };
            xy_cut(mask, sub, row_gap, col_gap, depth + 1, out);
        }
        return;
    }

    let rows = ink_runs(&mask.row_profile(&rect), 0, row_gap);
    if rows.len() > 1 {
        for (a, b) in rows {
            let sub = Rect {
                y0: rect.y0 + a,
                y1: rect.y0 + b,
                ..rect
            };
            xy_cut(mask, sub, row_gap, col_gap, depth + 1, out);
        }
        return;
    }

    out.push(rect);
}

// ── Classification ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct LeafFeatures {
    bbox: BoundingBox,
    lines: usize,
    /// Median text-line height, page units.
    line_height: f32,
    density: f32,
    h_rules: usize,
    v_rules: usize,
    /// Embedded text inside the region, one entry per visual line.
    text_lines: Vec<String>,
    from_spans: bool,
}

impl LeafFeatures {
    fn measure(mask: &InkMask, r: &Rect, input: &LayoutInput) -> Option<Self> {
        let s = mask.scale;
        let bbox = BoundingBox::from_corners(
            r.x0 as f32 * s,
            r.y0 as f32 * s,
            r.x1 as f32 * s,
            r.y1 as f32 * s,
        )?
        .clamp_to(input.width, input.height)?
        .0;

        let rows = mask.row_profile(r);
        let cols = mask.col_profile(r);
        let ink: u32 = rows.iter().sum();
        let runs = ink_runs(&rows, 0, 1);
        let mut heights: Vec<usize> = runs.iter().map(|(a, b)| b - a).collect();
        heights.sort_unstable();
        let line_height = heights.get(heights.len() / 2).copied().unwrap_or(0) as f32 * s;

        let h_threshold = (r.width() as f32 * RULE_COVERAGE) as u32;
        let v_threshold = (r.height() as f32 * RULE_COVERAGE) as u32;
        let h_rule_rows: Vec<u32> = rows.iter().map(|&c| u32::from(c >= h_threshold.max(1))).collect();
        let v_rule_cols: Vec<u32> = cols.iter().map(|&c| u32::from(c >= v_threshold.max(1))).collect();

        Some(Self {
            bbox,
            lines: runs.len(),
            line_height,
            density: ink as f32 / (r.width() * r.height()).max(1) as f32,
            h_rules: ink_runs(&h_rule_rows, 0, 1).len(),
            v_rules: ink_runs(&v_rule_cols, 0, 1).len(),
            text_lines: span_lines(&input.spans, &bbox),
            from_spans: mask.from_spans,
        })
    }
}

/// Embedded text whose centre falls inside `bbox`, grouped into lines.
fn span_lines(spans: &[TextSpan], bbox: &BoundingBox) -> Vec<String> {
    let inside = spans.iter().filter(|s| {
        let (cx, cy) = s.bbox.center();
        bbox.contains_point(cx, cy)
    });
    group_into_lines(inside)
        .into_iter()
        .map(|line| line.iter().map(|s| s.text.as_str()).collect::<Vec<_>>().join(" "))
        .collect()
}

fn classify_page(leaves: &[LeafFeatures], page_w: f32, page_h: f32) -> Vec<LayoutRegion> {
    let mut heights: Vec<f32> = leaves
        .iter()
        .filter(|f| f.line_height > 0.0)
        .map(|f| f.line_height)
        .collect();
    heights.sort_by(f32::total_cmp);
    let median_line = heights.get(heights.len() / 2).copied().unwrap_or(0.0);
    let content_left = leaves
        .iter()
        .map(|f| f.bbox.x())
        .fold(f32::INFINITY, f32::min);

    let mut regions: Vec<LayoutRegion> = leaves
        .iter()
        .map(|f| {
            let (kind, confidence) = classify_leaf(f, page_w, page_h, median_line, content_left);
            LayoutRegion::new(f.bbox, kind, confidence, RegionSource::Heuristic)
        })
        .collect();

    // A short block right under a figure is its caption.
    let figures: Vec<BoundingBox> = regions
        .iter()
        .filter(|r| r.kind == BlockType::Figure)
        .map(|r| r.bbox)
        .collect();
    for (region, leaf) in regions.iter_mut().zip(leaves) {
        if region.kind != BlockType::Paragraph || leaf.lines > 2 {
            continue;
        }
        let under_figure = figures.iter().any(|fig| {
            let gap = region.bbox.y() - fig.bottom();
            let overlaps = region.bbox.x() < fig.right() && region.bbox.right() > fig.x();
            overlaps && gap >= 0.0 && gap < 0.03 * page_h
        });
        if under_figure {
            region.kind = BlockType::Caption;
            region.confidence = INFERRED_TYPE_CONFIDENCE;
        }
    }
    regions
}

fn classify_leaf(
    f: &LeafFeatures,
    page_w: f32,
    page_h: f32,
    median_line: f32,
    content_left: f32,
) -> (BlockType, f32) {
    let inferred = |t| (t, INFERRED_TYPE_CONFIDENCE);
    let width_ratio = f.bbox.width() / page_w;
    let height_ratio = f.bbox.height() / page_h;
    let top = f.bbox.y() / page_h;
    let bottom = f.bbox.bottom() / page_h;
    let short = f.lines <= 2;

    if !f.from_spans {
        if f.h_rules >= 3 || (f.h_rules >= 2 && f.v_rules >= 2) {
            return inferred(BlockType::Table);
        }
        if f.density > FIGURE_DENSITY && height_ratio > 0.08 {
            return inferred(BlockType::Figure);
        }
    }
    if short && bottom <= HEADER_BAND {
        return inferred(BlockType::Header);
    }
    if short && top >= FOOTER_BAND {
        return inferred(BlockType::Footer);
    }
    if f.text_lines.first().is_some_and(|l| RE_CAPTION.is_match(l)) && short {
        return inferred(BlockType::Caption);
    }

    let centered = ((f.bbox.center().0 - page_w / 2.0).abs()) < 0.1 * page_w;
    let large = median_line > 0.0 && f.line_height >= 1.3 * median_line;
    if short && height_ratio < 0.05 && (large || (top < 0.25 && (centered || width_ratio > 0.4))) {
        return inferred(BlockType::Heading);
    }

    let bullets = f.text_lines.iter().filter(|l| RE_LIST_ITEM.is_match(l)).count();
    let indented = f.bbox.x() - content_left >= 0.03 * page_w;
    if f.lines >= 2 && (bullets >= 2 || (f.text_lines.is_empty() && indented && width_ratio < 0.6)) {
        return inferred(BlockType::List);
    }

    (BlockType::Paragraph, PARAGRAPH_CONFIDENCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::sync::Arc;

    fn span(text: &str, x: f32, y: f32, w: f32, h: f32) -> TextSpan {
        TextSpan {
            text: text.into(),
            bbox: BoundingBox::new(x, y, w, h).unwrap(),
        }
    }

    fn input_from_spans(spans: Vec<TextSpan>) -> LayoutInput {
        LayoutInput {
            page_number: 1,
            width: 600.0,
            height: 800.0,
            raster: None,
            spans: Arc::new(spans),
        }
    }

    #[test]
    fn text_native_page_splits_into_blocks() {
        let spans = vec![
            span("Quarterly Report", 200.0, 60.0, 200.0, 24.0),
            span("First paragraph line one", 50.0, 240.0, 500.0, 10.0),
            span("first paragraph line two", 50.0, 253.0, 480.0, 10.0),
            span("Second paragraph", 50.0, 320.0, 500.0, 10.0),
            span("Page 1", 280.0, 770.0, 40.0, 10.0),
        ];
        let regions = HeuristicLayout::default()
            .detect(&input_from_spans(spans))
            .unwrap();
        assert_eq!(regions.len(), 4, "{regions:?}");
        assert_eq!(regions[0].kind, BlockType::Heading);
        assert_eq!(regions[1].kind, BlockType::Paragraph);
        assert_eq!(regions[1].confidence, PARAGRAPH_CONFIDENCE);
        assert_eq!(regions[3].kind, BlockType::Footer);
        for r in &regions {
            assert!(r.bbox.within_page(600.0, 800.0));
        }
    }

    #[test]
    fn bullet_lines_become_list() {
        let spans = vec![
            span("Intro text that is long enough", 50.0, 100.0, 500.0, 10.0),
            span("• apples", 70.0, 200.0, 100.0, 10.0),
            span("• pears", 70.0, 213.0, 100.0, 10.0),
            span("• plums", 70.0, 226.0, 100.0, 10.0),
        ];
        let regions = HeuristicLayout::default()
            .detect(&input_from_spans(spans))
            .unwrap();
        assert!(regions.iter().any(|r| r.kind == BlockType::List), "{regions:?}");
    }

    #[test]
    fn two_columns_are_cut_apart() {
        let mut spans = Vec::new();
        for i in 0..10 {
            let y = 100.0 + i as f32 * 13.0;
            spans.push(span("left column words", 40.0, y, 240.0, 10.0));
            spans.push(span("right column words", 320.0, y, 240.0, 10.0));
        }
        let regions = HeuristicLayout::default()
            .detect(&input_from_spans(spans))
            .unwrap();
        assert_eq!(regions.len(), 2);
        assert!(regions[0].bbox.right() < regions[1].bbox.x());
    }

    #[test]
    fn ruled_raster_region_is_table() {
        let mut img = GrayImage::from_pixel(400, 400, Luma([255]));
        for k in 0..4 {
            let y = 100 + k * 40;
            for x in 50..350 {
                img.put_pixel(x, y, Luma([0]));
                img.put_pixel(x, y + 1, Luma([0]));
            }
        }
        for x in [50u32, 200, 349] {
            for y in 100..222 {
                img.put_pixel(x, y, Luma([0]));
            }
        }
        let input = LayoutInput {
            page_number: 1,
            width: 400.0,
            height: 400.0,
            raster: Some(Arc::new(img)),
            spans: Arc::new(vec![]),
        };
        let regions = HeuristicLayout::default().detect(&input).unwrap();
        assert_eq!(regions.len(), 1, "{regions:?}");
        assert_eq!(regions[0].kind, BlockType::Table);
    }

    #[test]
    fn blank_page_has_no_regions() {
        let input = LayoutInput {
            page_number: 1,
            width: 100.0,
            height: 100.0,
            raster: Some(Arc::new(GrayImage::from_pixel(100, 100, Luma([255])))),
            spans: Arc::new(vec![]),
        };
        assert!(HeuristicLayout::default().detect(&input).unwrap().is_empty());
    }

    #[test]
    fn caption_prefix_is_recognised() {
        assert!(RE_CAPTION.is_match("Figure 3: throughput"));
        assert!(RE_CAPTION.is_match("Fig. 12 results"));
        assert!(!RE_CAPTION.is_match("Figures are fun"));
        assert!(RE_LIST_ITEM.is_match("1. first"));
        assert!(RE_LIST_ITEM.is_match("- dash item"));
        assert!(!RE_LIST_ITEM.is_match("2024 was a year"));
    }
}
