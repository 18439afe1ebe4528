//! Block assembly: merge layout regions with their text into a [`Page`].
//!
//! Input is every region of one page paired with the text obtained for it
//! (embedded spans, OCR words, or nothing), plus the reading order. Output
//! is the final page: blocks with stable `p{page}_b{rank}` ids, table grids
//! and figure/caption links.
//!
//! Invariants upheld here:
//! * every block bbox lies inside the page (clamped, with a warning);
//! * block confidences are in `[0,1]`;
//! * every table is a full `rows × columns` grid, empty cells included;
//! * block ids are unique within the page and follow reading order.

use crate::config::LayoutConfig;
use crate::document::{Block, BlockType, BoundingBox, Figure, Page, PageStatus, Table};
use crate::pipeline::layout::{is_permutation, reading_order, LayoutRegion, RegionSource};
use crate::pipeline::load::{group_into_lines, TextSpan};
use crate::pipeline::ocr::RecognizedText;
use crate::pipeline::projection::{band_of, cluster_intervals};
use tracing::{debug, warn};

/// Region confidence of the block that collects text outside every region.
pub const UNASSIGNED_CONFIDENCE: f32 = 0.5;

/// Caption search distance, as a fraction of page height.
const CAPTION_MAX_GAP: f32 = 0.05;

/// Text obtained for one region.
#[derive(Debug, Clone, PartialEq)]
pub enum RegionText {
    /// Embedded PDF text; confidence 1.
    Embedded(Vec<TextSpan>),
    Recognized(RecognizedText),
    /// OCR was attempted and failed.
    Failed,
    /// No text source applies (figures, OCR disabled).
    Empty,
}

impl RegionText {
    /// Words in reading order with their boxes.
    fn words(&self) -> Vec<(String, BoundingBox)> {
        match self {
            RegionText::Embedded(spans) => group_into_lines(spans)
                .into_iter()
                .flatten()
                .flat_map(|s| split_span(s))
                .collect(),
            RegionText::Recognized(rt) => rt.words.iter().map(|w| (w.text.clone(), w.bbox)).collect(),
            RegionText::Failed | RegionText::Empty => Vec::new(),
        }
    }

    fn confidence(&self) -> f32 {
        match self {
            RegionText::Embedded(spans) if spans.iter().any(|s| !s.text.trim().is_empty()) => 1.0,
            RegionText::Recognized(rt) => rt.confidence,
            _ => 0.0,
        }
    }
}

/// Split a multi-word span into word boxes proportional to character count.
fn split_span(span: &TextSpan) -> Vec<(String, BoundingBox)> {
    let words: Vec<&str> = span.text.split_whitespace().collect();
    if words.len() <= 1 {
        return words.into_iter().map(|w| (w.to_string(), span.bbox)).collect();
    }
    let total: usize = words.iter().map(|w| w.chars().count() + 1).sum();
    let unit = span.bbox.width() / total as f32;
    let mut cursor = 0usize;
    words
        .into_iter()
        .map(|w| {
            let chars = w.chars().count();
            let bbox = BoundingBox::new(
                span.bbox.x() + cursor as f32 * unit,
                span.bbox.y(),
                (chars as f32 * unit).max(f32::EPSILON),
                span.bbox.height(),
            )
            .unwrap_or(span.bbox);
            cursor += chars + 1;
            (w.to_string(), bbox)
        })
        .collect()
}

/// Embedded spans distributed over regions.
#[derive(Debug, Clone, Default)]
pub struct SpanAssignment {
    /// Spans per region, same indexing as the regions slice.
    pub per_region: Vec<Vec<TextSpan>>,
    /// A paragraph region holding every span that fell outside all regions.
    pub unassigned: Option<(LayoutRegion, Vec<TextSpan>)>,
}

/// Give each span to the smallest region containing its centre.
pub fn assign_spans(regions: &[LayoutRegion], spans: &[TextSpan]) -> SpanAssignment {
    let mut per_region = vec![Vec::new(); regions.len()];
    let mut leftover: Vec<TextSpan> = Vec::new();
    for span in spans.iter().filter(|s| !s.text.trim().is_empty()) {
        let (cx, cy) = span.bbox.center();
        let target = regions
            .iter()
            .enumerate()
            .filter(|(_, r)| r.bbox.contains_point(cx, cy))
            .min_by(|(_, a), (_, b)| a.bbox.area().total_cmp(&b.bbox.area()))
            .map(|(i, _)| i);
        match target {
            Some(i) => per_region[i].push(span.clone()),
            None => leftover.push(span.clone()),
        }
    }

    let unassigned = leftover
        .iter()
        .map(|s| s.bbox)
        .reduce(|a, b| a.union(&b))
        .map(|bbox| {
            debug!("{} spans outside every region", leftover.len());
            (
                LayoutRegion::new(
                    bbox,
                    BlockType::Paragraph,
                    UNASSIGNED_CONFIDENCE,
                    RegionSource::Unassigned,
                ),
                leftover,
            )
        });
    SpanAssignment {
        per_region,
        unassigned,
    }
}

/// Everything needed to build one page.
#[derive(Debug, Clone)]
pub struct AssemblyInput {
    pub page_number: usize,
    pub source_page: usize,
    pub width: f32,
    pub height: f32,
    pub regions: Vec<(LayoutRegion, RegionText)>,
    /// Reading order over `regions`; recomputed if not a permutation.
    pub order: Vec<usize>,
    pub layout: LayoutConfig,
    pub extract_tables: bool,
    pub extract_figures: bool,
    pub status: PageStatus,
}

/// Build the final page.
pub fn assemble_page(input: AssemblyInput) -> Page {
    let AssemblyInput {
        page_number,
        source_page,
        width,
        height,
        regions,
        order,
        layout,
        extract_tables,
        extract_figures,
        status,
    } = input;

    let order = if is_permutation(&order, regions.len()) {
        order
    } else {
        warn!(
            "Page {}: invalid reading order from layout backend, recomputing",
            page_number
        );
        let bare: Vec<LayoutRegion> = regions.iter().map(|(r, _)| r.clone()).collect();
        reading_order(&bare, width, &layout)
    };

    let mut page = Page {
        page_number,
        source_page,
        width,
        height,
        blocks: Vec::with_capacity(regions.len()),
        tables: Vec::new(),
        figures: Vec::new(),
        status,
    };

    for idx in order {
        let (region, text) = &regions[idx];
        let Some((bbox, clamped)) = region.bbox.clamp_to(width, height) else {
            warn!(
                "Page {}: dropping {} region {} outside the {}x{} page",
                page_number, region.kind, region.bbox, width, height
            );
            continue;
        };
        if clamped {
            warn!(
                "Page {}: clamped {} region {} to {}",
                page_number, region.kind, region.bbox, bbox
            );
        }

        let id = Block::make_id(page_number, page.blocks.len() + 1);
        let words = text.words();
        let confidence = block_confidence(region, text);

        if region.kind == BlockType::Table && extract_tables {
            page.tables.push(build_table(&id, bbox, &words));
        }
        if region.kind == BlockType::Figure && extract_figures {
            page.figures.push(Figure {
                block_id: id.clone(),
                bbox,
                caption: None,
            });
        }

        page.blocks.push(Block {
            id,
            block_type: region.kind,
            bbox,
            text: words.iter().map(|(w, _)| w.as_str()).collect::<Vec<_>>().join(" "),
            confidence,
            page_number,
        });
    }

    link_captions(&mut page);
    page
}

fn block_confidence(region: &LayoutRegion, text: &RegionText) -> f32 {
    let c = match (region.kind, text) {
        // Figures carry no text of their own.
        (BlockType::Figure, RegionText::Empty) => region.confidence,
        _ if region.source == RegionSource::FullPage => text.confidence(),
        _ => region.confidence * text.confidence(),
    };
    c.clamp(0.0, 1.0)
}

/// Cluster words into row and column bands and fill a rectangular grid.
fn build_table(block_id: &str, bbox: BoundingBox, words: &[(String, BoundingBox)]) -> Table {
    if words.is_empty() {
        return Table {
            block_id: block_id.to_string(),
            bbox,
            rows: 0,
            columns: 0,
            cells: Vec::new(),
        };
    }

    // Use the middle of each word so tall glyphs do not bridge two rows.
    let row_intervals: Vec<(f32, f32)> = words
        .iter()
        .map(|(_, b)| {
            let (_, cy) = b.center();
            (cy - b.height() * 0.3, cy + b.height() * 0.3)
        })
        .collect();
    let rows = cluster_intervals(&row_intervals, 0.0);

    let mut heights: Vec<f32> = words.iter().map(|(_, b)| b.height()).collect();
    heights.sort_by(f32::total_cmp);
    let median_height = heights[heights.len() / 2];
    let col_intervals: Vec<(f32, f32)> = words.iter().map(|(_, b)| (b.x(), b.right())).collect();
    let columns = cluster_intervals(&col_intervals, 0.8 * median_height);

    let mut cells = vec![vec![String::new(); columns.len()]; rows.len()];
    for (text, b) in words {
        let (cx, cy) = b.center();
        let (Some(r), Some(c)) = (band_of(&rows, cy), band_of(&columns, cx)) else {
            continue;
        };
        let cell = &mut cells[r][c];
        if !cell.is_empty() {
            cell.push(' ');
        }
        cell.push_str(text);
    }

    Table {
        block_id: block_id.to_string(),
        bbox,
        rows: rows.len(),
        columns: columns.len(),
        cells,
    }
}

/// Point each figure at the nearest caption block directly below it (or,
/// failing that, directly above), each caption used at most once.
fn link_captions(page: &mut Page) {
    let max_gap = CAPTION_MAX_GAP * page.height;
    let mut used = vec![false; page.blocks.len()];
    for figure in &mut page.figures {
        let best = page
            .blocks
            .iter()
            .enumerate()
            .filter(|(i, b)| b.block_type == BlockType::Caption && !used[*i])
            .filter(|(_, b)| b.bbox.x() < figure.bbox.right() && b.bbox.right() > figure.bbox.x())
            .filter_map(|(i, b)| {
                let below = b.bbox.y() - figure.bbox.bottom();
                let above = figure.bbox.y() - b.bbox.bottom();
                if (0.0..=max_gap).contains(&below) || (-1.0..0.0).contains(&below) {
                    Some((i, below.max(0.0), 0))
                } else if (0.0..=max_gap).contains(&above) {
                    Some((i, above, 1))
                } else {
                    None
                }
            })
            .min_by(|a, b| a.2.cmp(&b.2).then(a.1.total_cmp(&b.1)));
        if let Some((i, _, _)) = best {
            used[i] = true;
            figure.caption = Some(page.blocks[i].id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ocr::RecognizedWord;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox::new(x, y, w, h).unwrap()
    }

    fn region(kind: BlockType, b: BoundingBox, conf: f32) -> LayoutRegion {
        LayoutRegion::new(b, kind, conf, RegionSource::Heuristic)
    }

    fn span(text: &str, b: BoundingBox) -> TextSpan {
        TextSpan {
            text: text.into(),
            bbox: b,
        }
    }

    fn input(regions: Vec<(LayoutRegion, RegionText)>, order: Vec<usize>) -> AssemblyInput {
        AssemblyInput {
            page_number: 2,
            source_page: 5,
            width: 600.0,
            height: 800.0,
            regions,
            order,
            layout: LayoutConfig::default(),
            extract_tables: true,
            extract_figures: true,
            status: PageStatus::default(),
        }
    }

    fn recognized(words: &[(&str, BoundingBox)], conf: f32) -> RegionText {
        RegionText::Recognized(RecognizedText {
            words: words
                .iter()
                .map(|(t, b)| RecognizedWord {
                    text: t.to_string(),
                    line: 0,
                    bbox: *b,
                    confidence: conf,
                })
                .collect(),
            confidence: conf,
            substituted: false,
        })
    }

    #[test]
    fn ids_follow_reading_order_and_text_joins_words() {
        let top = bbox(50.0, 50.0, 500.0, 20.0);
        let bottom = bbox(50.0, 200.0, 500.0, 40.0);
        let regions = vec![
            (
                region(BlockType::Paragraph, bottom, 0.7),
                RegionText::Embedded(vec![
                    span("second line", bbox(50.0, 220.0, 200.0, 10.0)),
                    span("first line", bbox(50.0, 205.0, 200.0, 10.0)),
                ]),
            ),
            (
                region(BlockType::Heading, top, 0.6),
                RegionText::Embedded(vec![span("Invoice", bbox(60.0, 55.0, 80.0, 12.0))]),
            ),
        ];
        let page = assemble_page(input(regions, vec![1, 0]));
        assert_eq!(page.blocks[0].id, "p2_b1");
        assert_eq!(page.blocks[0].text, "Invoice");
        assert_eq!(page.blocks[0].block_type, BlockType::Heading);
        assert_eq!(page.blocks[1].id, "p2_b2");
        assert_eq!(page.blocks[1].text, "first line second line");
        assert!((page.blocks[1].confidence - 0.7).abs() < 1e-6);
        assert_eq!(page.source_page, 5);
    }

    #[test]
    fn invalid_order_is_recomputed() {
        let regions = vec![
            (region(BlockType::Paragraph, bbox(50.0, 300.0, 500.0, 20.0), 0.7), RegionText::Empty),
            (region(BlockType::Paragraph, bbox(50.0, 100.0, 500.0, 20.0), 0.7), RegionText::Empty),
        ];
        let page = assemble_page(input(regions, vec![0, 0]));
        assert_eq!(page.blocks.len(), 2);
        assert_eq!(page.blocks[0].bbox.y(), 100.0);
    }

    #[test]
    fn out_of_page_boxes_are_clamped_or_dropped() {
        let regions = vec![
            (region(BlockType::Paragraph, bbox(500.0, 10.0, 300.0, 20.0), 0.7), RegionText::Empty),
            (region(BlockType::Paragraph, bbox(700.0, 10.0, 50.0, 20.0), 0.7), RegionText::Empty),
        ];
        let page = assemble_page(input(regions, vec![0, 1]));
        assert_eq!(page.blocks.len(), 1);
        assert!(page.blocks[0].bbox.within_page(600.0, 800.0));
        assert_eq!(page.blocks[0].bbox.right(), 600.0);
    }

    #[test]
    fn confidence_rules() {
        let full = LayoutRegion::new(bbox(0.0, 0.0, 600.0, 800.0), BlockType::Paragraph, 0.5, RegionSource::FullPage);
        let words = [("hello", bbox(10.0, 10.0, 50.0, 10.0))];
        assert!((block_confidence(&full, &recognized(&words, 0.9)) - 0.9).abs() < 1e-6);

        let para = region(BlockType::Paragraph, bbox(0.0, 0.0, 10.0, 10.0), 0.7);
        assert!((block_confidence(&para, &recognized(&words, 0.5)) - 0.35).abs() < 1e-6);
        assert_eq!(block_confidence(&para, &RegionText::Failed), 0.0);

        let fig = region(BlockType::Figure, bbox(0.0, 0.0, 10.0, 10.0), 0.6);
        assert!((block_confidence(&fig, &RegionText::Empty) - 0.6).abs() < 1e-6);
    }

    #[test]
    fn table_grid_is_rectangular_with_empty_cells() {
        let h = 10.0;
        let words = [
            ("Item", bbox(10.0, 10.0, 40.0, h)),
            ("Qty", bbox(110.0, 10.0, 30.0, h)),
            ("Price", bbox(210.0, 10.0, 50.0, h)),
            ("Widget", bbox(10.0, 30.0, 60.0, h)),
            ("42.00", bbox(210.0, 30.0, 50.0, h)),
            ("Gadget", bbox(10.0, 50.0, 60.0, h)),
            ("3", bbox(115.0, 50.0, 10.0, h)),
            ("7.50", bbox(210.0, 50.0, 40.0, h)),
        ];
        let regions = vec![(
            region(BlockType::Table, bbox(0.0, 0.0, 300.0, 70.0), 0.6),
            recognized(&words, 0.9),
        )];
        let page = assemble_page(input(regions, vec![0]));
        let table = &page.tables[0];
        assert_eq!((table.rows, table.columns), (3, 3));
        assert!(table.is_rectangular());
        assert_eq!(table.cells[1], vec!["Widget", "", "42.00"]);
        assert_eq!(table.cells[2][1], "3");
        assert_eq!(table.block_id, page.blocks[0].id);
    }

    #[test]
    fn figure_links_caption_below() {
        let regions = vec![
            (region(BlockType::Figure, bbox(100.0, 100.0, 300.0, 200.0), 0.6), RegionText::Empty),
            (
                region(BlockType::Caption, bbox(100.0, 310.0, 300.0, 15.0), 0.6),
                RegionText::Embedded(vec![span("Figure 1: Revenue", bbox(100.0, 310.0, 150.0, 12.0))]),
            ),
        ];
        let page = assemble_page(input(regions, vec![0, 1]));
        assert_eq!(page.figures.len(), 1);
        assert_eq!(page.figures[0].caption.as_deref(), Some("p2_b2"));
    }

    #[test]
    fn spans_outside_regions_form_unassigned_paragraph() {
        let regions = vec![region(BlockType::Paragraph, bbox(0.0, 0.0, 100.0, 100.0), 0.7)];
        let spans = vec![
            span("inside", bbox(10.0, 10.0, 30.0, 10.0)),
            span("stray", bbox(300.0, 500.0, 30.0, 10.0)),
            span("   ", bbox(10.0, 50.0, 30.0, 10.0)),
        ];
        let a = assign_spans(&regions, &spans);
        assert_eq!(a.per_region[0].len(), 1);
        let (r, stray) = a.unassigned.unwrap();
        assert_eq!(r.source, RegionSource::Unassigned);
        assert_eq!(r.confidence, UNASSIGNED_CONFIDENCE);
        assert_eq!(stray[0].text, "stray");
    }

    #[test]
    fn multi_word_span_is_split_for_tables() {
        let words = split_span(&span("Widget Pro", bbox(0.0, 0.0, 110.0, 10.0)));
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].0, "Widget");
        assert!(words[0].1.right() < words[1].1.x());
    }
}
