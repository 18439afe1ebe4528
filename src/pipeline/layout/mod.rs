//! Layout detection: partition a page into typed regions and order them.
//!
//! Two backends implement [`LayoutBackend`]:
//!
//! * [`ModelLayout`] wraps a caller-supplied pretrained detector, loaded
//!   lazily on first use.
//! * [`HeuristicLayout`] needs nothing but the page itself (a raster, or
//!   the embedded text boxes) and always succeeds.
//!
//! Both share [`reading_order`], so switching backend never changes how the
//! final block sequence is derived from region geometry.

mod heuristic;
mod model;

pub use heuristic::HeuristicLayout;
pub use model::{LayoutModel, LayoutModelLoader, ModelLayout};

use crate::config::LayoutConfig;
use crate::document::{BlockType, BoundingBox};
use crate::error::PerceptionError;
use crate::pipeline::load::TextSpan;
use crate::pipeline::projection::{band_of, cluster_intervals};
use async_trait::async_trait;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

/// Confidence of the single region produced when no detector is usable.
pub const FULL_PAGE_CONFIDENCE: f32 = 0.5;

/// Regions at least this wide (fraction of the page) span every column.
const SPANNING_WIDTH_FRACTION: f32 = 0.5;

/// Which mechanism produced a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionSource {
    Model,
    Heuristic,
    /// Whole-page fallback.
    FullPage,
    /// Collects text that fell outside every detected region.
    Unassigned,
}

/// A typed rectangle found on a page, in page units.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutRegion {
    pub bbox: BoundingBox,
    pub kind: BlockType,
    pub confidence: f32,
    pub source: RegionSource,
}

impl LayoutRegion {
    pub fn new(bbox: BoundingBox, kind: BlockType, confidence: f32, source: RegionSource) -> Self {
        Self {
            bbox,
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            source,
        }
    }
}

/// The single region covering the whole page.
pub fn full_page_region(width: f32, height: f32) -> Option<LayoutRegion> {
    BoundingBox::page(width, height).map(|bbox| {
        LayoutRegion::new(
            bbox,
            BlockType::Paragraph,
            FULL_PAGE_CONFIDENCE,
            RegionSource::FullPage,
        )
    })
}

/// What a detector sees of one page. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LayoutInput {
    pub page_number: usize,
    pub width: f32,
    pub height: f32,
    /// Normalised raster, when the page has one.
    pub raster: Option<Arc<GrayImage>>,
    pub spans: Arc<Vec<TextSpan>>,
}

impl LayoutInput {
    /// Page units per raster pixel.
    pub fn raster_scale(&self) -> Option<f32> {
        self.raster
            .as_ref()
            .filter(|r| r.width() > 0)
            .map(|r| self.width / r.width() as f32)
    }
}

/// Capability shared by all layout detectors.
///
/// `detect` is synchronous and CPU-bound; the orchestrator runs it on the
/// blocking pool under the stage timeout.
#[async_trait]
pub trait LayoutBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Acquire resources. Fails with
    /// [`PerceptionError::BackendUnavailable`] if they are missing.
    async fn initialize(&self) -> Result<(), PerceptionError>;

    /// Regions in detection order.
    fn detect(&self, input: &LayoutInput) -> Result<Vec<LayoutRegion>, PerceptionError>;

    /// Permutation of `regions` indices in reading order.
    fn reading_order(
        &self,
        regions: &[LayoutRegion],
        page_width: f32,
        config: &LayoutConfig,
    ) -> Vec<usize> {
        reading_order(regions, page_width, config)
    }
}

// ── Reading order ────────────────────────────────────────────────────────

/// Canonical left-to-right, top-to-bottom order of `regions`.
///
/// Regions spanning at least half the page width (titles, full-width
/// figures) cut the page into horizontal sections. Within a section the
/// remaining regions are split into column bands at vertical whitespace
/// gaps of at least `column_gap_fraction × page_width` that no region
/// crosses; columns are read left to right. Inside a column, regions are
/// grouped into rows by vertical overlap (`row_overlap`), rows are read top
/// to bottom and each row left to right. Exact ties fall back to detection
/// order, which makes the result a total, deterministic order.
pub fn reading_order(regions: &[LayoutRegion], page_width: f32, config: &LayoutConfig) -> Vec<usize> {
    let by_position = |a: &usize, b: &usize| {
        let (ra, rb) = (&regions[*a].bbox, &regions[*b].bbox);
        ra.y()
            .total_cmp(&rb.y())
            .then(ra.x().total_cmp(&rb.x()))
            .then(a.cmp(b))
    };

    let spanning_width = page_width * SPANNING_WIDTH_FRACTION;
    let (mut spanning, narrow): (Vec<usize>, Vec<usize>) =
        (0..regions.len()).partition(|&i| regions[i].bbox.width() >= spanning_width);
    spanning.sort_by(by_position);

    let mut order = Vec::with_capacity(regions.len());
    let mut remaining = narrow;
    for &s in &spanning {
        let cy_s = regions[s].bbox.center().1;
        let (before, after): (Vec<usize>, Vec<usize>) = remaining
            .into_iter()
            .partition(|&i| regions[i].bbox.center().1 < cy_s);
        order.extend(order_section(regions, &before, page_width, config));
        order.push(s);
        remaining = after;
    }
    order.extend(order_section(regions, &remaining, page_width, config));
    order
}

/// Columns left to right, each read with [`order_rows`].
fn order_section(
    regions: &[LayoutRegion],
    members: &[usize],
    page_width: f32,
    config: &LayoutConfig,
) -> Vec<usize> {
    if members.len() <= 1 {
        return members.to_vec();
    }
    let intervals: Vec<(f32, f32)> = members
        .iter()
        .map(|&i| (regions[i].bbox.x(), regions[i].bbox.right()))
        .collect();
    let columns = cluster_intervals(&intervals, config.column_gap_fraction * page_width);

    // Touching bands share an edge; each region joins exactly one of them.
    let mut by_column: Vec<Vec<usize>> = vec![Vec::new(); columns.len().max(1)];
    for &i in members {
        let column = band_of(&columns, regions[i].bbox.x()).unwrap_or(0);
        by_column[column].push(i);
    }

    let mut order = Vec::with_capacity(members.len());
    for in_column in &by_column {
        order.extend(order_rows(regions, in_column, config.row_overlap));
    }
    order
}

/// Two-pass ordering: group into rows by vertical overlap, then sort each
/// row by x.
fn order_rows(regions: &[LayoutRegion], members: &[usize], row_overlap: f32) -> Vec<usize> {
    let mut sorted = members.to_vec();
    sorted.sort_by(|a, b| {
        let (ra, rb) = (&regions[*a].bbox, &regions[*b].bbox);
        ra.y()
            .total_cmp(&rb.y())
            .then(ra.x().total_cmp(&rb.x()))
            .then(a.cmp(b))
    });

    let mut rows: Vec<Vec<usize>> = Vec::new();
    for i in sorted {
        let joins = rows.last().is_some_and(|row| {
            row.iter()
                .any(|&j| regions[i].bbox.vertical_overlap_ratio(&regions[j].bbox) >= row_overlap)
        });
        match rows.last_mut() {
            Some(row) if joins => row.push(i),
            _ => rows.push(vec![i]),
        }
    }

    rows.into_iter()
        .flat_map(|mut row| {
            row.sort_by(|a, b| {
                regions[*a]
                    .bbox
                    .x()
                    .partial_cmp(&regions[*b].bbox.x())
                    .unwrap_or(Ordering::Equal)
                    .then(a.cmp(b))
            });
            row
        })
        .collect()
}

/// `order` contains every index below `len` exactly once.
pub fn is_permutation(order: &[usize], len: usize) -> bool {
    if order.len() != len {
        return false;
    }
    let mut seen = vec![false; len];
    for &i in order {
        if i >= len || seen[i] {
            return false;
        }
        seen[i] = true;
    }
    true
}
