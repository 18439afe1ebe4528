//! # docsense
//!
//! Perceive semi-structured documents (PDFs, scans, photos) as a typed
//! graph of pages, blocks, tables and figures, with provenance, and query
//! it without re-running perception.
//!
//! ## Why this crate?
//!
//! Agents that consume documents need more than a text dump: they need to
//! know that a line is a heading, that a grid is a table with three
//! columns, which caption belongs to which figure, and how much to trust
//! each piece. This crate runs a staged pipeline that keeps embedded PDF
//! text where it exists, OCRs only the regions that lack it, and records
//! every fallback it takes so callers can see exactly which parts of a
//! document are degraded.
//!
//! ## Pipeline Overview
//!
//! ```text
//! bytes
//!  │
//!  ├─ 1. Load        sniff content, decode pages (pdfium, spawn_blocking)
//!  ├─ 2. Preprocess  denoise, deskew, contrast (raster pages only)
//!  ├─ 3. Layout      model → heuristic → full page; reading order
//!  ├─ 4. OCR         per region without embedded text (Tesseract / vision LLM)
//!  ├─ 5. Assemble    blocks p{n}_b{k}, table grids, figure captions
//!  └─ 6. Store       memory LRU in front of atomic JSON records
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docsense::store::LayeredStore;
//! use docsense::{ParseRequest, PerceptionConfig, PerceptionQuery, Perceiver, StoreConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = LayeredStore::open(StoreConfig::new("./.docsense")).await?;
//!     let perceiver = Perceiver::builder(PerceptionConfig::default())
//!         .store(Arc::new(store))
//!         .build();
//!
//!     let bytes = std::fs::read("invoice.pdf")?;
//!     let doc = perceiver.process(ParseRequest::new("invoice.pdf", bytes)).await?;
//!     eprintln!("{} pages, degraded: {}", doc.pages.len(), doc.is_degraded());
//!
//!     let hits = perceiver
//!         .query(&PerceptionQuery::regex(&doc.document_id, r"\d{4}-\d{2}-\d{2}"))
//!         .await?;
//!     for r in hits.results {
//!         println!("{} {:.2} {}", r.block_id, r.score, r.matched_text);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature     | Default | Description |
//! |-------------|---------|-------------|
//! | `cli`       | on      | Enables the `docsense` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `tesseract` | off     | Links libtesseract through `leptess` for the default OCR backend |
//!
//! Without `tesseract` the Tesseract backend reports itself unavailable;
//! scanned pages then come out empty and flagged as degraded unless the
//! vision backend (`ocr_engine: "vision"`) or a custom
//! [`OcrBackend`](pipeline::ocr::OcrBackend) is used.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod perceive;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod query;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    LayoutConfig, OcrEngine, PageSelection, ParseOptions, PerceptionConfig,
    PerceptionConfigBuilder, PreprocessConfig, StoreConfig, VisionConfig,
};
pub use document::{
    Block, BlockType, BoundingBox, ConfidenceMode, Document, DocumentMetadata, Figure, Page,
    PageStatus, Provenance, SourceInfo, Table, TextSource,
};
pub use error::{PerceptionError, Stage, StageFailure};
pub use perceive::{CancelToken, ParseRequest, Perceiver, PerceiverBuilder, PIPELINE_VERSION};
pub use progress::{NoopObserver, Observer, ProgressObserver};
pub use query::{
    LexicalOverlapScorer, PerceptionQuery, QueryMode, QueryResponse, QueryResult, SemanticScorer,
};
pub use store::{DocumentStore, LayeredStore};
