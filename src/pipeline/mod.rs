//! Pipeline stages for document perception.
//!
//! Each submodule implements one transformation step; the orchestrator in
//! [`crate::perceive`] wires them together. Keeping stages separate makes
//! each independently testable and lets backends be swapped (model vs.
//! heuristic layout, Tesseract vs. vision OCR) without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! bytes ──▶ detect ──▶ load ──▶ preprocess ──▶ layout ──▶ ocr ──▶ assemble
//!           (sniff)   (pdfium/   (denoise,     (regions,  (per     (blocks,
//!                      image)     deskew)       order)     region)  tables)
//! ```
//!
//! 1. [`detect`]     — content sniffing; filenames and mime hints are not trusted
//! 2. [`load`]       — decode pages; embedded text for text-native PDF pages,
//!    rasters otherwise. pdfium runs in `spawn_blocking`
//! 3. [`preprocess`] — raster normalisation ahead of layout and OCR
//! 4. [`layout`]     — typed regions plus canonical reading order
//! 5. [`ocr`]        — region-wise recognition with confidence normalisation;
//!    [`postprocess`] cleans vision-model transcriptions
//! 6. [`assemble`]   — blocks, table grids, figure captions
//!
//! [`projection`] holds the whitespace-gap analysis shared by layout, OCR
//! row splitting and table decomposition; [`input`] is CLI ingress.

pub mod assemble;
pub mod detect;
pub mod input;
pub mod layout;
pub mod load;
pub mod ocr;
pub mod postprocess;
pub mod preprocess;
pub mod projection;
