//! Error types for the docsense library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PerceptionError`] — **Fatal**: the request cannot be satisfied at all
//!   (unsupported or corrupt input, unknown document, bad query). Returned as
//!   `Err(PerceptionError)` from the orchestrator, the store and the query
//!   engine.
//!
//! * [`StageFailure`] — **Non-fatal**: one stage failed for one page (layout
//!   model crashed, OCR timed out on a region) and the orchestrator took a
//!   fallback. Stored on the page status and in the document provenance so
//!   callers can see exactly which parts of a document are degraded.
//!
//! `PerceptionError` is `Clone` because a coalesced pipeline run hands the
//! same result to every waiting caller; sources that are not `Clone`
//! themselves (`std::io::Error`, `serde_json::Error`) are held in an `Arc`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// All fatal errors returned by the docsense library.
#[derive(Debug, Clone, Error)]
pub enum PerceptionError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The bytes are not a format any loader understands. Permanent.
    #[error("Unsupported document: {detail}")]
    UnsupportedDocument { detail: String },

    /// The format was recognised but the bytes could not be decoded.
    ///
    /// May succeed with different options (e.g. a PDF password).
    #[error("Corrupt document: {detail}")]
    CorruptDocument { detail: String },

    /// Input exceeds the configured size or page limit.
    #[error("Document too large: {detail}")]
    TooLarge { detail: String },

    /// A request option was unknown or had the wrong type.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// HTTP download of an input URL failed.
    #[error("Failed to download '{url}': {reason}")]
    Download { url: String, reason: String },

    // ── Backend errors ────────────────────────────────────────────────────
    /// A layout/OCR backend (or pdfium itself) is missing its resources.
    #[error("Backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// A backend was available but a call to it failed at runtime.
    #[error("Backend '{backend}' failed: {detail}")]
    BackendFailed { backend: String, detail: String },

    /// A stage exceeded its time budget.
    #[error("Stage '{stage}' timed out after {secs}s")]
    StageTimeout { stage: String, secs: u64 },

    // ── Query / store errors ──────────────────────────────────────────────
    /// The query is syntactically invalid (bad regex, zero max_results, ...).
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The requested document does not exist.
    #[error("Document '{id}' not found")]
    NotFound { id: String },

    /// Durable storage I/O failed.
    #[error("Storage error at '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A persisted record could not be (de)serialised.
    #[error("Serialization error: {0}")]
    Serialization(#[source] Arc<serde_json::Error>),

    // ── Lifecycle ─────────────────────────────────────────────────────────
    /// The caller cancelled the request between stages.
    #[error("Request cancelled")]
    Cancelled,

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error (task panic, poisoned state).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PerceptionError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PerceptionError::Storage {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Errors that will fail again no matter how often the request is retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PerceptionError::UnsupportedDocument { .. }
                | PerceptionError::TooLarge { .. }
                | PerceptionError::InvalidOptions(_)
                | PerceptionError::InvalidQuery(_)
                | PerceptionError::InvalidConfig(_)
                | PerceptionError::NotFound { .. }
        )
    }

    /// Environmental failures: retrying later or elsewhere may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PerceptionError::BackendUnavailable { .. }
                | PerceptionError::BackendFailed { .. }
                | PerceptionError::StageTimeout { .. }
                | PerceptionError::Download { .. }
                | PerceptionError::Storage { .. }
        )
    }
}

impl From<serde_json::Error> for PerceptionError {
    fn from(e: serde_json::Error) -> Self {
        PerceptionError::Serialization(Arc::new(e))
    }
}

/// Pipeline stage names as they appear in provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    Preprocess,
    Layout,
    Ocr,
    Assemble,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Preprocess => "preprocess",
            Stage::Layout => "layout",
            Stage::Ocr => "ocr",
            Stage::Assemble => "assemble",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal failure of one stage on one page.
///
/// Recorded in [`crate::document::PageStatus::failures`] and mirrored as an
/// annotation in [`crate::document::Provenance`].
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("page {page}: {stage} failed ({detail}); fallback: {fallback}")]
pub struct StageFailure {
    pub stage: Stage,
    pub page: usize,
    pub detail: String,
    /// What the orchestrator did instead, e.g. `"heuristic layout"`.
    pub fallback: String,
}

impl StageFailure {
    pub fn new(
        stage: Stage,
        page: usize,
        detail: impl Into<String>,
        fallback: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            page,
            detail: detail.into(),
            fallback: fallback.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint() {
        let all = [
            PerceptionError::UnsupportedDocument { detail: "x".into() },
            PerceptionError::CorruptDocument { detail: "x".into() },
            PerceptionError::BackendUnavailable {
                backend: "tesseract".into(),
                reason: "missing".into(),
            },
            PerceptionError::StageTimeout {
                stage: "ocr".into(),
                secs: 3,
            },
            PerceptionError::InvalidQuery("(".into()),
            PerceptionError::NotFound { id: "a".into() },
            PerceptionError::Cancelled,
        ];
        for e in &all {
            assert!(!(e.is_permanent() && e.is_transient()), "{e}");
        }
        assert!(all[0].is_permanent());
        assert!(!all[1].is_permanent());
        assert!(all[2].is_transient());
    }

    #[test]
    fn storage_error_is_clone_and_displays_path() {
        let e = PerceptionError::storage(
            "/tmp/store/x.json",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        let cloned = e.clone();
        let msg = cloned.to_string();
        assert!(msg.contains("x.json"), "got: {msg}");
        assert!(msg.contains("disk full"), "got: {msg}");
    }

    #[test]
    fn stage_failure_display() {
        let f = StageFailure::new(Stage::Ocr, 2, "timed out", "empty block");
        let msg = f.to_string();
        assert!(msg.contains("page 2"));
        assert!(msg.contains("ocr"));
        assert!(msg.contains("empty block"));
    }

    #[test]
    fn stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::Preprocess).unwrap();
        assert_eq!(json, "\"preprocess\"");
    }
}
