//! Observer trait for streaming per-page perception results.
//!
//! Register an [`Arc<dyn ProgressObserver>`] with
//! [`crate::PerceiverBuilder::observer`] to see each page as soon as it has
//! been assembled, long before the whole `Document` is complete.
//!
//! # Example
//!
//! ```rust
//! use docsense::{Page, ProgressObserver};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct BlockCounter(AtomicUsize);
//!
//! impl ProgressObserver for BlockCounter {
//!     fn on_page_complete(&self, page: &Page, total_pages: usize) {
//!         self.0.fetch_add(page.blocks.len(), Ordering::SeqCst);
//!         eprintln!("page {}/{} ready", page.page_number, total_pages);
//!     }
//! }
//! ```

use crate::document::{Document, Page};
use crate::error::{PerceptionError, StageFailure};
use std::sync::Arc;

/// Called by the orchestrator while a document is processed.
///
/// Pages are processed concurrently, so `on_page_complete` may be invoked
/// from several tasks at once and in any page order. All methods default to
/// no-ops.
pub trait ProgressObserver: Send + Sync {
    /// The loader succeeded; `total_pages` pages will be processed.
    fn on_document_start(&self, filename: &str, total_pages: usize) {
        let _ = (filename, total_pages);
    }

    /// A page finished every stage. The page is final.
    fn on_page_complete(&self, page: &Page, total_pages: usize) {
        let _ = (page, total_pages);
    }

    /// A stage failed on a page and a fallback was taken.
    fn on_stage_fallback(&self, failure: &StageFailure) {
        let _ = failure;
    }

    /// The document was assembled (and persisted, when a store is attached).
    fn on_document_complete(&self, document: &Document) {
        let _ = document;
    }

    /// The request failed fatally or was cancelled.
    fn on_document_error(&self, filename: &str, error: &PerceptionError) {
        let _ = (filename, error);
    }
}

/// The default observer.
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// Convenience alias for the type held by the orchestrator.
pub type Observer = Arc<dyn ProgressObserver>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Stage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Tracking {
        pages: AtomicUsize,
        fallbacks: AtomicUsize,
        errors: AtomicUsize,
    }

    impl ProgressObserver for Tracking {
        fn on_page_complete(&self, _page: &Page, _total: usize) {
            self.pages.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stage_fallback(&self, _failure: &StageFailure) {
            self.fallbacks.fetch_add(1, Ordering::SeqCst);
        }

        fn on_document_error(&self, _filename: &str, _error: &PerceptionError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let obs: Observer = Arc::new(NoopObserver);
        obs.on_document_start("a.pdf", 3);
        obs.on_page_complete(&Page::failed(1, 1, 10.0, 10.0, vec![]), 3);
        obs.on_document_error("a.pdf", &PerceptionError::Cancelled);
    }

    #[test]
    fn tracking_observer_receives_events() {
        let t = Tracking::default();
        t.on_page_complete(&Page::failed(1, 1, 10.0, 10.0, vec![]), 2);
        t.on_page_complete(&Page::failed(2, 2, 10.0, 10.0, vec![]), 2);
        t.on_stage_fallback(&StageFailure::new(Stage::Layout, 1, "boom", "heuristic"));
        t.on_document_error("x", &PerceptionError::Cancelled);
        assert_eq!(t.pages.load(Ordering::SeqCst), 2);
        assert_eq!(t.fallbacks.load(Ordering::SeqCst), 1);
        assert_eq!(t.errors.load(Ordering::SeqCst), 1);
    }
}
