//! Pipeline orchestrator: bytes in, validated [`Document`] out.
//!
//! ```text
//! ParseRequest
//!   │  size limit, sha256, coalescing key
//!   ├─ Load        fatal on failure (Unsupported / Corrupt / TooLarge)
//!   │  per page, `page_concurrency` at a time:
//!   ├─ Preprocess  skipped for text-native pages
//!   ├─ Layout      model → heuristic → full-page region
//!   ├─ OCR         per region without embedded text; skipped for text-native pages
//!   └─ Assemble    blocks, tables, figures, page status
//!   │
//!   └─ store.save  only for complete, non-cancelled runs
//! ```
//!
//! ## Why coalesce?
//!
//! Layout and OCR are the most expensive things this crate does. Two callers
//! submitting the same bytes with the same options while the first run is
//! still going would otherwise pay twice; instead the second caller awaits a
//! clone of the first run's [`Shared`] future. Once a run finishes its entry
//! is dropped, so a later identical request starts a fresh run.
//!
//! ## Why decide backends per document?
//!
//! Backend availability (model weights present, Tesseract linked, provider
//! configured) is checked once per `Perceiver` and the choice applies to the
//! whole document, which keeps provenance to a single `layout_backend` and
//! `ocr_backend`. Only runtime failures of an available backend fall back
//! page by page, and each such fallback is recorded as a [`StageFailure`];
//! the pages that ended up on another backend are listed in one annotation.

use crate::config::{OcrEngine, ParseOptions, PerceptionConfig};
use crate::document::{
    BlockType, ConfidenceMode, Document, Page, PageStatus, ProvenanceRecorder, SourceInfo,
    TextSource,
};
use crate::error::{PerceptionError, Stage, StageFailure};
use crate::pipeline::assemble::{assemble_page, assign_spans, AssemblyInput, RegionText};
use crate::pipeline::detect::reconcile_mime_hint;
use crate::pipeline::layout::{
    full_page_region, reading_order, HeuristicLayout, LayoutBackend, LayoutInput,
    LayoutModelLoader, LayoutRegion, ModelLayout,
};
use crate::pipeline::load::{LoadRequest, LoadedPage, Loader, SniffingLoader};
use crate::pipeline::ocr::{recognize_region, OcrBackend, RegionRequest, TesseractOcr, VisionOcr};
use crate::pipeline::preprocess::preprocess;
use crate::progress::{NoopObserver, Observer};
use crate::query::{self, LexicalOverlapScorer, PerceptionQuery, QueryResponse, SemanticScorer};
use crate::store::DocumentStore;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt, TryStreamExt};
use image::GrayImage;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Recorded in every document's provenance.
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

// ── Requests ─────────────────────────────────────────────────────────────

/// One document to perceive.
#[derive(Debug, Clone)]
pub struct ParseRequest {
    pub filename: String,
    pub content: Arc<[u8]>,
    /// Client-declared type; only compared against the sniffed one.
    pub mime_hint: Option<String>,
    pub options: ParseOptions,
}

impl ParseRequest {
    pub fn new(filename: impl Into<String>, content: impl Into<Arc<[u8]>>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
            mime_hint: None,
            options: ParseOptions::default(),
        }
    }

    pub fn mime_hint(mut self, mime: impl Into<String>) -> Self {
        self.mime_hint = Some(mime.into());
        self
    }

    pub fn options(mut self, options: ParseOptions) -> Self {
        self.options = options;
        self
    }
}

/// Cooperative cancellation, checked between stages.
///
/// Cancelling after the document was stored has no effect on the result.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), PerceptionError> {
        if self.is_cancelled() {
            return Err(PerceptionError::Cancelled);
        }
        Ok(())
    }
}

// ── Builder ──────────────────────────────────────────────────────────────

/// Assembles a [`Perceiver`] from its collaborators.
///
/// ```rust,no_run
/// use docsense::store::LayeredStore;
/// use docsense::{ParseRequest, PerceptionConfig, Perceiver, StoreConfig};
/// use std::sync::Arc;
///
/// # async fn run() -> Result<(), docsense::PerceptionError> {
/// let store = LayeredStore::open(StoreConfig::new("/tmp/docsense")).await?;
/// let perceiver = Perceiver::builder(PerceptionConfig::default())
///     .store(Arc::new(store))
///     .build();
/// let bytes = std::fs::read("scan.png").map_err(|e| docsense::PerceptionError::Internal(e.to_string()))?;
/// let doc = perceiver.process(ParseRequest::new("scan.png", bytes)).await?;
/// println!("{} blocks", doc.block_count());
/// # Ok(())
/// # }
/// ```
pub struct PerceiverBuilder {
    config: PerceptionConfig,
    store: Option<Arc<dyn DocumentStore>>,
    loader: Option<Arc<dyn Loader>>,
    layout_model: Option<Arc<dyn LayoutModelLoader>>,
    ocr: HashMap<OcrEngine, Arc<dyn OcrBackend>>,
    scorer: Option<Arc<dyn SemanticScorer>>,
    observer: Option<Observer>,
}

impl PerceiverBuilder {
    /// Persist every completed document here. Without a store, `query`,
    /// `get`, `delete` and `list` fail with `InvalidConfig`.
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the default content-sniffing loader.
    pub fn loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Enable the model layout backend, loaded on first use.
    pub fn layout_model(mut self, loader: Arc<dyn LayoutModelLoader>) -> Self {
        self.layout_model = Some(loader);
        self
    }

    /// Register (or replace) the backend serving `engine`.
    pub fn ocr_backend(mut self, engine: OcrEngine, backend: Arc<dyn OcrBackend>) -> Self {
        self.ocr.insert(engine, backend);
        self
    }

    /// Scorer used by `semantic` queries.
    pub fn semantic_scorer(mut self, scorer: Arc<dyn SemanticScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Perceiver {
        let config = self.config;

        let mut ocr: HashMap<OcrEngine, Arc<dyn OcrBackend>> = HashMap::new();
        ocr.insert(
            OcrEngine::Tesseract,
            Arc::new(TesseractOcr::new(config.tesseract_language.clone())),
        );
        ocr.insert(OcrEngine::Vision, Arc::new(VisionOcr::new(config.vision.clone())));
        ocr.extend(self.ocr);
        let ocr_ready = ocr.keys().map(|engine| (*engine, OnceCell::new())).collect();

        Perceiver {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(config.max_concurrent_documents.max(1))),
                heuristic: Arc::new(HeuristicLayout::new(config.layout.clone())),
                layout_model: self.layout_model.map(|l| Arc::new(ModelLayout::new(l))),
                layout_model_ready: OnceCell::new(),
                loader: self.loader.unwrap_or_else(|| Arc::new(SniffingLoader::default())),
                store: self.store,
                ocr,
                ocr_ready,
                scorer: self.scorer.unwrap_or_else(|| Arc::new(LexicalOverlapScorer)),
                observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
                in_flight: Mutex::new(HashMap::new()),
                runs: AtomicU64::new(0),
                config,
            }),
        }
    }
}

// ── Perceiver ────────────────────────────────────────────────────────────

type InFlight = Shared<BoxFuture<'static, Result<Arc<Document>, PerceptionError>>>;

/// Owned by a spawned run; drops its coalescing entry on exit or unwind.
struct InFlightEntry {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

struct Inner {
    config: PerceptionConfig,
    store: Option<Arc<dyn DocumentStore>>,
    loader: Arc<dyn Loader>,
    layout_model: Option<Arc<ModelLayout>>,
    layout_model_ready: OnceCell<Result<(), PerceptionError>>,
    heuristic: Arc<HeuristicLayout>,
    ocr: HashMap<OcrEngine, Arc<dyn OcrBackend>>,
    ocr_ready: HashMap<OcrEngine, OnceCell<Result<(), PerceptionError>>>,
    scorer: Arc<dyn SemanticScorer>,
    observer: Observer,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    runs: AtomicU64,
}

/// The document perception engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Perceiver {
    inner: Arc<Inner>,
}

impl Perceiver {
    pub fn builder(config: PerceptionConfig) -> PerceiverBuilder {
        PerceiverBuilder {
            config,
            store: None,
            loader: None,
            layout_model: None,
            ocr: HashMap::new(),
            scorer: None,
            observer: None,
        }
    }

    pub fn config(&self) -> &PerceptionConfig {
        &self.inner.config
    }

    /// Pipeline executions started so far; coalesced callers do not count.
    pub fn pipeline_runs(&self) -> u64 {
        self.inner.runs.load(Ordering::SeqCst)
    }

    /// Perceive a document and persist it when a store is attached.
    ///
    /// # Errors
    /// Only fatal errors: loader failures, size limits, storage failures.
    /// Stage failures degrade pages instead (see [`Page::status`]).
    pub async fn process(&self, request: ParseRequest) -> Result<Arc<Document>, PerceptionError> {
        self.process_cancellable(request, &CancelToken::new()).await
    }

    /// Like [`process`](Self::process); `cancel` is checked between stages.
    ///
    /// A caller that joins an in-flight run for the same content and
    /// options shares that run's outcome. If that run is cancelled by the
    /// caller that started it, a joiner whose own token is still live
    /// starts the document again.
    pub async fn process_cancellable(
        &self,
        request: ParseRequest,
        cancel: &CancelToken,
    ) -> Result<Arc<Document>, PerceptionError> {
        let limit = self.inner.config.max_file_size_bytes;
        if request.content.len() as u64 > limit {
            let err = PerceptionError::TooLarge {
                detail: format!(
                    "'{}' is {} bytes; the limit is {} bytes",
                    request.filename,
                    request.content.len(),
                    limit
                ),
            };
            self.inner.observer.on_document_error(&request.filename, &err);
            return Err(err);
        }

        let hash = content_hash(&request.content);
        let key = format!("{hash}|{}", request.options.fingerprint());
        loop {
            let (run, joined) = {
                let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                match in_flight.get(&key) {
                    Some(run) => {
                        debug!("Joining in-flight run for '{}'", request.filename);
                        (run.clone(), true)
                    }
                    None => {
                        let run = self.spawn_run(request.clone(), hash.clone(), key.clone(), cancel);
                        in_flight.insert(key.clone(), run.clone());
                        (run, false)
                    }
                }
            };
            match run.await {
                Err(PerceptionError::Cancelled) if joined && !cancel.is_cancelled() => {
                    debug!(
                        "In-flight run for '{}' was cancelled by its owner; starting over",
                        request.filename
                    );
                }
                result => return result,
            }
        }
    }

    /// Run the pipeline on its own task. The in-flight entry for `key` is
    /// removed when that task ends, whether it returns or panics.
    fn spawn_run(
        &self,
        request: ParseRequest,
        hash: String,
        key: String,
        cancel: &CancelToken,
    ) -> InFlight {
        let inner = Arc::clone(&self.inner);
        let cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let _entry = InFlightEntry {
                inner: Arc::clone(&inner),
                key,
            };
            run_document(&inner, request, hash, &cancel).await
        });
        async move {
            handle.await.unwrap_or_else(|e| {
                Err(PerceptionError::Internal(format!("pipeline task failed: {e}")))
            })
        }
        .boxed()
        .shared()
    }

    fn store(&self) -> Result<&Arc<dyn DocumentStore>, PerceptionError> {
        self.inner
            .store
            .as_ref()
            .ok_or_else(|| PerceptionError::InvalidConfig("no document store attached".into()))
    }

    /// Run a query against a stored document.
    pub async fn query(&self, q: &PerceptionQuery) -> Result<QueryResponse, PerceptionError> {
        let document = self.store()?.get(&q.document_id).await?;
        query::query_with_scorer(&document, q, self.inner.scorer.as_ref())
    }

    pub async fn get(&self, document_id: &str) -> Result<Arc<Document>, PerceptionError> {
        self.store()?.get(document_id).await
    }

    pub async fn delete(&self, document_id: &str) -> Result<bool, PerceptionError> {
        self.store()?.delete(document_id).await
    }

    pub async fn list(&self, limit: usize, offset: usize) -> Result<Vec<String>, PerceptionError> {
        self.store()?.list(limit, offset).await
    }
}

/// `sha256:<hex>` of the raw input.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

// ── Backend plans ────────────────────────────────────────────────────────

enum LayoutPlan {
    /// Tried in order on each page until one succeeds.
    Detectors(Vec<Arc<dyn LayoutBackend>>),
    FullPage,
}

impl LayoutPlan {
    fn name(&self) -> String {
        match self {
            LayoutPlan::Detectors(chain) => chain
                .first()
                .map_or_else(|| "full_page".to_string(), |b| b.name().to_string()),
            LayoutPlan::FullPage => "full_page".to_string(),
        }
    }
}

enum OcrPlan {
    Ready(Arc<dyn OcrBackend>),
    Unavailable(String),
    Disabled,
    /// Every page is text-native; no backend was initialised.
    NotNeeded,
}

async fn choose_layout(
    inner: &Inner,
    options: &ParseOptions,
    recorder: &mut ProvenanceRecorder,
) -> LayoutPlan {
    if !options.extract_layout {
        recorder.annotate("layout detection disabled; one full-page region per page");
        return LayoutPlan::FullPage;
    }

    let mut chain: Vec<Arc<dyn LayoutBackend>> = Vec::new();
    if let Some(model) = &inner.layout_model {
        let ready = inner
            .layout_model_ready
            .get_or_init(|| async { model.initialize().await })
            .await;
        match ready {
            Ok(()) => chain.push(Arc::clone(model) as Arc<dyn LayoutBackend>),
            Err(e) => {
                warn!("Layout model unavailable, using heuristic layout: {}", e);
                recorder.annotate(format!("layout model unavailable ({e}); using heuristic layout"));
            }
        }
    }
    match inner.heuristic.initialize().await {
        Ok(()) => chain.push(Arc::clone(&inner.heuristic) as Arc<dyn LayoutBackend>),
        Err(e) => {
            warn!("Heuristic layout unavailable: {}", e);
            recorder.annotate(format!("heuristic layout unavailable ({e})"));
        }
    }

    if chain.is_empty() {
        recorder.annotate("no layout backend available; one full-page region per page");
        LayoutPlan::FullPage
    } else {
        LayoutPlan::Detectors(chain)
    }
}

async fn choose_ocr(inner: &Inner, engine: OcrEngine, recorder: &mut ProvenanceRecorder) -> OcrPlan {
    if engine == OcrEngine::Disabled {
        return OcrPlan::Disabled;
    }
    let (Some(backend), Some(ready)) = (inner.ocr.get(&engine), inner.ocr_ready.get(&engine)) else {
        return OcrPlan::Unavailable(format!("no backend registered for '{}'", engine.as_str()));
    };
    match ready.get_or_init(|| async { backend.initialize().await }).await {
        Ok(()) => OcrPlan::Ready(Arc::clone(backend)),
        Err(e) => {
            warn!("OCR backend '{}' unavailable: {}", engine.as_str(), e);
            recorder.annotate(format!("OCR backend '{}' unavailable ({e})", engine.as_str()));
            OcrPlan::Unavailable(e.to_string())
        }
    }
}

// ── Document run ─────────────────────────────────────────────────────────

async fn run_document(
    inner: &Arc<Inner>,
    request: ParseRequest,
    hash: String,
    cancel: &CancelToken,
) -> Result<Arc<Document>, PerceptionError> {
    let filename = request.filename.clone();
    let result = execute(inner, request, hash, cancel).await;
    match &result {
        Ok(document) => inner.observer.on_document_complete(document),
        Err(e) => {
            warn!("Processing '{}' failed: {}", filename, e);
            inner.observer.on_document_error(&filename, e);
        }
    }
    result
}

async fn execute(
    inner: &Arc<Inner>,
    request: ParseRequest,
    hash: String,
    cancel: &CancelToken,
) -> Result<Arc<Document>, PerceptionError> {
    let _permit = Arc::clone(&inner.permits)
        .acquire_owned()
        .await
        .map_err(|_| PerceptionError::Internal("document worker pool closed".into()))?;
    inner.runs.fetch_add(1, Ordering::SeqCst);
    cancel.check()?;

    let config = &inner.config;
    let ParseRequest {
        filename,
        content,
        mime_hint,
        options,
    } = request;
    info!("Processing '{}' ({} bytes)", filename, content.len());
    let mut recorder = ProvenanceRecorder::new();

    // ── Load ─────────────────────────────────────────────────────────────
    let mime_type = inner.loader.detect(&content)?;
    if let Some(note) = reconcile_mime_hint(mime_hint.as_deref(), &mime_type) {
        recorder.annotate(note);
    }
    let load_request = LoadRequest {
        page_range: options.page_range.clone(),
        max_pages: config.max_pages,
        dpi: config.dpi,
        max_raster_pixels: config.max_raster_pixels,
        coverage_threshold: config.text_coverage_threshold,
        password: config.pdf_password.clone(),
        pdfium_library_path: config.pdfium_library_path.clone(),
    };
    let started = Instant::now();
    let loaded = inner.loader.load(Arc::clone(&content), &load_request).await?;
    recorder.record(Stage::Load, started.elapsed());
    debug!("Stage load: {} pages in {:?}", loaded.pages.len(), started.elapsed());
    for note in &loaded.notes {
        recorder.annotate(note.clone());
    }
    let total_pages = loaded.pages.len();
    inner.observer.on_document_start(&filename, total_pages);
    cancel.check()?;

    // ── Backends ─────────────────────────────────────────────────────────
    let layout = choose_layout(inner, &options, &mut recorder).await;
    let layout_backend = layout.name();
    recorder.set_layout_backend(layout_backend.clone());

    let needs_ocr = loaded
        .pages
        .iter()
        .any(|p| p.raster.is_some() && !p.is_text_native(config.text_coverage_threshold));
    let ocr = if needs_ocr {
        choose_ocr(inner, options.ocr_engine, &mut recorder).await
    } else {
        OcrPlan::NotNeeded
    };
    if let OcrPlan::Ready(backend) = &ocr {
        recorder.set_ocr_backend(Some(backend.name().to_string()));
    }

    // ── Pages ────────────────────────────────────────────────────────────
    let ctx = Arc::new(PageContext {
        inner: Arc::clone(inner),
        options: options.clone(),
        layout,
        ocr,
        cancel: cancel.clone(),
        total_pages,
    });
    let mut results: Vec<(Page, PageTrace)> = stream::iter(loaded.pages.into_iter().enumerate())
        .map(|(i, page)| {
            let ctx = Arc::clone(&ctx);
            async move { ctx.process_page(i + 1, page).await }
        })
        .buffer_unordered(config.page_concurrency.max(1))
        .try_collect()
        .await?;
    results.sort_by_key(|(page, _)| page.page_number);

    let mut pages = Vec::with_capacity(results.len());
    let mut substituted: Vec<(usize, String)> = Vec::new();
    for (page, mut trace) in results {
        if let Some(used) = trace.layout_backend.take().filter(|b| *b != layout_backend) {
            substituted.push((page.page_number, used));
        }
        trace.apply(&mut recorder);
        pages.push(page);
    }
    if let Some(note) = layout_substitution_note(&layout_backend, &substituted) {
        recorder.annotate(note);
    }

    let mut metadata = loaded.metadata;
    if metadata.title.as_deref().map_or(true, |t| t.trim().is_empty()) {
        metadata.title = Some(filename.clone());
    }

    let document = Arc::new(Document {
        document_id: Uuid::now_v7().to_string(),
        source: SourceInfo {
            filename: filename.clone(),
            mime_type: loaded.mime_type,
            size_bytes: content.len() as u64,
            content_hash: hash,
        },
        metadata,
        pages,
        provenance: recorder.finish(PIPELINE_VERSION),
    });

    // A cancelled run never reaches the store.
    cancel.check()?;
    if let Some(store) = &inner.store {
        store.save(Arc::clone(&document)).await?;
    }

    let degraded = document.pages.iter().filter(|p| p.status.degraded).count();
    info!(
        "Processed '{}' as {}: {} pages, {} blocks, {} degraded, {}ms",
        filename,
        document.document_id,
        document.pages.len(),
        document.block_count(),
        degraded,
        document.provenance.processing_time_ms
    );
    Ok(document)
}

/// Names the pages whose regions came from a backend other than the
/// document's `layout_backend`, grouped by the backend actually used.
fn layout_substitution_note(document_backend: &str, pages: &[(usize, String)]) -> Option<String> {
    if pages.is_empty() {
        return None;
    }
    let mut by_backend: Vec<(&str, Vec<String>)> = Vec::new();
    for (page, backend) in pages {
        match by_backend.iter_mut().find(|(b, _)| b == backend) {
            Some((_, list)) => list.push(page.to_string()),
            None => by_backend.push((backend.as_str(), vec![page.to_string()])),
        }
    }
    let parts: Vec<String> = by_backend
        .into_iter()
        .map(|(backend, list)| format!("{backend} on page(s) {}", list.join(", ")))
        .collect();
    Some(format!(
        "layout from {} (document layout backend: {document_backend})",
        parts.join("; ")
    ))
}

// ── Page run ─────────────────────────────────────────────────────────────

/// What one page contributes to the document's provenance.
#[derive(Debug, Default)]
struct PageTrace {
    timings: Vec<(Stage, Duration)>,
    skipped: Vec<Stage>,
    failures: Vec<StageFailure>,
    confidence: Vec<ConfidenceMode>,
    /// Backend whose regions the page was assembled from.
    layout_backend: Option<String>,
}

impl PageTrace {
    fn record(&mut self, stage: Stage, elapsed: Duration) {
        self.timings.push((stage, elapsed));
    }

    fn skip(&mut self, stage: Stage) {
        if !self.skipped.contains(&stage) {
            self.skipped.push(stage);
        }
    }

    fn apply(self, recorder: &mut ProvenanceRecorder) {
        for (stage, elapsed) in self.timings {
            recorder.record(stage, elapsed);
        }
        for stage in self.skipped {
            recorder.skip(stage);
        }
        for failure in self.failures {
            recorder.annotate(failure.to_string());
        }
        for mode in self.confidence {
            recorder.note_confidence(mode);
        }
    }
}

struct PageContext {
    inner: Arc<Inner>,
    options: ParseOptions,
    layout: LayoutPlan,
    ocr: OcrPlan,
    cancel: CancelToken,
    total_pages: usize,
}

impl PageContext {
    fn fail(&self, trace: &mut PageTrace, failure: StageFailure) {
        warn!("{}", failure);
        self.inner.observer.on_stage_fallback(&failure);
        trace.failures.push(failure);
    }

    async fn process_page(
        &self,
        page_number: usize,
        loaded: LoadedPage,
    ) -> Result<(Page, PageTrace), PerceptionError> {
        let config = &self.inner.config;
        let mut trace = PageTrace::default();
        let text_native = loaded.is_text_native(config.text_coverage_threshold);
        let LoadedPage {
            source_page,
            width,
            height,
            raster,
            spans,
        } = loaded;

        // ── Preprocess ───────────────────────────────────────────────────
        self.cancel.check()?;
        let raster = match raster {
            Some(image) if !text_native => Some(self.preprocess(page_number, image, &mut trace).await),
            _ => {
                trace.skip(Stage::Preprocess);
                None
            }
        };

        // ── Layout ───────────────────────────────────────────────────────
        self.cancel.check()?;
        let spans = Arc::new(spans);
        let input = LayoutInput {
            page_number,
            width,
            height,
            raster: raster.clone(),
            spans: Arc::clone(&spans),
        };
        let (mut regions, detector) = self.detect_layout(&input, &mut trace).await;

        // ── Text per region ──────────────────────────────────────────────
        self.cancel.check()?;
        let scale = input.raster_scale().unwrap_or(1.0);
        let assignment = assign_spans(&regions, &spans);
        let mut texts = Vec::with_capacity(regions.len() + 1);
        let (mut any_embedded, mut any_ocr, mut ocr_ran, mut ocr_wanted) = (false, false, false, false);

        for (region, own_spans) in regions.iter().zip(assignment.per_region) {
            let text = if !own_spans.is_empty() {
                any_embedded = true;
                RegionText::Embedded(own_spans)
            } else if text_native || region.kind == BlockType::Figure {
                RegionText::Empty
            } else {
                match (&raster, &self.ocr) {
                    (Some(image), OcrPlan::Ready(backend)) => {
                        let request = RegionRequest {
                            raster: &**image,
                            scale,
                            region: region.bbox,
                            hint: region.kind,
                            timeout: config.stage_timeout,
                            default_confidence: config.ocr_default_confidence,
                        };
                        let started = Instant::now();
                        let outcome = recognize_region(backend.as_ref(), &request).await;
                        trace.record(Stage::Ocr, started.elapsed());
                        ocr_ran = true;
                        match outcome {
                            Ok(recognized) => {
                                if !recognized.words.is_empty() {
                                    any_ocr = true;
                                    trace.confidence.push(if recognized.substituted {
                                        ConfidenceMode::Substituted {
                                            default: config.ocr_default_confidence,
                                        }
                                    } else {
                                        ConfidenceMode::Native
                                    });
                                }
                                RegionText::Recognized(recognized)
                            }
                            Err(e) => {
                                self.fail(
                                    &mut trace,
                                    StageFailure::new(
                                        Stage::Ocr,
                                        page_number,
                                        format!("region {}: {e}", region.bbox),
                                        "empty block",
                                    ),
                                );
                                RegionText::Failed
                            }
                        }
                    }
                    (Some(_), _) => {
                        ocr_wanted = true;
                        RegionText::Empty
                    }
                    (None, _) => RegionText::Empty,
                }
            };
            texts.push(text);
        }

        if ocr_wanted {
            let reason = match &self.ocr {
                OcrPlan::Disabled => "OCR disabled for this request".to_string(),
                OcrPlan::Unavailable(reason) => reason.clone(),
                OcrPlan::Ready(_) | OcrPlan::NotNeeded => "no OCR backend".to_string(),
            };
            self.fail(
                &mut trace,
                StageFailure::new(Stage::Ocr, page_number, reason, "empty blocks"),
            );
        }
        if !ocr_ran {
            trace.skip(Stage::Ocr);
        }

        if let Some((region, leftover)) = assignment.unassigned {
            any_embedded = true;
            regions.push(region);
            texts.push(RegionText::Embedded(leftover));
        }

        let order = match &detector {
            Some(backend) => backend.reading_order(&regions, width, &config.layout),
            None => reading_order(&regions, width, &config.layout),
        };

        // ── Assemble ─────────────────────────────────────────────────────
        self.cancel.check()?;
        let text_source = match (any_embedded, any_ocr) {
            (true, true) => TextSource::Mixed,
            (true, false) => TextSource::Embedded,
            (false, true) => TextSource::Ocr,
            (false, false) => TextSource::None,
        };
        let status = PageStatus {
            degraded: !trace.failures.is_empty(),
            text_source,
            stages_skipped: trace.skipped.clone(),
            failures: trace.failures.clone(),
        };
        let started = Instant::now();
        let page = assemble_page(AssemblyInput {
            page_number,
            source_page,
            width,
            height,
            regions: regions.into_iter().zip(texts).collect(),
            order,
            layout: config.layout.clone(),
            extract_tables: self.options.extract_tables,
            extract_figures: self.options.extract_figures,
            status,
        });
        trace.record(Stage::Assemble, started.elapsed());
        debug!(
            "Page {}/{} assembled: {} blocks ({:?})",
            page_number,
            self.total_pages,
            page.blocks.len(),
            page.status.text_source
        );

        self.inner.observer.on_page_complete(&page, self.total_pages);
        Ok((page, trace))
    }

    async fn preprocess(
        &self,
        page_number: usize,
        image: GrayImage,
        trace: &mut PageTrace,
    ) -> Arc<GrayImage> {
        let config = &self.inner.config;
        let original = Arc::new(image);
        let input = Arc::clone(&original);
        let settings = config.preprocess.clone();
        let started = Instant::now();
        let outcome = blocking_stage(Stage::Preprocess, config.stage_timeout, move || {
            Ok(preprocess((*input).clone(), &settings))
        })
        .await;
        trace.record(Stage::Preprocess, started.elapsed());
        match outcome {
            Ok(out) => {
                if out.skew_degrees != 0.0 {
                    debug!("Page {}: deskewed by {:.1}°", page_number, out.skew_degrees);
                }
                Arc::new(out.image)
            }
            Err(e) => {
                self.fail(
                    trace,
                    StageFailure::new(Stage::Preprocess, page_number, e.to_string(), "unprocessed raster"),
                );
                original
            }
        }
    }

    /// Regions from the first backend that succeeds, with that backend.
    /// `None` means the full-page region was used.
    async fn detect_layout(
        &self,
        input: &LayoutInput,
        trace: &mut PageTrace,
    ) -> (Vec<LayoutRegion>, Option<Arc<dyn LayoutBackend>>) {
        let chain = match &self.layout {
            LayoutPlan::Detectors(chain) => chain.as_slice(),
            LayoutPlan::FullPage => {
                trace.skip(Stage::Layout);
                trace.layout_backend = Some("full_page".to_string());
                return (full_page(input), None);
            }
        };

        let timeout = self.inner.config.stage_timeout;
        for (i, backend) in chain.iter().enumerate() {
            let detector = Arc::clone(backend);
            let page = input.clone();
            let started = Instant::now();
            let outcome = blocking_stage(Stage::Layout, timeout, move || detector.detect(&page)).await;
            trace.record(Stage::Layout, started.elapsed());
            match outcome {
                Ok(regions) => {
                    debug!(
                        "Page {}: {} regions from {} layout",
                        input.page_number,
                        regions.len(),
                        backend.name()
                    );
                    trace.layout_backend = Some(backend.name().to_string());
                    return (regions, Some(Arc::clone(backend)));
                }
                Err(e) => {
                    let fallback = chain
                        .get(i + 1)
                        .map_or_else(|| "full-page region".to_string(), |b| format!("{} layout", b.name()));
                    self.fail(
                        trace,
                        StageFailure::new(Stage::Layout, input.page_number, e.to_string(), fallback),
                    );
                }
            }
        }
        trace.layout_backend = Some("full_page".to_string());
        (full_page(input), None)
    }
}

fn full_page(input: &LayoutInput) -> Vec<LayoutRegion> {
    full_page_region(input.width, input.height).into_iter().collect()
}

/// Run CPU-bound stage work on the blocking pool under `timeout`.
///
/// On timeout the blocking task is left to finish on its own; its result
/// is discarded.
async fn blocking_stage<T, F>(stage: Stage, timeout: Duration, work: F) -> Result<T, PerceptionError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PerceptionError> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(PerceptionError::Internal(format!("{stage} task failed: {e}"))),
        Err(_) => Err(PerceptionError::StageTimeout {
            stage: stage.to_string(),
            secs: timeout.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_substitutions_are_grouped_by_backend() {
        assert_eq!(layout_substitution_note("model", &[]), None);
        let pages = vec![
            (1, "heuristic".to_string()),
            (2, "full_page".to_string()),
            (4, "heuristic".to_string()),
        ];
        assert_eq!(
            layout_substitution_note("model", &pages).as_deref(),
            Some(
                "layout from heuristic on page(s) 1, 4; full_page on page(s) 2 \
                 (document layout backend: model)"
            )
        );
    }

    #[test]
    fn content_hash_is_prefixed_hex() {
        let h = content_hash(b"abc");
        assert_eq!(
            h,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(clone.check().is_ok());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(PerceptionError::Cancelled)));
    }

    #[tokio::test]
    async fn blocking_stage_maps_timeout() {
        let err = blocking_stage(Stage::Layout, Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PerceptionError::StageTimeout { ref stage, .. } if stage == "layout"));
    }

    #[test]
    fn trace_skips_are_deduplicated() {
        let mut trace = PageTrace::default();
        trace.skip(Stage::Ocr);
        trace.skip(Stage::Ocr);
        trace.record(Stage::Layout, Duration::from_millis(3));
        let mut recorder = ProvenanceRecorder::new();
        assert_eq!(trace.skipped, vec![Stage::Ocr]);
        trace.apply(&mut recorder);
        let p = recorder.finish("test");
        assert_eq!(p.stages_skipped, vec![Stage::Ocr]);
        assert!(p.ran(Stage::Layout));
    }

    #[tokio::test]
    async fn queries_need_a_store() {
        let perceiver = Perceiver::builder(PerceptionConfig::default()).build();
        let err = perceiver
            .query(&PerceptionQuery::keyword("x", "y"))
            .await
            .unwrap_err();
        assert!(matches!(err, PerceptionError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn oversized_input_is_rejected_before_loading() {
        let config = PerceptionConfig::builder().max_file_size_bytes(4).build().unwrap();
        let perceiver = Perceiver::builder(config).build();
        let err = perceiver
            .process(ParseRequest::new("big.png", vec![0u8; 16]))
            .await
            .unwrap_err();
        assert!(matches!(err, PerceptionError::TooLarge { .. }));
        assert_eq!(perceiver.pipeline_runs(), 0);
    }
}
