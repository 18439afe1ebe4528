//! CLI binary for docsense.
//!
//! A thin shim over the library crate: maps flags to `PerceptionConfig` /
//! `ParseOptions` / `PerceptionQuery`, runs against a store directory and
//! prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docsense::pipeline::input::fetch_input;
use docsense::store::LayeredStore;
use docsense::{
    BlockType, Document, OcrEngine, Page, PageSelection, ParseOptions, ParseRequest,
    PerceptionConfig, PerceptionError, PerceptionQuery, Perceiver, ProgressObserver, QueryMode,
    StageFailure, StoreConfig, TextSource, VisionConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Progress observer using indicatif ────────────────────────────────────────

/// Live progress bar plus one log line per page. Pages finish out of order
/// when processed concurrently; the bar only counts.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Loading");
        bar.set_message("decoding document…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl ProgressObserver for CliProgress {
    fn on_document_start(&self, filename: &str, total_pages: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} pages  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(total_pages as u64);
        self.bar.set_prefix("Perceiving");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{filename}: {total_pages} pages"))
        ));
    }

    fn on_page_complete(&self, page: &Page, total_pages: usize) {
        let mark = if page.status.degraded { yellow("⚠") } else { green("✓") };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            mark,
            page.page_number,
            total_pages,
            dim(&format!("{:>3} blocks", page.blocks.len())),
            dim(text_source_label(page.status.text_source)),
        ));
        self.bar.inc(1);
    }

    fn on_stage_fallback(&self, failure: &StageFailure) {
        self.bar.println(format!("    {} {}", yellow("↳"), dim(&failure.to_string())));
    }

    fn on_document_complete(&self, _document: &Document) {
        self.bar.finish_and_clear();
    }

    fn on_document_error(&self, _filename: &str, _error: &PerceptionError) {
        self.bar.finish_and_clear();
    }
}

fn text_source_label(source: TextSource) -> &'static str {
    match source {
        TextSource::Embedded => "embedded text",
        TextSource::Ocr => "ocr",
        TextSource::Mixed => "embedded + ocr",
        TextSource::None => "no text",
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Perceive a scan and store it
  docsense parse scan.png

  # Text-native PDF, pages 1-5, print the document as JSON
  docsense parse --pages 1-5 --json report.pdf

  # OCR through a vision LLM instead of Tesseract
  docsense parse --ocr vision --model gpt-4.1-nano invoice.pdf

  # Search a stored document
  docsense query 0190f3c4-... "invoice"
  docsense query --mode regex --types paragraph,table 0190f3c4-... '\d{4}-\d{2}-\d{2}'

  # Inspect, list and delete stored documents
  docsense show --page 2 0190f3c4-...
  docsense list --limit 20
  docsense delete 0190f3c4-...

ENVIRONMENT VARIABLES:
  DOCSENSE_STORE          Store directory (default: ~/.cache/docsense)
  DOCSENSE_OCR            Default OCR engine (tesseract, vision, disabled)
  PDFIUM_LIB_PATH         libpdfium file or directory (default: system library)
  EDGEQUAKE_PROVIDER      Vision OCR provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Vision OCR model ID
  OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY   provider credentials
  RUST_LOG                Overrides the log filter
"#;

/// Perceive documents into pages, blocks, tables and figures, then query them.
#[derive(Parser, Debug)]
#[command(
    name = "docsense",
    version,
    about = "Perceive PDFs and scans as typed pages, blocks, tables and figures",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Store directory.
    #[arg(long, global = true, env = "DOCSENSE_STORE")]
    store: Option<PathBuf>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCSENSE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "DOCSENSE_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Perceive a local file or HTTP(S) URL and store the result.
    Parse(ParseArgs),
    /// Search a stored document.
    Query(QueryArgs),
    /// Print a stored document.
    Show {
        document_id: String,
        /// Only this page (1-indexed).
        #[arg(long)]
        page: Option<usize>,
        /// Full JSON record instead of text.
        #[arg(long)]
        json: bool,
    },
    /// List stored document ids, oldest first.
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Delete a stored document.
    Delete { document_id: String },
}

#[derive(clap::Args, Debug)]
struct ParseArgs {
    /// Local file path or HTTP/HTTPS URL.
    input: String,

    /// OCR engine: tesseract, vision, disabled.
    #[arg(long, env = "DOCSENSE_OCR", default_value = "tesseract", value_parser = parse_ocr)]
    ocr: OcrEngine,

    /// Page selection: all, 5, 3-15, or 1,3,7-9.
    #[arg(long, env = "DOCSENSE_PAGES", default_value = "all", value_parser = parse_pages)]
    pages: PageSelection,

    /// One full-page region per page instead of layout detection.
    #[arg(long)]
    no_layout: bool,

    /// Do not decompose tables into cells.
    #[arg(long)]
    no_tables: bool,

    /// Do not emit figure records.
    #[arg(long)]
    no_figures: bool,

    /// Parse options as JSON; when given, the option flags above are ignored.
    #[arg(long)]
    options: Option<String>,

    /// Rasterisation DPI (72–400).
    #[arg(long, env = "DOCSENSE_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Embedded-text coverage above which a page skips OCR (0–1).
    #[arg(long, env = "DOCSENSE_TEXT_COVERAGE", default_value_t = 0.10)]
    text_coverage: f32,

    /// Per-stage timeout in seconds.
    #[arg(long, env = "DOCSENSE_STAGE_TIMEOUT", default_value_t = 60)]
    stage_timeout: u64,

    /// Pages processed concurrently.
    #[arg(short = 'c', long, env = "DOCSENSE_PAGE_CONCURRENCY", default_value_t = 4)]
    page_concurrency: usize,

    /// Maximum input size in MiB.
    #[arg(long, env = "DOCSENSE_MAX_FILE_MB", default_value_t = 100)]
    max_file_mb: u64,

    /// Maximum pages processed.
    #[arg(long, env = "DOCSENSE_MAX_PAGES", default_value_t = 500)]
    max_pages: usize,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "DOCSENSE_PDF_PASSWORD")]
    password: Option<String>,

    /// libpdfium file or directory.
    #[arg(long, env = "PDFIUM_LIB_PATH")]
    pdfium_lib: Option<PathBuf>,

    /// Tesseract language code.
    #[arg(long, env = "DOCSENSE_TESSERACT_LANG", default_value = "eng")]
    tesseract_lang: String,

    /// Vision OCR model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Vision OCR provider.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "DOCSENSE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Print the full document as JSON.
    #[arg(long)]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "DOCSENSE_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(clap::Args, Debug)]
struct QueryArgs {
    document_id: String,
    query: String,

    /// keyword, regex or semantic.
    #[arg(long, default_value = "keyword", value_parser = parse_mode)]
    mode: QueryMode,

    /// Only these pages: 5, 3-15, 1,3,7-9.
    #[arg(long, value_parser = parse_pages)]
    pages: Option<PageSelection>,

    /// Only these block types, comma-separated (heading,table,...).
    #[arg(long, value_parser = parse_types)]
    types: Option<Vec<BlockType>>,

    #[arg(short = 'n', long, default_value_t = 10)]
    max_results: usize,

    #[arg(long)]
    min_confidence: Option<f32>,

    /// Print the response as JSON.
    #[arg(long)]
    json: bool,
}

fn parse_ocr(s: &str) -> Result<OcrEngine, String> {
    s.parse()
}

fn parse_pages(s: &str) -> Result<PageSelection, String> {
    s.parse()
}

fn parse_types(s: &str) -> Result<Vec<BlockType>, String> {
    docsense::config::parse_block_types(s)
}

fn parse_mode(s: &str) -> Result<QueryMode, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "keyword" => Ok(QueryMode::Keyword),
        "regex" => Ok(QueryMode::Regex),
        "semantic" => Ok(QueryMode::Semantic),
        other => Err(format!("unknown query mode '{other}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs during `parse`.
    let show_progress = matches!(&cli.command, Command::Parse(a) if !a.no_progress && !a.json)
        && !cli.quiet;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let store_config = match &cli.store {
        Some(root) => StoreConfig::new(root),
        None => StoreConfig::default(),
    };
    let store = Arc::new(
        LayeredStore::open(store_config)
            .await
            .context("Failed to open document store")?,
    );

    // Store-only commands never touch pipeline settings.
    let catalog = Perceiver::builder(PerceptionConfig::default())
        .store(store.clone())
        .build();
    let result = match cli.command {
        Command::Parse(args) => parse(args, Arc::clone(&store), show_progress, cli.quiet).await,
        Command::Query(args) => query(args, &catalog).await,
        Command::Show {
            document_id,
            page,
            json,
        } => show(&document_id, page, json, &catalog).await,
        Command::List { limit, offset } => list(limit, offset, &catalog).await,
        Command::Delete { document_id } => delete(&document_id, &catalog, cli.quiet).await,
    };
    store.close();
    result
}

async fn list(limit: usize, offset: usize, catalog: &Perceiver) -> Result<()> {
    for id in catalog.list(limit, offset).await? {
        println!("{id}");
    }
    Ok(())
}

async fn delete(document_id: &str, catalog: &Perceiver, quiet: bool) -> Result<()> {
    if !catalog.delete(document_id).await? {
        anyhow::bail!("Document '{document_id}' not found");
    }
    if !quiet {
        eprintln!("{} deleted {}", green("✔"), document_id);
    }
    Ok(())
}

async fn parse(
    args: ParseArgs,
    store: Arc<LayeredStore>,
    show_progress: bool,
    quiet: bool,
) -> Result<()> {
    let options = match &args.options {
        Some(json) => ParseOptions::from_json(json).context("Invalid --options")?,
        None => ParseOptions {
            ocr_engine: args.ocr,
            extract_layout: !args.no_layout,
            extract_tables: !args.no_tables,
            extract_figures: !args.no_figures,
            page_range: args.pages.clone(),
        },
    };

    let mut builder = PerceptionConfig::builder()
        .dpi(args.dpi)
        .text_coverage_threshold(args.text_coverage)
        .stage_timeout_secs(args.stage_timeout)
        .page_concurrency(args.page_concurrency)
        .max_file_size_bytes(args.max_file_mb.saturating_mul(1024 * 1024))
        .max_pages(args.max_pages)
        .tesseract_language(args.tesseract_lang.clone())
        .vision(VisionConfig {
            provider_name: args.provider.clone(),
            model: args.model.clone(),
            ..VisionConfig::default()
        });
    if let Some(pwd) = &args.password {
        builder = builder.pdf_password(pwd.clone());
    }
    if let Some(lib) = &args.pdfium_lib {
        builder = builder.pdfium_library_path(lib.clone());
    }
    let config = builder.build().context("Invalid configuration")?;

    let input = fetch_input(&args.input, args.download_timeout, config.max_file_size_bytes)
        .await
        .with_context(|| format!("Failed to read {}", args.input))?;

    let mut perceiver = Perceiver::builder(config).store(store);
    if show_progress {
        perceiver = perceiver.observer(CliProgress::new());
    }
    let perceiver = perceiver.build();

    let mut request = ParseRequest::new(input.filename, input.bytes).options(options);
    if let Some(mime) = input.mime_hint {
        request = request.mime_hint(mime);
    }
    let doc = perceiver.process(request).await.context("Perception failed")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(doc.as_ref()).context("Failed to serialise document")?
        );
    } else {
        println!("{}", doc.document_id);
    }

    if !quiet {
        let degraded = doc.pages.iter().filter(|p| p.status.degraded).count();
        eprintln!(
            "{}  {} pages  {} blocks  {} tables  {} figures  {}ms",
            if degraded == 0 { green("✔") } else { yellow("⚠") },
            doc.pages.len(),
            doc.block_count(),
            doc.pages.iter().map(|p| p.tables.len()).sum::<usize>(),
            doc.pages.iter().map(|p| p.figures.len()).sum::<usize>(),
            doc.provenance.processing_time_ms,
        );
        eprintln!(
            "   layout: {}  ocr: {}  stages: {}",
            dim(&doc.provenance.layout_backend),
            dim(doc.provenance.ocr_backend.as_deref().unwrap_or("none")),
            dim(&doc
                .provenance
                .stages_run
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" → ")),
        );
        if degraded > 0 {
            eprintln!("   {} {} degraded page(s):", yellow("⚠"), degraded);
            for note in &doc.provenance.annotations {
                eprintln!("     {}", dim(note));
            }
        }
    }
    Ok(())
}

async fn query(args: QueryArgs, perceiver: &Perceiver) -> Result<()> {
    let mut q = PerceptionQuery::new(&args.document_id, &args.query, args.mode)
        .max_results(args.max_results);
    q.page_range = args.pages;
    q.block_types = args.types;
    q.min_confidence = args.min_confidence;

    let response = perceiver.query(&q).await.context("Query failed")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&response).context("Failed to serialise response")?
        );
        return Ok(());
    }
    for r in &response.results {
        println!(
            "{:<10} {:<9} {:.3}  {}",
            r.block_id,
            r.block_type.as_str(),
            r.score,
            r.context.replace('\n', " ")
        );
    }
    eprintln!(
        "{}",
        dim(&format!(
            "{} of {} matches, {}ms",
            response.results.len(),
            response.total_matches,
            response.processing_time_ms
        ))
    );
    Ok(())
}

async fn show(document_id: &str, page: Option<usize>, json: bool, perceiver: &Perceiver) -> Result<()> {
    let doc = perceiver.get(document_id).await?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(doc.as_ref()).context("Failed to serialise document")?
        );
        return Ok(());
    }

    if let Some(title) = &doc.metadata.title {
        println!("{}", bold(title));
    }
    for p in &doc.pages {
        if page.is_some_and(|n| n != p.page_number) {
            continue;
        }
        println!(
            "{}",
            cyan(&format!(
                "── page {} (source {}) {}",
                p.page_number,
                p.source_page,
                if p.status.degraded { "degraded" } else { "" }
            ))
        );
        for b in &p.blocks {
            println!(
                "{} {}",
                dim(&format!("[{} {} {:.2}]", b.id, b.block_type, b.confidence)),
                b.text
            );
        }
        for t in &p.tables {
            println!("{}", dim(&format!("table {} ({}×{})", t.block_id, t.rows, t.columns)));
            for row in &t.cells {
                println!("  | {} |", row.join(" | "));
            }
        }
    }
    Ok(())
}
