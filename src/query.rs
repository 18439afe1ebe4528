//! Query engine: keyword, regex and (stub) semantic retrieval over blocks.
//!
//! Matching runs against every block's text; `page_range`, `block_types`
//! and `min_confidence` filters are applied to the matches; results are
//! ordered by descending score, then by page number and reading order, and
//! truncated to `max_results`. `total_matches` counts filtered matches
//! before truncation.
//!
//! ## Keyword scoring
//!
//! Case-insensitive, non-overlapping occurrences of the query:
//!
//! ```text
//! score = occurrences × chars(query) / chars(block text)
//! ```
//!
//! which lies in (0, 1] and is exactly 1.0 when the query equals the whole
//! block text. Regex matches are scored the same way from the total matched
//! length.

use crate::config::PageSelection;
use crate::document::{Block, BlockType, Document};
use crate::error::PerceptionError;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Range;
use std::time::Instant;

/// Characters of surrounding text included on each side of a match.
const CONTEXT_CHARS: usize = 50;
/// Compiled-program cap for caller-supplied patterns.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

fn default_max_results() -> usize {
    10
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    #[default]
    Keyword,
    Regex,
    /// Placeholder lexical-overlap scoring; see [`SemanticScorer`].
    Semantic,
}

/// A search request against one stored document.
///
/// ```rust
/// use docsense::{PerceptionQuery, QueryMode};
///
/// let q = PerceptionQuery::from_json(r#"{"document_id": "d1", "query": "total", "mode": "keyword"}"#).unwrap();
/// assert_eq!(q.mode, QueryMode::Keyword);
/// assert_eq!(q.max_results, 10);
/// assert!(PerceptionQuery::from_json(r#"{"document_id": "d1", "query": "x", "limit": 3}"#).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerceptionQuery {
    pub document_id: String,
    pub query: String,
    #[serde(default)]
    pub mode: QueryMode,
    #[serde(default)]
    pub page_range: Option<PageSelection>,
    #[serde(default)]
    pub block_types: Option<Vec<BlockType>>,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub min_confidence: Option<f32>,
}

impl PerceptionQuery {
    pub fn new(document_id: impl Into<String>, query: impl Into<String>, mode: QueryMode) -> Self {
        Self {
            document_id: document_id.into(),
            query: query.into(),
            mode,
            page_range: None,
            block_types: None,
            max_results: default_max_results(),
            min_confidence: None,
        }
    }

    pub fn keyword(document_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self::new(document_id, query, QueryMode::Keyword)
    }

    pub fn regex(document_id: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(document_id, pattern, QueryMode::Regex)
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.page_range = Some(selection);
        self
    }

    pub fn block_types(mut self, types: Vec<BlockType>) -> Self {
        self.block_types = Some(types);
        self
    }

    pub fn max_results(mut self, n: usize) -> Self {
        self.max_results = n;
        self
    }

    pub fn min_confidence(mut self, c: f32) -> Self {
        self.min_confidence = Some(c);
        self
    }

    /// Parse a query; unknown or ill-typed fields give `InvalidQuery`.
    pub fn from_json(json: &str) -> Result<Self, PerceptionError> {
        serde_json::from_str(json).map_err(|e| PerceptionError::InvalidQuery(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub block_id: String,
    pub page_number: usize,
    pub block_type: BlockType,
    pub matched_text: String,
    pub score: f32,
    /// Text around the first match.
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query: PerceptionQuery,
    pub document_id: String,
    pub results: Vec<QueryResult>,
    /// Matches surviving the filters, before truncation.
    pub total_matches: usize,
    pub processing_time_ms: u64,
}

// ── Semantic extension point ─────────────────────────────────────────────

/// Relevance of a block's text to a free-text query, in `[0,1]`.
///
/// Implement this to plug in embedding similarity; zero means no match.
pub trait SemanticScorer: Send + Sync {
    fn score(&self, query: &str, text: &str) -> f32;
}

/// Deterministic stand-in: the fraction of distinct query terms that occur
/// in the text (case-insensitive, alphanumeric tokens).
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalOverlapScorer;

fn tokens(s: &str) -> BTreeSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl SemanticScorer for LexicalOverlapScorer {
    fn score(&self, query: &str, text: &str) -> f32 {
        let q = tokens(query);
        if q.is_empty() {
            return 0.0;
        }
        let t = tokens(text);
        q.intersection(&t).count() as f32 / q.len() as f32
    }
}

// ── Matching ─────────────────────────────────────────────────────────────

enum Matcher<'a> {
    Pattern(Regex),
    Semantic(&'a dyn SemanticScorer),
}

struct Hit {
    score: f32,
    matched_text: String,
    span: Option<Range<usize>>,
}

impl Matcher<'_> {
    fn build<'a>(q: &PerceptionQuery, scorer: &'a dyn SemanticScorer) -> Result<Matcher<'a>, PerceptionError> {
        let pattern = match q.mode {
            QueryMode::Keyword => regex::escape(q.query.trim()),
            QueryMode::Regex => q.query.clone(),
            QueryMode::Semantic => return Ok(Matcher::Semantic(scorer)),
        };
        RegexBuilder::new(&pattern)
            .case_insensitive(q.mode == QueryMode::Keyword)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map(Matcher::Pattern)
            .map_err(|e| PerceptionError::InvalidQuery(format!("invalid pattern '{}': {e}", q.query)))
    }

    fn find(&self, query: &str, text: &str) -> Option<Hit> {
        match self {
            Matcher::Pattern(re) => {
                let matches: Vec<_> = re.find_iter(text).filter(|m| !m.is_empty()).collect();
                let first = matches.first()?;
                let text_chars = text.chars().count().max(1);
                let matched_chars: usize = matches.iter().map(|m| m.as_str().chars().count()).sum();
                let score = if first.as_str().trim() == text.trim() && matches.len() == 1 {
                    1.0
                } else {
                    (matched_chars as f32 / text_chars as f32).clamp(f32::EPSILON, 1.0)
                };
                Some(Hit {
                    score,
                    matched_text: first.as_str().to_string(),
                    span: Some(first.range()),
                })
            }
            Matcher::Semantic(scorer) => {
                let score = scorer.score(query, text).clamp(0.0, 1.0);
                (score > 0.0).then(|| Hit {
                    score,
                    matched_text: snippet(text, 0..0),
                    span: None,
                })
            }
        }
    }
}

/// Up to `CONTEXT_CHARS` characters either side of `span`, on char
/// boundaries, with `...` marking cut ends.
fn snippet(text: &str, span: Range<usize>) -> String {
    let start = text[..span.start]
        .char_indices()
        .rev()
        .nth(CONTEXT_CHARS - 1)
        .map_or(0, |(i, _)| i);
    let end = text[span.end..]
        .char_indices()
        .nth(CONTEXT_CHARS)
        .map_or(text.len(), |(i, _)| span.end + i);
    let mut out = String::new();
    if start > 0 {
        out.push_str("...");
    }
    out.push_str(text[start..end].trim());
    if end < text.len() {
        out.push_str("...");
    }
    out
}

fn passes_filters(q: &PerceptionQuery, block: &Block) -> bool {
    if let Some(pages) = &q.page_range {
        if !pages.contains(block.page_number) {
            return false;
        }
    }
    if let Some(types) = &q.block_types {
        if !types.contains(&block.block_type) {
            return false;
        }
    }
    if let Some(min) = q.min_confidence {
        if block.confidence < min {
            return false;
        }
    }
    true
}

/// Run `q` against `document` with the default semantic stub.
pub fn query(document: &Document, q: &PerceptionQuery) -> Result<QueryResponse, PerceptionError> {
    query_with_scorer(document, q, &LexicalOverlapScorer)
}

/// Run `q` against `document`; `scorer` serves `semantic` mode.
pub fn query_with_scorer(
    document: &Document,
    q: &PerceptionQuery,
    scorer: &dyn SemanticScorer,
) -> Result<QueryResponse, PerceptionError> {
    let start = Instant::now();
    if q.document_id != document.document_id {
        return Err(PerceptionError::InvalidQuery(format!(
            "query targets document '{}' but was run against '{}'",
            q.document_id, document.document_id
        )));
    }
    if q.query.trim().is_empty() {
        return Err(PerceptionError::InvalidQuery("query text is empty".into()));
    }
    if q.max_results == 0 {
        return Err(PerceptionError::InvalidQuery("max_results must be at least 1".into()));
    }
    if let Some(c) = q.min_confidence {
        if !(0.0..=1.0).contains(&c) {
            return Err(PerceptionError::InvalidQuery(format!(
                "min_confidence must be within 0–1, got {c}"
            )));
        }
    }
    let matcher = Matcher::build(q, scorer)?;

    // (score, page, reading index, result)
    let mut hits: Vec<(f32, usize, usize, QueryResult)> = Vec::new();
    for page in &document.pages {
        for (index, block) in page.blocks.iter().enumerate() {
            let Some(hit) = matcher.find(&q.query, &block.text) else {
                continue;
            };
            if !passes_filters(q, block) {
                continue;
            }
            let context = match hit.span {
                Some(span) => snippet(&block.text, span),
                None => String::new(),
            };
            hits.push((
                hit.score,
                page.page_number,
                index,
                QueryResult {
                    block_id: block.id.clone(),
                    page_number: block.page_number,
                    block_type: block.block_type,
                    matched_text: hit.matched_text,
                    score: hit.score,
                    context,
                },
            ));
        }
    }

    hits.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
    let total_matches = hits.len();
    let results = hits
        .into_iter()
        .take(q.max_results)
        .map(|(_, _, _, r)| r)
        .collect();

    Ok(QueryResponse {
        query: q.clone(),
        document_id: document.document_id.clone(),
        results,
        total_matches,
        processing_time_ms: start.elapsed().as_millis() as u64,
    })
}
