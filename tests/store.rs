//! Integration tests for the layered document store.
//!
//! Run with:
//!   cargo test --test store

use docsense::document::ProvenanceRecorder;
use docsense::store::LayeredStore;
use docsense::{
    Block, BlockType, BoundingBox, Document, DocumentMetadata, DocumentStore, Figure, Page,
    PageStatus, PerceptionError, SourceInfo, StoreConfig, Table, TextSource,
};
use futures::future::join_all;
use std::sync::Arc;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
    BoundingBox::new(x, y, w, h).unwrap()
}

fn block(page: usize, rank: usize, kind: BlockType, b: BoundingBox, text: &str) -> Block {
    Block {
        id: Block::make_id(page, rank),
        block_type: kind,
        bbox: b,
        text: text.into(),
        confidence: 0.87,
        page_number: page,
    }
}

/// A one-page document with a heading, a table and a captioned figure.
fn sample(id: &str) -> Arc<Document> {
    let table_box = bbox(50.0, 120.0, 500.0, 80.0);
    let figure_box = bbox(50.0, 300.0, 300.0, 200.0);
    let mut recorder = ProvenanceRecorder::new();
    recorder.set_layout_backend("heuristic");
    recorder.annotate("page 1: layout failed (boom); fallback: heuristic layout");

    let page = Page {
        page_number: 1,
        source_page: 4,
        width: 600.0,
        height: 800.0,
        blocks: vec![
            block(1, 1, BlockType::Heading, bbox(50.0, 40.0, 500.0, 30.0), "Invoice 2026-01-28"),
            block(1, 2, BlockType::Table, table_box, "Item Qty Widget 3"),
            block(1, 3, BlockType::Figure, figure_box, ""),
            block(1, 4, BlockType::Caption, bbox(50.0, 505.0, 300.0, 12.0), "Figure 1: usage"),
        ],
        tables: vec![Table {
            block_id: Block::make_id(1, 2),
            bbox: table_box,
            rows: 2,
            columns: 2,
            cells: vec![
                vec!["Item".into(), "Qty".into()],
                vec!["Widget".into(), "3".into()],
            ],
        }],
        figures: vec![Figure {
            block_id: Block::make_id(1, 3),
            bbox: figure_box,
            caption: Some("Figure 1: usage".into()),
        }],
        status: PageStatus {
            text_source: TextSource::Embedded,
            ..PageStatus::default()
        },
    };

    Arc::new(Document {
        document_id: id.into(),
        source: SourceInfo {
            filename: "invoice.pdf".into(),
            mime_type: "application/pdf".into(),
            size_bytes: 1234,
            content_hash: "sha256:00ff".into(),
        },
        metadata: DocumentMetadata {
            title: Some("Invoice".into()),
            page_count: 7,
            ..DocumentMetadata::default()
        },
        pages: vec![page],
        provenance: recorder.finish("test"),
    })
}

async fn open(dir: &std::path::Path, max_docs: usize) -> LayeredStore {
    LayeredStore::open(StoreConfig::new(dir).max_cached_documents(max_docs))
        .await
        .unwrap()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn documents_survive_reopening_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let original = sample("doc-1");
    {
        let store = open(dir.path(), 8).await;
        assert_eq!(store.save(Arc::clone(&original)).await.unwrap(), "doc-1");
        store.close();
    }

    let store = open(dir.path(), 8).await;
    assert!(!store.is_cached("doc-1"));
    let loaded = store.get("doc-1").await.unwrap();
    assert_eq!(loaded.as_ref(), original.as_ref());
    assert!(store.is_cached("doc-1"));
    assert!(loaded.validate().is_empty(), "{:?}", loaded.validate());
}

#[tokio::test]
async fn evicted_documents_are_reloaded_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 2).await;
    for id in ["a", "b", "c"] {
        store.save(sample(id)).await.unwrap();
    }

    assert!(!store.is_cached("a"), "least recently used entry should be evicted");
    assert!(store.is_cached("b"));
    assert!(store.is_cached("c"));
    assert!(store.stats().evictions >= 1);

    let a = store.get("a").await.unwrap();
    assert_eq!(a.document_id, "a");
    assert!(store.is_cached("a"));
    assert_eq!(store.count().await.unwrap(), 3);
}

#[tokio::test]
async fn list_is_ordered_and_paginated() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 8).await;
    let ids: Vec<String> = ["0190a", "0190b", "0190c", "0190d", "0190e"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    for id in ids.iter().rev() {
        store.save(sample(id)).await.unwrap();
    }

    assert_eq!(store.list(10, 0).await.unwrap(), ids);
    assert_eq!(store.list(2, 1).await.unwrap(), ids[1..3].to_vec());
    assert!(store.list(10, 5).await.unwrap().is_empty());
    assert_eq!(store.count().await.unwrap(), 5);
}

#[tokio::test]
async fn concurrent_access_to_different_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(open(dir.path(), 4).await);

    let saves = (0..16).map(|i| {
        let store = Arc::clone(&store);
        async move { store.save(sample(&format!("doc-{i:02}"))).await }
    });
    for result in join_all(saves).await {
        result.unwrap();
    }

    let gets = (0..16).map(|i| {
        let store = Arc::clone(&store);
        async move { store.get(&format!("doc-{i:02}")).await }
    });
    for (i, result) in join_all(gets).await.into_iter().enumerate() {
        assert_eq!(result.unwrap().document_id, format!("doc-{i:02}"));
    }
    assert_eq!(store.count().await.unwrap(), 16);
    assert!(store.stats().entries <= 4);
}

#[tokio::test]
async fn saving_an_existing_id_replaces_it() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 1).await;
    store.save(sample("same")).await.unwrap();

    let mut updated = (*sample("same")).clone();
    updated.metadata.title = Some("Revised".into());
    store.save(Arc::new(updated)).await.unwrap();
    store.clear_cache();

    let loaded = store.get("same").await.unwrap();
    assert_eq!(loaded.metadata.title.as_deref(), Some("Revised"));
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn deleted_documents_are_gone_from_both_layers() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path(), 4).await;
    store.save(sample("gone")).await.unwrap();

    assert!(store.delete("gone").await.unwrap());
    assert!(!store.delete("gone").await.unwrap());
    assert!(matches!(
        store.get("gone").await,
        Err(PerceptionError::NotFound { .. })
    ));
    assert!(store.list(10, 0).await.unwrap().is_empty());
}
