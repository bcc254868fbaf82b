//! Core data models used throughout Termbridge.
//!
//! These types represent the records, knowledge items, and terminology
//! entries that flow through the storage, retrieval, and translation
//! pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored (text, vector, metadata) triple.
///
/// Owned exclusively by the collection it lives in. The `id` is generated
/// at insert time and never changes; it is also mirrored into
/// `metadata["id"]` so the persisted form round-trips without a separate
/// id array.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A record paired with its similarity score for one query.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: Record,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
}

/// How a knowledge item entered the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeKind {
    /// A question/answer block imported from structured text.
    QaGroup,
    /// A chunk produced by the paragraph chunker.
    DocumentChunk,
    /// Free text added directly.
    #[default]
    Text,
}

/// Metadata carried by every [`KnowledgeItem`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KnowledgeMeta {
    #[serde(rename = "type", default)]
    pub kind: KnowledgeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<String>,
}

/// One passage in the knowledge index.
///
/// `vector_ref` points at the record holding this item's embedding. It is
/// a weak reference: the item does not own the vector store, and a missing
/// or dangling reference is a recoverable state (the backfill pass repairs
/// it), never a fatal one.
#[derive(Debug, Clone)]
pub struct KnowledgeItem {
    /// Unique key within the index.
    pub name: String,
    pub content: String,
    pub vector_ref: Option<String>,
    pub metadata: KnowledgeMeta,
}

/// Outcome of one text import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Items stored with a vector reference.
    pub chunks_added: usize,
    /// Items stored without one because embedding failed; a later
    /// backfill pass picks these up.
    pub chunks_failed: usize,
}

/// One terminology entry: a source-language term and its accepted
/// target-language renderings, first entry = highest priority.
#[derive(Debug, Clone)]
pub struct TermEntry {
    pub id: String,
    pub source_term: String,
    pub target_terms: Vec<String>,
    pub source_lang: String,
    pub target_lang: String,
    pub vector_ref: Option<String>,
    pub added_time: DateTime<Utc>,
}

impl TermEntry {
    /// The highest-priority target rendering.
    pub fn primary_target(&self) -> &str {
        self.target_terms.first().map(String::as_str).unwrap_or("")
    }
}

/// A dictionary hit inside a piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermMatch {
    /// The span as it appears in the scanned text.
    pub source_span: String,
    /// The rendering that will replace the span.
    pub chosen_target: String,
    /// Every accepted rendering, `chosen_target` first.
    pub all_targets: Vec<String>,
}
