//! Knowledge index: turns free-text queries into ranked, deduplicated
//! passages.
//!
//! Imports recognize two shapes of text. Question/answer blocks are
//! stored whole but indexed by their question lines, which makes short
//! user queries land on the right block; everything else goes through the
//! paragraph chunker. Items whose embedding fails at import time are kept
//! without a vector and picked up later by
//! [`ensure_vectors`](KnowledgeIndex::ensure_vectors).
//!
//! Retrieval expands the query into variants (templated rewrites plus
//! extracted keywords) because a single embedding of a short query
//! under-recalls paraphrased knowledge; the merged hits are deduplicated
//! by exact content and reranked. When no embedding backend is reachable
//! the index degrades to a lexical keyword match instead of erroring.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use termbridge_core::chunk::chunk_paragraphs;
use termbridge_core::keywords::{extract_keywords, lexical_score};
use termbridge_core::qa::parse_qa_blocks;
use termbridge_core::{Error, ImportReport, KnowledgeItem, KnowledgeKind, KnowledgeMeta, Record};

use crate::config::KnowledgeConfig;
use crate::embedding::EmbeddingPort;
use crate::generation::GenerationPort;
use crate::persist::{quarantine, write_json_atomic};
use crate::store::VectorStore;

/// Collection holding knowledge passages.
pub const KNOWLEDGE_COLLECTION: &str = "knowledge";

/// Reply required from the generator when the context cannot answer.
pub const NO_ANSWER_REPLY: &str = "No answer found in the provided content.";

/// A knowledge item paired with its retrieval score.
#[derive(Debug, Clone)]
pub struct KnowledgeHit {
    pub item: KnowledgeItem,
    pub score: f32,
}

/// Persisted shape of one item in the items file.
#[derive(Serialize, Deserialize)]
struct StoredItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vector_id: Option<String>,
    #[serde(default)]
    metadata: KnowledgeMeta,
}

/// Named knowledge passages indexed through a [`VectorStore`].
///
/// The index does not own the store; items hold weak references into it
/// and a dangling reference is repaired by the backfill pass rather than
/// treated as fatal.
pub struct KnowledgeIndex {
    store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingPort>,
    config: KnowledgeConfig,
    items_path: PathBuf,
    items: RwLock<HashMap<String, KnowledgeItem>>,
}

impl KnowledgeIndex {
    /// Open the index, loading persisted items. A missing items file is
    /// an empty index; an unreadable one is quarantined.
    pub fn open(
        store: Arc<VectorStore>,
        embedder: Arc<dyn EmbeddingPort>,
        config: KnowledgeConfig,
    ) -> Result<Self> {
        let items_path = config.items_path.clone();
        let index = Self {
            store,
            embedder,
            config,
            items_path,
            items: RwLock::new(HashMap::new()),
        };
        index.load_items()?;
        Ok(index)
    }

    fn load_items(&self) -> Result<()> {
        let mut items = self.items.write().unwrap();
        items.clear();

        if !self.items_path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.items_path)
            .with_context(|| format!("failed to read {}", self.items_path.display()))?;
        let stored: HashMap<String, StoredItem> = match serde_json::from_str(&content) {
            Ok(parsed) => parsed,
            Err(e) => {
                let moved = quarantine(&self.items_path)?;
                warn!(
                    path = %self.items_path.display(),
                    quarantined = %moved.display(),
                    error = %e,
                    "knowledge items file unreadable, starting empty"
                );
                return Ok(());
            }
        };

        for (name, item) in stored {
            // Older files omitted content for QA items; the answer text
            // is enough to keep the item alive.
            let content = match item.content {
                Some(content) if !content.is_empty() => content,
                _ => match (&item.metadata.question, &item.metadata.answer) {
                    (Some(q), Some(a)) => format!("Question: {q}\nAnswer: {a}"),
                    _ => {
                        warn!(item = %name, "dropping knowledge item without content");
                        continue;
                    }
                },
            };
            items.insert(
                name.clone(),
                KnowledgeItem {
                    name,
                    content,
                    vector_ref: item.vector_id,
                    metadata: item.metadata,
                },
            );
        }
        info!(count = items.len(), "knowledge items loaded");
        Ok(())
    }

    /// Persist the item table (content, vector reference, metadata).
    pub fn save(&self) -> Result<()> {
        let items = self.items.read().unwrap();
        let mut map = serde_json::Map::new();
        for (name, item) in items.iter() {
            let stored = StoredItem {
                content: Some(item.content.clone()),
                vector_id: item.vector_ref.clone(),
                metadata: item.metadata.clone(),
            };
            map.insert(name.clone(), serde_json::to_value(stored)?);
        }
        write_json_atomic(&self.items_path, &Value::Object(map))
            .with_context(|| "failed to save knowledge items")
    }

    /// Import raw text, as QA blocks when the text has that structure and
    /// as paragraph chunks otherwise. Embedding failures do not abort the
    /// import; affected items are stored without a vector and counted in
    /// `chunks_failed`.
    pub async fn import_text(&self, raw_text: &str, source_id: &str) -> Result<ImportReport> {
        let mut report = ImportReport::default();

        let qa_blocks = parse_qa_blocks(raw_text);
        if !qa_blocks.is_empty() {
            for (i, block) in qa_blocks.iter().enumerate() {
                let name = self.unique_name(&format!("{source_id}_qa_{}", i + 1));
                let metadata = KnowledgeMeta {
                    kind: KnowledgeKind::QaGroup,
                    question: Some(block.question.clone()),
                    answer: Some(block.answer.clone()),
                    source: Some(source_id.to_string()),
                    chunk_index: None,
                    imported_at: Some(chrono::Utc::now().to_rfc3339()),
                };
                let vector_ref = self
                    .embed_and_insert(&name, &block.index_text(), &block.full_text, &metadata)
                    .await;
                self.add_item(&name, &block.full_text, vector_ref, metadata, &mut report);
            }
        } else {
            let chunks = chunk_paragraphs(raw_text, self.config.chunk_budget);
            for (i, chunk) in chunks.iter().enumerate() {
                let name = self.unique_name(&format!("{source_id}_chunk_{}", i + 1));
                let metadata = KnowledgeMeta {
                    kind: KnowledgeKind::DocumentChunk,
                    question: None,
                    answer: None,
                    source: Some(source_id.to_string()),
                    chunk_index: Some(i),
                    imported_at: Some(chrono::Utc::now().to_rfc3339()),
                };
                let vector_ref = self
                    .embed_and_insert(&name, chunk, chunk, &metadata)
                    .await;
                self.add_item(&name, chunk, vector_ref, metadata, &mut report);
            }
        }

        self.save()?;
        self.store.flush()?;
        info!(
            source = source_id,
            added = report.chunks_added,
            failed = report.chunks_failed,
            "import finished"
        );
        Ok(report)
    }

    /// Embed `index_text` and store `content` under it. Returns the new
    /// record id, or None when embedding or insertion failed.
    async fn embed_and_insert(
        &self,
        name: &str,
        index_text: &str,
        content: &str,
        metadata: &KnowledgeMeta,
    ) -> Option<String> {
        let vector = match self.embedder.embed(index_text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(item = name, error = %e, "embedding failed, item kept without vector");
                return None;
            }
        };
        let mut record_meta = serde_json::Map::new();
        record_meta.insert("title".to_string(), Value::String(name.to_string()));
        if let Ok(kind) = serde_json::to_value(metadata.kind) {
            record_meta.insert("type".to_string(), kind);
        }
        if let Some(source) = &metadata.source {
            record_meta.insert("source".to_string(), Value::String(source.clone()));
        }
        match self
            .store
            .insert(KNOWLEDGE_COLLECTION, content, vector, record_meta)
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(item = name, error = %e, "store insert failed, item kept without vector");
                None
            }
        }
    }

    fn add_item(
        &self,
        name: &str,
        content: &str,
        vector_ref: Option<String>,
        metadata: KnowledgeMeta,
        report: &mut ImportReport,
    ) {
        if vector_ref.is_some() {
            report.chunks_added += 1;
        } else {
            report.chunks_failed += 1;
        }
        let mut items = self.items.write().unwrap();
        items.insert(
            name.to_string(),
            KnowledgeItem {
                name: name.to_string(),
                content: content.to_string(),
                vector_ref,
                metadata,
            },
        );
    }

    /// Pick a name not yet taken, appending a counter when needed.
    fn unique_name(&self, base: &str) -> String {
        let items = self.items.read().unwrap();
        if !items.contains_key(base) {
            return base.to_string();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}_{n}");
            if !items.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Search the index.
    ///
    /// The query is expanded into variants (the original, templated
    /// prefix/suffix rewrites, extracted keywords); each variant is
    /// searched at a relaxed similarity floor; hits are merged with
    /// first-occurrence-wins deduplication by exact content, sorted by
    /// score, and truncated to `top_k`. Falls back to a lexical keyword
    /// match when the embedding backend is unreachable.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<KnowledgeHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let variants = self.query_variants(query);
        debug!(count = variants.len(), "searching query variants");

        let mut merged: Vec<(Record, f32)> = Vec::new();
        let mut seen: HashSet<[u8; 32]> = HashSet::new();

        for variant in &variants {
            let vector = match self.embedder.embed(variant).await {
                Ok(v) => v,
                Err(Error::ModelUnavailable(reason)) => {
                    warn!(%reason, "embedding unavailable, using lexical fallback");
                    return Ok(self.lexical_search(query, top_k));
                }
                Err(e) => {
                    warn!(error = %e, "embedding failed, using lexical fallback");
                    return Ok(self.lexical_search(query, top_k));
                }
            };

            let hits = self.store.search(
                KNOWLEDGE_COLLECTION,
                &vector,
                self.config.variant_top_k,
                self.config.variant_min_similarity,
            );
            for hit in hits {
                let digest: [u8; 32] = Sha256::digest(hit.record.text.as_bytes()).into();
                if seen.insert(digest) {
                    merged.push((hit.record, hit.score));
                }
            }
        }

        merged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        merged.truncate(top_k);

        let items = self.items.read().unwrap();
        let by_ref: HashMap<&str, &KnowledgeItem> = items
            .values()
            .filter_map(|item| item.vector_ref.as_deref().map(|id| (id, item)))
            .collect();

        let hits = merged
            .into_iter()
            .map(|(record, score)| {
                let item = by_ref
                    .get(record.id.as_str())
                    .map(|item| (*item).clone())
                    .unwrap_or_else(|| orphan_item(&record));
                KnowledgeHit { item, score }
            })
            .collect();
        Ok(hits)
    }

    /// Keyword match over stored content, used when embeddings are
    /// unavailable. Scores favor frequent and early occurrences.
    fn lexical_search(&self, query: &str, top_k: usize) -> Vec<KnowledgeHit> {
        let keywords = extract_keywords(query, 16);
        if keywords.is_empty() {
            return Vec::new();
        }
        let items = self.items.read().unwrap();
        let mut hits: Vec<KnowledgeHit> = items
            .values()
            .filter_map(|item| {
                let score = lexical_score(&item.content, &keywords);
                if score > 0.0 {
                    Some(KnowledgeHit {
                        item: item.clone(),
                        score: score as f32,
                    })
                } else {
                    None
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        hits
    }

    fn query_variants(&self, query: &str) -> Vec<String> {
        let mut variants = vec![query.to_string()];
        for prefix in &self.config.variant_prefixes {
            if !query.starts_with(prefix.trim_end()) {
                variants.push(format!("{prefix}{query}"));
            }
        }
        for suffix in &self.config.variant_suffixes {
            if !query.ends_with(suffix.trim_start()) {
                variants.push(format!("{query}{suffix}"));
            }
        }
        for keyword in extract_keywords(query, self.config.keyword_count) {
            if keyword != query {
                variants.push(keyword);
            }
        }
        variants
    }

    /// Embed items that are missing their vector. Safe to re-run; a pass
    /// over an unchanged index is a no-op returning 0.
    pub async fn ensure_vectors(&self) -> Result<usize> {
        let pending: Vec<(String, String, KnowledgeMeta)> = {
            let items = self.items.read().unwrap();
            items
                .values()
                .filter(|item| item.vector_ref.is_none())
                .filter_map(|item| {
                    let content = if !item.content.is_empty() {
                        Some(item.content.clone())
                    } else {
                        item.metadata.answer.clone()
                    };
                    content.map(|c| (item.name.clone(), c, item.metadata.clone()))
                })
                .collect()
        };

        let mut backfilled = 0;
        for (name, content, metadata) in pending {
            let index_text = match (&metadata.question, metadata.kind) {
                (Some(question), KnowledgeKind::QaGroup) => question.clone(),
                _ => content.clone(),
            };
            if let Some(id) = self
                .embed_and_insert(&name, &index_text, &content, &metadata)
                .await
            {
                let mut items = self.items.write().unwrap();
                match items.get_mut(&name) {
                    Some(item) if item.vector_ref.is_none() => {
                        item.vector_ref = Some(id);
                        backfilled += 1;
                    }
                    // Item vanished or got a vector meanwhile; drop the
                    // orphan record to keep references consistent.
                    _ => {
                        self.store.delete(KNOWLEDGE_COLLECTION, &id);
                    }
                }
            }
        }

        if backfilled > 0 {
            self.save()?;
            self.store.flush()?;
            info!(backfilled, "knowledge vectors backfilled");
        }
        Ok(backfilled)
    }

    /// Remove an item and, when present, its record. Returns false when
    /// the item does not exist.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let removed = {
            let mut items = self.items.write().unwrap();
            items.remove(name)
        };
        let Some(item) = removed else {
            return Ok(false);
        };
        if let Some(vector_ref) = &item.vector_ref {
            self.store.delete(KNOWLEDGE_COLLECTION, vector_ref);
        }
        self.save()?;
        Ok(true)
    }

    pub fn get(&self, name: &str) -> Option<KnowledgeItem> {
        self.items.read().unwrap().get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.items.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().unwrap().is_empty()
    }

    /// Concatenate the best-matching passages for a query, at most
    /// `max_context_items` of them, for use as answer context. Contexts
    /// use the stricter `min_similarity` floor, not the relaxed recall
    /// floor search runs on. Empty when nothing relevant is stored; that
    /// is a normal result.
    pub async fn build_context(&self, query: &str) -> Result<String> {
        let mut hits = self.search(query, self.config.max_context_items).await?;
        hits.retain(|hit| hit.score >= self.config.min_similarity);
        let mut context = String::new();
        for hit in &hits {
            context.push_str(&format!("--- {} ---\n{}\n\n", hit.item.name, hit.item.content));
        }
        Ok(context.trim_end().to_string())
    }

    /// Answer a question strictly from indexed content, or state that no
    /// answer exists. Generation failures surface to the caller.
    pub async fn answer_question(
        &self,
        question: &str,
        generator: &dyn GenerationPort,
        timeout: Duration,
    ) -> Result<String> {
        let context = self.build_context(question).await?;
        if context.is_empty() {
            return Ok(NO_ANSWER_REPLY.to_string());
        }
        let prompt = knowledge_prompt(&context, question);
        let answer = generator.generate(&prompt, timeout).await?;
        Ok(answer.trim().to_string())
    }
}

/// Build the strict answer-only-from-context prompt.
pub fn knowledge_prompt(context: &str, question: &str) -> String {
    format!(
        "Answer the question using only the provided content. Do not add \
         information that is not in the content, do not speculate, and do \
         not extend the answer beyond it. If the content cannot answer the \
         question, reply exactly: \"{NO_ANSWER_REPLY}\"\n\n\
         Content:\n{context}\n\nQuestion: {question}\n\nAnswer:"
    )
}

/// Wrap a record with no owning item so search can still return it.
fn orphan_item(record: &Record) -> KnowledgeItem {
    let name = record
        .metadata
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or(&record.id)
        .to_string();
    KnowledgeItem {
        name,
        content: record.text.clone(),
        vector_ref: Some(record.id.clone()),
        metadata: KnowledgeMeta::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledEmbedder;
    use async_trait::async_trait;

    /// Deterministic letter-frequency embedding: texts sharing words get
    /// similar vectors, which is enough to exercise ranking.
    struct BagOfLetters;

    #[async_trait]
    impl EmbeddingPort for BagOfLetters {
        fn model_name(&self) -> &str {
            "bag-of-letters"
        }
        fn dims(&self) -> usize {
            26
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>, Error> {
            let mut v = vec![0.0f32; 26];
            for c in text.chars().flat_map(|c| c.to_lowercase()) {
                if c.is_ascii_lowercase() {
                    v[(c as u8 - b'a') as usize] += 1.0;
                }
            }
            Ok(v)
        }
    }

    fn index_in(dir: &tempfile::TempDir, embedder: Arc<dyn EmbeddingPort>) -> KnowledgeIndex {
        let store = Arc::new(VectorStore::open(dir.path().join("vectors.json")).unwrap());
        let config = KnowledgeConfig {
            items_path: dir.path().join("items.json"),
            ..Default::default()
        };
        KnowledgeIndex::open(store, embedder, config).unwrap()
    }

    #[tokio::test]
    async fn qa_import_takes_priority_over_chunking() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(&dir, Arc::new(BagOfLetters));

        let text = "Question: what is neck?\nAnswer: the first growth stage.\n\n\
                    Question: what is crown?\nAnswer: the widening stage.";
        let report = index.import_text(text, "guide.txt").await.unwrap();
        assert_eq!(report.chunks_added, 2);
        assert_eq!(report.chunks_failed, 0);

        let item = index.get("guide.txt_qa_1").unwrap();
        assert_eq!(item.metadata.kind, KnowledgeKind::QaGroup);
        assert!(item.content.contains("what is neck?"));
        assert!(item.vector_ref.is_some());
    }

    #[tokio::test]
    async fn plain_text_falls_back_to_chunking() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(&dir, Arc::new(BagOfLetters));

        let report = index
            .import_text("Just prose.\n\nMore prose here.", "notes.md")
            .await
            .unwrap();
        assert_eq!(report.chunks_added, 1);
        let item = index.get("notes.md_chunk_1").unwrap();
        assert_eq!(item.metadata.kind, KnowledgeKind::DocumentChunk);
    }

    #[tokio::test]
    async fn embedding_failure_keeps_item_without_vector() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(&dir, Arc::new(DisabledEmbedder));

        let report = index.import_text("Some prose.", "doc").await.unwrap();
        assert_eq!(report.chunks_added, 0);
        assert_eq!(report.chunks_failed, 1);
        assert!(index.get("doc_chunk_1").unwrap().vector_ref.is_none());
    }

    #[tokio::test]
    async fn search_finds_imported_content() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(&dir, Arc::new(BagOfLetters));
        index
            .import_text("the quick brown fox jumps", "a")
            .await
            .unwrap();
        index
            .import_text("zzz completely unrelated zzz", "b")
            .await
            .unwrap();

        let hits = index.search("quick brown fox", 5).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].item.content.contains("fox"));
    }

    #[tokio::test]
    async fn search_deduplicates_across_variants() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(&dir, Arc::new(BagOfLetters));
        index.import_text("alpha beta gamma", "a").await.unwrap();

        let hits = index.search("alpha beta gamma", 10).await.unwrap();
        // Several variants hit the same item; it must appear once.
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn search_degrades_to_lexical_when_embeddings_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(&dir, Arc::new(DisabledEmbedder));
        index
            .import_text("rust ownership and borrowing", "doc")
            .await
            .unwrap();

        let hits = index.search("ownership rules", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].item.content.contains("ownership"));
    }

    #[tokio::test]
    async fn searching_empty_index_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(&dir, Arc::new(BagOfLetters));
        assert!(index.search("anything", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ensure_vectors_is_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        // Import with embeddings down, then bring them up.
        {
            let index = index_in(&dir, Arc::new(DisabledEmbedder));
            index.import_text("first passage", "a").await.unwrap();
            index.import_text("second passage", "b").await.unwrap();
        }
        let index = index_in(&dir, Arc::new(BagOfLetters));
        assert_eq!(index.ensure_vectors().await.unwrap(), 2);
        assert_eq!(index.ensure_vectors().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_removes_item_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(&dir, Arc::new(BagOfLetters));
        index.import_text("to be deleted", "doc").await.unwrap();

        let vector_ref = index.get("doc_chunk_1").unwrap().vector_ref.unwrap();
        assert!(index.delete("doc_chunk_1").unwrap());
        assert!(index.get("doc_chunk_1").is_none());
        assert!(index.store.get(KNOWLEDGE_COLLECTION, &vector_ref).is_none());
        assert!(!index.delete("doc_chunk_1").unwrap());
    }

    #[tokio::test]
    async fn items_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = index_in(&dir, Arc::new(BagOfLetters));
            index.import_text("persistent passage", "doc").await.unwrap();
        }
        let index = index_in(&dir, Arc::new(BagOfLetters));
        assert_eq!(index.len(), 1);
        assert!(index.get("doc_chunk_1").unwrap().vector_ref.is_some());
    }

    #[tokio::test]
    async fn build_context_concatenates_at_most_three() {
        let dir = tempfile::tempdir().unwrap();
        let index = index_in(&dir, Arc::new(BagOfLetters));
        for i in 0..5 {
            index
                .import_text(&format!("shared words plus unique{i}"), &format!("s{i}"))
                .await
                .unwrap();
        }
        let context = index.build_context("shared words plus").await.unwrap();
        let separators = context.matches("--- ").count();
        assert!(separators >= 1 && separators <= 3);
    }

    #[test]
    fn prompt_requires_context_only_answers() {
        let prompt = knowledge_prompt("some context", "a question");
        assert!(prompt.contains("some context"));
        assert!(prompt.contains(NO_ANSWER_REPLY));
    }
}
