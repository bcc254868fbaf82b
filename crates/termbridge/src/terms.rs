//! Bidirectional terminology dictionary.
//!
//! Entries map a source-language term to an ordered list of accepted
//! target-language renderings (first entry wins). Matching scans entries
//! longest-term first so a short term never shadows a longer one that
//! contains it. The reverse direction (target language back to source) is
//! derived, not stored: a lazily built cache keyed on the first-listed
//! rendering, invalidated by any mutation.
//!
//! Persistence follows the same discipline as the vector store: atomic
//! replace with a `.bak` sibling, and recovery from the backup when the
//! main file fails to parse.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use termbridge_core::{Error, TermEntry, TermMatch};

use crate::config::TermsConfig;
use crate::embedding::EmbeddingPort;
use crate::persist::{backup_path, quarantine, write_json_atomic};
use crate::store::VectorStore;

/// Collection holding term embeddings, kept apart from knowledge
/// passages so fuzzy term lookup never surfaces document chunks.
pub const TERMS_COLLECTION: &str = "terms";

/// Persisted shape of one dictionary entry.
#[derive(Serialize, Deserialize)]
struct StoredTerm {
    /// Comma-separated renderings, first one preferred.
    target_term: String,
    /// Kept equal to `target_term` for older readers.
    definition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    vector_id: Option<String>,
    #[serde(default)]
    metadata: StoredTermMeta,
}

#[derive(Serialize, Deserialize, Default)]
struct StoredTermMeta {
    #[serde(default)]
    source_lang: Option<String>,
    #[serde(default)]
    target_lang: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    added_time: Option<DateTime<Utc>>,
}

/// One row of the derived reverse index.
struct ReverseRow {
    /// First-listed rendering, lowercased for matching.
    primary_lower: String,
    /// The entry's source term, which becomes the replacement.
    source_term: String,
    source_lang: String,
    target_lang: String,
}

/// Terminology table with forward and derived reverse lookup, plus
/// vector-backed fuzzy search over its own collection.
pub struct TermDictionary {
    store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingPort>,
    config: TermsConfig,
    path: PathBuf,
    entries: RwLock<HashMap<String, TermEntry>>,
    reverse: RwLock<Option<Arc<Vec<ReverseRow>>>>,
}

impl TermDictionary {
    /// Open the dictionary, loading persisted terms. A missing file is an
    /// empty dictionary; a corrupt one recovers from its `.bak` sibling
    /// before giving up and starting empty.
    pub fn open(
        store: Arc<VectorStore>,
        embedder: Arc<dyn EmbeddingPort>,
        config: TermsConfig,
    ) -> Result<Self> {
        let path = config.path.clone();
        let dictionary = Self {
            store,
            embedder,
            config,
            path,
            entries: RwLock::new(HashMap::new()),
            reverse: RwLock::new(None),
        };
        dictionary.load()?;
        Ok(dictionary)
    }

    fn load(&self) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        entries.clear();
        *self.reverse.write().unwrap() = None;

        if !self.path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        let stored: HashMap<String, StoredTerm> = match serde_json::from_str(&content) {
            Ok(parsed) => parsed,
            Err(main_err) => {
                let bak = backup_path(&self.path);
                let recovered = std::fs::read_to_string(&bak)
                    .ok()
                    .and_then(|backup| serde_json::from_str(&backup).ok());
                match recovered {
                    Some(parsed) => {
                        warn!(
                            path = %self.path.display(),
                            error = %main_err,
                            "terms file unreadable, recovered from backup"
                        );
                        let _ = std::fs::copy(&bak, &self.path);
                        parsed
                    }
                    None => {
                        let moved = quarantine(&self.path)?;
                        warn!(
                            path = %self.path.display(),
                            quarantined = %moved.display(),
                            error = %main_err,
                            "terms file unreadable and no usable backup, starting empty"
                        );
                        return Ok(());
                    }
                }
            }
        };

        for (source_term, term) in stored {
            let targets = parse_targets(&term.target_term);
            if targets.is_empty() {
                warn!(term = %source_term, "dropping stored term without renderings");
                continue;
            }
            entries.insert(
                source_term.clone(),
                TermEntry {
                    id: term
                        .metadata
                        .id
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                    source_term,
                    target_terms: targets,
                    source_lang: term.metadata.source_lang.unwrap_or_else(|| "zh".to_string()),
                    target_lang: term.metadata.target_lang.unwrap_or_else(|| "en".to_string()),
                    vector_ref: term.vector_id,
                    added_time: term.metadata.added_time.unwrap_or_else(Utc::now),
                },
            );
        }
        info!(count = entries.len(), "terms loaded");
        Ok(())
    }

    /// Persist all entries with an atomic replace and `.bak` backup.
    pub fn save(&self) -> Result<()> {
        let entries = self.entries.read().unwrap();
        let mut map = serde_json::Map::new();
        for (source_term, entry) in entries.iter() {
            let joined = entry.target_terms.join(", ");
            let stored = StoredTerm {
                target_term: joined.clone(),
                definition: joined,
                vector_id: entry.vector_ref.clone(),
                metadata: StoredTermMeta {
                    source_lang: Some(entry.source_lang.clone()),
                    target_lang: Some(entry.target_lang.clone()),
                    id: Some(entry.id.clone()),
                    added_time: Some(entry.added_time),
                },
            };
            map.insert(source_term.clone(), serde_json::to_value(stored)?);
        }
        write_json_atomic(&self.path, &Value::Object(map))
            .with_context(|| "failed to save terms")
    }

    /// Add a term. Rejects an empty source term or an empty rendering
    /// list. Replaces any existing entry for the same source term.
    /// Returns the entry id.
    pub async fn add_term(
        &self,
        source: &str,
        targets: Vec<String>,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String> {
        let source = source.trim();
        let targets: Vec<String> = targets
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if source.is_empty() {
            anyhow::bail!("source term must not be empty");
        }
        if targets.is_empty() {
            anyhow::bail!("term '{source}' needs at least one target rendering");
        }

        let id = Uuid::new_v4().to_string();
        let mut entry = TermEntry {
            id: id.clone(),
            source_term: source.to_string(),
            target_terms: targets,
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
            vector_ref: None,
            added_time: Utc::now(),
        };

        entry.vector_ref = self.embed_term(&entry).await;

        {
            let mut entries = self.entries.write().unwrap();
            if let Some(old) = entries.insert(source.to_string(), entry) {
                if let Some(old_ref) = old.vector_ref {
                    self.store.delete(TERMS_COLLECTION, &old_ref);
                }
            }
        }
        self.invalidate_reverse();
        self.save()?;
        Ok(id)
    }

    async fn embed_term(&self, entry: &TermEntry) -> Option<String> {
        let vector = match self.embedder.embed(&entry.source_term).await {
            Ok(v) => v,
            Err(e) => {
                debug!(term = %entry.source_term, error = %e, "term left unvectorized");
                return None;
            }
        };
        let mut metadata = serde_json::Map::new();
        metadata.insert("type".to_string(), Value::String("term".to_string()));
        metadata.insert("term_id".to_string(), Value::String(entry.id.clone()));
        metadata.insert(
            "source_lang".to_string(),
            Value::String(entry.source_lang.clone()),
        );
        metadata.insert(
            "target_lang".to_string(),
            Value::String(entry.target_lang.clone()),
        );
        match self
            .store
            .insert(TERMS_COLLECTION, &entry.source_term, vector, metadata)
        {
            Ok(record_id) => Some(record_id),
            Err(e) => {
                warn!(term = %entry.source_term, error = %e, "term vector insert failed");
                None
            }
        }
    }

    /// Remove a term. Returns false when it does not exist.
    pub fn delete_term(&self, source: &str) -> Result<bool> {
        let removed = {
            let mut entries = self.entries.write().unwrap();
            entries.remove(source)
        };
        let Some(entry) = removed else {
            return Ok(false);
        };
        if let Some(vector_ref) = &entry.vector_ref {
            self.store.delete(TERMS_COLLECTION, vector_ref);
        }
        self.invalidate_reverse();
        self.save()?;
        Ok(true)
    }

    pub fn get(&self, source: &str) -> Option<TermEntry> {
        self.entries.read().unwrap().get(source).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Find every dictionary hit in `text` for the given direction.
    ///
    /// The direction is selected per entry: entries stored as
    /// `(source_lang, target_lang)` match forward on their source term;
    /// entries stored with the pair swapped match in reverse on their
    /// first-listed rendering, case-insensitively and preferring word
    /// boundaries. Matches come back longest span first, deduplicated.
    pub fn find_matches(&self, text: &str, source_lang: &str, target_lang: &str) -> Vec<TermMatch> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut matches: Vec<TermMatch> = Vec::new();
        let mut seen_spans: Vec<String> = Vec::new();

        // Forward: the stored source term appears in the text.
        {
            let entries = self.entries.read().unwrap();
            let mut forward: Vec<&TermEntry> = entries
                .values()
                .filter(|e| e.source_lang == source_lang && e.target_lang == target_lang)
                .collect();
            forward.sort_by(|a, b| {
                b.source_term
                    .chars()
                    .count()
                    .cmp(&a.source_term.chars().count())
            });

            for entry in forward {
                let Some(span) = find_span(text, &entry.source_term, false) else {
                    continue;
                };
                push_match(
                    &mut matches,
                    &mut seen_spans,
                    span,
                    entry.primary_target().to_string(),
                    entry.target_terms.clone(),
                );
            }
        }

        // Reverse: the first-listed rendering appears in the text and the
        // stored language pair is the query pair swapped.
        let reverse = self.reverse_rows();
        let mut reverse_rows: Vec<&ReverseRow> = reverse
            .iter()
            .filter(|r| r.source_lang == target_lang && r.target_lang == source_lang)
            .collect();
        reverse_rows.sort_by(|a, b| {
            b.primary_lower
                .chars()
                .count()
                .cmp(&a.primary_lower.chars().count())
        });

        for row in reverse_rows {
            let Some(span) = find_span(text, &row.primary_lower, true) else {
                continue;
            };
            push_match(
                &mut matches,
                &mut seen_spans,
                span,
                row.source_term.clone(),
                vec![row.source_term.clone()],
            );
        }

        matches.sort_by(|a, b| {
            b.source_span
                .chars()
                .count()
                .cmp(&a.source_span.chars().count())
        });
        matches
    }

    /// Vector-backed fuzzy lookup over the dictionary's own collection,
    /// topped up with plain text matches and degrading to text matching
    /// alone when embeddings are unavailable.
    pub async fn search_fuzzy(&self, query: &str, top_k: usize) -> Result<Vec<TermEntry>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut found: Vec<TermEntry> = Vec::new();

        match self.embedder.embed(query).await {
            Ok(vector) => {
                let hits = self.store.search(
                    TERMS_COLLECTION,
                    &vector,
                    self.config.fuzzy_top_k.min(top_k.max(1)),
                    self.config.fuzzy_min_similarity,
                );
                let entries = self.entries.read().unwrap();
                let by_ref: HashMap<&str, &TermEntry> = entries
                    .values()
                    .filter_map(|e| e.vector_ref.as_deref().map(|id| (id, e)))
                    .collect();
                for hit in hits {
                    if let Some(entry) = by_ref.get(hit.record.id.as_str()) {
                        found.push((*entry).clone());
                    }
                }
            }
            Err(Error::ModelUnavailable(reason)) => {
                debug!(%reason, "fuzzy term search falling back to text matching");
            }
            Err(e) => {
                debug!(error = %e, "fuzzy term search falling back to text matching");
            }
        }

        if found.len() < top_k {
            for entry in self.text_search(query) {
                if found.len() >= top_k {
                    break;
                }
                if !found.iter().any(|f| f.source_term == entry.source_term) {
                    found.push(entry);
                }
            }
        }

        found.truncate(top_k);
        Ok(found)
    }

    /// Case-insensitive substring match over source terms and renderings.
    fn text_search(&self, query: &str) -> Vec<TermEntry> {
        let query = query.to_lowercase();
        let entries = self.entries.read().unwrap();
        let mut hits: Vec<TermEntry> = entries
            .values()
            .filter(|entry| {
                entry.source_term.to_lowercase().contains(&query)
                    || entry
                        .target_terms
                        .iter()
                        .any(|t| t.to_lowercase().contains(&query))
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.source_term.cmp(&b.source_term));
        hits
    }

    /// Embed terms missing their vector. Re-entrant; returns the number
    /// backfilled, 0 when nothing was pending.
    pub async fn ensure_vectors(&self) -> Result<usize> {
        let pending: Vec<TermEntry> = {
            let entries = self.entries.read().unwrap();
            entries
                .values()
                .filter(|e| e.vector_ref.is_none())
                .cloned()
                .collect()
        };

        let mut backfilled = 0;
        for entry in pending {
            if let Some(record_id) = self.embed_term(&entry).await {
                let mut entries = self.entries.write().unwrap();
                match entries.get_mut(&entry.source_term) {
                    Some(live) if live.vector_ref.is_none() => {
                        live.vector_ref = Some(record_id);
                        backfilled += 1;
                    }
                    _ => {
                        self.store.delete(TERMS_COLLECTION, &record_id);
                    }
                }
            }
        }

        if backfilled > 0 {
            self.save()?;
            self.store.flush()?;
            info!(backfilled, "term vectors backfilled");
        }
        Ok(backfilled)
    }

    /// Import a term table: a JSON object of `source -> "rendering, ..."`
    /// pairs, or comma/tab separated lines. Returns (added, failed).
    pub async fn import_table(
        &self,
        content: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<(usize, usize)> {
        let mut pairs: Vec<(String, String)> = Vec::new();

        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(content) {
            for (source, rendering) in map {
                if let Value::String(rendering) = rendering {
                    pairs.push((source, rendering));
                }
            }
        } else {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let separator = if line.contains('\t') { '\t' } else { ',' };
                if let Some((source, rendering)) = line.split_once(separator) {
                    pairs.push((source.trim().to_string(), rendering.trim().to_string()));
                }
            }
        }

        let mut added = 0;
        let mut failed = 0;
        for (source, rendering) in pairs {
            match self
                .add_term(&source, parse_targets(&rendering), source_lang, target_lang)
                .await
            {
                Ok(_) => added += 1,
                Err(e) => {
                    warn!(term = %source, error = %e, "term import failed");
                    failed += 1;
                }
            }
        }
        info!(added, failed, "term table imported");
        Ok((added, failed))
    }

    fn invalidate_reverse(&self) {
        *self.reverse.write().unwrap() = None;
    }

    /// The derived reverse index, built on first use after any mutation.
    fn reverse_rows(&self) -> Arc<Vec<ReverseRow>> {
        if let Some(rows) = self.reverse.read().unwrap().as_ref() {
            return Arc::clone(rows);
        }
        let rows: Vec<ReverseRow> = {
            let entries = self.entries.read().unwrap();
            entries
                .values()
                .filter_map(|entry| {
                    let primary = entry.primary_target();
                    if primary.is_empty() {
                        return None;
                    }
                    Some(ReverseRow {
                        primary_lower: primary.to_lowercase(),
                        source_term: entry.source_term.clone(),
                        source_lang: entry.source_lang.clone(),
                        target_lang: entry.target_lang.clone(),
                    })
                })
                .collect()
        };
        let rows = Arc::new(rows);
        let mut cache = self.reverse.write().unwrap();
        // A concurrent builder may have won; keep whichever is in place.
        if cache.is_none() {
            *cache = Some(Arc::clone(&rows));
        }
        debug!(rows = rows.len(), "reverse term index built");
        rows
    }
}

/// Split a comma-separated rendering list, preserving order.
pub fn parse_targets(rendering: &str) -> Vec<String> {
    rendering
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn push_match(
    matches: &mut Vec<TermMatch>,
    seen_spans: &mut Vec<String>,
    span: String,
    chosen_target: String,
    all_targets: Vec<String>,
) {
    let key = span.to_lowercase();
    if seen_spans.contains(&key) {
        return;
    }
    seen_spans.push(key);
    matches.push(TermMatch {
        source_span: span,
        chosen_target,
        all_targets,
    });
}

/// Locate `needle` in `text` and return the span as it actually appears.
///
/// Case-insensitive. When `prefer_word_boundary` is set, an occurrence
/// bounded by non-alphanumeric characters wins; a plain substring
/// occurrence is accepted only if no bounded one exists.
fn find_span(text: &str, needle: &str, prefer_word_boundary: bool) -> Option<String> {
    if needle.is_empty() {
        return None;
    }
    let text_lower = text.to_lowercase();
    let needle_lower = needle.to_lowercase();

    let mut fallback: Option<(usize, usize)> = None;
    let mut search_from = 0;
    while let Some(offset) = text_lower[search_from..].find(&needle_lower) {
        let start = search_from + offset;
        let end = start + needle_lower.len();
        if !prefer_word_boundary || bounded(&text_lower, start, end) {
            return slice_original(text, &text_lower, start, end);
        }
        if fallback.is_none() {
            fallback = Some((start, end));
        }
        search_from = end;
    }

    fallback.and_then(|(start, end)| slice_original(text, &text_lower, start, end))
}

/// Map byte offsets found in the lowercased text back onto the original.
/// Lowercasing can change byte lengths (rarely), so fall back gracefully.
fn slice_original(text: &str, text_lower: &str, start: usize, end: usize) -> Option<String> {
    if text.len() == text_lower.len() && text.is_char_boundary(start) && text.is_char_boundary(end)
    {
        Some(text[start..end].to_string())
    } else {
        Some(text_lower[start..end].to_string())
    }
}

fn bounded(text: &str, start: usize, end: usize) -> bool {
    let before_ok = text[..start]
        .chars()
        .next_back()
        .map(|c| !c.is_alphanumeric())
        .unwrap_or(true);
    let after_ok = text[end..]
        .chars()
        .next()
        .map(|c| !c.is_alphanumeric())
        .unwrap_or(true);
    before_ok && after_ok
}
