//! Embedded vector store: named collections of (text, vector, metadata)
//! records with brute-force cosine search and JSON persistence.
//!
//! Collections are partitions with one fixed dimensionality each, set by
//! the first successful insert. Search is a linear scan; at the scale
//! this store targets (low tens of thousands of records) that is faster
//! than maintaining an index, and the contract (scored hits, descending,
//! stable ties) leaves room to swap in an approximate index later.
//!
//! Loading is self-healing: a missing file is an empty store, a corrupt
//! file is quarantined and logged rather than propagated, misaligned
//! parallel arrays are truncated to the shortest, and legacy flat record
//! maps are migrated into the collection model on first sight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use termbridge_core::similarity::cosine_similarity;
use termbridge_core::{Error, Record, SearchHit};

use crate::persist::{quarantine, write_json_atomic};

/// Name of the collection used when callers do not pick one.
pub const DEFAULT_COLLECTION: &str = "default";

#[derive(Default)]
struct Collection {
    records: Vec<Record>,
    dim: Option<usize>,
}

struct State {
    collections: HashMap<String, Collection>,
    default_collection: String,
    dirty: bool,
}

/// Durable, queryable storage of (text, vector, metadata) triples.
///
/// Interior readers-writer locking: any number of concurrent searches, or
/// one writer. [`flush`](VectorStore::flush) and
/// [`load`](VectorStore::load) take the whole store exclusively.
pub struct VectorStore {
    path: PathBuf,
    state: RwLock<State>,
}

impl VectorStore {
    /// Open the store persisted at `path`, loading existing data. A
    /// missing file is a valid empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: path.into(),
            state: RwLock::new(State {
                collections: HashMap::new(),
                default_collection: DEFAULT_COLLECTION.to_string(),
                dirty: false,
            }),
        };
        store.load()?;
        Ok(store)
    }

    /// Name of the lazily-created default collection.
    pub fn default_collection(&self) -> String {
        self.state.read().unwrap().default_collection.clone()
    }

    /// Ensure a collection exists. Idempotent.
    pub fn create_or_get_collection(&self, name: &str) {
        let mut state = self.state.write().unwrap();
        state.collections.entry(name.to_string()).or_default();
    }

    /// Insert a record, fixing the collection's dimensionality on first
    /// insert and rejecting mismatched vectors ever after. The collection
    /// is created if absent. Returns the new record's id.
    pub fn insert(
        &self,
        collection: &str,
        text: &str,
        vector: Vec<f32>,
        mut metadata: Map<String, Value>,
    ) -> Result<String, Error> {
        let mut state = self.state.write().unwrap();
        let coll = state.collections.entry(collection.to_string()).or_default();

        if let Some(dim) = coll.dim {
            if vector.len() != dim {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    actual: vector.len(),
                });
            }
        }

        let id = Uuid::new_v4().to_string();
        metadata.insert("id".to_string(), Value::String(id.clone()));

        if coll.dim.is_none() {
            coll.dim = Some(vector.len());
        }
        coll.records.push(Record {
            id: id.clone(),
            text: text.to_string(),
            vector,
            metadata,
        });
        state.dirty = true;
        Ok(id)
    }

    /// Remove a record by id. Returns false when the collection or the
    /// id does not exist; absence is not an error.
    pub fn delete(&self, collection: &str, id: &str) -> bool {
        let mut state = self.state.write().unwrap();
        let Some(coll) = state.collections.get_mut(collection) else {
            return false;
        };
        let before = coll.records.len();
        coll.records.retain(|r| r.id != id);
        let removed = coll.records.len() != before;
        if removed {
            state.dirty = true;
        }
        removed
    }

    /// Fetch a record by id.
    pub fn get(&self, collection: &str, id: &str) -> Option<Record> {
        let state = self.state.read().unwrap();
        state
            .collections
            .get(collection)?
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Number of records in a collection (0 if it does not exist).
    pub fn count(&self, collection: &str) -> usize {
        let state = self.state.read().unwrap();
        state
            .collections
            .get(collection)
            .map(|c| c.records.len())
            .unwrap_or(0)
    }

    /// Names of all collections currently held.
    pub fn collection_names(&self) -> Vec<String> {
        let state = self.state.read().unwrap();
        state.collections.keys().cloned().collect()
    }

    /// Rank records by cosine similarity to `query`.
    ///
    /// Results are sorted descending; equal scores keep insertion order.
    /// Records below `min_similarity` are excluded, so fewer than `top_k`
    /// hits is a normal outcome. An empty or unknown collection yields an
    /// empty result, never an error.
    pub fn search(
        &self,
        collection: &str,
        query: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> Vec<SearchHit> {
        let state = self.state.read().unwrap();
        let Some(coll) = state.collections.get(collection) else {
            return Vec::new();
        };

        let mut hits: Vec<SearchHit> = coll
            .records
            .iter()
            .filter_map(|record| {
                let score = cosine_similarity(query, &record.vector);
                if score >= min_similarity {
                    Some(SearchHit {
                        record: record.clone(),
                        score,
                    })
                } else {
                    None
                }
            })
            .collect();

        // Stable sort keeps insertion order between equal scores.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        hits
    }

    /// Serialize every collection to disk. Exclusive; concurrent readers
    /// wait. The write is atomic: temp file, verification re-parse, then
    /// rename, with the previous version kept as `.bak`.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();

        let mut collections = Map::new();
        for (name, coll) in &state.collections {
            let vectors: Vec<Value> = coll
                .records
                .iter()
                .map(|r| serde_json::to_value(&r.vector).unwrap_or(Value::Null))
                .collect();
            let texts: Vec<Value> = coll
                .records
                .iter()
                .map(|r| Value::String(r.text.clone()))
                .collect();
            let metadata: Vec<Value> = coll
                .records
                .iter()
                .map(|r| Value::Object(r.metadata.clone()))
                .collect();
            collections.insert(
                name.clone(),
                serde_json::json!({
                    "vectors": vectors,
                    "texts": texts,
                    "metadata": metadata,
                }),
            );
        }

        let payload = serde_json::json!({
            "collections": collections,
            "default_collection": state.default_collection,
        });

        write_json_atomic(&self.path, &payload)
            .with_context(|| format!("failed to flush vector store to {}", self.path.display()))?;
        state.dirty = false;
        debug!(path = %self.path.display(), "vector store flushed");
        Ok(())
    }

    /// Read the persisted form back in, replacing in-memory state.
    /// Exclusive. Never fails on bad content: corrupt files are
    /// quarantined and the store continues empty.
    pub fn load(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.collections.clear();
        state.default_collection = DEFAULT_COLLECTION.to_string();
        state.dirty = false;

        if !self.path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        let value: Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                let err = Error::CorruptPersistence(e.to_string());
                let moved = quarantine(&self.path)?;
                warn!(
                    path = %self.path.display(),
                    quarantined = %moved.display(),
                    error = %err,
                    "vector store file unreadable, starting empty"
                );
                return Ok(());
            }
        };

        let Value::Object(root) = value else {
            let moved = quarantine(&self.path)?;
            warn!(
                path = %self.path.display(),
                quarantined = %moved.display(),
                "vector store file is not an object, starting empty"
            );
            return Ok(());
        };

        if let Some(name) = root.get("default_collection").and_then(Value::as_str) {
            state.default_collection = name.to_string();
        }

        // Layouts this store has used over time, newest first. The first
        // strategy that yields records wins; anything but the current
        // layout marks the store dirty so the next flush rewrites it.
        let strategies: &[(&str, LoadStrategy)] = &[
            ("collections", load_collection_layout),
            ("legacy-vectors-map", load_legacy_vectors_key),
            ("legacy-flat-map", load_flat_map_layout),
        ];

        let default_name = state.default_collection.clone();
        let loaded = strategies
            .iter()
            .find_map(|(layout, strategy)| strategy(&root, &default_name).map(|c| (*layout, c)));

        if let Some((layout, collections)) = loaded {
            state.collections = collections;
            if layout != "collections" {
                let migrated: usize =
                    state.collections.values().map(|c| c.records.len()).sum();
                info!(layout, migrated, "migrated legacy records into collection model");
                state.dirty = true;
            }
        }

        Ok(())
    }

    /// True when in-memory state has changes not yet flushed.
    pub fn is_dirty(&self) -> bool {
        self.state.read().unwrap().dirty
    }
}

/// One way of reading a persisted document into collections. Returns
/// None when the document does not carry records in this layout, letting
/// the next strategy try.
type LoadStrategy = fn(&Map<String, Value>, &str) -> Option<HashMap<String, Collection>>;

/// Current layout: a "collections" object of parallel-array collections.
fn load_collection_layout(
    root: &Map<String, Value>,
    _default_name: &str,
) -> Option<HashMap<String, Collection>> {
    let collections = root.get("collections")?.as_object()?;
    let mut out = HashMap::new();
    for (name, value) in collections {
        out.insert(name.clone(), parse_collection(name, value));
    }
    if out.values().all(|c| c.records.is_empty()) {
        return None;
    }
    Some(out)
}

/// Transitional layout: a flat id -> record map under a "vectors" key.
fn load_legacy_vectors_key(
    root: &Map<String, Value>,
    default_name: &str,
) -> Option<HashMap<String, Collection>> {
    let map = root.get("vectors")?.as_object()?;
    flat_map_collections(map, default_name)
}

/// Oldest layout: the whole document is the flat id -> record map.
fn load_flat_map_layout(
    root: &Map<String, Value>,
    default_name: &str,
) -> Option<HashMap<String, Collection>> {
    if root.contains_key("collections") || root.contains_key("vectors") {
        return None;
    }
    if !looks_like_flat_map(root) {
        return None;
    }
    flat_map_collections(root, default_name)
}

fn flat_map_collections(
    map: &Map<String, Value>,
    default_name: &str,
) -> Option<HashMap<String, Collection>> {
    let mut coll = Collection::default();
    migrate_flat_map(map, &mut coll);
    if coll.records.is_empty() {
        return None;
    }
    Some(HashMap::from([(default_name.to_string(), coll)]))
}

/// Parse one persisted collection, repairing misaligned parallel arrays
/// by truncating to the shortest and skipping dimension-mismatched rows.
fn parse_collection(name: &str, value: &Value) -> Collection {
    let empty = Vec::new();
    let vectors = value
        .get("vectors")
        .and_then(Value::as_array)
        .unwrap_or(&empty);
    let texts = value
        .get("texts")
        .and_then(Value::as_array)
        .unwrap_or(&empty);
    let metadata = value.get("metadata").and_then(Value::as_array);

    let mut len = vectors.len().min(texts.len());
    if let Some(metadata) = metadata {
        len = len.min(metadata.len());
    }
    if len < vectors.len().max(texts.len()) {
        warn!(
            collection = name,
            kept = len,
            vectors = vectors.len(),
            texts = texts.len(),
            "parallel arrays misaligned, truncating to shortest"
        );
    }

    let mut coll = Collection::default();
    for i in 0..len {
        let Some(vector) = parse_vector(&vectors[i]) else {
            warn!(collection = name, index = i, "skipping unreadable vector");
            continue;
        };
        if let Some(dim) = coll.dim {
            if vector.len() != dim {
                warn!(
                    collection = name,
                    index = i,
                    expected = dim,
                    actual = vector.len(),
                    "skipping dimension-mismatched vector"
                );
                continue;
            }
        }

        let text = texts[i].as_str().unwrap_or_default().to_string();
        let mut meta = metadata
            .and_then(|m| m.get(i))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let id = meta
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        meta.insert("id".to_string(), Value::String(id.clone()));

        if coll.dim.is_none() {
            coll.dim = Some(vector.len());
        }
        coll.records.push(Record {
            id,
            text,
            vector,
            metadata: meta,
        });
    }
    coll
}

fn parse_vector(value: &Value) -> Option<Vec<f32>> {
    let array = value.as_array()?;
    Some(
        array
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect(),
    )
}

/// Heuristic for the oldest format: a bare object whose values are
/// records carrying a vector.
fn looks_like_flat_map(root: &Map<String, Value>) -> bool {
    !root.is_empty()
        && root.values().all(|v| {
            v.as_object()
                .map(|o| o.contains_key("vector"))
                .unwrap_or(false)
        })
}

fn migrate_flat_map(map: &Map<String, Value>, target: &mut Collection) -> usize {
    let mut migrated = 0;
    for (id, item) in map {
        let Some(item) = item.as_object() else {
            continue;
        };
        let Some(vector) = item.get("vector").and_then(parse_vector) else {
            continue;
        };
        if let Some(dim) = target.dim {
            if vector.len() != dim {
                continue;
            }
        }
        let text = item
            .get("text")
            .or_else(|| item.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut meta = item
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        meta.insert("id".to_string(), Value::String(id.clone()));

        if target.dim.is_none() {
            target.dim = Some(vector.len());
        }
        target.records.push(Record {
            id: id.clone(),
            text,
            vector,
            metadata: meta,
        });
        migrated += 1;
    }
    migrated
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> VectorStore {
        VectorStore::open(dir.path().join("vectors.json")).unwrap()
    }

    fn meta() -> Map<String, Value> {
        Map::new()
    }

    #[test]
    fn first_insert_fixes_dimensionality() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.insert("c", "a", vec![1.0, 0.0], meta()).unwrap();
        let err = store
            .insert("c", "b", vec![1.0, 0.0, 0.0], meta())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
        // The rejected insert must not have mutated the collection.
        assert_eq!(store.count("c"), 1);
        store.insert("c", "c", vec![0.0, 1.0], meta()).unwrap();
        assert_eq!(store.count("c"), 2);
    }

    #[test]
    fn search_is_sorted_descending() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.insert("c", "far", vec![0.1, 1.0], meta()).unwrap();
        store.insert("c", "near", vec![1.0, 0.05], meta()).unwrap();
        store.insert("c", "mid", vec![1.0, 0.5], meta()).unwrap();

        let hits = store.search("c", &[1.0, 0.0], 10, -1.0);
        assert_eq!(hits.len(), 3);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(hits[0].record.text, "near");
    }

    #[test]
    fn equal_scores_keep_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.insert("c", "first", vec![1.0, 0.0], meta()).unwrap();
        store.insert("c", "second", vec![1.0, 0.0], meta()).unwrap();
        store.insert("c", "third", vec![1.0, 0.0], meta()).unwrap();

        let hits = store.search("c", &[1.0, 0.0], 10, 0.0);
        let texts: Vec<&str> = hits.iter().map(|h| h.record.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn similarity_floor_excludes_rather_than_pads() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.insert("c", "on", vec![1.0, 0.0], meta()).unwrap();
        store.insert("c", "off", vec![0.0, 1.0], meta()).unwrap();

        let hits = store.search("c", &[1.0, 0.0], 5, 0.9);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.text, "on");
    }

    #[test]
    fn searching_empty_or_missing_collection_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.search("nope", &[1.0], 5, 0.0).is_empty());
        store.create_or_get_collection("empty");
        assert!(store.search("empty", &[1.0], 5, 0.0).is_empty());
    }

    #[test]
    fn delete_is_boolean_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let id = store.insert("c", "x", vec![1.0], meta()).unwrap();
        assert!(store.delete("c", &id));
        assert!(!store.delete("c", &id));
        assert!(!store.delete("ghost", "whatever"));
    }

    #[test]
    fn get_returns_record_with_mirrored_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let id = store.insert("c", "hello", vec![1.0], meta()).unwrap();
        let record = store.get("c", &id).unwrap();
        assert_eq!(record.text, "hello");
        assert_eq!(record.metadata["id"], Value::String(id));
    }

    #[test]
    fn flush_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");

        let store = VectorStore::open(&path).unwrap();
        store.insert("c", "alpha", vec![1.0, 0.0], meta()).unwrap();
        store.insert("c", "beta", vec![0.6, 0.8], meta()).unwrap();
        let before = store.search("c", &[1.0, 0.0], 5, -1.0);
        store.flush().unwrap();

        let reopened = VectorStore::open(&path).unwrap();
        assert_eq!(reopened.count("c"), 2);
        let after = reopened.search("c", &[1.0, 0.0], 5, -1.0);
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.record.text, a.record.text);
            assert!((b.score - a.score).abs() < 1e-6);
        }
    }

    #[test]
    fn corrupt_file_is_quarantined_and_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        std::fs::write(&path, "{{{ definitely not json").unwrap();

        let store = VectorStore::open(&path).unwrap();
        assert!(store.collection_names().is_empty());
        assert!(!path.exists());
        assert!(dir.path().join("vectors.json.corrupted").exists());
    }

    #[test]
    fn misaligned_arrays_truncate_to_shortest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        let payload = serde_json::json!({
            "collections": {
                "c": {
                    "vectors": [[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]],
                    "texts": ["one", "two"],
                    "metadata": [{}, {}, {}],
                }
            },
            "default_collection": "default",
        });
        std::fs::write(&path, payload.to_string()).unwrap();

        let store = VectorStore::open(&path).unwrap();
        assert_eq!(store.count("c"), 2);
    }

    #[test]
    fn legacy_flat_map_is_migrated_into_default_collection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        let payload = serde_json::json!({
            "v_1": {"text": "old one", "vector": [1.0, 0.0], "metadata": {}},
            "v_2": {"content": "old two", "vector": [0.0, 1.0], "metadata": {}},
        });
        std::fs::write(&path, payload.to_string()).unwrap();

        let store = VectorStore::open(&path).unwrap();
        assert_eq!(store.count(DEFAULT_COLLECTION), 2);
        assert!(store.is_dirty());
        let hits = store.search(DEFAULT_COLLECTION, &[1.0, 0.0], 5, 0.5);
        assert_eq!(hits[0].record.text, "old one");
    }

    #[test]
    fn legacy_vectors_key_fills_empty_collections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");
        let payload = serde_json::json!({
            "collections": {},
            "vectors": {
                "v_1": {"text": "carried over", "vector": [0.5, 0.5], "metadata": {}},
            },
            "default_collection": "default",
        });
        std::fs::write(&path, payload.to_string()).unwrap();

        let store = VectorStore::open(&path).unwrap();
        assert_eq!(store.count(DEFAULT_COLLECTION), 1);
        assert!(store.is_dirty());
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path().join("absent.json")).unwrap();
        assert!(store.collection_names().is_empty());
    }
}
