//! # Termbridge
//!
//! **An embedded retrieval and terminology-protected translation
//! pipeline.**
//!
//! Termbridge stores (text, vector, metadata) records in named
//! collections, builds a knowledge index and a bidirectional terminology
//! dictionary on top of them, and wraps an opaque generation model in a
//! guard that keeps dictionary terms intact through translation.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     ┌────────────────┐
//! │ KnowledgeIndex │     │ TermDictionary │──▶┌──────────────────┐
//! └───────┬────────┘     └───────┬────────┘   │ TranslationGuard │
//!         │                      │            └────────┬─────────┘
//!         ▼                      ▼                     │
//!     ┌───────────────────────────────┐                ▼
//!     │          VectorStore          │         ┌──────────────┐
//!     │  collections + JSON on disk   │         │ GenerationPort│
//!     └───────────────┬───────────────┘         └──────────────┘
//!                     ▼
//!              ┌──────────────┐
//!              │ EmbeddingPort │
//!              └──────────────┘
//! ```
//!
//! ## Data flow
//!
//! 1. Text enters through [`knowledge::KnowledgeIndex::import_text`]: QA
//!    blocks are recognized first, everything else goes through the
//!    paragraph chunker; each item is embedded and stored, and embedding
//!    failures are backfilled later by `ensure_vectors`.
//! 2. Queries are expanded into variants, searched against the
//!    [`store::VectorStore`] at a relaxed floor, deduplicated, and
//!    reranked; with no embedding backend the index answers from a
//!    lexical keyword match.
//! 3. [`terms::TermDictionary`] resolves terminology in both directions;
//!    the reverse direction is derived lazily from the forward entries.
//! 4. [`translate::TranslationGuard`] protects matched terms behind
//!    `[T1]`-style placeholders, calls the generation model, restores
//!    drifted tokens, validates, and repairs once before surfacing any
//!    remaining issues.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with per-component structs and validation |
//! | [`store`] | Named vector collections, cosine search, self-healing JSON persistence |
//! | [`knowledge`] | Import, variant-expanded retrieval, backfill, answer prompts |
//! | [`terms`] | Bidirectional terminology table with fuzzy lookup |
//! | [`translate`] | Placeholder-protected translation with validate/repair |
//! | [`embedding`] | `EmbeddingPort` trait and HTTP providers |
//! | [`generation`] | `GenerationPort` trait and HTTP providers |
//! | [`persist`] | Atomic JSON writes, backups, quarantine |
//!
//! The pure algorithms (chunking, QA parsing, similarity, placeholder
//! handling) live in the `termbridge-core` crate.

pub mod config;
pub mod embedding;
pub mod generation;
pub mod knowledge;
pub mod persist;
pub mod store;
pub mod terms;
pub mod translate;

pub use config::{load_config, Config};
pub use embedding::{create_embedder, EmbeddingPort};
pub use generation::{create_generator, GenerationPort};
pub use knowledge::{KnowledgeHit, KnowledgeIndex};
pub use store::VectorStore;
pub use terms::TermDictionary;
pub use translate::{Translation, TranslationGuard};

pub use termbridge_core as core;
pub use termbridge_core::{Error, ImportReport, KnowledgeItem, QualityIssue, TermEntry, TermMatch};
