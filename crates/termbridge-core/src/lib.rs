//! # Termbridge Core
//!
//! Shared, I/O-free logic for Termbridge: data models, the error taxonomy,
//! cosine similarity, paragraph chunking, QA-block parsing, keyword
//! extraction, and placeholder protection for terminology-safe translation.
//!
//! This crate contains no tokio, no filesystem access, and no network
//! dependencies. Everything here is deterministic and unit-testable in
//! isolation; the stores and the translation pipeline live in the
//! `termbridge` crate.

pub mod chunk;
pub mod error;
pub mod keywords;
pub mod models;
pub mod placeholder;
pub mod qa;
pub mod similarity;

pub use error::Error;
pub use models::{
    ImportReport, KnowledgeItem, KnowledgeKind, KnowledgeMeta, Record, SearchHit, TermEntry,
    TermMatch,
};
pub use placeholder::{PlaceholderMap, QualityIssue};
