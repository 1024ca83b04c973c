//! Semantic search infrastructure for library embeddings.
//!
//! This module provides local semantic search capabilities using fastembed-rs
//! for generating embeddings and an in-memory matrix for similarity search.
//!
//! # Architecture
//!
//! - `device`: Compute device resolution with one-way CPU fallback
//! - `embeddings`: Wraps fastembed behind a memoized model provider
//! - `cache`: In-memory embedding matrix, staleness rule and rebuild
//! - `storage`: Binary vectors.bin + manifest.json persistence
//! - `service`: High-level semantic search engine

pub mod cache;
pub mod device;
pub mod embeddings;
pub mod service;
pub mod storage;

pub use device::DevicePreference;
pub use embeddings::ModelProvider;
pub use service::{CacheStatus, SearchHit, SemanticSearchEngine, SemanticSearchError};
pub use storage::CacheStore;

/// Default embedding model name
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";
