//! Semantic search engine over a book library.
//!
//! Provides a high-level interface for semantic search operations:
//! - Lazy-loads the embedding model and the cached library embeddings
//! - Rebuilds and persists the cache when it goes stale
//! - Ranks books by cosine similarity to the query

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::SemanticSearchConfig;
use crate::library::{BookId, BookRecord};
use crate::normalize::normalize;
use crate::semantic::cache::{self, CacheError, CacheManifest};
use crate::semantic::device::DevicePreference;
use crate::semantic::embeddings::{EmbeddingError, ModelProvider};
use crate::semantic::storage::{CacheStore, CacheStoreError};

/// Errors that can occur during semantic search operations.
#[derive(Debug, thiserror::Error)]
pub enum SemanticSearchError {
    #[error("semantic search unavailable: {0}")]
    Unavailable(#[source] EmbeddingError),

    #[error("top_n must be at least 1")]
    InvalidTopN,

    #[error("query embedding has {got} dimensions, cache has {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CacheError> for SemanticSearchError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Embedding(e) => SemanticSearchError::Embedding(e),
            CacheError::DimensionMismatch { expected, got } => {
                SemanticSearchError::DimensionMismatch { expected, got }
            }
            other => SemanticSearchError::Internal(other.to_string()),
        }
    }
}

/// One ranked result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit<'a> {
    pub record: &'a BookRecord,
    pub score: f32,
}

/// What is on disk, read without loading a model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatus {
    pub model_name: String,
    pub dimensions: usize,
    pub rows: usize,
    pub refreshed_at: DateTime<Utc>,
}

/// Engine for searching a library by meaning.
///
/// Owns the model provider, the durable cache store and the in-memory
/// manifest. `search` takes `&mut self`, so one engine serializes its callers.
pub struct SemanticSearchEngine {
    config: SemanticSearchConfig,
    provider: ModelProvider,
    store: CacheStore,
    manifest: Option<CacheManifest>,
    rebuilds: usize,
}

impl SemanticSearchEngine {
    /// Create a new engine.
    ///
    /// Nothing is loaded until the first search.
    pub fn new(config: SemanticSearchConfig, provider: ModelProvider, store: CacheStore) -> Self {
        Self {
            config,
            provider,
            store,
            manifest: None,
            rebuilds: 0,
        }
    }

    pub fn default_top_n(&self) -> usize {
        self.config.default_top_n
    }

    /// Number of cache rebuilds performed by this engine.
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds
    }

    pub fn provider(&self) -> &ModelProvider {
        &self.provider
    }

    pub fn manifest(&self) -> Option<&CacheManifest> {
        self.manifest.as_ref()
    }

    pub fn max_cache_age(&self) -> Duration {
        Duration::days(self.config.max_cache_age_days.min(i32::MAX as u64) as i64)
    }

    /// Search `library` for the books closest in meaning to `query`.
    ///
    /// Returns at most `top_n` hits sorted by descending score, ties broken
    /// by ascending book id.
    pub fn search<'a>(
        &mut self,
        query: &str,
        top_n: usize,
        library: &'a [BookRecord],
        device: Option<DevicePreference>,
        force_refresh: bool,
    ) -> Result<Vec<SearchHit<'a>>, SemanticSearchError> {
        if top_n == 0 {
            return Err(SemanticSearchError::InvalidTopN);
        }

        let (model_name, dimensions) = {
            let model = self
                .provider
                .get_model(device)
                .map_err(SemanticSearchError::Unavailable)?;
            (model.name().to_string(), model.dimensions())
        };

        self.ensure_fresh(library, &model_name, dimensions, device, force_refresh)?;

        let query_embedding = self.provider.embed(device, &normalize(query))?;

        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| SemanticSearchError::Internal("cache not built".to_string()))?;

        if query_embedding.len() != manifest.dimensions() {
            return Err(SemanticSearchError::DimensionMismatch {
                expected: manifest.dimensions(),
                got: query_embedding.len(),
            });
        }

        rank(manifest, &query_embedding, library, top_n).map_err(Into::into)
    }

    /// Make sure the in-memory manifest matches the model and the library.
    fn ensure_fresh(
        &mut self,
        library: &[BookRecord],
        model_name: &str,
        dimensions: usize,
        device: Option<DevicePreference>,
        force_refresh: bool,
    ) -> Result<(), SemanticSearchError> {
        if self.manifest.is_none() {
            self.manifest = self.store.load(model_name, dimensions);
        }

        if let Some(manifest) = &self.manifest {
            if !manifest.is_compatible(model_name, dimensions) {
                log::info!(
                    "cached embeddings come from {} ({} dims), discarding",
                    manifest.model_name(),
                    manifest.dimensions()
                );
                self.manifest = None;
            }
        }

        let ids: Vec<BookId> = library.iter().map(|record| record.id).collect();
        let force = force_refresh || self.config.force_refresh;
        if !cache::needs_refresh(self.manifest.as_ref(), &ids, self.max_cache_age(), force) {
            return Ok(());
        }

        log::info!("Rebuilding embedding cache for {} books", library.len());
        let manifest = cache::rebuild(library, &mut self.provider, device)?;
        self.rebuilds += 1;

        if let Err(e) = self.store.persist(&manifest) {
            log::warn!("Failed to persist embedding cache: {}", e);
        }

        self.manifest = Some(manifest);
        Ok(())
    }

    /// Describe the durable cache, or `None` when there is none.
    pub fn status(&self) -> Result<Option<CacheStatus>, CacheStoreError> {
        if !self.store.exists() {
            return Ok(None);
        }

        let metadata = self.store.read_metadata()?;
        Ok(Some(CacheStatus {
            model_name: metadata.model_name,
            dimensions: metadata.dimensions,
            rows: metadata.row_count,
            refreshed_at: metadata.refreshed_at,
        }))
    }

    /// Load the durable cache if the configured model built it. Never loads a
    /// model; the dimensionality is taken from the stored metadata.
    pub fn durable_manifest(&self) -> Option<CacheManifest> {
        let metadata = self.store.read_metadata().ok()?;
        self.store
            .load(self.provider.model_name(), metadata.dimensions)
    }

    /// Remove the durable cache and forget the in-memory one.
    pub fn clear_cache(&mut self) -> Result<(), CacheStoreError> {
        self.manifest = None;
        self.store.clear()
    }
}

/// Score every cached row against `query_embedding` and join the best
/// `top_n` back to `library`. Rows whose book is gone are skipped before
/// truncation.
pub fn rank<'a>(
    manifest: &CacheManifest,
    query_embedding: &[f32],
    library: &'a [BookRecord],
    top_n: usize,
) -> Result<Vec<SearchHit<'a>>, CacheError> {
    let scores = manifest.cosine_scores(query_embedding)?;

    let by_id: HashMap<BookId, &'a BookRecord> =
        library.iter().map(|record| (record.id, record)).collect();

    let mut hits: Vec<SearchHit<'a>> = manifest
        .ids()
        .iter()
        .zip(scores)
        .filter_map(|(id, score)| match by_id.get(id) {
            Some(record) => Some(SearchHit { record, score }),
            None => {
                log::debug!("cached book {} is no longer in the library", id);
                None
            }
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.record.id.cmp(&b.record.id))
    });
    hits.truncate(top_n);

    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::{fake_provider, sample_library, FakeLoader, FAKE_MODEL};

    fn new_engine(loader: &FakeLoader, dir: &std::path::Path) -> SemanticSearchEngine {
        SemanticSearchEngine::new(
            SemanticSearchConfig::default(),
            fake_provider(loader),
            CacheStore::new(dir.to_path_buf()),
        )
    }

    #[test]
    fn test_returns_exactly_top_n_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FakeLoader::new(32);
        let mut engine = new_engine(&loader, dir.path());
        let library = sample_library();

        for top_n in 1..=library.len() {
            let hits = engine.search("fantasy quest", top_n, &library, None, false).unwrap();
            assert_eq!(hits.len(), top_n);
            assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        }

        // more than the library holds
        let hits = engine.search("fantasy", 100, &library, None, false).unwrap();
        assert_eq!(hits.len(), library.len());
    }

    #[test]
    fn test_best_match_comes_first() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FakeLoader::new(64);
        let mut engine = new_engine(&loader, dir.path());
        let library = sample_library();

        let hits = engine
            .search("Desert planet politics and spice", 1, &library, None, false)
            .unwrap();
        assert_eq!(hits[0].record.title, "Dune");
    }

    #[test]
    fn test_repeated_search_rebuilds_once() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FakeLoader::new(16);
        let mut engine = new_engine(&loader, dir.path());
        let library = sample_library();

        engine.search("hobbit", 3, &library, None, false).unwrap();
        engine.search("hobbit", 3, &library, None, false).unwrap();

        assert_eq!(engine.rebuild_count(), 1);
        assert_eq!(loader.loads(), 1);
    }

    #[test]
    fn test_library_change_triggers_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FakeLoader::new(16);
        let mut engine = new_engine(&loader, dir.path());
        let mut library = sample_library();

        engine.search("hobbit", 3, &library, None, false).unwrap();
        library.reverse();
        engine.search("hobbit", 3, &library, None, false).unwrap();
        assert_eq!(engine.rebuild_count(), 1);

        library.pop();
        engine.search("hobbit", 3, &library, None, false).unwrap();
        assert_eq!(engine.rebuild_count(), 2);
    }

    #[test]
    fn test_force_refresh_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FakeLoader::new(16);
        let mut engine = new_engine(&loader, dir.path());
        let library = sample_library();

        engine.search("hobbit", 3, &library, None, false).unwrap();
        engine.search("hobbit", 3, &library, None, true).unwrap();

        assert_eq!(engine.rebuild_count(), 2);
    }

    #[test]
    fn test_cache_is_reloaded_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FakeLoader::new(16);
        let library = sample_library();

        let first = {
            let mut engine = new_engine(&loader, dir.path());
            let hits = engine.search("ring", 2, &library, None, false).unwrap();
            assert_eq!(engine.rebuild_count(), 1);
            hits.iter().map(|hit| hit.record.id).collect::<Vec<_>>()
        };

        let mut engine = new_engine(&loader, dir.path());
        let hits = engine.search("ring", 2, &library, None, false).unwrap();
        assert_eq!(engine.rebuild_count(), 0);
        assert_eq!(hits.iter().map(|hit| hit.record.id).collect::<Vec<_>>(), first);
    }

    #[test]
    fn test_cache_from_other_model_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let library = sample_library();

        let mut engine = new_engine(&FakeLoader::new(16), dir.path());
        engine.search("ring", 2, &library, None, false).unwrap();

        let mut engine = new_engine(&FakeLoader::new(8), dir.path());
        engine.search("ring", 2, &library, None, false).unwrap();
        assert_eq!(engine.rebuild_count(), 1);
        assert_eq!(engine.manifest().unwrap().dimensions(), 8);
    }

    #[test]
    fn test_stale_references_are_skipped() {
        let loader = FakeLoader::new(16);
        let mut provider = fake_provider(&loader);
        let library = sample_library();
        let manifest = cache::rebuild(&library, &mut provider, None).unwrap();

        // book 1 was removed after the cache was built
        let subset = &library[1..];
        let query = loader.embedding_for(&normalize("hobbit dragon treasure"));
        let hits = rank(&manifest, &query, subset, 10).unwrap();

        assert_eq!(hits.len(), subset.len());
        assert!(hits.iter().all(|hit| hit.record.id != 1));

        // still fills top_n from the remaining rows
        let hits = rank(&manifest, &query, subset, 2).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_ties_break_by_ascending_id() {
        let manifest = CacheManifest::from_parts(
            "m",
            2,
            vec![9, 3, 5],
            vec![0; 3],
            vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0],
            Utc::now(),
        )
        .unwrap();
        let library: Vec<BookRecord> = [3, 5, 9]
            .into_iter()
            .map(|id| BookRecord::new(id, format!("book {id}")))
            .collect();

        let hits = rank(&manifest, &[1.0, 0.0], &library, 3).unwrap();
        let ids: Vec<BookId> = hits.iter().map(|hit| hit.record.id).collect();
        assert_eq!(ids, vec![3, 9, 5]);
    }

    #[test]
    fn test_zero_top_n_is_rejected_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FakeLoader::new(16);
        let mut engine = new_engine(&loader, dir.path());

        let library = sample_library();
        let result = engine.search("anything", 0, &library, None, false);
        assert!(matches!(result, Err(SemanticSearchError::InvalidTopN)));
        assert_eq!(loader.loads(), 0);
    }

    #[test]
    fn test_query_dimension_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FakeLoader::new(16).with_query_dimensions(12);
        let mut engine = new_engine(&loader, dir.path());

        let library = sample_library();
        let result = engine.search("hobbit", 3, &library, None, false);
        assert!(matches!(
            result,
            Err(SemanticSearchError::DimensionMismatch { expected: 16, got: 12 })
        ));
    }

    #[test]
    fn test_model_load_failure_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FakeLoader::new(16).failing_load_everywhere();
        let mut engine = new_engine(&loader, dir.path());

        let library = sample_library();
        let result = engine.search("hobbit", 3, &library, None, false);
        let err = result.unwrap_err();
        assert!(matches!(err, SemanticSearchError::Unavailable(_)));
        assert!(err.to_string().starts_with("semantic search unavailable"));
    }

    #[test]
    fn test_persist_failure_does_not_fail_search() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("cache");
        std::fs::write(&blocker, b"").unwrap();

        let loader = FakeLoader::new(16);
        let mut engine = new_engine(&loader, &blocker);

        let library = sample_library();
        let hits = engine.search("hobbit", 2, &library, None, false).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_empty_library() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FakeLoader::new(16);
        let mut engine = new_engine(&loader, dir.path());

        let hits = engine.search("hobbit", 3, &[], None, false).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_status_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let loader = FakeLoader::new(16);
        let mut engine = new_engine(&loader, dir.path());
        assert_eq!(engine.status().unwrap(), None);

        let library = sample_library();
        engine.search("hobbit", 1, &library, None, false).unwrap();

        let status = engine.status().unwrap().unwrap();
        assert_eq!(status.model_name, FAKE_MODEL);
        assert_eq!(status.rows, library.len());
        assert_eq!(status.dimensions, 16);

        engine.clear_cache().unwrap();
        assert_eq!(engine.status().unwrap(), None);
        assert!(engine.manifest().is_none());

        engine.search("hobbit", 1, &library, None, false).unwrap();
        assert_eq!(engine.rebuild_count(), 2);
    }

    #[test]
    fn test_durable_manifest_without_model_load() {
        let dir = tempfile::tempdir().unwrap();
        let library = sample_library();
        assert!(new_engine(&FakeLoader::new(16), dir.path()).durable_manifest().is_none());

        new_engine(&FakeLoader::new(16), dir.path())
            .search("hobbit", 1, &library, None, false)
            .unwrap();

        let loader = FakeLoader::new(16);
        let engine = new_engine(&loader, dir.path());
        let manifest = engine.durable_manifest().unwrap();
        assert_eq!(manifest.len(), library.len());
        assert_eq!(manifest.dimensions(), 16);
        assert_eq!(loader.loads(), 0);

        // another model's cache is not handed out
        let other = SemanticSearchEngine::new(
            SemanticSearchConfig::default(),
            ModelProvider::new(
                "other-model",
                DevicePreference::Cpu,
                Box::new(loader.clone()),
                Box::new(crate::tests::fixtures::FakeProbe::cpu_only()),
            ),
            CacheStore::new(dir.path().to_path_buf()),
        );
        assert!(other.durable_manifest().is_none());
    }
}
