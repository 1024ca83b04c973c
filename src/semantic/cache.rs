//! In-memory embedding cache with cosine similarity scoring.
//!
//! A [`CacheManifest`] holds one embedding per book as rows of a row-major
//! matrix. Row `i` belongs to `ids[i]`; the two are only ever built together.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use crate::library::{BookId, BookRecord};
use crate::normalize::{content_fingerprint, searchable_text};
use crate::semantic::device::DevicePreference;
use crate::semantic::embeddings::{EmbeddingError, ModelProvider};

/// Errors that can occur while building or querying the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Model returned {got} embeddings for {expected} texts")]
    RowCountMismatch { expected: usize, got: usize },
}

/// Snapshot of the embedded library.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheManifest {
    ids: Vec<BookId>,
    fingerprints: Vec<u64>,
    /// Row-major, `ids.len() * dimensions` values
    vectors: Vec<f32>,
    dimensions: usize,
    model_name: String,
    refreshed_at: DateTime<Utc>,
}

impl CacheManifest {
    /// Assemble a manifest from aligned parts.
    ///
    /// Fails if the parts don't line up.
    pub fn from_parts(
        model_name: &str,
        dimensions: usize,
        ids: Vec<BookId>,
        fingerprints: Vec<u64>,
        vectors: Vec<f32>,
        refreshed_at: DateTime<Utc>,
    ) -> Result<Self, CacheError> {
        if fingerprints.len() != ids.len() {
            return Err(CacheError::RowCountMismatch {
                expected: ids.len(),
                got: fingerprints.len(),
            });
        }
        if vectors.len() != ids.len() * dimensions {
            return Err(CacheError::DimensionMismatch {
                expected: ids.len() * dimensions,
                got: vectors.len(),
            });
        }

        Ok(Self {
            ids,
            fingerprints,
            vectors,
            dimensions,
            model_name: model_name.to_string(),
            refreshed_at,
        })
    }

    pub fn ids(&self) -> &[BookId] {
        &self.ids
    }

    pub fn fingerprints(&self) -> &[u64] {
        &self.fingerprints
    }

    /// The whole row-major matrix.
    pub fn vectors(&self) -> &[f32] {
        &self.vectors
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn refreshed_at(&self) -> DateTime<Utc> {
        self.refreshed_at
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Embedding row `index`.
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        if index >= self.ids.len() {
            return None;
        }
        let start = index * self.dimensions;
        Some(&self.vectors[start..start + self.dimensions])
    }

    /// Whether this manifest was produced by the given model.
    pub fn is_compatible(&self, model_name: &str, dimensions: usize) -> bool {
        self.model_name == model_name && self.dimensions == dimensions
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.refreshed_at
    }

    /// Number of cached rows whose record content changed since the rebuild,
    /// or whose record is gone.
    pub fn changed_rows(&self, records: &[BookRecord]) -> usize {
        let current: HashMap<BookId, u64> = records
            .iter()
            .map(|record| (record.id, content_fingerprint(&searchable_text(record))))
            .collect();

        self.ids
            .iter()
            .zip(&self.fingerprints)
            .filter(|(id, fingerprint)| current.get(id) != Some(fingerprint))
            .count()
    }

    /// Cosine similarity of `query` against every row, in row order.
    pub fn cosine_scores(&self, query: &[f32]) -> Result<Vec<f32>, CacheError> {
        if query.len() != self.dimensions {
            return Err(CacheError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let query_norm = l2_norm(query);
        if query_norm < f32::EPSILON || self.dimensions == 0 {
            return Ok(vec![0.0; self.ids.len()]);
        }

        Ok(self
            .vectors
            .chunks_exact(self.dimensions)
            .map(|row| {
                let row_norm = l2_norm(row);
                if row_norm < f32::EPSILON {
                    return 0.0;
                }
                let dot: f32 = query.iter().zip(row).map(|(a, b)| a * b).sum();
                dot / (query_norm * row_norm)
            })
            .collect())
    }
}

/// Compute L2 norm of a vector.
fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Decide whether the cache has to be rebuilt.
///
/// Stale when there is no cache, it has no rows, it's older than `max_age`,
/// `force` is set, or the set of cached ids differs from `current_ids`.
/// Order alone never matters.
pub fn needs_refresh(
    manifest: Option<&CacheManifest>,
    current_ids: &[BookId],
    max_age: Duration,
    force: bool,
) -> bool {
    needs_refresh_at(manifest, current_ids, max_age, force, Utc::now())
}

pub fn needs_refresh_at(
    manifest: Option<&CacheManifest>,
    current_ids: &[BookId],
    max_age: Duration,
    force: bool,
    now: DateTime<Utc>,
) -> bool {
    let Some(manifest) = manifest else {
        return true;
    };

    if force || manifest.is_empty() {
        return true;
    }

    if manifest.age(now) > max_age {
        log::debug!(
            "cache is {} hours old, max age is {} hours",
            manifest.age(now).num_hours(),
            max_age.num_hours()
        );
        return true;
    }

    let cached: HashSet<BookId> = manifest.ids.iter().copied().collect();
    let current: HashSet<BookId> = current_ids.iter().copied().collect();
    cached != current
}

/// Embed the whole library in one batch.
///
/// Rows are ordered by ascending book id.
pub fn rebuild(
    records: &[BookRecord],
    provider: &mut ModelProvider,
    device: Option<DevicePreference>,
) -> Result<CacheManifest, CacheError> {
    let mut ordered: Vec<&BookRecord> = records.iter().collect();
    ordered.sort_by_key(|record| record.id);
    ordered.dedup_by_key(|record| record.id);

    let texts: Vec<String> = ordered.iter().map(|record| searchable_text(record)).collect();
    let fingerprints: Vec<u64> = texts.iter().map(|text| content_fingerprint(text)).collect();
    let ids: Vec<BookId> = ordered.iter().map(|record| record.id).collect();

    log::info!("Generating embeddings for {} books", texts.len());
    let embeddings = provider.embed_batch(device, &texts)?;

    if embeddings.len() != texts.len() {
        return Err(CacheError::RowCountMismatch {
            expected: texts.len(),
            got: embeddings.len(),
        });
    }

    let (model_name, dimensions) = {
        let model = provider.get_model(device)?;
        (model.name().to_string(), model.dimensions())
    };

    let mut vectors = Vec::with_capacity(ids.len() * dimensions);
    for embedding in embeddings {
        if embedding.len() != dimensions {
            return Err(CacheError::DimensionMismatch {
                expected: dimensions,
                got: embedding.len(),
            });
        }
        vectors.extend(embedding);
    }

    CacheManifest::from_parts(&model_name, dimensions, ids, fingerprints, vectors, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::{fake_provider, sample_library, FakeLoader};

    fn manifest_with_ids(ids: &[BookId], refreshed_at: DateTime<Utc>) -> CacheManifest {
        let vectors = ids.iter().flat_map(|id| vec![*id as f32, 1.0]).collect();
        CacheManifest::from_parts("m", 2, ids.to_vec(), vec![0; ids.len()], vectors, refreshed_at)
            .unwrap()
    }

    #[test]
    fn test_missing_or_empty_manifest_needs_refresh() {
        assert!(needs_refresh(None, &[1, 2], Duration::days(7), false));

        let empty = manifest_with_ids(&[], Utc::now());
        assert!(needs_refresh(Some(&empty), &[], Duration::days(7), false));
    }

    #[test]
    fn test_fresh_manifest_is_reused() {
        let manifest = manifest_with_ids(&[1, 2, 3], Utc::now());
        assert!(!needs_refresh(Some(&manifest), &[1, 2, 3], Duration::days(7), false));
    }

    #[test]
    fn test_reordering_is_not_stale() {
        let manifest = manifest_with_ids(&[1, 2, 3], Utc::now());
        assert!(!needs_refresh(Some(&manifest), &[3, 1, 2], Duration::days(7), false));
    }

    #[test]
    fn test_added_or_removed_record_is_stale() {
        let manifest = manifest_with_ids(&[1, 2, 3], Utc::now());

        assert!(needs_refresh(Some(&manifest), &[1, 2, 3, 4], Duration::days(7), false));
        assert!(needs_refresh(Some(&manifest), &[1, 2], Duration::days(7), false));
        // same size, different members
        assert!(needs_refresh(Some(&manifest), &[1, 2, 4], Duration::days(7), false));
    }

    #[test]
    fn test_force_refresh() {
        let manifest = manifest_with_ids(&[1], Utc::now());
        assert!(needs_refresh(Some(&manifest), &[1], Duration::days(7), true));
    }

    #[test]
    fn test_expired_manifest_is_stale() {
        let now = Utc::now();
        let manifest = manifest_with_ids(&[1], now - Duration::days(8));

        assert!(needs_refresh_at(Some(&manifest), &[1], Duration::days(7), false, now));
        assert!(!needs_refresh_at(Some(&manifest), &[1], Duration::days(9), false, now));
        // zero max age expires anything with a nonzero age
        assert!(needs_refresh_at(Some(&manifest), &[1], Duration::zero(), false, now));
    }

    #[test]
    fn test_from_parts_rejects_misaligned_data() {
        let result = CacheManifest::from_parts("m", 3, vec![1, 2], vec![0, 0], vec![0.0; 5], Utc::now());
        assert!(matches!(result, Err(CacheError::DimensionMismatch { .. })));

        let result = CacheManifest::from_parts("m", 3, vec![1, 2], vec![0], vec![0.0; 6], Utc::now());
        assert!(matches!(result, Err(CacheError::RowCountMismatch { .. })));
    }

    #[test]
    fn test_cosine_scores() {
        let manifest = CacheManifest::from_parts(
            "m",
            3,
            vec![1, 2, 3],
            vec![0; 3],
            vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, -1.0, 0.0, 0.0],
            Utc::now(),
        )
        .unwrap();

        let scores = manifest.cosine_scores(&[2.0, 0.0, 0.0]).unwrap();
        assert!((scores[0] - 1.0).abs() < 1e-6);
        assert!(scores[1].abs() < 1e-6);
        // no clamping
        assert!((scores[2] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_scores_dimension_mismatch() {
        let manifest = manifest_with_ids(&[1], Utc::now());
        let result = manifest.cosine_scores(&[1.0, 0.0, 0.0]);
        assert!(matches!(result, Err(CacheError::DimensionMismatch { expected: 2, got: 3 })));
    }

    #[test]
    fn test_rebuild_aligns_rows_with_ids() {
        let loader = FakeLoader::new(16);
        let mut provider = fake_provider(&loader);

        let mut records = sample_library();
        records.reverse();

        let manifest = rebuild(&records, &mut provider, None).unwrap();

        let mut expected_ids: Vec<BookId> = records.iter().map(|r| r.id).collect();
        expected_ids.sort();
        assert_eq!(manifest.ids(), expected_ids.as_slice());
        assert_eq!(manifest.dimensions(), 16);
        assert_eq!(manifest.model_name(), "fake-model");
        assert_eq!(manifest.vectors().len(), records.len() * 16);

        // each row is the embedding of its own record
        for (index, id) in manifest.ids().iter().enumerate() {
            let record = records.iter().find(|r| r.id == *id).unwrap();
            let expected = loader.embedding_for(&searchable_text(record));
            assert_eq!(manifest.row(index).unwrap(), expected.as_slice());
        }
        assert!(manifest.row(records.len()).is_none());
    }

    #[test]
    fn test_rebuild_uses_one_batch() {
        let loader = FakeLoader::new(16);
        let mut provider = fake_provider(&loader);

        rebuild(&sample_library(), &mut provider, None).unwrap();

        assert_eq!(loader.batch_calls(), 1);
    }

    #[test]
    fn test_changed_rows() {
        let loader = FakeLoader::new(16);
        let mut provider = fake_provider(&loader);
        let mut records = sample_library();
        let manifest = rebuild(&records, &mut provider, None).unwrap();

        assert_eq!(manifest.changed_rows(&records), 0);

        records[0].title.push_str(" (revised)");
        records.pop();
        assert_eq!(manifest.changed_rows(&records), 2);
    }
}
