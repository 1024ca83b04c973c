//! Durable storage for the embedding cache.
//!
//! Two artifacts live in the cache directory:
//!
//! `vectors.bin` - the embedding matrix
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - row_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Rows (repeated `row_count` times):
//! - embedding: [f32; dimensions] (little-endian)
//!
//! `manifest.json` - row order and provenance: format version, model name,
//! dimensions, row count, book ids, content fingerprints, refresh time, and a
//! CRC32 of the `vectors.bin` rows so a half-replaced pair is detected.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::library::BookId;
use crate::semantic::cache::CacheManifest;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + row_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

const VECTORS_FILE: &str = "vectors.bin";
const METADATA_FILE: &str = "manifest.json";

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: cache was built with a different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Contents of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub version: u8,
    pub model_name: String,
    pub dimensions: usize,
    pub row_count: usize,
    pub refreshed_at: DateTime<Utc>,
    pub ids: Vec<BookId>,
    pub fingerprints: Vec<u64>,
    pub vectors_checksum: u32,
}

/// Storage manager for the cache artifacts.
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Create a new storage manager rooted at `dir`.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn vectors_path(&self) -> PathBuf {
        self.dir.join(VECTORS_FILE)
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Check if both artifacts exist.
    pub fn exists(&self) -> bool {
        self.vectors_path().exists() && self.metadata_path().exists()
    }

    /// Load a cache built with `model_name` producing `dimensions`-wide vectors.
    ///
    /// Anything unreadable, corrupted or built by another model is reported as
    /// no cache at all.
    pub fn load(&self, model_name: &str, dimensions: usize) -> Option<CacheManifest> {
        if !self.exists() {
            log::info!("No embedding cache in {}", self.dir.display());
            return None;
        }

        match self.try_load(model_name, dimensions) {
            Ok(manifest) => {
                log::info!("Loaded {} cached embeddings", manifest.len());
                Some(manifest)
            }
            Err(CacheStoreError::ModelMismatch) | Err(CacheStoreError::DimensionMismatch { .. }) => {
                log::warn!("Embedding cache was built with a different model, ignoring it");
                None
            }
            Err(e) => {
                log::warn!("Embedding cache is unreadable, ignoring it: {}", e);
                None
            }
        }
    }

    /// Load, reporting why a cache can't be used.
    pub fn try_load(
        &self,
        model_name: &str,
        dimensions: usize,
    ) -> Result<CacheManifest, CacheStoreError> {
        let metadata = self.read_metadata()?;
        if metadata.version > FORMAT_VERSION {
            return Err(CacheStoreError::VersionMismatch(metadata.version, FORMAT_VERSION));
        }
        if metadata.model_name != model_name {
            return Err(CacheStoreError::ModelMismatch);
        }
        if metadata.dimensions != dimensions {
            return Err(CacheStoreError::DimensionMismatch {
                expected: dimensions,
                got: metadata.dimensions,
            });
        }

        let file = File::open(self.vectors_path())?;
        let mut reader = BufReader::new(file);

        // Read and validate header
        let header = Self::read_header(&mut reader)?;
        Self::validate_header(&header, &model_id_hash(model_name), dimensions)?;

        if header.row_count as usize != metadata.row_count
            || metadata.ids.len() != metadata.row_count
            || metadata.fingerprints.len() != metadata.row_count
        {
            return Err(CacheStoreError::InvalidFormat(format!(
                "row count disagrees: vectors.bin has {}, manifest.json has {} ids",
                header.row_count,
                metadata.ids.len()
            )));
        }

        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;

        let expected_len = metadata.row_count * dimensions * 4;
        if body.len() != expected_len {
            return Err(CacheStoreError::InvalidFormat(format!(
                "expected {} bytes of vectors, found {}",
                expected_len,
                body.len()
            )));
        }
        if crc32fast::hash(&body) != metadata.vectors_checksum {
            return Err(CacheStoreError::ChecksumMismatch);
        }

        let vectors: Vec<f32> = body
            .chunks_exact(4)
            .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect();

        CacheManifest::from_parts(
            &metadata.model_name,
            metadata.dimensions,
            metadata.ids,
            metadata.fingerprints,
            vectors,
            metadata.refreshed_at,
        )
        .map_err(|e| CacheStoreError::InvalidFormat(e.to_string()))
    }

    /// Read `manifest.json` alone.
    pub fn read_metadata(&self) -> Result<CacheMetadata, CacheStoreError> {
        let bytes = std::fs::read(self.metadata_path())?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Save the manifest to storage.
    ///
    /// Each artifact is written to a temp file, synced and renamed into place.
    /// The vectors go first; the metadata carries their checksum, so a crash
    /// between the two renames leaves a pair that fails to load.
    pub fn persist(&self, manifest: &CacheManifest) -> Result<(), CacheStoreError> {
        if manifest.dimensions() > u16::MAX as usize {
            return Err(CacheStoreError::InvalidFormat(format!(
                "{} dimensions do not fit the file format",
                manifest.dimensions()
            )));
        }

        std::fs::create_dir_all(&self.dir)?;

        let body: Vec<u8> = manifest
            .vectors()
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect();

        let metadata = CacheMetadata {
            version: FORMAT_VERSION,
            model_name: manifest.model_name().to_string(),
            dimensions: manifest.dimensions(),
            row_count: manifest.len(),
            refreshed_at: manifest.refreshed_at(),
            ids: manifest.ids().to_vec(),
            fingerprints: manifest.fingerprints().to_vec(),
            vectors_checksum: crc32fast::hash(&body),
        };

        let header = Header {
            version: FORMAT_VERSION,
            model_id: model_id_hash(manifest.model_name()),
            dimensions: manifest.dimensions() as u16,
            row_count: manifest.len() as u64,
        };

        Self::atomic_write(&self.vectors_path(), |writer| {
            Self::write_header(writer, &header)?;
            writer.write_all(&body)?;
            Ok(())
        })?;

        Self::atomic_write(&self.metadata_path(), |writer| {
            serde_json::to_writer(&mut *writer, &metadata)?;
            Ok(())
        })?;

        log::debug!("Persisted {} embeddings to {}", manifest.len(), self.dir.display());
        Ok(())
    }

    /// Delete both artifacts if they exist.
    pub fn clear(&self) -> Result<(), CacheStoreError> {
        for path in [self.metadata_path(), self.vectors_path()] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Write via temp file -> fsync -> rename.
    fn atomic_write<F>(path: &Path, write: F) -> Result<(), CacheStoreError>
    where
        F: FnOnce(&mut BufWriter<File>) -> Result<(), CacheStoreError>,
    {
        let temp_path = path.with_extension("tmp");

        let result = (|| {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            write(&mut writer)?;

            writer.flush()?;
            let file = writer
                .into_inner()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            file.sync_all()?;
            Ok(())
        })();

        if result.is_err() {
            // Clean up temp file on error
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        // Atomic rename
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Read header from file.
    fn read_header(reader: &mut BufReader<File>) -> Result<Header, CacheStoreError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;

        let version = header_bytes[0];

        // Version check first
        if version > FORMAT_VERSION {
            return Err(CacheStoreError::VersionMismatch(version, FORMAT_VERSION));
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]);

        let mut row_count = [0u8; 8];
        row_count.copy_from_slice(&header_bytes[35..43]);
        let row_count = u64::from_le_bytes(row_count);

        let mut stored_checksum = [0u8; 4];
        stored_checksum.copy_from_slice(&header_bytes[43..47]);
        let stored_checksum = u32::from_le_bytes(stored_checksum);

        // Verify checksum (computed over header without checksum field)
        if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
            return Err(CacheStoreError::ChecksumMismatch);
        }

        Ok(Header {
            version,
            model_id,
            dimensions,
            row_count,
        })
    }

    /// Validate header against expected values.
    fn validate_header(
        header: &Header,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(), CacheStoreError> {
        if header.model_id != *expected_model_id {
            return Err(CacheStoreError::ModelMismatch);
        }

        if header.dimensions as usize != expected_dimensions {
            return Err(CacheStoreError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        Ok(())
    }

    /// Write header to file.
    fn write_header(writer: &mut BufWriter<File>, header: &Header) -> Result<(), CacheStoreError> {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = header.version;
        header_bytes[1..33].copy_from_slice(&header.model_id);
        header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&header.row_count.to_le_bytes());

        // Compute and store checksum
        let checksum = crc32fast::hash(&header_bytes[0..43]);
        header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        Ok(())
    }
}

/// Compute SHA256 hash of the model name for storage identification.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    row_count: u64,
}
