//! Embedding model wrapper for fastembed.
//!
//! Provides a high-level interface for generating embeddings:
//! - Lazy, memoized model loading bound to a resolved compute device
//! - Model download into a configurable cache directory
//! - Batch embedding generation with a one-shot CPU retry

use fastembed::{InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::time::Duration;

use crate::semantic::device::{
    Device, DevicePreference, DeviceProbe, DeviceSelector, SystemProbe,
};

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Model download timed out after {0} seconds")]
    DownloadTimeout(u64),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// A loaded sentence-embedding model.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    /// Output dimensionality.
    fn dimensions(&self) -> usize;

    /// Device the model is bound to.
    fn device(&self) -> Device;

    /// Embed all texts in one call. Output is aligned with the input.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Instantiates models. This is the expensive step (download + weights).
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_name: &str, device: Device) -> Result<Box<dyn Embedder>, EmbeddingError>;
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
    device: Device,
}

impl EmbeddingModel {
    /// Create a new embedding model with the given name.
    ///
    /// The model will be downloaded on first use if not cached.
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    ///
    /// # Arguments
    /// * `model_name` - Name of the model (e.g., "all-MiniLM-L6-v2")
    /// * `cache_dir` - Directory to cache downloaded models
    /// * `device` - Device to bind the ONNX session to
    /// * `download_timeout` - Optional timeout for model download
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        device: Device,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        // Ensure cache directory exists
        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);
        let options = Self::with_device(options, device)?;

        // Download and session setup run on a detached thread; a timed out
        // download keeps going in the background until the process exits.
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(TextEmbedding::try_new(options));
        });

        let mut model = match rx.recv_timeout(timeout) {
            Ok(result) => result.map_err(|e| EmbeddingError::InitFailed(e.to_string()))?,
            Err(RecvTimeoutError::Timeout) => {
                return Err(EmbeddingError::DownloadTimeout(timeout.as_secs()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(EmbeddingError::InitFailed(
                    "model loader thread exited unexpectedly".to_string(),
                ))
            }
        };

        // Get model dimensions by embedding a test string
        let dimensions = Self::probe_dimensions(&mut model)?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
            device,
        })
    }

    #[cfg(any(feature = "cuda", feature = "coreml"))]
    fn with_device(options: InitOptions, device: Device) -> Result<InitOptions, EmbeddingError> {
        use ort::execution_providers::ExecutionProviderDispatch;

        let provider: Option<ExecutionProviderDispatch> = match device {
            #[cfg(feature = "cuda")]
            Device::Cuda => Some(
                ort::execution_providers::CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure(),
            ),
            #[cfg(feature = "coreml")]
            Device::CoreMl => Some(
                ort::execution_providers::CoreMLExecutionProvider::default()
                    .build()
                    .error_on_failure(),
            ),
            Device::Cpu => None,
            #[allow(unreachable_patterns)]
            other => {
                return Err(EmbeddingError::InitFailed(format!(
                    "device {other} is not compiled into this binary"
                )))
            }
        };

        Ok(match provider {
            Some(provider) => options.with_execution_providers(vec![provider]),
            None => options,
        })
    }

    #[cfg(not(any(feature = "cuda", feature = "coreml")))]
    fn with_device(options: InitOptions, device: Device) -> Result<InitOptions, EmbeddingError> {
        if device.is_accelerated() {
            return Err(EmbeddingError::InitFailed(format!(
                "device {device} is not compiled into this binary"
            )));
        }
        Ok(options)
    }

    /// Parse model name string to fastembed enum.
    fn parse_model_name(
        name: &str,
    ) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => {
                Ok(fastembed::EmbeddingModel::AllMiniLML6V2)
            }
            "all-minilm-l6-v2-q" | "allminiml6v2q" => {
                Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q)
            }
            "bge-small-en-v1.5" | "bgesmallenv15" => {
                Ok(fastembed::EmbeddingModel::BGESmallENV15)
            }
            "bge-small-en-v1.5-q" | "bgesmallenv15q" => {
                Ok(fastembed::EmbeddingModel::BGESmallENV15Q)
            }
            "bge-base-en-v1.5" | "bgebaseenv15" => {
                Ok(fastembed::EmbeddingModel::BGEBaseENV15)
            }
            "bge-base-en-v1.5-q" | "bgebaseenv15q" => {
                Ok(fastembed::EmbeddingModel::BGEBaseENV15Q)
            }
            "bge-large-en-v1.5" | "bgelargeenv15" => {
                Ok(fastembed::EmbeddingModel::BGELargeENV15)
            }
            "bge-large-en-v1.5-q" | "bgelargeenv15q" => {
                Ok(fastembed::EmbeddingModel::BGELargeENV15Q)
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5 (add -q suffix for quantized)",
                name
            ))),
        }
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl Embedder for EmbeddingModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn device(&self) -> Device {
        self.device
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }
}

/// Loads fastembed models into `<cache_dir>/models`.
pub struct FastEmbedLoader {
    cache_dir: PathBuf,
    download_timeout: Option<Duration>,
}

impl FastEmbedLoader {
    pub fn new(cache_dir: PathBuf, download_timeout: Option<Duration>) -> Self {
        Self {
            cache_dir,
            download_timeout,
        }
    }
}

impl ModelLoader for FastEmbedLoader {
    fn load(&self, model_name: &str, device: Device) -> Result<Box<dyn Embedder>, EmbeddingError> {
        let model = EmbeddingModel::new(
            model_name,
            self.cache_dir.clone(),
            device,
            self.download_timeout,
        )?;
        Ok(Box::new(model))
    }
}

/// Memoized model provider.
///
/// Owns the device state machine and at most one loaded model. The model is
/// loaded on first use and kept until the requested device preference
/// changes or `reset` is called.
pub struct ModelProvider {
    loader: Box<dyn ModelLoader>,
    probe: Box<dyn DeviceProbe>,
    model_name: String,
    preference: DevicePreference,
    selector: DeviceSelector,
    model: Option<Box<dyn Embedder>>,
    loads: usize,
}

impl ModelProvider {
    pub fn new(
        model_name: &str,
        preference: DevicePreference,
        loader: Box<dyn ModelLoader>,
        probe: Box<dyn DeviceProbe>,
    ) -> Self {
        Self {
            loader,
            probe,
            model_name: model_name.to_string(),
            preference,
            selector: DeviceSelector::new(),
            model: None,
            loads: 0,
        }
    }

    /// Provider backed by fastembed and the system device probe.
    pub fn fastembed(
        model_name: &str,
        preference: DevicePreference,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Self {
        Self::new(
            model_name,
            preference,
            Box::new(FastEmbedLoader::new(cache_dir, download_timeout)),
            Box::new(SystemProbe),
        )
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Number of model loads so far.
    pub fn load_count(&self) -> usize {
        self.loads
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Device of the loaded model, if any.
    pub fn device(&self) -> Option<Device> {
        self.model.as_ref().map(|model| model.device())
    }

    /// Drop the loaded model; the next call loads again.
    pub fn reset(&mut self) {
        self.model = None;
        self.selector.reset();
    }

    /// Get the model, loading it if needed.
    ///
    /// `requested` overrides the configured preference. A different
    /// preference than last time drops the current model.
    pub fn get_model(
        &mut self,
        requested: Option<DevicePreference>,
    ) -> Result<&dyn Embedder, EmbeddingError> {
        if let Some(requested) = requested {
            if requested != self.preference {
                log::debug!(
                    "device preference changed from {} to {}",
                    self.preference,
                    requested
                );
                self.preference = requested;
                self.reset();
            }
        }

        if self.model.is_none() {
            let model = self.load()?;
            self.model = Some(model);
        }

        self.model
            .as_deref()
            .ok_or_else(|| EmbeddingError::InitFailed("model not loaded".to_string()))
    }

    fn load(&mut self) -> Result<Box<dyn Embedder>, EmbeddingError> {
        let device = self.selector.resolve(self.preference, self.probe.as_ref());
        log::info!("Loading embedding model '{}' on {}", self.model_name, device);

        self.loads += 1;
        match self.loader.load(&self.model_name, device) {
            Ok(model) => Ok(model),
            Err(e) if device.is_accelerated() => {
                log::warn!("Failed to load model on {device}: {e}");
                self.selector.fall_back();
                self.loads += 1;
                self.loader.load(&self.model_name, Device::Cpu)
            }
            Err(e) => Err(e),
        }
    }

    /// Embed a batch, retrying once on the CPU if the accelerated device fails.
    pub fn embed_batch(
        &mut self,
        requested: Option<DevicePreference>,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let result = self.get_model(requested)?.embed_batch(texts);

        match result {
            Err(e) if self.device().is_some_and(|device| device.is_accelerated()) => {
                log::warn!("Embedding failed on accelerated device, retrying on cpu: {e}");
                self.selector.fall_back();
                self.model = None;
                self.get_model(None)?.embed_batch(texts)
            }
            other => other,
        }
    }

    /// Embed a single text.
    pub fn embed(
        &mut self,
        requested: Option<DevicePreference>,
        text: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(requested, &[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}
