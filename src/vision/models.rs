//! Model management for ONNX Runtime
//!
//! Handles downloading, caching, and loading of the text and face models.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use ndarray::{Array4, ArrayD};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::config::ModelSettings;
use crate::error::EkycError;

/// Environment variable that forces offline mode
pub const OFFLINE_ENV: &str = "EKYC_OFFLINE";

/// Model files used by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// Text detection model (DBNet)
    TextDetection,
    /// Text recognition model (CRNN)
    TextRecognition,
    /// Character dictionary for recognition
    CharacterDictionary,
    /// Face detector (UltraFace RFB-320)
    FaceDetection,
    /// Face embedding model (ArcFace)
    FaceEmbedding,
}

impl ModelType {
    pub const ALL: [ModelType; 5] = [
        ModelType::TextDetection,
        ModelType::TextRecognition,
        ModelType::CharacterDictionary,
        ModelType::FaceDetection,
        ModelType::FaceEmbedding,
    ];

    /// Get the filename for this model type
    pub fn filename(&self) -> &'static str {
        match self {
            ModelType::TextDetection => "det.onnx",
            ModelType::TextRecognition => "rec.onnx",
            ModelType::CharacterDictionary => "dict.txt",
            ModelType::FaceDetection => "face_det.onnx",
            ModelType::FaceEmbedding => "face_embed.onnx",
        }
    }

    /// Get the download URL for this model
    pub fn download_url(&self) -> &'static str {
        match self {
            ModelType::TextDetection => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/detection/v3/det.onnx"
            }
            ModelType::TextRecognition => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/rec.onnx"
            }
            ModelType::CharacterDictionary => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/dict.txt"
            }
            ModelType::FaceDetection => {
                "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx"
            }
            ModelType::FaceEmbedding => {
                "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-8.onnx"
            }
        }
    }

    /// Expected file size for integrity check (approximate, in bytes)
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelType::TextDetection => (2_000_000, 5_000_000),
            ModelType::TextRecognition => (7_000_000, 10_000_000),
            ModelType::CharacterDictionary => (500, 10_000),
            ModelType::FaceDetection => (800_000, 2_000_000),
            ModelType::FaceEmbedding => (200_000_000, 300_000_000),
        }
    }

    /// Display name for progress reporting
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelType::TextDetection => "Text Detection",
            ModelType::TextRecognition => "Text Recognition",
            ModelType::CharacterDictionary => "Character Dictionary",
            ModelType::FaceDetection => "Face Detection",
            ModelType::FaceEmbedding => "Face Embedding",
        }
    }
}

/// Model manifest tracking downloaded models
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
    /// Unix timestamp, seconds
    pub downloaded_at: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Model manager for downloading and caching ONNX models
pub struct ModelManager {
    models_dir: PathBuf,
    offline: bool,
}

impl ModelManager {
    /// Create model manager with custom directory
    pub fn with_dir(models_dir: PathBuf, offline: bool) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;
        let offline = offline || std::env::var(OFFLINE_ENV).is_ok();
        Ok(Self { models_dir, offline })
    }

    /// Create a model manager in the application data directory
    pub fn in_data_dir(offline: bool) -> Result<Self> {
        let models_dir = crate::storage::get_data_dir()?.join("models");
        Self::with_dir(models_dir, offline)
    }

    /// Model manager for the configured directory, or the data directory
    pub fn from_settings(settings: &ModelSettings) -> Result<Self> {
        match &settings.directory {
            Some(dir) => Self::with_dir(dir.clone(), settings.offline),
            None => Self::in_data_dir(settings.offline),
        }
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, model_type: ModelType) -> PathBuf {
        self.models_dir.join(model_type.filename())
    }

    /// Check if a model is already downloaded
    pub fn is_model_available(&self, model_type: ModelType) -> bool {
        match std::fs::metadata(self.model_path(model_type)) {
            Ok(metadata) => {
                let (min, max) = model_type.expected_size_range();
                (min..=max).contains(&metadata.len())
            }
            Err(_) => false,
        }
    }

    /// Get status of all models
    pub fn get_model_status(&self) -> Vec<(ModelType, bool, Option<u64>)> {
        ModelType::ALL
            .iter()
            .map(|&model_type| {
                let size = std::fs::metadata(self.model_path(model_type)).ok().map(|m| m.len());
                (model_type, self.is_model_available(model_type), size)
            })
            .collect()
    }

    /// Download a model if not already available
    /// Returns the path to the model file
    pub fn ensure_model(&self, model_type: ModelType) -> Result<PathBuf> {
        let path = self.model_path(model_type);

        if self.is_model_available(model_type) {
            debug!("Model {:?} already available at {:?}", model_type, path);
            return Ok(path);
        }

        if self.offline {
            anyhow::bail!(
                "Offline mode: cannot download {} model. Download it from {} and place it at {:?}",
                model_type.display_name(),
                model_type.download_url(),
                path
            );
        }

        self.download_model(model_type)?;
        Ok(path)
    }

    /// Download every model the pipeline needs
    pub fn ensure_all_models(&self) -> Result<()> {
        for model_type in ModelType::ALL {
            self.ensure_model(model_type)?;
        }
        Ok(())
    }

    /// Download a specific model (blocking)
    fn download_model(&self, model_type: ModelType) -> Result<()> {
        let url = model_type.download_url();
        let path = self.model_path(model_type);

        info!("Downloading {} model from {}", model_type.display_name(), url);

        let rt = Runtime::new().context("Failed to create tokio runtime")?;
        let hash = rt.block_on(download_file_async(url, &path))?;

        if !self.is_model_available(model_type) {
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            warn!(
                "{} model has unexpected size {} bytes",
                model_type.display_name(),
                size
            );
            anyhow::bail!("Download completed but model verification failed");
        }

        self.update_manifest_for_model(model_type, hash)?;

        info!("Successfully downloaded {} model", model_type.display_name());
        Ok(())
    }

    /// Update manifest after successful download
    fn update_manifest_for_model(&self, model_type: ModelType, sha256: String) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();
        let metadata = std::fs::metadata(self.model_path(model_type))?;

        let model_info = ModelInfo {
            model_type: format!("{:?}", model_type),
            filename: model_type.filename().to_string(),
            size_bytes: metadata.len(),
            sha256,
            downloaded_at: unix_now(),
        };

        if let Some(existing) = manifest
            .models
            .iter_mut()
            .find(|m| m.filename == model_info.filename)
        {
            *existing = model_info;
        } else {
            manifest.models.push(model_info);
        }

        self.save_manifest(&manifest)
    }

    /// Load the model manifest
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(ModelManifest::default())
        }
    }

    /// Save the model manifest
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join("manifest.json");
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }
}

/// Stream `url` into `path` through a temp file; returns the SHA-256 hex digest
async fn download_file_async(url: &str, path: &Path) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(600))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send download request")?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed with status {}: {}", response.status(), url);
    }

    let total_size = response.content_length();
    debug!("Download size: {:?} bytes", total_size);

    let temp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;

    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Error reading download stream")?;
        file.write_all(&chunk).context("Failed to write to temp file")?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
    }

    file.flush().context("Failed to flush temp file")?;
    drop(file);
    debug!("Downloaded {} of {:?} bytes from {}", downloaded, total_size, url);

    std::fs::rename(&temp_path, path)
        .context("Failed to move downloaded file to final location")?;

    Ok(format!("{:x}", hasher.finalize()))
}

/// ONNX Runtime session wrapper
pub struct OnnxSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxSession {
    /// Create a new ONNX session from a model file
    pub fn new(model_path: &Path) -> Result<Self> {
        info!("Loading ONNX model from {:?}", model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        let input_names: Vec<String> = session
            .inputs
            .iter()
            .map(|input| input.name.clone())
            .collect();

        let output_names: Vec<String> = session
            .outputs
            .iter()
            .map(|output| output.name.clone())
            .collect();

        info!(
            "Model loaded. Inputs: {:?}, Outputs: {:?}",
            input_names, output_names
        );

        Ok(Self {
            session,
            input_names,
            output_names,
        })
    }

    /// Run the model on one image tensor and copy every output out
    pub fn run(&mut self, input: Array4<f32>) -> crate::error::Result<Vec<ArrayD<f32>>> {
        let input_name = self
            .input_names
            .first()
            .cloned()
            .ok_or_else(|| EkycError::Model("model declares no inputs".to_string()))?;

        let value = Value::from_array(input).map_err(EkycError::inference)?;
        let outputs = self
            .session
            .run(ort::inputs![input_name.as_str() => value])
            .map_err(EkycError::inference)?;

        // outputs come back in declaration order
        let mut arrays = Vec::with_capacity(self.output_names.len());
        for index in 0..self.output_names.len() {
            let array = outputs[index]
                .try_extract_array::<f32>()
                .map_err(EkycError::inference)?;
            arrays.push(array.to_owned());
        }
        Ok(arrays)
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
