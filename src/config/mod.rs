//! Application Configuration
//!
//! Pipeline settings stored in TOML format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Languages the provisioned recognition models cover
pub const SUPPORTED_OCR_LANGUAGES: &[&str] = &["en"];

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Intermediate image locations
    pub artifacts: ArtifactsConfig,
    /// Text recognition settings
    pub ocr: OcrSettings,
    /// Face verification settings
    pub face: FaceSettings,
    /// Record store settings
    pub database: DatabaseConfig,
    /// Log file settings
    pub logging: LoggingConfig,
    /// Orchestration settings
    pub pipeline: PipelineSettings,
    /// ONNX model locations
    pub models: ModelSettings,
}

/// Where intermediate images are written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Directory for the cropped document image
    pub intermediate_dir: PathBuf,
    /// File name of the cropped document image
    pub contour_image_file_name: String,
    /// Directory for the selfie and the face cut from the document
    pub faces_dir: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            intermediate_dir: PathBuf::from("artifacts/intermediate"),
            contour_image_file_name: "contour_id.jpg".to_string(),
            faces_dir: PathBuf::from("artifacts/faces"),
        }
    }
}

/// Text recognition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Fragments at or below this confidence are dropped (0.0 - 1.0)
    pub confidence_threshold: f32,
    /// Recognition languages
    pub languages: Vec<String>,
    /// Probability cutoff for the text detection map (0.0 - 1.0)
    pub detection_threshold: f32,
    /// Smallest text box kept, in detection-map pixels
    pub min_box_area: u32,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.10,
            languages: vec!["en".to_string()],
            detection_threshold: 0.3,
            min_box_area: 16,
        }
    }
}

/// Face verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceSettings {
    /// Minimum cosine similarity for two faces to match
    pub match_threshold: f32,
    /// Minimum detector score for a face box
    pub detection_threshold: f32,
    /// Fraction of the face box added on each side before cropping
    pub face_padding: f32,
}

impl Default for FaceSettings {
    fn default() -> Self {
        Self {
            match_threshold: 0.45,
            detection_threshold: 0.7,
            face_padding: 0.1,
        }
    }
}

/// Record store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: PathBuf,
    /// How long a locked database is retried before failing
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ekyc.db"),
            busy_timeout_ms: 5000,
        }
    }
}

/// Log file settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory holding the log file
    pub directory: PathBuf,
    /// Log file name (appended to, never truncated)
    pub file_name: String,
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_name: "ekyc_logs.log".to_string(),
            level: "info".to_string(),
        }
    }
}

/// How a selected document type is routed to a field extractor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Each document type uses its own extractor
    #[default]
    ByDocumentType,
    /// Every document type is parsed with the PAN rules
    PanOnly,
}

/// Orchestration settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub dispatch: DispatchMode,
}

/// ONNX model locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Model cache directory; the data directory is used when unset
    pub directory: Option<PathBuf>,
    /// Never download, only use models already on disk
    pub offline: bool,
}

impl AppConfig {
    /// Check value ranges and names
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.ocr.confidence_threshold) {
            anyhow::bail!(
                "ocr.confidence_threshold must be within 0.0..=1.0, got {}",
                self.ocr.confidence_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.ocr.detection_threshold) {
            anyhow::bail!(
                "ocr.detection_threshold must be within 0.0..=1.0, got {}",
                self.ocr.detection_threshold
            );
        }
        if self.ocr.languages.is_empty() {
            anyhow::bail!("ocr.languages must name at least one language");
        }
        if let Some(lang) = self
            .ocr
            .languages
            .iter()
            .find(|lang| !SUPPORTED_OCR_LANGUAGES.contains(&lang.as_str()))
        {
            anyhow::bail!(
                "unsupported OCR language {:?} (supported: {:?})",
                lang,
                SUPPORTED_OCR_LANGUAGES
            );
        }
        if !(-1.0..=1.0).contains(&self.face.match_threshold) {
            anyhow::bail!(
                "face.match_threshold must be within -1.0..=1.0, got {}",
                self.face.match_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.face.detection_threshold) {
            anyhow::bail!(
                "face.detection_threshold must be within 0.0..=1.0, got {}",
                self.face.detection_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.face.face_padding) {
            anyhow::bail!("face.face_padding must be within 0.0..=1.0");
        }
        if self.artifacts.contour_image_file_name.trim().is_empty() {
            anyhow::bail!("artifacts.contour_image_file_name must not be empty");
        }
        if self.logging.file_name.trim().is_empty() {
            anyhow::bail!("logging.file_name must not be empty");
        }
        Ok(())
    }

    /// Resolve relative artifact, database and log paths against `root`
    pub fn resolve_paths(&mut self, root: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        };
        resolve(&mut self.artifacts.intermediate_dir);
        resolve(&mut self.artifacts.faces_dir);
        resolve(&mut self.database.path);
        resolve(&mut self.logging.directory);
        if let Some(dir) = self.models.directory.as_mut() {
            resolve(dir);
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {:?}", path))?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Load configuration from file, or use defaults when the file is absent
pub fn load_or_default(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(AppConfig::default())
    }
}
