//! Vision Layer
//!
//! Image loading, document localisation, text recognition and face
//! verification. Model-backed stages sit behind the [`TextRecognizer`] and
//! [`FaceAnalyzer`] traits; the ONNX Runtime implementations load their
//! models through [`ModelManager`].

pub mod face;
pub mod loader;
pub mod locator;
pub mod models;
pub mod ocr;
pub mod preprocess;

use anyhow::Result;
use tracing::info;

pub use face::{Embedding, FaceAnalyzer, FaceVerdict, FaceVerifier, OnnxFaceAnalyzer};
pub use loader::{read_image, save_image, ImageSource};
pub use locator::{extract_image_from_id, LocatedDocument};
pub use models::{ModelManager, ModelType};
pub use ocr::{extract_text, OcrOutput, OnnxTextRecognizer, RecognizedText, TextRecognizer};

use crate::config::AppConfig;

/// Model-backed stages ready for the pipeline
pub struct VisionBackends {
    pub recognizer: Box<dyn TextRecognizer>,
    pub faces: FaceVerifier,
}

/// Ensure every model is present and load the ONNX backends
pub fn load_onnx_backends(config: &AppConfig) -> Result<VisionBackends> {
    let manager = ModelManager::from_settings(&config.models)?;
    manager.ensure_all_models()?;

    let recognizer = OnnxTextRecognizer::new(
        &manager.model_path(ModelType::TextDetection),
        &manager.model_path(ModelType::TextRecognition),
        &manager.model_path(ModelType::CharacterDictionary),
        &config.ocr,
    )?;
    let analyzer = OnnxFaceAnalyzer::new(
        &manager.model_path(ModelType::FaceDetection),
        &manager.model_path(ModelType::FaceEmbedding),
        &config.face,
    )?;
    info!("Vision models loaded from {:?}", manager.models_dir());

    Ok(VisionBackends {
        recognizer: Box::new(recognizer),
        faces: FaceVerifier::new(Box::new(analyzer), config.face.clone()),
    })
}
