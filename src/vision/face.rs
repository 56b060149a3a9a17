//! Face detection, embedding and verification
//!
//! A [`FaceAnalyzer`] finds the most prominent face in an image and maps a
//! face crop to an embedding. [`FaceVerifier`] builds on it to decide whether
//! two images show the same person.

use image::DynamicImage;
use ndarray::{ArrayD, IxDyn};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::FaceSettings;
use crate::error::{EkycError, Result};
use crate::vision::loader::{read_image, ImageSource};
use crate::vision::models::OnnxSession;
use crate::vision::preprocess::preprocess_fixed_size;

/// Face embedding vector, L2-normalised
pub type Embedding = Vec<f32>;

/// Detected face location
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceRegion {
    /// Bounding box (x, y, width, height)
    pub bounds: (u32, u32, u32, u32),
    /// Detector confidence (0.0 - 1.0)
    pub score: f32,
}

/// Face detection and embedding backend
pub trait FaceAnalyzer {
    /// Most confident face in the image, if any
    fn detect_face(&mut self, image: &DynamicImage) -> Result<Option<FaceRegion>>;

    /// Embedding of an already cropped face
    fn embed(&mut self, face: &DynamicImage) -> Result<Embedding>;
}

/// Detect the most confident face and crop it with `padding` (fraction of the
/// face size) added on every side
pub fn detect_and_extract_face(
    analyzer: &mut dyn FaceAnalyzer,
    image: &DynamicImage,
    padding: f32,
) -> Result<Option<DynamicImage>> {
    let Some(region) = analyzer.detect_face(image)? else {
        warn!("No face detected in the image.");
        return Ok(None);
    };

    let (x, y, w, h) = pad_bounds(region.bounds, padding, image.width(), image.height());
    if w == 0 || h == 0 {
        warn!("Detected face has an empty bounding box: {:?}", region.bounds);
        return Ok(None);
    }
    debug!("Face detected at {:?} with score {:.3}", (x, y, w, h), region.score);

    Ok(Some(image.crop_imm(x, y, w, h)))
}

fn pad_bounds(
    bounds: (u32, u32, u32, u32),
    padding: f32,
    max_w: u32,
    max_h: u32,
) -> (u32, u32, u32, u32) {
    let pad_x = (bounds.2 as f32 * padding).round() as u32;
    let pad_y = (bounds.3 as f32 * padding).round() as u32;

    let x1 = bounds.0.saturating_sub(pad_x).min(max_w);
    let y1 = bounds.1.saturating_sub(pad_y).min(max_h);
    let x2 = (bounds.0 + bounds.2 + pad_x).min(max_w);
    let y2 = (bounds.1 + bounds.3 + pad_y).min(max_h);
    (x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
}

/// Cosine similarity of two embeddings; 0.0 for mismatched or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Outcome of comparing a selfie with a document face
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaceVerdict {
    Match { similarity: f32 },
    Mismatch { similarity: f32 },
    NoFaceInSelfie,
}

impl FaceVerdict {
    pub fn is_match(&self) -> bool {
        matches!(self, FaceVerdict::Match { .. })
    }
}

/// Compares faces with a [`FaceAnalyzer`] and the configured threshold
pub struct FaceVerifier {
    analyzer: Box<dyn FaceAnalyzer>,
    settings: FaceSettings,
}

impl FaceVerifier {
    pub fn new(analyzer: Box<dyn FaceAnalyzer>, settings: FaceSettings) -> Self {
        Self { analyzer, settings }
    }

    /// Crop the face from a document image
    pub fn extract_face(&mut self, image: &DynamicImage) -> Result<Option<DynamicImage>> {
        detect_and_extract_face(self.analyzer.as_mut(), image, self.settings.face_padding)
    }

    /// Compare a selfie with a face already cropped from a document
    pub fn compare(
        &mut self,
        selfie: &DynamicImage,
        document_face: &DynamicImage,
    ) -> Result<FaceVerdict> {
        let Some(selfie_face) = self.extract_face(selfie)? else {
            return Ok(FaceVerdict::NoFaceInSelfie);
        };

        let selfie_embedding = self.analyzer.embed(&selfie_face)?;
        let document_embedding = self.analyzer.embed(document_face)?;
        let similarity = cosine_similarity(&selfie_embedding, &document_embedding);

        let verdict = if similarity >= self.settings.match_threshold {
            FaceVerdict::Match { similarity }
        } else {
            FaceVerdict::Mismatch { similarity }
        };
        info!(
            "Face similarity {:.3} (threshold {:.2}): {:?}",
            similarity, self.settings.match_threshold, verdict
        );
        Ok(verdict)
    }

    /// Compare a saved selfie with a saved document face
    pub fn compare_files(&mut self, selfie_path: &Path, face_path: &Path) -> Result<FaceVerdict> {
        let selfie = read_image(&ImageSource::from_path(selfie_path))?;
        let face = read_image(&ImageSource::from_path(face_path))?;
        self.compare(&selfie, &face)
    }

    /// Embedding of the face in a saved image
    ///
    /// Falls back to the whole image when no face is detected.
    pub fn embedding_for_file(&mut self, path: &Path) -> Result<Embedding> {
        let image = read_image(&ImageSource::from_path(path))?;
        let face = match self.extract_face(&image)? {
            Some(face) => face,
            None => image,
        };
        self.analyzer.embed(&face)
    }
}

/// UltraFace detector input size
const DETECTOR_WIDTH: u32 = 320;
const DETECTOR_HEIGHT: u32 = 240;
/// ArcFace input size
const EMBEDDER_SIZE: u32 = 112;

/// Face analysis with the UltraFace detector and the ArcFace embedder
pub struct OnnxFaceAnalyzer {
    detector: OnnxSession,
    embedder: OnnxSession,
    detection_threshold: f32,
}

impl OnnxFaceAnalyzer {
    pub fn new(
        detector_model: &Path,
        embedder_model: &Path,
        settings: &FaceSettings,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            detector: OnnxSession::new(detector_model)?,
            embedder: OnnxSession::new(embedder_model)?,
            detection_threshold: settings.detection_threshold,
        })
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn detect_face(&mut self, image: &DynamicImage) -> Result<Option<FaceRegion>> {
        let input = preprocess_fixed_size(image, DETECTOR_WIDTH, DETECTOR_HEIGHT, 127.0, 128.0);
        let outputs = self.detector.run(input)?;

        // scores are [1, N, 2], boxes are [1, N, 4]
        let find = |last_dim: usize| {
            outputs
                .iter()
                .find(|o| o.ndim() == 3 && o.shape()[2] == last_dim)
                .ok_or_else(|| {
                    EkycError::Inference(format!("face detector output with {} columns missing", last_dim))
                })
        };
        let scores = find(2)?;
        let boxes = find(4)?;

        Ok(best_face(scores, boxes, self.detection_threshold, image.width(), image.height()))
    }

    fn embed(&mut self, face: &DynamicImage) -> Result<Embedding> {
        let input = preprocess_fixed_size(face, EMBEDDER_SIZE, EMBEDDER_SIZE, 0.0, 1.0);
        let outputs = self.embedder.run(input)?;
        let raw = outputs
            .into_iter()
            .next()
            .ok_or_else(|| EkycError::Inference("face embedder returned no output".into()))?;

        Ok(l2_normalize(raw.iter().copied().collect()))
    }
}

/// Highest scoring box above `threshold`, scaled from normalised corners to pixels
fn best_face(
    scores: &ArrayD<f32>,
    boxes: &ArrayD<f32>,
    threshold: f32,
    width: u32,
    height: u32,
) -> Option<FaceRegion> {
    let candidates = scores.shape()[1].min(boxes.shape()[1]);
    let (index, score) = (0..candidates)
        .map(|i| (i, scores[IxDyn(&[0, i, 1])]))
        .filter(|(_, score)| *score > threshold)
        .max_by(|a, b| a.1.total_cmp(&b.1))?;

    let clamp = |v: f32, max: u32| (v.clamp(0.0, 1.0) * max as f32).round() as u32;
    let x1 = clamp(boxes[IxDyn(&[0, index, 0])], width);
    let y1 = clamp(boxes[IxDyn(&[0, index, 1])], height);
    let x2 = clamp(boxes[IxDyn(&[0, index, 2])], width);
    let y2 = clamp(boxes[IxDyn(&[0, index, 3])], height);

    Some(FaceRegion {
        bounds: (x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1)),
        score,
    })
}

fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use ndarray::Array3;
    use tempfile::TempDir;

    use crate::vision::loader::save_image;

    /// Treats any non-black image as a face filling the frame and embeds the
    /// mean colour
    pub(crate) struct ColorFaceAnalyzer;

    impl FaceAnalyzer for ColorFaceAnalyzer {
        fn detect_face(&mut self, image: &DynamicImage) -> Result<Option<FaceRegion>> {
            let rgb = image.to_rgb8();
            if rgb.pixels().all(|p| p.0 == [0, 0, 0]) {
                return Ok(None);
            }
            Ok(Some(FaceRegion {
                bounds: (0, 0, image.width(), image.height()),
                score: 0.99,
            }))
        }

        fn embed(&mut self, face: &DynamicImage) -> Result<Embedding> {
            let rgb = face.to_rgb8();
            let count = (rgb.width() * rgb.height()).max(1) as f32;
            let mut sums = [0.0f32; 3];
            for pixel in rgb.pixels() {
                for c in 0..3 {
                    sums[c] += pixel[c] as f32;
                }
            }
            Ok(l2_normalize(sums.iter().map(|s| s / count).collect()))
        }
    }

    pub(crate) fn solid(color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(24, 24, Rgb(color)))
    }

    fn verifier() -> FaceVerifier {
        FaceVerifier::new(Box::new(ColorFaceAnalyzer), FaceSettings::default())
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 2.0], &[-1.0, -2.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_pad_bounds_clamps() {
        assert_eq!(pad_bounds((10, 10, 20, 20), 0.1, 100, 100), (8, 8, 24, 24));
        assert_eq!(pad_bounds((0, 0, 50, 50), 0.5, 60, 60), (0, 0, 60, 60));
    }

    #[test]
    fn test_same_face_matches() {
        let verdict = verifier()
            .compare(&solid([200, 150, 120]), &solid([200, 150, 120]))
            .unwrap();
        assert!(verdict.is_match());
    }

    #[test]
    fn test_different_face_mismatches() {
        let verdict = verifier()
            .compare(&solid([255, 0, 0]), &solid([0, 0, 255]))
            .unwrap();
        assert!(matches!(verdict, FaceVerdict::Mismatch { .. }));
    }

    #[test]
    fn test_blank_selfie_has_no_face() {
        let verdict = verifier()
            .compare(&solid([0, 0, 0]), &solid([200, 150, 120]))
            .unwrap();
        assert_eq!(verdict, FaceVerdict::NoFaceInSelfie);
    }

    #[test]
    fn test_compare_files_and_embedding() {
        let dir = TempDir::new().unwrap();
        let selfie = save_image(&solid([90, 60, 30]), "face_image.png", dir.path()).unwrap();
        let face = save_image(&solid([90, 60, 30]), "extracted_face.png", dir.path()).unwrap();

        let mut verifier = verifier();
        assert!(verifier.compare_files(&selfie, &face).unwrap().is_match());

        let embedding = verifier.embedding_for_file(&selfie).unwrap();
        assert_eq!(embedding.len(), 3);
        let norm: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_best_face_picks_highest_score() {
        let scores = Array3::from_shape_vec((1, 3, 2), vec![0.9, 0.1, 0.2, 0.8, 0.05, 0.95])
            .unwrap()
            .into_dyn();
        let boxes = Array3::from_shape_vec(
            (1, 3, 4),
            vec![
                0.0, 0.0, 0.1, 0.1, //
                0.1, 0.1, 0.5, 0.5, //
                0.25, 0.5, 0.75, 1.0,
            ],
        )
        .unwrap()
        .into_dyn();

        let face = best_face(&scores, &boxes, 0.7, 320, 240).unwrap();
        assert!((face.score - 0.95).abs() < 1e-6);
        assert_eq!(face.bounds, (80, 120, 160, 120));

        assert!(best_face(&scores, &boxes, 0.99, 320, 240).is_none());
    }
}
