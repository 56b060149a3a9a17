//! OCR (Optical Character Recognition) module
//!
//! Uses PaddleOCR models via ONNX Runtime for text detection and recognition.
//! Recognized fragments are collected into an [`OcrOutput`], which offers the
//! pipe-delimited and newline-delimited views the extractors consume.

use image::{DynamicImage, GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::{ArrayD, ArrayView2, Axis, Ix2};
use std::path::Path;
use tracing::{debug, error, info};

use crate::config::OcrSettings;
use crate::error::{EkycError, Result};
use crate::vision::models::OnnxSession;
use crate::vision::preprocess::{
    crop_box, preprocess_for_detection, preprocess_for_recognition, rgb_to_f32, PreprocessConfig,
};

/// Expansion ratio applied to detected text boxes
const UNCLIP_RATIO: f32 = 1.5;

/// Single recognized text fragment
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedText {
    /// Recognized text
    pub text: String,
    /// Recognition confidence (0.0 - 1.0)
    pub confidence: f32,
    /// Bounding box (x, y, width, height) in source image pixels
    pub bounds: (u32, u32, u32, u32),
}

impl RecognizedText {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            bounds: (0, 0, 0, 0),
        }
    }

    pub fn with_bounds(mut self, bounds: (u32, u32, u32, u32)) -> Self {
        self.bounds = bounds;
        self
    }
}

/// Ordered text fragments that passed the confidence filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OcrOutput {
    fragments: Vec<RecognizedText>,
}

impl OcrOutput {
    pub fn new(fragments: Vec<RecognizedText>) -> Self {
        Self { fragments }
    }

    /// Keep fragments whose confidence is strictly above `threshold`, in order
    pub fn from_fragments(raw: Vec<RecognizedText>, threshold: f32) -> Self {
        let fragments = raw
            .into_iter()
            .filter(|fragment| fragment.confidence > threshold)
            .collect();
        Self { fragments }
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn fragments(&self) -> &[RecognizedText] {
        &self.fragments
    }

    /// Every fragment followed by `|`, e.g. `"GOVT OF INDIA|John Doe|"`
    pub fn pipe_delimited(&self) -> String {
        self.fragments
            .iter()
            .map(|fragment| format!("{}|", fragment.text))
            .collect()
    }

    /// Fragments joined with `\n`
    pub fn newline_delimited(&self) -> String {
        self.fragments
            .iter()
            .map(|fragment| fragment.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A text recognition backend
pub trait TextRecognizer {
    /// Detect and recognize every text fragment, in reading order
    fn recognize(&mut self, image: &DynamicImage) -> Result<Vec<RecognizedText>>;
}

/// Run OCR and filter by the configured confidence threshold
///
/// Recognizer failures are logged and reported as an empty output.
pub fn extract_text(
    recognizer: &mut dyn TextRecognizer,
    image: &DynamicImage,
    settings: &OcrSettings,
) -> OcrOutput {
    info!("Text extraction started...");

    match recognizer.recognize(image) {
        Ok(raw) => {
            let raw_count = raw.len();
            let output = OcrOutput::from_fragments(raw, settings.confidence_threshold);
            debug!(
                "Kept {} of {} fragments above confidence {}",
                output.fragments().len(),
                raw_count,
                settings.confidence_threshold
            );
            info!("Text extraction completed successfully.");
            output
        }
        Err(e) => {
            error!("An error occurred during text extraction: {}", e);
            OcrOutput::default()
        }
    }
}

/// OCR engine using PaddleOCR via ONNX Runtime
pub struct OnnxTextRecognizer {
    detection: OnnxSession,
    recognition: OnnxSession,
    dictionary: Vec<char>,
    preprocess: PreprocessConfig,
    detection_threshold: f32,
    min_box_area: u32,
}

impl OnnxTextRecognizer {
    /// Load the detection and recognition models and the character dictionary
    pub fn new(
        detection_model: &Path,
        recognition_model: &Path,
        dictionary_path: &Path,
        settings: &OcrSettings,
    ) -> anyhow::Result<Self> {
        let detection = OnnxSession::new(detection_model)?;
        let recognition = OnnxSession::new(recognition_model)?;
        let dictionary = load_dictionary(dictionary_path)?;
        info!("Loaded character dictionary with {} entries", dictionary.len());

        Ok(Self {
            detection,
            recognition,
            dictionary,
            preprocess: PreprocessConfig::default(),
            detection_threshold: settings.detection_threshold,
            min_box_area: settings.min_box_area,
        })
    }

    /// Find text boxes in source image coordinates
    fn detect_boxes(&mut self, image: &DynamicImage) -> Result<Vec<(u32, u32, u32, u32)>> {
        let (input, scale) = preprocess_for_detection(&image.to_rgb8(), &self.preprocess);
        let outputs = self.detection.run(input)?;
        let probability = outputs
            .into_iter()
            .next()
            .ok_or_else(|| EkycError::Inference("detection model returned no output".into()))?;

        let boxes = boxes_from_probability_map(
            &probability,
            self.detection_threshold,
            self.min_box_area,
        )?;

        let (width, height) = (image.width(), image.height());
        Ok(boxes
            .into_iter()
            .map(|b| scale_box(b, scale, width, height))
            .filter(|b| b.2 > 0 && b.3 > 0)
            .collect())
    }
}

impl TextRecognizer for OnnxTextRecognizer {
    fn recognize(&mut self, image: &DynamicImage) -> Result<Vec<RecognizedText>> {
        let boxes = self.detect_boxes(image)?;
        debug!("Detected {} text regions", boxes.len());

        let rgb = rgb_to_f32(&image.to_rgb8());
        let mut fragments = Vec::with_capacity(boxes.len());

        for bounds in boxes {
            let crop = crop_box(&rgb, bounds);
            let input = preprocess_for_recognition(&crop, &self.preprocess);
            let outputs = self.recognition.run(input)?;
            let Some(logits) = outputs.into_iter().next() else {
                continue;
            };

            let (text, confidence) = ctc_greedy_decode(sequence_view(&logits)?, &self.dictionary);
            let text = text.trim().to_string();
            if text.is_empty() {
                continue;
            }
            debug!("Recognized {:?} ({:.3}) at {:?}", text, confidence, bounds);
            fragments.push(RecognizedText::new(text, confidence).with_bounds(bounds));
        }

        Ok(fragments)
    }
}

/// Dictionary with the CTC blank at index 0 and a trailing space
pub fn load_dictionary(path: &Path) -> anyhow::Result<Vec<char>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to open dictionary {}: {}", path.display(), e))?;

    let mut dictionary = vec!['\0'];
    dictionary.extend(content.lines().filter_map(|line| line.chars().next()));
    dictionary.push(' ');
    Ok(dictionary)
}

/// Greedy CTC decoding over a `[timesteps, classes]` score matrix
///
/// Repeats collapse, blanks (index 0) are dropped, and the confidence is the
/// mean score of the emitted characters.
pub fn ctc_greedy_decode(scores: ArrayView2<f32>, dictionary: &[char]) -> (String, f32) {
    let mut text = String::new();
    let mut total = 0.0f32;
    let mut emitted = 0usize;
    let mut previous: Option<usize> = None;

    for step in scores.outer_iter() {
        // first maximum wins ties
        let best = step.iter().enumerate().fold(None, |best, (index, &score)| match best {
            Some((_, top)) if top >= score => best,
            _ => Some((index, score)),
        });
        let Some((index, score)) = best else {
            continue;
        };

        if index != 0 && previous != Some(index) {
            if let Some(&ch) = dictionary.get(index) {
                text.push(ch);
                total += score;
                emitted += 1;
            }
        }
        previous = (index != 0).then_some(index);
    }

    let confidence = if emitted == 0 {
        0.0
    } else {
        (total / emitted as f32).clamp(0.0, 1.0)
    };
    (text, confidence)
}

/// View a `[1, T, C]` or `[T, C]` recognition output as `[T, C]`
fn sequence_view(logits: &ArrayD<f32>) -> Result<ArrayView2<'_, f32>> {
    let view = match logits.ndim() {
        3 => logits.index_axis(Axis(0), 0),
        2 => logits.view(),
        _ => {
            return Err(EkycError::Inference(format!(
                "unexpected recognition output shape {:?}",
                logits.shape()
            )))
        }
    };
    view.into_dimensionality::<Ix2>()
        .map_err(EkycError::inference)
}

/// Bounding boxes of the connected text regions in a DB probability map
///
/// Boxes are in model input coordinates, expanded by [`UNCLIP_RATIO`] and
/// sorted top to bottom, then left to right.
pub fn boxes_from_probability_map(
    probability: &ArrayD<f32>,
    threshold: f32,
    min_area: u32,
) -> Result<Vec<(u32, u32, u32, u32)>> {
    let shape = probability.shape();
    let (height, width) = match shape.len() {
        4 => (shape[2], shape[3]),
        3 => (shape[1], shape[2]),
        2 => (shape[0], shape[1]),
        _ => {
            return Err(EkycError::Inference(format!(
                "unexpected detection output shape {:?}",
                shape
            )))
        }
    };
    let map = probability
        .view()
        .into_shape_with_order((height, width))
        .map_err(EkycError::inference)?;

    let mut binary = GrayImage::new(width as u32, height as u32);
    for ((y, x), &p) in map.indexed_iter() {
        if p > threshold {
            binary.put_pixel(x as u32, y as u32, Luma([255]));
        }
    }

    let labels = connected_components(&binary, Connectivity::Eight, Luma([0u8]));

    // label -> (min_x, min_y, max_x, max_y, pixel count)
    let mut extents: std::collections::HashMap<u32, (u32, u32, u32, u32, u32)> =
        std::collections::HashMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0];
        if label == 0 {
            continue;
        }
        let entry = extents.entry(label).or_insert((x, y, x, y, 0));
        entry.0 = entry.0.min(x);
        entry.1 = entry.1.min(y);
        entry.2 = entry.2.max(x);
        entry.3 = entry.3.max(y);
        entry.4 += 1;
    }

    let mut boxes: Vec<(u32, u32, u32, u32)> = extents
        .into_values()
        .filter(|extent| extent.4 >= min_area)
        .map(|(min_x, min_y, max_x, max_y, _)| {
            unclip(
                (min_x, min_y, max_x - min_x + 1, max_y - min_y + 1),
                width as u32,
                height as u32,
            )
        })
        .collect();

    boxes.sort_by_key(|b| (b.1, b.0));
    Ok(boxes)
}

/// Grow a box on every side by `area * ratio / perimeter`, clamped to the map
fn unclip(b: (u32, u32, u32, u32), max_w: u32, max_h: u32) -> (u32, u32, u32, u32) {
    let (w, h) = (b.2 as f32, b.3 as f32);
    let distance = (w * h * UNCLIP_RATIO / (2.0 * (w + h))).round() as u32;

    let x1 = b.0.saturating_sub(distance);
    let y1 = b.1.saturating_sub(distance);
    let x2 = (b.0 + b.2 + distance).min(max_w);
    let y2 = (b.1 + b.3 + distance).min(max_h);
    (x1, y1, x2 - x1, y2 - y1)
}

/// Map a box from detection input coordinates back to the source image
fn scale_box(b: (u32, u32, u32, u32), scale: f32, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let to_source = |v: u32| (v as f32 / scale).round() as u32;
    let x = to_source(b.0).min(width);
    let y = to_source(b.1).min(height);
    let w = to_source(b.2).min(width - x);
    let h = to_source(b.3).min(height - y);
    (x, y, w, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array4};

    struct FailingRecognizer;

    impl TextRecognizer for FailingRecognizer {
        fn recognize(&mut self, _image: &DynamicImage) -> Result<Vec<RecognizedText>> {
            Err(EkycError::Inference("session crashed".into()))
        }
    }

    struct FixedRecognizer(Vec<RecognizedText>);

    impl TextRecognizer for FixedRecognizer {
        fn recognize(&mut self, _image: &DynamicImage) -> Result<Vec<RecognizedText>> {
            Ok(self.0.clone())
        }
    }

    fn sample_output() -> OcrOutput {
        OcrOutput::new(vec![
            RecognizedText::new("GOVT OF INDIA", 0.9),
            RecognizedText::new("John Doe", 0.8),
        ])
    }

    #[test]
    fn test_pipe_delimited_has_trailing_separator() {
        assert_eq!(sample_output().pipe_delimited(), "GOVT OF INDIA|John Doe|");
        assert_eq!(OcrOutput::default().pipe_delimited(), "");
    }

    #[test]
    fn test_newline_delimited() {
        assert_eq!(sample_output().newline_delimited(), "GOVT OF INDIA\nJohn Doe");
    }

    #[test]
    fn test_threshold_is_strict() {
        let output = OcrOutput::from_fragments(
            vec![
                RecognizedText::new("low", 0.05),
                RecognizedText::new("edge", 0.10),
                RecognizedText::new("kept", 0.11),
            ],
            0.10,
        );
        assert_eq!(output.fragments().len(), 1);
        assert_eq!(output.fragments()[0].text, "kept");
    }

    #[test]
    fn test_extract_text_swallows_recognizer_error() {
        let image = DynamicImage::new_rgb8(8, 8);
        let output = extract_text(&mut FailingRecognizer, &image, &OcrSettings::default());
        assert!(output.is_empty());
    }

    #[test]
    fn test_extract_text_preserves_order() {
        let image = DynamicImage::new_rgb8(8, 8);
        let mut recognizer = FixedRecognizer(vec![
            RecognizedText::new("first", 0.9),
            RecognizedText::new("noise", 0.01),
            RecognizedText::new("second", 0.7),
        ]);
        let output = extract_text(&mut recognizer, &image, &OcrSettings::default());
        assert_eq!(output.newline_delimited(), "first\nsecond");
    }

    #[test]
    fn test_ctc_collapses_repeats_and_drops_blanks() {
        // dictionary: blank, a, b, space
        let dictionary = vec!['\0', 'a', 'b', ' '];
        // argmax per step: a a blank a b b
        let scores = Array2::from_shape_vec(
            (6, 4),
            vec![
                0.1, 0.9, 0.0, 0.0, //
                0.1, 0.9, 0.0, 0.0, //
                0.9, 0.1, 0.0, 0.0, //
                0.2, 0.8, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0, //
                0.0, 0.0, 1.0, 0.0,
            ],
        )
        .unwrap();

        let (text, confidence) = ctc_greedy_decode(scores.view(), &dictionary);
        assert_eq!(text, "aab");
        assert!((confidence - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_ctc_all_blank_is_empty() {
        let scores = Array2::<f32>::zeros((3, 2));
        let (text, confidence) = ctc_greedy_decode(scores.view(), &['\0', 'x']);
        assert!(text.is_empty());
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn test_load_dictionary_adds_blank_and_space() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dict.txt");
        std::fs::write(&path, "0\n1\nA\n").unwrap();

        let dictionary = load_dictionary(&path).unwrap();
        assert_eq!(dictionary, vec!['\0', '0', '1', 'A', ' ']);
    }

    #[test]
    fn test_boxes_from_probability_map() {
        let mut map = Array4::<f32>::zeros((1, 1, 64, 64));
        // lower region first so sorting is exercised
        for y in 40..48 {
            for x in 4..30 {
                map[[0, 0, y, x]] = 0.9;
            }
        }
        for y in 8..16 {
            for x in 10..50 {
                map[[0, 0, y, x]] = 0.8;
            }
        }
        // speck below the area filter
        map[[0, 0, 60, 60]] = 0.9;

        let boxes = boxes_from_probability_map(&map.into_dyn(), 0.3, 16).unwrap();
        assert_eq!(boxes.len(), 2);
        assert!(boxes[0].1 < boxes[1].1);
        // 40x8 region grows by round(320 * 1.5 / 96) = 5 on each side
        assert_eq!(boxes[0], (5, 3, 50, 18));
    }

    #[test]
    fn test_scale_box_clamps_to_source() {
        assert_eq!(scale_box((10, 20, 30, 40), 2.0, 100, 100), (5, 10, 15, 20));
        assert_eq!(scale_box((180, 0, 100, 10), 2.0, 100, 100), (90, 0, 10, 5));
    }
}
