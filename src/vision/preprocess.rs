//! Image preprocessing for ONNX models
//!
//! Handles resizing, normalization, and tensor conversion for the
//! PaddleOCR text models and the face models.

use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::{Array3, Array4};

/// Preprocessing configuration for the text models
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Longest side for the detection model input
    pub det_target_size: u32,
    /// Target height for recognition model (typically 48)
    pub rec_target_height: u32,
    /// Maximum width for recognition
    pub rec_max_width: u32,
    /// Mean values for normalization [R, G, B]
    pub mean: [f32; 3],
    /// Std values for normalization [R, G, B]
    pub std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            det_target_size: 960,
            rec_target_height: 48,
            rec_max_width: 640,
            // Maps [0, 1] to [-1, 1]
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
        }
    }
}

/// Convert an RGB image to an HWC f32 array scaled to 0-1
pub fn rgb_to_f32(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut rgb = Array3::<f32>::zeros((height as usize, width as usize, 3));

    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            rgb[[y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
        }
    }

    rgb
}

/// Normalize image with mean and std
pub fn normalize(image: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let mut normalized = image.clone();
    for ((_, _, c), value) in normalized.indexed_iter_mut() {
        *value = (*value - mean[c]) / std[c];
    }
    normalized
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    let (h, w, c) = image.dim();
    let mut tensor = Array4::<f32>::zeros((1, c, h, w));

    for ((y, x, ch), value) in image.indexed_iter() {
        tensor[[0, ch, y, x]] = *value;
    }

    tensor
}

/// Resize image so its longest side is `target_size`, then pad with zeros
/// so both sides are multiples of 32 (required by the detection model).
/// Returns (resized_image, scale_factor)
pub fn resize_for_detection(image: &Array3<f32>, target_size: u32) -> (Array3<f32>, f32) {
    let (h, w, c) = image.dim();
    if h == 0 || w == 0 {
        return (Array3::<f32>::zeros((32, 32, c)), 1.0);
    }

    let scale = target_size as f32 / h.max(w) as f32;
    let new_h = ((h as f32 * scale) as usize).max(1);
    let new_w = ((w as f32 * scale) as usize).max(1);

    let padded_h = new_h.div_ceil(32) * 32;
    let padded_w = new_w.div_ceil(32) * 32;

    let mut resized = Array3::<f32>::zeros((padded_h, padded_w, c));
    bilinear_into(image, &mut resized, new_h, new_w, scale, scale);

    (resized, scale)
}

/// Resize image for recognition model (fixed height, variable width)
pub fn resize_for_recognition(image: &Array3<f32>, target_height: u32, max_width: u32) -> Array3<f32> {
    let (h, w, c) = image.dim();
    let new_h = target_height as usize;
    if h == 0 || w == 0 {
        return Array3::<f32>::zeros((new_h, 4, c));
    }

    let scale = target_height as f32 / h as f32;
    let new_w = (((w as f32 * scale) as u32).min(max_width) as usize).max(4);
    let scale_x = new_w as f32 / w as f32;

    let mut resized = Array3::<f32>::zeros((new_h, new_w, c));
    bilinear_into(image, &mut resized, new_h, new_w, scale, scale_x);

    resized
}

/// Fill the top-left `out_h` x `out_w` of `dst` with a bilinear resample of `src`
fn bilinear_into(
    src: &Array3<f32>,
    dst: &mut Array3<f32>,
    out_h: usize,
    out_w: usize,
    scale_y: f32,
    scale_x: f32,
) {
    let (h, w, c) = src.dim();

    for y in 0..out_h {
        for x in 0..out_w {
            let src_y = (y as f32 / scale_y).min(h as f32 - 1.0);
            let src_x = (x as f32 / scale_x).min(w as f32 - 1.0);

            let y0 = src_y.floor() as usize;
            let y1 = (y0 + 1).min(h - 1);
            let x0 = src_x.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);

            let fy = src_y - y0 as f32;
            let fx = src_x - x0 as f32;

            for ch in 0..c {
                let v0 = src[[y0, x0, ch]] * (1.0 - fx) + src[[y0, x1, ch]] * fx;
                let v1 = src[[y1, x0, ch]] * (1.0 - fx) + src[[y1, x1, ch]] * fx;
                dst[[y, x, ch]] = v0 * (1.0 - fy) + v1 * fy;
            }
        }
    }
}

/// Crop an axis-aligned box (x, y, width, height) from an HWC image
pub fn crop_box(image: &Array3<f32>, bounds: (u32, u32, u32, u32)) -> Array3<f32> {
    let (img_h, img_w, c) = image.dim();
    let x1 = (bounds.0 as usize).min(img_w);
    let y1 = (bounds.1 as usize).min(img_h);
    let x2 = (x1 + bounds.2 as usize).min(img_w);
    let y2 = (y1 + bounds.3 as usize).min(img_h);

    if x2 <= x1 || y2 <= y1 {
        return Array3::<f32>::zeros((1, 1, c));
    }

    image
        .slice(ndarray::s![y1..y2, x1..x2, ..])
        .to_owned()
}

/// Full preprocessing pipeline for text detection
pub fn preprocess_for_detection(image: &RgbImage, config: &PreprocessConfig) -> (Array4<f32>, f32) {
    let rgb = rgb_to_f32(image);
    let (resized, scale) = resize_for_detection(&rgb, config.det_target_size);
    let normalized = normalize(&resized, &config.mean, &config.std);
    (hwc_to_nchw(&normalized), scale)
}

/// Full preprocessing pipeline for text recognition
pub fn preprocess_for_recognition(image: &Array3<f32>, config: &PreprocessConfig) -> Array4<f32> {
    let resized = resize_for_recognition(image, config.rec_target_height, config.rec_max_width);
    let normalized = normalize(&resized, &config.mean, &config.std);
    hwc_to_nchw(&normalized)
}

/// Resize to a fixed model input and normalize raw 0-255 pixels as
/// `(pixel - mean) / std`
pub fn preprocess_fixed_size(
    image: &DynamicImage,
    width: u32,
    height: u32,
    mean: f32,
    std: f32,
) -> Array4<f32> {
    let resized = image.resize_exact(width, height, FilterType::Triangle).to_rgb8();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - mean) / std;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_rgb_to_f32() {
        let mut img = RgbImage::new(2, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));
        img.put_pixel(0, 1, Rgb([0, 0, 255]));
        img.put_pixel(1, 1, Rgb([128, 128, 128]));

        let rgb = rgb_to_f32(&img);

        assert!((rgb[[0, 0, 0]] - 1.0).abs() < 0.01);
        assert!(rgb[[0, 0, 1]].abs() < 0.01);
        assert!((rgb[[0, 1, 1]] - 1.0).abs() < 0.01);
        assert!((rgb[[1, 0, 2]] - 1.0).abs() < 0.01);
        assert!((rgb[[1, 1, 0]] - 0.502).abs() < 0.01);
    }

    #[test]
    fn test_hwc_to_nchw() {
        let hwc = Array3::<f32>::from_shape_fn((10, 20, 3), |(h, w, c)| (h * 100 + w * 10 + c) as f32);

        let nchw = hwc_to_nchw(&hwc);

        assert_eq!(nchw.dim(), (1, 3, 10, 20));
        assert_eq!(nchw[[0, 1, 5, 10]], hwc[[5, 10, 1]]);
    }

    #[test]
    fn test_normalize() {
        let image = Array3::<f32>::from_elem((2, 2, 3), 0.5);
        let normalized = normalize(&image, &[0.5, 0.5, 0.5], &[0.5, 0.5, 0.5]);
        assert!(normalized.iter().all(|v| v.abs() < 1e-6));

        let image = Array3::<f32>::from_elem((1, 1, 3), 1.0);
        let normalized = normalize(&image, &[0.5, 0.5, 0.5], &[0.5, 0.5, 0.5]);
        assert!((normalized[[0, 0, 2]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_detection_resize_pads_to_multiple_of_32() {
        let image = Array3::<f32>::from_elem((50, 100, 3), 1.0);
        let (resized, scale) = resize_for_detection(&image, 960);

        assert!((scale - 9.6).abs() < 1e-4);
        let (h, w, _) = resized.dim();
        assert_eq!(w, 960);
        assert_eq!(h, 480);
        assert_eq!(h % 32, 0);
    }

    #[test]
    fn test_recognition_resize_caps_width() {
        let image = Array3::<f32>::from_elem((10, 1000, 3), 0.3);
        let resized = resize_for_recognition(&image, 48, 640);
        assert_eq!(resized.dim(), (48, 640, 3));
        assert!((resized[[20, 300, 1]] - 0.3).abs() < 1e-5);
    }

    #[test]
    fn test_crop_box_clamps_to_image() {
        let image = Array3::<f32>::from_shape_fn((10, 10, 3), |(y, x, _)| (y * 10 + x) as f32);
        let crop = crop_box(&image, (8, 8, 5, 5));
        assert_eq!(crop.dim(), (2, 2, 3));
        assert_eq!(crop[[0, 0, 0]], 88.0);

        let empty = crop_box(&image, (20, 20, 5, 5));
        assert_eq!(empty.dim(), (1, 1, 3));
    }

    #[test]
    fn test_fixed_size_tensor() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(30, 40, Rgb([255, 127, 0])));
        let tensor = preprocess_fixed_size(&img, 112, 112, 127.5, 127.5);

        assert_eq!(tensor.dim(), (1, 3, 112, 112));
        assert!((tensor[[0, 0, 50, 50]] - 1.0).abs() < 1e-3);
        assert!((tensor[[0, 2, 50, 50]] + 1.0).abs() < 1e-3);
    }
}
