//! Document region detection
//!
//! Finds the identity document in a photo as the largest outer contour of
//! an adaptively thresholded image and crops to its bounding box.

use image::{DynamicImage, GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::filter::{box_filter, gaussian_blur_f32};
use imageproc::point::Point;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::Result;
use crate::vision::loader::save_image;

/// Sigma matching a 5x5 Gaussian kernel
const BLUR_SIGMA: f32 = 1.1;
/// Neighbourhood radius of the adaptive threshold (11x11 block)
const THRESHOLD_BLOCK_RADIUS: u32 = 5;
/// Subtracted from the neighbourhood mean before comparing
const THRESHOLD_OFFSET: i16 = 2;

/// Bounding box of the located document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Area enclosed by the contour, in pixels
    pub contour_area: u64,
}

/// Cropped document and where it was saved
#[derive(Debug)]
pub struct LocatedDocument {
    pub image: DynamicImage,
    pub region: DocumentRegion,
    pub saved_to: PathBuf,
}

/// Binary image: 255 where a pixel is brighter than its local mean minus the offset
pub fn adaptive_threshold_mean(gray: &GrayImage) -> GrayImage {
    let means = box_filter(gray, THRESHOLD_BLOCK_RADIUS, THRESHOLD_BLOCK_RADIUS);
    let mut out = GrayImage::new(gray.width(), gray.height());

    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let value = gray.get_pixel(x, y)[0] as i16;
        let mean = means.get_pixel(x, y)[0] as i16;
        *pixel = if value > mean - THRESHOLD_OFFSET {
            Luma([255])
        } else {
            Luma([0])
        };
    }
    out
}

/// Find the bounding box of the largest outer contour
pub fn find_document_region(image: &DynamicImage) -> Option<DocumentRegion> {
    let gray = image.to_luma8();
    let blurred = gaussian_blur_f32(&gray, BLUR_SIGMA);
    let binary = adaptive_threshold_mean(&blurred);

    let contours: Vec<Contour<i32>> = find_contours(&binary);
    let largest = contours
        .iter()
        .filter(|c| c.parent.is_none() && c.border_type == BorderType::Outer)
        .map(|c| (c, polygon_area(&c.points)))
        .filter(|(_, area)| *area > 0.0)
        .max_by(|a, b| a.1.total_cmp(&b.1));

    let Some((contour, area)) = largest else {
        warn!("No contours found, or the largest contour has zero area.");
        return None;
    };

    let region = bounding_rect(&contour.points, area)?;
    info!(
        "Contours are found at {:?} enclosing {} px",
        (region.x, region.y, region.width, region.height),
        region.contour_area
    );
    Some(region)
}

/// Locate the document, crop it and save the crop into `dir`
pub fn extract_image_from_id(
    image: &DynamicImage,
    filename: &str,
    dir: &Path,
) -> Result<Option<LocatedDocument>> {
    let Some(region) = find_document_region(image) else {
        return Ok(None);
    };

    let crop = image.crop_imm(region.x, region.y, region.width, region.height);
    let saved_to = save_image(&crop, filename, dir)?;

    Ok(Some(LocatedDocument {
        image: crop,
        region,
        saved_to,
    }))
}

/// Shoelace area of a closed polygon
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice_area: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
        .sum();
    (twice_area as f64 / 2.0).abs()
}

fn bounding_rect(points: &[Point<i32>], area: f64) -> Option<DocumentRegion> {
    let min_x = points.iter().map(|p| p.x).min()?;
    let max_x = points.iter().map(|p| p.x).max()?;
    let min_y = points.iter().map(|p| p.y).min()?;
    let max_y = points.iter().map(|p| p.y).max()?;

    Some(DocumentRegion {
        x: min_x.max(0) as u32,
        y: min_y.max(0) as u32,
        width: (max_x - min_x + 1) as u32,
        height: (max_y - min_y + 1) as u32,
        contour_area: area.round() as u64,
    })
}
