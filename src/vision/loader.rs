//! Image loading and saving

use image::DynamicImage;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::error::{EkycError, Result};

/// Where an input image comes from
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// A file on disk
    Path(PathBuf),
    /// Encoded bytes already in memory (an upload)
    Bytes { name: String, data: Vec<u8> },
}

impl ImageSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        ImageSource::Path(path.into())
    }

    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        ImageSource::Bytes {
            name: name.into(),
            data,
        }
    }

    /// Human-readable origin for log messages
    pub fn describe(&self) -> String {
        match self {
            ImageSource::Path(path) => path.display().to_string(),
            ImageSource::Bytes { name, data } => format!("{} ({} bytes)", name, data.len()),
        }
    }
}

/// Decode an image from a file or from uploaded bytes
pub fn read_image(source: &ImageSource) -> Result<DynamicImage> {
    let decoded = match source {
        ImageSource::Path(path) => {
            let data = std::fs::read(path).map_err(|e| EkycError::ImageIo {
                path: path.clone(),
                source: e,
            });
            data.and_then(|bytes| decode(&bytes, source))
        }
        ImageSource::Bytes { data, .. } => decode(data, source),
    };

    match &decoded {
        Ok(img) => info!(
            "Loaded image {} ({}x{})",
            source.describe(),
            img.width(),
            img.height()
        ),
        Err(e) => error!("Error loading image: {}", e),
    }
    decoded
}

fn decode(bytes: &[u8], source: &ImageSource) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| EkycError::Decode {
        source_name: source.describe(),
        source: e,
    })
}

/// Save an image into `dir`, replacing any file of the same name
///
/// The format follows the file extension.
pub fn save_image(image: &DynamicImage, filename: &str, dir: &Path) -> Result<PathBuf> {
    let full_path = dir.join(filename);
    let save_error = |reason: String| EkycError::Save {
        path: full_path.clone(),
        reason,
    };

    std::fs::create_dir_all(dir).map_err(|e| save_error(e.to_string()))?;
    if full_path.exists() {
        std::fs::remove_file(&full_path).map_err(|e| save_error(e.to_string()))?;
    }

    // JPEG has no alpha channel
    let is_jpeg = matches!(
        full_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref(),
        Some("jpg") | Some("jpeg")
    );
    let result = if is_jpeg {
        DynamicImage::ImageRgb8(image.to_rgb8()).save(&full_path)
    } else {
        image.save(&full_path)
    };
    result.map_err(|e| save_error(e.to_string()))?;

    info!("Image saved successfully: {:?}", full_path);
    Ok(full_path)
}
