use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use image::{DynamicImage, ImageFormat};

use crate::errors::{PendantDropError, Result};

const SUPPORTED_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// A captured drop image with its acquisition metadata.
///
/// The pixel buffer is shared read-only between the stages of an analysis.
#[derive(Debug, Clone)]
pub struct InputImage {
    pub image: Arc<DynamicImage>,
    pub path: Option<PathBuf>,
    pub filename: String,
    /// Seconds since the start of the acquisition
    pub timestamp: f64,
    /// A copy of this image is already persisted elsewhere (e.g. it was
    /// loaded from disk), so the save collaborator may skip writing it.
    pub is_replicated: bool,
}

impl InputImage {
    /// Wrap an in-memory capture that has not been persisted anywhere.
    pub fn from_image(image: DynamicImage, filename: impl Into<String>, timestamp: f64) -> Self {
        Self {
            image: Arc::new(image),
            path: None,
            filename: filename.into(),
            timestamp,
            is_replicated: false,
        }
    }
}

fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Get all supported image files from a directory (recursively), sorted by path
pub fn get_image_files_in_dir<P: AsRef<Path>>(dir_path: P) -> Result<Vec<PathBuf>> {
    let dir_path = dir_path.as_ref();

    if !dir_path.exists() {
        return Err(PendantDropError::InvalidPath(dir_path.to_path_buf()));
    }

    if !dir_path.is_dir() {
        return Err(PendantDropError::Config(format!(
            "{} is not a directory", dir_path.display()
        )));
    }

    let mut image_files = Vec::new();
    find_image_files_recursive(dir_path, &mut image_files)?;
    image_files.sort();

    Ok(image_files)
}

/// Helper function to recursively search for image files
fn find_image_files_recursive(dir_path: &Path, result: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir_path)? {
        let path = entry?.path();

        if path.is_dir() {
            find_image_files_recursive(&path, result)?;
        } else if path.is_file() && is_supported_image(&path) {
            result.push(path);
        }
    }

    Ok(())
}

/// Load an image from disk; grayscale and colour images are kept as they are
pub fn load_image<P: AsRef<Path>>(path: P, timestamp: f64) -> Result<InputImage> {
    let path = path.as_ref();

    let filename = path.file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| PendantDropError::InvalidPath(path.to_path_buf()))?
        .to_string();

    let image = image::open(path)?;

    Ok(InputImage {
        image: Arc::new(image),
        path: Some(path.to_path_buf()),
        filename,
        timestamp,
        is_replicated: true,
    })
}

/// Load an image sequence, stamping frame `i` with `i * frame_interval`
pub fn load_image_sequence(paths: &[PathBuf], frame_interval: f64) -> Result<Vec<InputImage>> {
    paths
        .iter()
        .enumerate()
        .map(|(i, path)| load_image(path, i as f64 * frame_interval))
        .collect()
}

/// Save an image to the specified path as PNG
pub fn save_image<P: AsRef<Path>>(image: &DynamicImage, path: P) -> Result<()> {
    image.save_with_format(path, ImageFormat::Png)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_filter_is_case_insensitive() {
        assert!(is_supported_image(Path::new("frame_001.PNG")));
        assert!(is_supported_image(Path::new("a/b/frame.tiff")));
        assert!(!is_supported_image(Path::new("notes.txt")));
        assert!(!is_supported_image(Path::new("no_extension")));
    }

    #[test]
    fn in_memory_images_are_not_replicated() {
        let image = DynamicImage::new_luma8(4, 4);
        let input = InputImage::from_image(image, "capture", 2.5);
        assert!(!input.is_replicated);
        assert!(input.path.is_none());
        assert_eq!(input.timestamp, 2.5);
    }

    #[test]
    fn missing_directory_is_reported() {
        let result = get_image_files_in_dir("/definitely/not/a/real/dir");
        assert!(matches!(result, Err(PendantDropError::InvalidPath(_))));
    }
}
