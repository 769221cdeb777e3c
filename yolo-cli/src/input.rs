//! Input image discovery.

use std::path::{Path, PathBuf};

use anyhow::Result;
use log::debug;
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// Collect all image paths from a file or directory, sorted.
pub fn collect_images(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    if !path.is_dir() {
        anyhow::bail!(
            "input path is neither file nor directory: {}",
            path.display()
        );
    }

    let mut images = Vec::new();
    for entry in WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let is_image = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image {
            images.push(entry.path().to_path_buf());
        } else {
            debug!("Skipping non-image file {}", entry.path().display());
        }
    }
    images.sort();

    if images.is_empty() {
        anyhow::bail!(
            "no images found at {} (supported extensions: {})",
            path.display(),
            IMAGE_EXTENSIONS.join(", ")
        );
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn walks_directories_and_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("b.PNG"), b"").unwrap();
        fs::write(dir.path().join("nested/a.jpg"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let images = collect_images(dir.path()).unwrap();
        assert_eq!(images.len(), 2);
        assert!(images[0].ends_with("b.PNG"));
        assert!(images[1].ends_with("nested/a.jpg"));
    }

    #[test]
    fn empty_directories_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_images(dir.path()).is_err());
        assert!(collect_images(&dir.path().join("missing")).is_err());
    }
}
