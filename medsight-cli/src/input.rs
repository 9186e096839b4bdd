//! Input collection.

use std::path::{Path, PathBuf};

use anyhow::Result;
use log::debug;
use medsight_utils::{config::UploadSettings, file_extension};
use walkdir::WalkDir;

/// Collect image paths from a file or directory.
///
/// A single file is returned as-is so the service decides whether it is acceptable. Directory
/// walks keep only extensions the upload policy allows.
pub fn collect_images(path: &Path, upload: &UploadSettings) -> Result<Vec<PathBuf>> {
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
        let name = entry.file_name().to_string_lossy();
        match file_extension(&name) {
            Some(ext) if upload.allows(&ext, None) => images.push(entry.path().to_path_buf()),
            _ => debug!("Skipping non-image file {}", entry.path().display()),
        }
    }
    images.sort();
    Ok(images)
}
