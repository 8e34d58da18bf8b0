use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BatchError;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

/// Image files directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, BatchError> {
    if !dir.exists() {
        return Err(BatchError::InvalidConfig(format!(
            "image directory not found: {}",
            dir.display()
        )));
    }
    if !dir.is_dir() {
        return Err(BatchError::InvalidConfig(format!(
            "image_path must be a directory: {}",
            dir.display()
        )));
    }

    let entries = fs::read_dir(dir)
        .map_err(|err| BatchError::Filesystem(format!("read {}: {err}", dir.display())))?;
    let mut images = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|err| BatchError::Filesystem(err.to_string()))?
            .path();
        if path.is_file() && is_image(&path) {
            images.push(path);
        }
    }

    if images.is_empty() {
        return Err(BatchError::EmptyInput(format!(
            "no image files found in {}",
            dir.display()
        )));
    }
    images.sort();
    Ok(images)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn lists_only_images_sorted() {
        let temp = tempfile::tempdir().unwrap();
        for name in ["b.PNG", "a.jpg", "notes.txt", "c.webp"] {
            fs::write(temp.path().join(name), b"x").unwrap();
        }
        fs::create_dir(temp.path().join("nested.png")).unwrap();

        let images = list_images(temp.path()).unwrap();
        let names = images
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.jpg", "b.PNG", "c.webp"]);
    }

    #[test]
    fn empty_directory_is_an_input_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = list_images(temp.path()).unwrap_err();
        assert_matches!(err, BatchError::EmptyInput(_));
    }

    #[test]
    fn missing_directory_is_a_config_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = list_images(&temp.path().join("missing")).unwrap_err();
        assert_matches!(err, BatchError::InvalidConfig(_));
    }
}
