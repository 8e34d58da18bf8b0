use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::BatchError;

/// Local directory receiving downloaded artifacts, with deterministic file
/// names derived from a base name and the unit index.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: Utf8PathBuf,
    base_name: String,
    extension: String,
    total: usize,
}

impl ArtifactStore {
    pub fn new(
        root: Utf8PathBuf,
        base_name: impl Into<String>,
        extension: impl Into<String>,
        total: usize,
    ) -> Self {
        Self {
            root,
            base_name: base_name.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
            total,
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// `<base>_<index:04>.<ext>` for multi-unit batches, `<base>.<ext>` when
    /// the batch has a single unit.
    pub fn artifact_path(&self, index: usize) -> Utf8PathBuf {
        let file_name = if self.total > 1 {
            format!("{}_{index:04}.{}", self.base_name, self.extension)
        } else {
            format!("{}.{}", self.base_name, self.extension)
        };
        self.root.join(file_name)
    }

    pub fn ensure_root(&self) -> Result<(), BatchError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| BatchError::Filesystem(err.to_string()))
    }

    /// Runs `write` against a temporary file next to `dest` and moves it into
    /// place only when `write` succeeds, so an interrupted download never
    /// leaves a truncated artifact under its final name.
    pub fn write_atomic<F>(&self, dest: &Utf8Path, write: F) -> Result<u64, BatchError>
    where
        F: FnOnce(&Path) -> Result<u64, BatchError>,
    {
        let parent = dest
            .parent()
            .ok_or_else(|| BatchError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| BatchError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix("edream-batch")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| BatchError::Filesystem(err.to_string()))?;
        let bytes = write(temp.path())?;
        temp.persist(dest.as_std_path())
            .map_err(|err| BatchError::Filesystem(err.to_string()))?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_names_are_zero_padded_for_batches() {
        let store = ArtifactStore::new(Utf8PathBuf::from("out"), "qwen-image", "png", 12);
        assert_eq!(store.artifact_path(3), Utf8PathBuf::from("out/qwen-image_0003.png"));
        assert_eq!(
            store.artifact_path(12),
            Utf8PathBuf::from("out/qwen-image_0012.png")
        );
    }

    #[test]
    fn single_artifact_has_no_index() {
        let store = ArtifactStore::new(Utf8PathBuf::from("out"), "cover", ".png", 1);
        assert_eq!(store.artifact_path(1), Utf8PathBuf::from("out/cover.png"));
    }

    #[test]
    fn failed_write_leaves_no_file() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = ArtifactStore::new(root, "img", "png", 1);
        let dest = store.artifact_path(1);

        let err = store
            .write_atomic(&dest, |_| Err(BatchError::Http("reset".to_string())))
            .unwrap_err();
        assert!(matches!(err, BatchError::Http(_)));
        assert!(!dest.as_std_path().exists());

        let bytes = store
            .write_atomic(&dest, |path| {
                fs::write(path, b"png").unwrap();
                Ok(3)
            })
            .unwrap();
        assert_eq!(bytes, 3);
        assert_eq!(fs::read(dest.as_std_path()).unwrap(), b"png");
    }
}
