use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};

use super::{validate_key, ArtifactStore};
use crate::error::StorageError;

/// Stores artifacts as files under a root directory.
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_key(path)?;
        Ok(self.root.join(path))
    }

    fn ensure_directory(&self, path: &Path) -> Result<(), StorageError> {
        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }
}

impl ArtifactStore for FileArtifactStore {
    /// Writes to a sibling temp file and renames it into place so readers
    /// never observe a partial artifact.
    fn put(&self, path: &str, bytes: &[u8]) -> Result<String, StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            self.ensure_directory(parent)?;
        }

        let tmp = target.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let write_tmp = || -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()
        };
        write_tmp().map_err(|e| StorageError::WriteFile {
            path: tmp.clone(),
            source: e,
        })?;

        if let Err(e) = std::fs::rename(&tmp, &target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(StorageError::WriteFile {
                path: target,
                source: e,
            });
        }

        log::debug!("Stored artifact {} ({} bytes)", target.display(), bytes.len());
        Ok(path.to_string())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(path)?;
        std::fs::read(&target).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path.to_string())
            } else {
                StorageError::ReadFile {
                    path: target,
                    source: e,
                }
            }
        })
    }

    fn create_temporary_link(&self, path: &str, ttl: Duration) -> Result<String, StorageError> {
        let target = self.resolve(path)?;
        if !target.is_file() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        let expires = (Utc::now() + ttl).timestamp();
        Ok(format!("file://{}?expires={}", target.display(), expires))
    }
}
