//! Artifact store contract and its implementations.

pub mod filesystem;
pub mod memory;

pub use filesystem::FileArtifactStore;
pub use memory::MemoryArtifactStore;

use chrono::Duration;

use crate::error::StorageError;

/// Holds merged manifests and other derived artifacts. Paths are relative,
/// `/`-separated keys.
pub trait ArtifactStore: Send + Sync {
    /// Stores `bytes` at `path`, replacing any previous content, and returns
    /// the stored artifact's reference.
    fn put(&self, path: &str, bytes: &[u8]) -> Result<String, StorageError>;

    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// A link to the artifact that stops being valid after `ttl`.
    fn create_temporary_link(&self, path: &str, ttl: Duration) -> Result<String, StorageError>;
}

/// Rejects keys that are empty, absolute, or step outside the store root.
pub(crate) fn validate_key(path: &str) -> Result<(), StorageError> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.starts_with('\\')
        || path
            .split(['/', '\\'])
            .any(|segment| segment.is_empty() || segment == "..");
    if invalid {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("jobs/j1/manifest.json").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("jobs/../../secret").is_err());
        assert!(validate_key("jobs//x").is_err());
    }
}
