use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{Duration, Utc};

use super::{validate_key, ArtifactStore};
use crate::error::StorageError;

/// Process-local store, mostly for tests and dry runs.
#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<String, StorageError> {
        validate_key(path)?;
        let mut objects = self
            .objects
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        objects.insert(path.to_string(), bytes.to_vec());
        Ok(path.to_string())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(path)?;
        let objects = self
            .objects
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        objects
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn create_temporary_link(&self, path: &str, ttl: Duration) -> Result<String, StorageError> {
        self.get(path)?;
        Ok(format!(
            "memory://{}?expires={}",
            path,
            (Utc::now() + ttl).timestamp()
        ))
    }
}
