// Storage abstraction for the durable device cache

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Key-value persistence supplied by the host platform
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String>;
    fn remove(&self, key: &[u8]) -> Result<(), String>;
    fn flush(&self) -> Result<(), String>;
}

/// In-memory storage useful for testing and simulation
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        self.data.write().remove(key);
        Ok(())
    }

    fn flush(&self) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub struct SledStorage {
    db: sled::Db,
}

#[cfg(not(target_arch = "wasm32"))]
impl SledStorage {
    pub fn new(path: &str) -> std::result::Result<Self, String> {
        let db = sled::open(path).map_err(|e| e.to_string())?;
        Ok(Self { db })
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl StorageBackend for SledStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), String> {
        self.db.insert(key, value).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, String> {
        let value = self.db.get(key).map_err(|e| e.to_string())?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &[u8]) -> Result<(), String> {
        self.db.remove(key).map_err(|e| e.to_string())?;
        Ok(())
    }

    fn flush(&self) -> Result<(), String> {
        self.db.flush().map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_put_get_remove() {
        let storage = MemoryStorage::new();
        assert!(storage.is_empty());

        storage.put(b"device_name", b"Watch-42").unwrap();
        assert_eq!(storage.get(b"device_name").unwrap(), Some(b"Watch-42".to_vec()));
        assert_eq!(storage.len(), 1);

        storage.remove(b"device_name").unwrap();
        assert_eq!(storage.get(b"device_name").unwrap(), None);
    }

    #[test]
    fn test_memory_storage_clones_share_data() {
        let storage = MemoryStorage::new();
        let clone = storage.clone();

        storage.put(b"k", b"v").unwrap();
        assert_eq!(clone.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
