// Durable cache of the paired wearable's identity
//
// The name comes from the pairing step (QR scan) and is what scan results
// are matched against. The address is written once the session reaches
// Ready and enables the direct-connect shortcut on later scans.

use super::backend::StorageBackend;
use crate::error::BleError;
use std::sync::Arc;
use tracing::debug;

pub const KEY_DEVICE_NAME: &str = "device_name";
pub const KEY_DEVICE_ADDRESS: &str = "device_address";

#[derive(Clone)]
pub struct DeviceCache {
    backend: Arc<dyn StorageBackend>,
}

impl DeviceCache {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Read a cached value; empty strings count as absent.
    pub fn get(&self, key: &str) -> Result<Option<String>, BleError> {
        let raw = self.backend.get(key.as_bytes()).map_err(BleError::Storage)?;
        let value = match raw {
            Some(bytes) => Some(
                String::from_utf8(bytes)
                    .map_err(|e| BleError::Storage(format!("{}: {}", key, e)))?,
            ),
            None => None,
        };
        Ok(value.filter(|v| !v.is_empty()))
    }

    pub fn put(&self, key: &str, value: &str) -> Result<(), BleError> {
        self.backend
            .put(key.as_bytes(), value.as_bytes())
            .map_err(BleError::Storage)?;
        self.backend.flush().map_err(BleError::Storage)?;
        debug!(key, "device cache updated");
        Ok(())
    }

    pub fn device_name(&self) -> Result<Option<String>, BleError> {
        self.get(KEY_DEVICE_NAME)
    }

    pub fn device_address(&self) -> Result<Option<String>, BleError> {
        self.get(KEY_DEVICE_ADDRESS)
    }

    pub fn store_device_name(&self, name: &str) -> Result<(), BleError> {
        self.put(KEY_DEVICE_NAME, name)
    }

    pub fn store_device_address(&self, address: &str) -> Result<(), BleError> {
        self.put(KEY_DEVICE_ADDRESS, address)
    }

    /// Forget the paired device entirely.
    pub fn clear(&self) -> Result<(), BleError> {
        self.backend
            .remove(KEY_DEVICE_NAME.as_bytes())
            .map_err(BleError::Storage)?;
        self.backend
            .remove(KEY_DEVICE_ADDRESS.as_bytes())
            .map_err(BleError::Storage)?;
        self.backend.flush().map_err(BleError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    #[test]
    fn test_absent_and_empty_values() {
        let storage = MemoryStorage::new();
        let cache = DeviceCache::new(Arc::new(storage.clone()));

        assert_eq!(cache.device_name().unwrap(), None);

        storage.put(KEY_DEVICE_NAME.as_bytes(), b"").unwrap();
        assert_eq!(cache.device_name().unwrap(), None);
    }

    #[test]
    fn test_store_and_clear() {
        let cache = DeviceCache::new(Arc::new(MemoryStorage::new()));

        cache.store_device_name("Watch-42").unwrap();
        cache.store_device_address("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(cache.device_name().unwrap().as_deref(), Some("Watch-42"));
        assert_eq!(
            cache.device_address().unwrap().as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );

        cache.clear().unwrap();
        assert_eq!(cache.device_name().unwrap(), None);
        assert_eq!(cache.device_address().unwrap(), None);
    }

    #[test]
    fn test_non_utf8_value_is_a_storage_error() {
        let storage = MemoryStorage::new();
        storage.put(KEY_DEVICE_ADDRESS.as_bytes(), &[0xff, 0xfe]).unwrap();
        let cache = DeviceCache::new(Arc::new(storage));

        assert!(matches!(
            cache.device_address(),
            Err(BleError::Storage(_))
        ));
    }
}
