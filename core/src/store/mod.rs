// Store module: durable device identity

pub mod backend;
pub mod device_cache;

#[cfg(not(target_arch = "wasm32"))]
pub use backend::SledStorage;
pub use backend::{MemoryStorage, StorageBackend};
pub use device_cache::{DeviceCache, KEY_DEVICE_ADDRESS, KEY_DEVICE_NAME};
