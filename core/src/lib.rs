// Wearlink Core: phone-to-wearable BLE link
//
// Two coupled pieces: the session state machine that turns unreliable radio
// events into a deterministic Ready state, and the AES-CBC count-padding
// codec applied to every payload crossing the link.

pub mod commands;
pub mod config;
pub mod crypto;
pub mod error;
pub mod session;
pub mod store;
pub mod transport;

pub use commands::DeviceCommand;
pub use config::{BleConfig, ConfigError, ScanConflictPolicy, ScanRetryPolicy};
pub use crypto::{CipherFrame, CipherKey, Codec, CodecError};
pub use error::{BleError, ProtocolError, Result, TransportError};
pub use session::{BleSession, NotificationFlags, SessionEvent, SessionSnapshot, SessionState};
pub use store::{DeviceCache, MemoryStorage, StorageBackend};
#[cfg(not(target_arch = "wasm32"))]
pub use store::SledStorage;
pub use transport::ble::{
    BlePlatformBridge, BridgeError, EventDispatcher, PeripheralDescriptor, PeripheralHandle,
    RadioEvent, RadioEventKind, ScriptedBridge,
};
