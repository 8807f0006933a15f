// Platform bridge for the native BLE stack
//
// The session never talks to a radio directly. Everything it needs from the
// host (scan, GATT, notifications) goes through `BlePlatformBridge`, and
// everything the radio reports comes back as a `RadioEvent` delivered to the
// listeners installed by the dispatcher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::uuid_eq;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Bluetooth unavailable: {0}")]
    Unavailable(String),
    #[error("Peripheral not found: {0}")]
    PeripheralNotFound(String),
    #[error("Characteristic {characteristic_id} not found in service {service_id}")]
    CharacteristicNotFound {
        service_id: String,
        characteristic_id: String,
    },
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Platform bridge error: {0}")]
    Platform(String),
}

// ============================================================================
// DATA STRUCTURES
// ============================================================================

/// A peripheral as reported by a scan or by the connected-peripheral query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralHandle {
    /// Platform address or identifier, used for every GATT call
    pub id: String,
    /// Advertised local name
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

impl PeripheralHandle {
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
            rssi: None,
        }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDescriptor {
    pub service_id: String,
    pub characteristic_id: String,
}

/// Result of service discovery on a connected peripheral
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralDescriptor {
    pub id: String,
    pub name: Option<String>,
    pub service_ids: Vec<String>,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl PeripheralDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Record a characteristic, adding its service if not yet listed
    pub fn with_characteristic(mut self, service_id: &str, characteristic_id: &str) -> Self {
        if !self.service_ids.iter().any(|s| uuid_eq(s, service_id)) {
            self.service_ids.push(service_id.to_string());
        }
        self.characteristics.push(CharacteristicDescriptor {
            service_id: service_id.to_string(),
            characteristic_id: characteristic_id.to_string(),
        });
        self
    }

    pub fn characteristic_uuids(&self) -> Vec<String> {
        self.characteristics
            .iter()
            .map(|c| c.characteristic_id.clone())
            .collect()
    }

    pub fn has_characteristic(&self, service_id: &str, characteristic_id: &str) -> bool {
        self.characteristics.iter().any(|c| {
            uuid_eq(&c.service_id, service_id) && uuid_eq(&c.characteristic_id, characteristic_id)
        })
    }
}

// ============================================================================
// RADIO EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    PeripheralDiscovered {
        handle: PeripheralHandle,
    },
    /// Scan window elapsed or the stack stopped scanning on its own
    ScanStopped,
    PeripheralDisconnected {
        handle: PeripheralHandle,
    },
    CharacteristicValueChanged {
        address: String,
        service_id: String,
        characteristic_id: String,
        value: Vec<u8>,
    },
}

impl RadioEvent {
    pub fn kind(&self) -> RadioEventKind {
        match self {
            RadioEvent::PeripheralDiscovered { .. } => RadioEventKind::PeripheralDiscovered,
            RadioEvent::ScanStopped => RadioEventKind::ScanStopped,
            RadioEvent::PeripheralDisconnected { .. } => RadioEventKind::PeripheralDisconnected,
            RadioEvent::CharacteristicValueChanged { .. } => {
                RadioEventKind::CharacteristicValueChanged
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioEventKind {
    PeripheralDiscovered,
    ScanStopped,
    PeripheralDisconnected,
    CharacteristicValueChanged,
}

impl RadioEventKind {
    pub const ALL: [RadioEventKind; 4] = [
        RadioEventKind::PeripheralDiscovered,
        RadioEventKind::ScanStopped,
        RadioEventKind::PeripheralDisconnected,
        RadioEventKind::CharacteristicValueChanged,
    ];
}

impl fmt::Display for RadioEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RadioEventKind::PeripheralDiscovered => "peripheral_discovered",
            RadioEventKind::ScanStopped => "scan_stopped",
            RadioEventKind::PeripheralDisconnected => "peripheral_disconnected",
            RadioEventKind::CharacteristicValueChanged => "characteristic_value_changed",
        };
        f.write_str(name)
    }
}

pub type RadioListener = Box<dyn Fn(RadioEvent) + Send + Sync>;

/// Token returned by `add_listener`. Removes exactly the listener it was
/// issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId {
    kind: RadioEventKind,
    seq: u64,
}

impl ListenerId {
    pub fn new(kind: RadioEventKind, seq: u64) -> Self {
        Self { kind, seq }
    }

    pub fn kind(&self) -> RadioEventKind {
        self.kind
    }
}

// ============================================================================
// PLATFORM BRIDGE TRAIT
// ============================================================================

/// Native BLE stack abstraction
///
/// Implemented by the host platform (btleplug on desktop, the mobile stack on
/// phones) and by `ScriptedBridge` in tests. Calls may complete in any order
/// relative to each other.
#[async_trait]
pub trait BlePlatformBridge: Send + Sync {
    /// Power on / enable the radio
    async fn start_radio(&self) -> Result<(), BridgeError>;

    async fn scan(
        &self,
        service_ids: &[String],
        duration_secs: u64,
        allow_duplicates: bool,
    ) -> Result<(), BridgeError>;

    async fn stop_scan(&self) -> Result<(), BridgeError>;

    /// Peripherals the stack already holds a connection to
    async fn get_connected_peripherals(
        &self,
        filter_service_ids: &[String],
    ) -> Result<Vec<PeripheralHandle>, BridgeError>;

    async fn connect(&self, address: &str) -> Result<(), BridgeError>;

    async fn disconnect(&self, address: &str) -> Result<(), BridgeError>;

    async fn discover_services(&self, address: &str) -> Result<PeripheralDescriptor, BridgeError>;

    async fn start_notify(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(), BridgeError>;

    async fn stop_notify(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(), BridgeError>;

    async fn read_characteristic(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<Vec<u8>, BridgeError>;

    async fn write_characteristic_no_response(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
        value: &[u8],
    ) -> Result<(), BridgeError>;

    /// Negotiate the ATT MTU; returns the value the stack settled on
    async fn request_mtu(&self, address: &str, mtu: u16) -> Result<u16, BridgeError>;

    fn add_listener(&self, kind: RadioEventKind, listener: RadioListener) -> ListenerId;

    /// Remove one listener. Unknown or already removed ids are ignored.
    fn remove_listener(&self, id: ListenerId);

    fn remove_all_listeners(&self, kind: RadioEventKind);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_collects_services_once() {
        let descriptor = PeripheralDescriptor::new("AA:BB")
            .with_characteristic("0000180f-0000-1000-8000-00805f9b34fb", "2a19")
            .with_characteristic("0000180F-0000-1000-8000-00805F9B34FB", "2a1a");

        assert_eq!(descriptor.service_ids.len(), 1);
        assert_eq!(descriptor.characteristic_uuids(), vec!["2a19", "2a1a"]);
        assert!(descriptor.has_characteristic("0000180F-0000-1000-8000-00805f9b34fb", "2A19"));
        assert!(!descriptor.has_characteristic("0000180F-0000-1000-8000-00805f9b34fb", "2a1b"));
    }

    #[test]
    fn test_event_kind() {
        let event = RadioEvent::PeripheralDisconnected {
            handle: PeripheralHandle::new("AA:BB", None),
        };
        assert_eq!(event.kind(), RadioEventKind::PeripheralDisconnected);
        assert_eq!(RadioEvent::ScanStopped.kind().to_string(), "scan_stopped");
    }
}
