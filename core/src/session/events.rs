// Events published to the application layer

use super::state::SessionState;
use crate::error::BleError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    PeripheralFound {
        address: String,
        name: Option<String>,
    },
    Ready {
        address: String,
    },
    /// Decoded payload of an enciphered characteristic, as hex text
    Notification {
        address: String,
        characteristic_id: String,
        data: String,
    },
    /// Battery level in percent (not enciphered on the wire)
    BatteryLevel {
        address: String,
        level: u8,
    },
    Disconnected {
        address: Option<String>,
    },
    Failed {
        error: BleError,
    },
}

impl SessionEvent {
    pub fn is_failure(&self) -> bool {
        matches!(self, SessionEvent::Failed { .. })
    }
}
