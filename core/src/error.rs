// Top-level error taxonomy for the BLE link

use crate::config::ConfigError;
use crate::crypto::CodecError;
use crate::session::SessionState;
use crate::transport::ble::BridgeError;
use thiserror::Error;

/// Radio stack failure, tagged with the operation that produced it
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed: {source}")]
pub struct TransportError {
    pub operation: &'static str,
    #[source]
    pub source: BridgeError,
}

impl TransportError {
    pub fn new(operation: &'static str, source: BridgeError) -> Self {
        Self { operation, source }
    }
}

/// Operation attempted in the wrong session state
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Service id must not be empty")]
    InvalidServiceId,
    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("{operation} rejected: session is busy in state {state}")]
    OperationInProgress {
        operation: &'static str,
        state: SessionState,
    },
    #[error("No device is connected")]
    NotConnected,
    #[error("Operation cancelled by session reset")]
    Cancelled,
    #[error("Target device not found after {attempts} scan attempts")]
    DeviceNotFound { attempts: u32 },
    #[error("No target device name cached")]
    MissingDeviceName,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BleError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl BleError {
    pub fn transport(operation: &'static str, source: BridgeError) -> Self {
        BleError::Transport(TransportError::new(operation, source))
    }

    /// True when the failure came from the radio stack rather than local checks.
    pub fn is_transport(&self) -> bool {
        matches!(self, BleError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, BleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_keeps_cause() {
        let err = BleError::transport("connect", BridgeError::Timeout("connect".into()));
        assert!(err.is_transport());
        let text = err.to_string();
        assert!(text.contains("connect failed"));
        assert!(text.contains("Timed out"));
    }

    #[test]
    fn test_protocol_error_display() {
        let err: BleError = ProtocolError::OperationInProgress {
            operation: "start_scan",
            state: SessionState::Connecting,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Protocol error: start_scan rejected: session is busy in state Connecting"
        );
    }
}
