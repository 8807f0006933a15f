//! BLE session configuration
//!
//! Everything the session needs at startup:
//! - Service and characteristic UUIDs of the wearable
//! - The fixed cipher key and IV
//! - Scan duration and the bounded scan-restart policy
//! - What to do when a scan is requested while a session is active

use crate::crypto::{CipherKey, CodecError, SUPPORTED_KEY_SIZES};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing service UUID")]
    MissingServiceId,

    #[error("Invalid UUID for {field}: {value}")]
    InvalidUuid { field: &'static str, value: String },

    #[error("Invalid cipher key: {0}")]
    InvalidKey(String),

    #[error("Invalid cipher IV: {0}")]
    InvalidIv(String),

    #[error("Invalid scan duration: must be > 0 seconds")]
    InvalidScanDuration,

    #[error("Invalid scan retry policy: {0}")]
    InvalidRetryPolicy(String),
}

// ============================================================================
// DEFAULTS
// ============================================================================

pub const DEFAULT_SERVICE_UUID: &str = "0783b03e-0376-b5a0-7140-a304d5194cb7";
pub const DEFAULT_TX_CHARACTERISTIC_UUID: &str = "0783b03e-0376-b5a0-7140-a304d5194cb8";
pub const DEFAULT_FLOW_CONTROL_CHARACTERISTIC_UUID: &str = "0783b03e-0376-b5a0-7140-a304d5194cb9";
pub const DEFAULT_RX_CHARACTERISTIC_UUID: &str = "0783b03e-0376-b5a0-7140-a304d5194cba";
pub const DEFAULT_BATTERY_SERVICE_UUID: &str = "0000180F-0000-1000-8000-00805f9b34fb";
pub const DEFAULT_BATTERY_CHARACTERISTIC_UUID: &str = "00002A19-0000-1000-8000-00805F9B34FB";

/// Development key. Production builds override it from the config file.
pub const DEFAULT_CIPHER_KEY_HEX: &str = "6b3e1f0a9c2d4e5f7a8b9c0d1e2f3a4b";
pub const DEFAULT_CIPHER_IV_HEX: &str = "1a2b3c4d5e6f708192a3b4c5d6e7f809";

pub const DEFAULT_SCAN_DURATION_SECS: u64 = 3;
pub const DEFAULT_SCAN_RESTART_DELAY_MS: u64 = 1500;

// ============================================================================
// POLICIES
// ============================================================================

/// Behaviour of `start_scan` while a session is already active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanConflictPolicy {
    /// Fail with `OperationInProgress`
    Reject,
    /// Tear the current session down, then scan
    Preempt,
}

impl Default for ScanConflictPolicy {
    fn default() -> Self {
        Self::Reject
    }
}

impl std::fmt::Display for ScanConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reject => write!(f, "Reject"),
            Self::Preempt => write!(f, "Preempt"),
        }
    }
}

/// Bounded restart of a scan that stopped without finding the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRetryPolicy {
    /// Delay before the first restart (milliseconds)
    pub restart_delay_ms: u64,
    /// Upper bound on any single delay (milliseconds)
    pub max_delay_ms: u64,
    /// Restarts allowed before the session gives up
    pub max_attempts: u32,
}

impl Default for ScanRetryPolicy {
    fn default() -> Self {
        Self {
            restart_delay_ms: DEFAULT_SCAN_RESTART_DELAY_MS,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ScanRetryPolicy {
    /// Capped exponential backoff for restart `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.pow(attempt.min(5));
        let delay_ms = self.restart_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryPolicy(
                "max_attempts must be >= 1".to_string(),
            ));
        }
        if self.max_delay_ms < self.restart_delay_ms {
            return Err(ConfigError::InvalidRetryPolicy(
                "max_delay_ms must be >= restart_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// BLE CONFIG
// ============================================================================

/// Startup configuration for a wearable session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Custom service of the wearable (scan filter)
    pub service_uuid: String,

    /// Command characteristic; encoded payloads are written here
    pub tx_characteristic_uuid: String,

    /// Flow-control characteristic
    pub flow_control_characteristic_uuid: String,

    /// Response characteristic
    pub rx_characteristic_uuid: String,

    /// Standard battery service (0x180F)
    pub battery_service_uuid: String,

    /// Battery level characteristic (0x2A19)
    pub battery_characteristic_uuid: String,

    /// Cipher key, hex text (16, 24 or 32 bytes)
    pub cipher_key_hex: String,

    /// Cipher IV, hex text (16 bytes)
    pub cipher_iv_hex: String,

    /// Radio scan window in seconds
    pub scan_duration_secs: u64,

    pub scan_retry: ScanRetryPolicy,

    pub scan_conflict: ScanConflictPolicy,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID.to_string(),
            tx_characteristic_uuid: DEFAULT_TX_CHARACTERISTIC_UUID.to_string(),
            flow_control_characteristic_uuid: DEFAULT_FLOW_CONTROL_CHARACTERISTIC_UUID.to_string(),
            rx_characteristic_uuid: DEFAULT_RX_CHARACTERISTIC_UUID.to_string(),
            battery_service_uuid: DEFAULT_BATTERY_SERVICE_UUID.to_string(),
            battery_characteristic_uuid: DEFAULT_BATTERY_CHARACTERISTIC_UUID.to_string(),
            cipher_key_hex: DEFAULT_CIPHER_KEY_HEX.to_string(),
            cipher_iv_hex: DEFAULT_CIPHER_IV_HEX.to_string(),
            scan_duration_secs: DEFAULT_SCAN_DURATION_SECS,
            scan_retry: ScanRetryPolicy::default(),
            scan_conflict: ScanConflictPolicy::default(),
        }
    }
}

impl BleConfig {
    /// Validate every field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_uuid.trim().is_empty() {
            return Err(ConfigError::MissingServiceId);
        }

        for (field, value) in self.uuid_fields() {
            Uuid::parse_str(value).map_err(|_| ConfigError::InvalidUuid {
                field,
                value: value.to_string(),
            })?;
        }

        self.cipher_key()?;

        if self.scan_duration_secs == 0 {
            return Err(ConfigError::InvalidScanDuration);
        }

        self.scan_retry.validate()
    }

    /// Build the cipher key from the hex fields
    pub fn cipher_key(&self) -> Result<CipherKey, ConfigError> {
        CipherKey::from_hex(&self.cipher_key_hex, &self.cipher_iv_hex).map_err(|e| match e {
            CodecError::MalformedKey { field: "iv", reason } => ConfigError::InvalidIv(reason),
            CodecError::MalformedKey { reason, .. } => ConfigError::InvalidKey(reason),
            CodecError::InvalidKeyLength(len) => ConfigError::InvalidKey(format!(
                "{} bytes, expected one of {:?}",
                len, SUPPORTED_KEY_SIZES
            )),
            CodecError::InvalidIvLength(len) => {
                ConfigError::InvalidIv(format!("{} bytes, expected 16", len))
            }
            other => ConfigError::InvalidKey(other.to_string()),
        })
    }

    /// Scan window as a `Duration`
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    /// True if `characteristic_id` names one of the enciphered characteristics
    pub fn is_custom_characteristic(&self, characteristic_id: &str) -> bool {
        [
            &self.tx_characteristic_uuid,
            &self.flow_control_characteristic_uuid,
            &self.rx_characteristic_uuid,
        ]
        .iter()
        .any(|uuid| uuid_eq(uuid, characteristic_id))
    }

    pub fn is_battery_characteristic(&self, characteristic_id: &str) -> bool {
        uuid_eq(&self.battery_characteristic_uuid, characteristic_id)
    }

    fn uuid_fields(&self) -> [(&'static str, &str); 6] {
        [
            ("service_uuid", self.service_uuid.as_str()),
            ("tx_characteristic_uuid", self.tx_characteristic_uuid.as_str()),
            (
                "flow_control_characteristic_uuid",
                self.flow_control_characteristic_uuid.as_str(),
            ),
            ("rx_characteristic_uuid", self.rx_characteristic_uuid.as_str()),
            ("battery_service_uuid", self.battery_service_uuid.as_str()),
            (
                "battery_characteristic_uuid",
                self.battery_characteristic_uuid.as_str(),
            ),
        ]
    }
}

/// Case-insensitive UUID comparison (platforms differ in casing).
pub fn uuid_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
