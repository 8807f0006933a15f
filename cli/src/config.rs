// Configuration management for the wearlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/wearlink/config.json
// - Linux: ~/.config/wearlink/config.json
// - Windows: %APPDATA%\wearlink\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use wearlink_core::{BleConfig, ScanConflictPolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Link settings shared with the core
    pub ble: BleConfig,

    /// Device cache location (defaults to the data directory)
    pub storage_path: Option<String>,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("wearlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("wearlink");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Where the sled device cache lives
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("device")),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config.ble.validate().context("Invalid BLE configuration")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. The result must still validate.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        let ble = &mut updated.ble;
        match key {
            "service_uuid" => ble.service_uuid = value.to_string(),
            "tx_characteristic_uuid" => ble.tx_characteristic_uuid = value.to_string(),
            "flow_control_characteristic_uuid" => {
                ble.flow_control_characteristic_uuid = value.to_string()
            }
            "rx_characteristic_uuid" => ble.rx_characteristic_uuid = value.to_string(),
            "battery_service_uuid" => ble.battery_service_uuid = value.to_string(),
            "battery_characteristic_uuid" => ble.battery_characteristic_uuid = value.to_string(),
            "cipher_key" => ble.cipher_key_hex = value.to_string(),
            "cipher_iv" => ble.cipher_iv_hex = value.to_string(),
            "scan_duration_secs" => {
                ble.scan_duration_secs = value.parse().context("Invalid number")?;
            }
            "scan_restart_delay_ms" => {
                ble.scan_retry.restart_delay_ms = value.parse().context("Invalid number")?;
            }
            "scan_max_delay_ms" => {
                ble.scan_retry.max_delay_ms = value.parse().context("Invalid number")?;
            }
            "scan_max_attempts" => {
                ble.scan_retry.max_attempts = value.parse().context("Invalid number")?;
            }
            "scan_conflict" => {
                ble.scan_conflict = match value.to_ascii_lowercase().as_str() {
                    "reject" => ScanConflictPolicy::Reject,
                    "preempt" => ScanConflictPolicy::Preempt,
                    _ => anyhow::bail!("Invalid scan conflict policy: {} (reject|preempt)", value),
                };
            }
            "storage_path" => {
                updated.storage_path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        updated
            .ble
            .validate()
            .with_context(|| format!("Rejected value for {}", key))?;
        *self = updated;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list().into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// List all config values. Key material is shown only by length.
    pub fn list(&self) -> Vec<(String, String)> {
        let ble = &self.ble;
        let key_len = ble.cipher_key_hex.len() / 2;
        vec![
            ("service_uuid".to_string(), ble.service_uuid.clone()),
            ("tx_characteristic_uuid".to_string(), ble.tx_characteristic_uuid.clone()),
            (
                "flow_control_characteristic_uuid".to_string(),
                ble.flow_control_characteristic_uuid.clone(),
            ),
            ("rx_characteristic_uuid".to_string(), ble.rx_characteristic_uuid.clone()),
            ("battery_service_uuid".to_string(), ble.battery_service_uuid.clone()),
            (
                "battery_characteristic_uuid".to_string(),
                ble.battery_characteristic_uuid.clone(),
            ),
            ("cipher_key".to_string(), format!("({} bytes)", key_len)),
            ("cipher_iv".to_string(), "(16 bytes)".to_string()),
            ("scan_duration_secs".to_string(), format!("{}s", ble.scan_duration_secs)),
            (
                "scan_restart_delay_ms".to_string(),
                format!("{}ms", ble.scan_retry.restart_delay_ms),
            ),
            (
                "scan_max_delay_ms".to_string(),
                format!("{}ms", ble.scan_retry.max_delay_ms),
            ),
            (
                "scan_max_attempts".to_string(),
                ble.scan_retry.max_attempts.to_string(),
            ),
            ("scan_conflict".to_string(), ble.scan_conflict.to_string()),
            (
                "storage_path".to_string(),
                self.storage_path
                    .clone()
                    .unwrap_or_else(|| "(auto)".to_string()),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ble.scan_duration_secs, 3);
        assert!(config.storage_path.is_none());
        assert!(config.ble.validate().is_ok());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.ble, BleConfig::default());
    }

    #[test]
    fn test_set_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        config.set("scan_conflict", "preempt").unwrap();
        config.set("scan_max_attempts", "4").unwrap();
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.ble.scan_conflict, ScanConflictPolicy::Preempt);
        assert_eq!(reloaded.ble.scan_retry.max_attempts, 4);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        assert!(config.set("cipher_key", "abcd").is_err());
        assert!(config.set("service_uuid", "not-a-uuid").is_err());
        assert!(config.set("scan_max_attempts", "0").is_err());
        assert!(config.set("listen_port", "80").is_err());
        assert_eq!(config.ble, BleConfig::default());
    }

    #[test]
    fn test_list_hides_key_material() {
        let config = Config::default();
        let listed = config.list();
        let key = listed.iter().find(|(k, _)| k == "cipher_key").unwrap();
        assert_eq!(key.1, "(16 bytes)");
        assert!(!listed
            .iter()
            .any(|(_, v)| v.contains(&config.ble.cipher_key_hex)));
    }
}
