// Outbound device commands
//
// Each command is a plaintext frame sent through `BleSession::send_command`,
// which enciphers it and writes it to the tx characteristic. The firmware
// command set is not final; every command currently carries the same
// placeholder frame.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Placeholder frame: two-byte length-prefixed marker
pub const PLACEHOLDER_FRAME: &[u8] = b"\x00\x05\x00DUMMY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceCommand {
    DeviceInfo,
    RefreshDeviceInfo,
    StepInfo,
    SleepInfo,
    HeartRateInfo,
}

impl DeviceCommand {
    pub const ALL: [DeviceCommand; 5] = [
        DeviceCommand::DeviceInfo,
        DeviceCommand::RefreshDeviceInfo,
        DeviceCommand::StepInfo,
        DeviceCommand::SleepInfo,
        DeviceCommand::HeartRateInfo,
    ];

    pub fn payload(&self) -> Vec<u8> {
        match self {
            DeviceCommand::DeviceInfo
            | DeviceCommand::RefreshDeviceInfo
            | DeviceCommand::StepInfo
            | DeviceCommand::SleepInfo
            | DeviceCommand::HeartRateInfo => PLACEHOLDER_FRAME.to_vec(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::DeviceInfo => "device-info",
            DeviceCommand::RefreshDeviceInfo => "refresh-device-info",
            DeviceCommand::StepInfo => "step-info",
            DeviceCommand::SleepInfo => "sleep-info",
            DeviceCommand::HeartRateInfo => "heart-rate-info",
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceCommand::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown command: {}", s))
    }
}
