// Session data owned by the state machine

use crate::error::BleError;
use crate::transport::ble::PeripheralDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Scanning,
    PeripheralFound,
    Connecting,
    /// Link is up, services not yet discovered
    Connected,
    ServicesDiscovered,
    EnablingNotifications,
    /// Connected, identity cached and all three notification channels active
    Ready,
}

impl SessionState {
    /// States in which the radio link to the peripheral is up
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::Connected
                | SessionState::ServicesDiscovered
                | SessionState::EnablingNotifications
                | SessionState::Ready
        )
    }

    /// States in which an asynchronous connect step is outstanding
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            SessionState::PeripheralFound
                | SessionState::Connecting
                | SessionState::Connected
                | SessionState::ServicesDiscovered
                | SessionState::EnablingNotifications
        )
    }

    pub fn accepts_notifications(&self) -> bool {
        matches!(
            self,
            SessionState::EnablingNotifications | SessionState::Ready
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationFlags {
    pub tx: bool,
    pub flow_control: bool,
    pub battery: bool,
}

impl NotificationFlags {
    pub fn all_enabled(&self) -> bool {
        self.tx && self.flow_control && self.battery
    }

    pub fn none_enabled(&self) -> bool {
        !(self.tx || self.flow_control || self.battery)
    }
}

/// Which of the three notification channels a characteristic belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyChannel {
    Tx,
    FlowControl,
    Battery,
}

impl NotificationFlags {
    pub fn set(&mut self, channel: NotifyChannel, enabled: bool) {
        match channel {
            NotifyChannel::Tx => self.tx = enabled,
            NotifyChannel::FlowControl => self.flow_control = enabled,
            NotifyChannel::Battery => self.battery = enabled,
        }
    }
}

/// Mutable session record. Only the controller writes it.
#[derive(Debug, Clone)]
pub struct Session {
    pub target_device_name: String,
    pub target_address: Option<String>,
    pub state: SessionState,
    pub notifications: NotificationFlags,
    pub scanning: bool,
    pub peripheral_found: bool,
    pub connected: bool,
    /// Service id and window of the scan to repeat on restart
    pub scan_service_id: Option<String>,
    pub scan_duration_secs: u64,
    pub restart_attempts: u32,
    pub last_failure: Option<BleError>,
    pub descriptor: Option<PeripheralDescriptor>,
    /// Bumped on every reset; deferred work from an older epoch is stale
    pub epoch: u64,
    /// Peripheral this side asked the stack to drop. Survives resets so the
    /// stack's echo of that disconnect is not taken for a new link loss.
    pub released_address: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            target_device_name: String::new(),
            target_address: None,
            state: SessionState::Idle,
            notifications: NotificationFlags::default(),
            scanning: false,
            peripheral_found: false,
            connected: false,
            scan_service_id: None,
            scan_duration_secs: 0,
            restart_attempts: 0,
            last_failure: None,
            descriptor: None,
            epoch: 0,
            released_address: None,
        }
    }

    pub fn select_target(&mut self, address: &str) {
        self.target_address = Some(address.to_string());
        self.released_address = None;
    }

    pub fn mark_released(&mut self, address: &str) {
        self.released_address = Some(address.to_string());
    }

    /// Consume the release mark if `address` is the peripheral we dropped.
    pub fn take_released(&mut self, address: &str) -> bool {
        match &self.released_address {
            Some(released) if released.eq_ignore_ascii_case(address) => {
                self.released_address = None;
                true
            }
            _ => false,
        }
    }

    /// A disconnect applies unless another peripheral is the target.
    pub fn disconnect_applies(&self, address: &str) -> bool {
        self.target_address
            .as_deref()
            .map_or(true, |target| target.eq_ignore_ascii_case(address))
    }

    /// Fresh scan: nothing carries over from the previous session.
    pub fn begin_scan(&mut self, device_name: String, service_id: &str, duration_secs: u64) {
        self.clear();
        self.target_device_name = device_name;
        self.scan_service_id = Some(service_id.to_string());
        self.scan_duration_secs = duration_secs;
        self.last_failure = None;
        self.scanning = true;
    }

    /// Return to `Idle`. Safe to repeat; the last failure is kept for queries.
    pub fn reset(&mut self) {
        self.clear();
        self.state = SessionState::Idle;
        self.epoch = self.epoch.wrapping_add(1);
    }

    fn clear(&mut self) {
        self.target_device_name.clear();
        self.target_address = None;
        self.notifications = NotificationFlags::default();
        self.scanning = false;
        self.peripheral_found = false;
        self.connected = false;
        self.scan_service_id = None;
        self.scan_duration_secs = 0;
        self.restart_attempts = 0;
        self.descriptor = None;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            target_device_name: Some(self.target_device_name.clone()).filter(|n| !n.is_empty()),
            target_address: self.target_address.clone(),
            notifications: self.notifications,
            scanning: self.scanning,
            peripheral_found: self.peripheral_found,
            connected: self.connected,
            restart_attempts: self.restart_attempts,
            last_failure: self.last_failure.as_ref().map(ToString::to_string),
            characteristic_uuids: self
                .descriptor
                .as_ref()
                .map(PeripheralDescriptor::characteristic_uuids)
                .unwrap_or_default(),
        }
    }
}

/// Read-only view of the session for the application layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub target_device_name: Option<String>,
    pub target_address: Option<String>,
    pub notifications: NotificationFlags,
    pub scanning: bool,
    pub peripheral_found: bool,
    pub connected: bool,
    pub restart_attempts: u32,
    pub last_failure: Option<String>,
    pub characteristic_uuids: Vec<String>,
}

impl SessionSnapshot {
    /// True when no connection, scan or notification flag is set
    pub fn all_flags_clear(&self) -> bool {
        !self.scanning
            && !self.peripheral_found
            && !self.connected
            && self.notifications.none_enabled()
            && self.target_address.is_none()
            && self.target_device_name.is_none()
    }
}
