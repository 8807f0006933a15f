// BLE session state machine
//
// Idle -> Scanning -> PeripheralFound -> Connecting -> Connected
//      -> ServicesDiscovered -> EnablingNotifications -> Ready
//
// Any state returns to Idle on disconnect or failure. Every reset bumps the
// session epoch; deferred work (scan restart timer, connect flow) carries the
// epoch it was started under and stops as soon as the epoch moves on.

use super::events::SessionEvent;
use super::state::{NotifyChannel, Session, SessionSnapshot, SessionState};
use crate::commands::DeviceCommand;
use crate::config::{uuid_eq, BleConfig, ScanConflictPolicy};
use crate::crypto::Codec;
use crate::error::{BleError, ProtocolError, Result};
use crate::store::{DeviceCache, StorageBackend};
use crate::transport::ble::{BlePlatformBridge, BridgeError, EventDispatcher, PeripheralHandle};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct SessionTasks {
    restart_timer: Option<JoinHandle<()>>,
    connect_flow: Option<JoinHandle<()>>,
}

/// Owner of the single device session
#[derive(Clone)]
pub struct BleSession {
    bridge: Arc<dyn BlePlatformBridge>,
    config: Arc<BleConfig>,
    codec: Arc<Codec>,
    cache: DeviceCache,
    session: Arc<RwLock<Session>>,
    state_tx: Arc<watch::Sender<SessionState>>,
    epoch_tx: Arc<watch::Sender<u64>>,
    events: broadcast::Sender<SessionEvent>,
    tasks: Arc<Mutex<SessionTasks>>,
}

impl BleSession {
    pub fn new(
        bridge: Arc<dyn BlePlatformBridge>,
        config: BleConfig,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let codec = Codec::new(config.cipher_key()?);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (epoch_tx, _) = watch::channel(0u64);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            bridge,
            config: Arc::new(config),
            codec: Arc::new(codec),
            cache: DeviceCache::new(storage),
            session: Arc::new(RwLock::new(Session::new())),
            state_tx: Arc::new(state_tx),
            epoch_tx: Arc::new(epoch_tx),
            events,
            tasks: Arc::new(Mutex::new(SessionTasks::default())),
        })
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn state(&self) -> SessionState {
        self.session.read().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.read().snapshot()
    }

    pub fn config(&self) -> &BleConfig {
        &self.config
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn cached_device_name(&self) -> Result<Option<String>> {
        self.cache.device_name()
    }

    pub fn cached_device_address(&self) -> Result<Option<String>> {
        self.cache.device_address()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Resolve once the session reaches `target`.
    pub async fn wait_for_state(&self, target: SessionState) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| ProtocolError::Cancelled.into())
    }

    // ========================================================================
    // SETUP
    // ========================================================================

    /// Power the radio on and install the radio event listeners.
    ///
    /// The returned dispatcher owns the listeners; dropping it removes them.
    pub async fn initialize(&self) -> Result<EventDispatcher> {
        self.bridge
            .start_radio()
            .await
            .map_err(|e| BleError::transport("start_radio", e))?;

        let dispatcher = EventDispatcher::new(self.bridge.clone(), self.clone());
        dispatcher.refresh();
        info!("BLE session initialized");
        Ok(dispatcher)
    }

    /// Store the name scan results are matched against
    pub fn set_target_device_name(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ProtocolError::MissingDeviceName.into());
        }
        self.cache.store_device_name(name)?;
        info!(device_name = name, "target device name stored");
        Ok(())
    }

    // ========================================================================
    // SCANNING
    // ========================================================================

    pub async fn start_scan(&self, service_id: &str, duration_secs: u64) -> Result<()> {
        if service_id.trim().is_empty() {
            return Err(ProtocolError::InvalidServiceId.into());
        }

        let current = self.state();
        if current != SessionState::Idle {
            match self.config.scan_conflict {
                ScanConflictPolicy::Reject => {
                    warn!(state = %current, "scan rejected, session already active");
                    return Err(ProtocolError::OperationInProgress {
                        operation: "start_scan",
                        state: current,
                    }
                    .into());
                }
                ScanConflictPolicy::Preempt => self.preempt().await,
            }
        }

        let device_name = self
            .cache
            .device_name()?
            .ok_or(ProtocolError::MissingDeviceName)?;

        let epoch = {
            let mut s = self.session.write();
            if s.state != SessionState::Idle {
                return Err(ProtocolError::OperationInProgress {
                    operation: "start_scan",
                    state: s.state,
                }
                .into());
            }
            s.begin_scan(device_name, service_id, duration_secs);
            self.transition_locked(&mut s, SessionState::Scanning);
            s.epoch
        };

        info!(service_id, duration_secs, "scan started");
        if let Err(e) = self.launch_scan(service_id, duration_secs).await {
            self.fail(epoch, e.clone(), None).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn stop_scan(&self) -> Result<()> {
        let (state, epoch) = {
            let s = self.session.read();
            (s.state, s.epoch)
        };
        if state != SessionState::Scanning {
            return Err(ProtocolError::InvalidState {
                operation: "stop_scan",
                state,
            }
            .into());
        }

        self.bridge
            .stop_scan()
            .await
            .map_err(|e| BleError::transport("stop_scan", e))?;
        self.reset_inner(Some(epoch), None, true);
        info!("scan stopped");
        Ok(())
    }

    async fn launch_scan(&self, service_id: &str, duration_secs: u64) -> Result<()> {
        self.bridge
            .start_radio()
            .await
            .map_err(|e| BleError::transport("start_radio", e))?;
        self.bridge
            .scan(&[service_id.to_string()], duration_secs, false)
            .await
            .map_err(|e| BleError::transport("scan", e))
    }

    /// Tear the active session down ahead of a new scan.
    async fn preempt(&self) {
        let (scanning, address, linked) = {
            let s = self.session.read();
            (
                s.scanning,
                s.target_address.clone(),
                s.state.is_connected() || s.state.is_connecting(),
            )
        };
        info!(scanning, linked, "preempting active session");

        if scanning {
            if let Err(e) = self.bridge.stop_scan().await {
                warn!(error = %e, "stop_scan failed during preempt");
            }
        }
        if let (true, Some(address)) = (linked, address.as_deref()) {
            self.session.write().mark_released(address);
            if let Err(e) = self.bridge.disconnect(address).await {
                warn!(address, error = %e, "disconnect failed during preempt");
            }
        }
        self.reset_inner(None, None, true);
    }

    // ========================================================================
    // RADIO EVENT TRANSITIONS
    // ========================================================================

    pub async fn on_peripheral_discovered(&self, handle: PeripheralHandle) -> Result<()> {
        let (epoch, stop_scan) = {
            let mut s = self.session.write();
            if s.state != SessionState::Scanning {
                trace!(peripheral = %handle.id, state = %s.state, "discovery ignored");
                return Ok(());
            }
            if handle.name.as_deref() != Some(s.target_device_name.as_str()) {
                trace!(peripheral = %handle.id, name = ?handle.name, "non-matching peripheral");
                return Ok(());
            }
            s.select_target(&handle.id);
            s.peripheral_found = true;
            self.transition_locked(&mut s, SessionState::PeripheralFound);
            (s.epoch, s.scanning)
        };

        info!(address = %handle.id, name = ?handle.name, rssi = ?handle.rssi, "target peripheral found");
        self.publish(SessionEvent::PeripheralFound {
            address: handle.id.clone(),
            name: handle.name.clone(),
        });
        self.cancel_restart_timer();

        if stop_scan {
            if let Err(e) = self.bridge.stop_scan().await {
                warn!(error = %e, "stop_scan failed after match");
            }
            let mut s = self.session.write();
            if s.epoch == epoch {
                s.scanning = false;
            }
        }

        self.advance(epoch, SessionState::Connecting)?;
        self.spawn_connect_flow(handle.id, epoch);
        Ok(())
    }

    pub async fn on_scan_stopped(&self) -> Result<()> {
        let epoch = {
            let mut s = self.session.write();
            s.scanning = false;
            if s.state != SessionState::Scanning || s.peripheral_found || s.connected {
                debug!(state = %s.state, "scan stopped, nothing to restart");
                return Ok(());
            }
            s.epoch
        };

        if self.try_direct_connect(epoch).await? {
            return Ok(());
        }
        self.schedule_restart(epoch)
    }

    pub async fn on_peripheral_disconnected(&self, handle: PeripheralHandle) -> Result<()> {
        {
            let mut s = self.session.write();
            if s.take_released(&handle.id) {
                debug!(address = %handle.id, "echo of a local disconnect ignored");
                return Ok(());
            }
            if !s.disconnect_applies(&handle.id) {
                debug!(
                    address = %handle.id,
                    target = ?s.target_address,
                    "disconnect of another peripheral ignored"
                );
                return Ok(());
            }
        }
        info!(address = %handle.id, "peripheral disconnected");
        self.reset_inner(None, None, true);
        self.publish(SessionEvent::Disconnected {
            address: Some(handle.id),
        });
        Ok(())
    }

    pub fn on_characteristic_value_changed(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
        value: &[u8],
    ) -> Result<()> {
        let state = self.state();
        if !state.accepts_notifications() {
            warn!(%state, characteristic_id, "notification outside an active session dropped");
            return Err(ProtocolError::InvalidState {
                operation: "characteristic_value_changed",
                state,
            }
            .into());
        }

        if self.config.is_battery_characteristic(characteristic_id) {
            match value.first() {
                Some(&level) => {
                    debug!(address, level, "battery level notification");
                    self.publish(SessionEvent::BatteryLevel {
                        address: address.to_string(),
                        level,
                    });
                }
                None => warn!(address, "empty battery notification"),
            }
            return Ok(());
        }

        if !self.config.is_custom_characteristic(characteristic_id) {
            debug!(service_id, characteristic_id, "notification from unknown characteristic ignored");
            return Ok(());
        }

        match self.codec.decode_payload(value) {
            Ok(data) => {
                debug!(address, characteristic_id, len = data.len() / 2, "notification decoded");
                self.publish(SessionEvent::Notification {
                    address: address.to_string(),
                    characteristic_id: characteristic_id.to_string(),
                    data,
                });
                Ok(())
            }
            Err(e) => {
                warn!(characteristic_id, error = %e, "notification decode failed");
                Err(e.into())
            }
        }
    }

    /// Disconnect-triggered reset. Repeating it is harmless.
    pub fn reset(&self) {
        self.reset_inner(None, None, true);
    }

    // ========================================================================
    // CONNECT FLOW
    // ========================================================================

    /// Connect to `address` directly and drive the session to `Ready`.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let (epoch, stop_scan) = {
            let mut s = self.session.write();
            match s.state {
                SessionState::Idle | SessionState::Scanning => {}
                SessionState::Ready => {
                    return Err(ProtocolError::InvalidState {
                        operation: "connect",
                        state: s.state,
                    }
                    .into())
                }
                state => {
                    return Err(ProtocolError::OperationInProgress {
                        operation: "connect",
                        state,
                    }
                    .into())
                }
            }
            let stop = s.scanning;
            s.scanning = false;
            s.select_target(address);
            self.transition_locked(&mut s, SessionState::Connecting);
            (s.epoch, stop)
        };

        self.cancel_restart_timer();
        if stop_scan {
            if let Err(e) = self.bridge.stop_scan().await {
                warn!(error = %e, "stop_scan failed before connect");
            }
        }
        self.run_connect_flow(address, epoch).await
    }

    /// Known device already linked at the OS level: connect without rescanning.
    async fn try_direct_connect(&self, epoch: u64) -> Result<bool> {
        let (Some(name), Some(address)) = (self.cache.device_name()?, self.cache.device_address()?)
        else {
            return Ok(false);
        };

        let connected = match self.bridge.get_connected_peripherals(&[]).await {
            Ok(peripherals) => peripherals,
            Err(e) => {
                warn!(error = %e, "get_connected_peripherals failed");
                return Ok(false);
            }
        };
        if connected.is_empty() {
            return Ok(false);
        }

        {
            let mut s = self.session.write();
            if s.epoch != epoch || s.state != SessionState::Scanning {
                return Ok(true);
            }
            s.select_target(&address);
            s.peripheral_found = true;
            self.transition_locked(&mut s, SessionState::PeripheralFound);
            self.transition_locked(&mut s, SessionState::Connecting);
        }

        info!(%address, device_name = %name, "connecting to known peripheral without rescan");
        self.spawn_connect_flow(address, epoch);
        Ok(true)
    }

    fn spawn_connect_flow(&self, address: String, epoch: u64) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = this.run_connect_flow(&address, epoch).await {
                debug!(%address, error = %e, "connect flow ended before ready");
            }
        });
        if let Some(previous) = self.tasks.lock().connect_flow.replace(handle) {
            previous.abort();
        }
    }

    async fn run_connect_flow(&self, address: &str, epoch: u64) -> Result<()> {
        let superseded = wait_for_epoch_change(self.epoch_tx.subscribe(), epoch);
        let outcome = tokio::select! {
            biased;
            _ = superseded => Err(BleError::from(ProtocolError::Cancelled)),
            result = self.establish(address, epoch) => result,
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(BleError::Protocol(ProtocolError::Cancelled)) => {
                info!(address, "connect flow cancelled by reset");
                Err(ProtocolError::Cancelled.into())
            }
            Err(e) => {
                let linked = {
                    let s = self.session.read();
                    s.epoch == epoch && s.connected
                };
                self.fail(epoch, e.clone(), linked.then_some(address))
                    .await;
                Err(e)
            }
        }
    }

    async fn establish(&self, address: &str, epoch: u64) -> Result<()> {
        debug!(address, "connecting");
        self.bridge
            .connect(address)
            .await
            .map_err(|e| BleError::transport("connect", e))?;
        {
            let mut s = self.session.write();
            if s.epoch != epoch {
                return Err(ProtocolError::Cancelled.into());
            }
            s.connected = true;
            self.transition_locked(&mut s, SessionState::Connected);
        }

        let descriptor = self
            .bridge
            .discover_services(address)
            .await
            .map_err(|e| BleError::transport("discover_services", e))?;
        info!(address, characteristics = ?descriptor.characteristic_uuids(), "services discovered");
        {
            let mut s = self.session.write();
            if s.epoch != epoch {
                return Err(ProtocolError::Cancelled.into());
            }
            s.descriptor = Some(descriptor);
            self.transition_locked(&mut s, SessionState::ServicesDiscovered);
            self.transition_locked(&mut s, SessionState::EnablingNotifications);
        }

        let cfg = &self.config;
        futures::future::try_join3(
            self.enable_channel(
                address,
                &cfg.service_uuid,
                &cfg.tx_characteristic_uuid,
                NotifyChannel::Tx,
                epoch,
            ),
            self.enable_channel(
                address,
                &cfg.service_uuid,
                &cfg.flow_control_characteristic_uuid,
                NotifyChannel::FlowControl,
                epoch,
            ),
            self.enable_channel(
                address,
                &cfg.battery_service_uuid,
                &cfg.battery_characteristic_uuid,
                NotifyChannel::Battery,
                epoch,
            ),
        )
        .await?;

        self.enter_ready(address, epoch)
    }

    async fn enable_channel(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
        channel: NotifyChannel,
        epoch: u64,
    ) -> Result<()> {
        self.bridge
            .start_notify(address, service_id, characteristic_id)
            .await
            .map_err(|e| {
                warn!(address, characteristic_id, error = %e, "start_notify failed");
                BleError::transport("start_notify", e)
            })?;

        let mut s = self.session.write();
        if s.epoch != epoch {
            return Err(ProtocolError::Cancelled.into());
        }
        s.notifications.set(channel, true);
        debug!(address, ?channel, "notification enabled");
        Ok(())
    }

    fn enter_ready(&self, address: &str, epoch: u64) -> Result<()> {
        if !self.is_current(epoch) {
            return Err(ProtocolError::Cancelled.into());
        }
        self.cache.store_device_address(address)?;

        {
            let mut s = self.session.write();
            if s.epoch != epoch {
                return Err(ProtocolError::Cancelled.into());
            }
            s.scanning = false;
            s.peripheral_found = false;
            s.connected = true;
            s.restart_attempts = 0;
            self.transition_locked(&mut s, SessionState::Ready);
        }

        info!(address, "session ready");
        self.publish(SessionEvent::Ready {
            address: address.to_string(),
        });
        Ok(())
    }

    // ========================================================================
    // SCAN RESTART
    // ========================================================================

    fn schedule_restart(&self, epoch: u64) -> Result<()> {
        let policy = &self.config.scan_retry;
        let attempt = {
            let mut s = self.session.write();
            if s.epoch != epoch {
                return Ok(());
            }
            if s.restart_attempts >= policy.max_attempts {
                let attempts = s.restart_attempts;
                drop(s);

                let error = BleError::from(ProtocolError::DeviceNotFound { attempts });
                warn!(attempts, "target device not found, giving up");
                self.reset_inner(Some(epoch), Some(error.clone()), true);
                self.publish(SessionEvent::Failed {
                    error: error.clone(),
                });
                return Err(error);
            }
            s.restart_attempts += 1;
            s.restart_attempts
        };

        let delay = policy.delay_for(attempt - 1);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "scan restart scheduled");

        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.tasks.lock().restart_timer.take();
            if let Err(e) = this.restart_scan(epoch).await {
                debug!(error = %e, "scan restart failed");
            }
        });
        if let Some(previous) = self.tasks.lock().restart_timer.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn restart_scan(&self, epoch: u64) -> Result<()> {
        let (service_id, duration_secs, attempt) = {
            let mut s = self.session.write();
            if s.epoch != epoch || s.state != SessionState::Scanning || s.peripheral_found {
                return Ok(());
            }
            let Some(service_id) = s.scan_service_id.clone() else {
                return Ok(());
            };
            s.scanning = true;
            (service_id, s.scan_duration_secs, s.restart_attempts)
        };

        info!(attempt, "restarting scan");
        if let Err(e) = self.launch_scan(&service_id, duration_secs).await {
            self.fail(epoch, e.clone(), None).await;
            return Err(e);
        }
        Ok(())
    }

    fn cancel_restart_timer(&self) {
        if let Some(handle) = self.tasks.lock().restart_timer.take() {
            handle.abort();
            trace!("scan restart timer cancelled");
        }
    }

    // ========================================================================
    // OPERATIONS ON A CONNECTED DEVICE
    // ========================================================================

    pub async fn disconnect(&self, address: &str) -> Result<()> {
        let state = self.state();
        if !(state.is_connected() || state.is_connecting()) {
            return Err(ProtocolError::NotConnected.into());
        }

        self.session.write().mark_released(address);
        self.bridge
            .disconnect(address)
            .await
            .map_err(|e| BleError::transport("disconnect", e))?;
        self.reset_inner(None, None, true);
        info!(address, "disconnected");
        self.publish(SessionEvent::Disconnected {
            address: Some(address.to_string()),
        });
        Ok(())
    }

    pub async fn enable_notification(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<()> {
        let epoch = self.require_ready("enable_notification")?;
        self.bridge
            .start_notify(address, service_id, characteristic_id)
            .await
            .map_err(|e| BleError::transport("start_notify", e))?;
        self.record_notification(epoch, characteristic_id, true);
        Ok(())
    }

    pub async fn disable_notification(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<()> {
        let epoch = self.require_ready("disable_notification")?;
        self.bridge
            .stop_notify(address, service_id, characteristic_id)
            .await
            .map_err(|e| BleError::transport("stop_notify", e))?;
        self.record_notification(epoch, characteristic_id, false);
        Ok(())
    }

    pub async fn read_characteristic(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<Vec<u8>> {
        self.require_ready("read_characteristic")?;
        self.bridge
            .read_characteristic(address, service_id, characteristic_id)
            .await
            .map_err(|e| BleError::transport("read_characteristic", e))
    }

    /// Encipher `plaintext` and write the hex text to the tx characteristic
    pub async fn send_encoded(&self, plaintext: &[u8]) -> Result<()> {
        let address = {
            let s = self.session.read();
            if s.state != SessionState::Ready {
                return Err(ProtocolError::InvalidState {
                    operation: "send_encoded",
                    state: s.state,
                }
                .into());
            }
            s.target_address.clone().ok_or(ProtocolError::NotConnected)?
        };

        let hex_ciphertext = self.codec.encode(plaintext)?;
        self.bridge
            .write_characteristic_no_response(
                &address,
                &self.config.service_uuid,
                &self.config.tx_characteristic_uuid,
                hex_ciphertext.as_bytes(),
            )
            .await
            .map_err(|e| BleError::transport("write_characteristic_no_response", e))?;
        debug!(%address, plaintext_len = plaintext.len(), "encoded payload written");
        Ok(())
    }

    pub async fn send_command(&self, command: DeviceCommand) -> Result<()> {
        debug!(%command, "sending device command");
        self.send_encoded(&command.payload()).await
    }

    /// Battery percentage from the standard battery characteristic
    pub async fn battery_level(&self, address: &str) -> Result<u8> {
        let value = self
            .read_characteristic(
                address,
                &self.config.battery_service_uuid,
                &self.config.battery_characteristic_uuid,
            )
            .await?;
        value.first().copied().ok_or_else(|| {
            BleError::transport(
                "read_characteristic",
                BridgeError::Platform("empty battery level value".to_string()),
            )
        })
    }

    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        self.require_ready("request_mtu")?;
        let address = self
            .session
            .read()
            .target_address
            .clone()
            .ok_or(ProtocolError::NotConnected)?;
        let negotiated = self
            .bridge
            .request_mtu(&address, mtu)
            .await
            .map_err(|e| BleError::transport("request_mtu", e))?;
        info!(%address, requested = mtu, negotiated, "MTU negotiated");
        Ok(negotiated)
    }

    /// GATT operations run only once the connect flow has finished. Returns
    /// the epoch of the ready session.
    fn require_ready(&self, operation: &'static str) -> Result<u64> {
        let s = self.session.read();
        match s.state {
            SessionState::Ready => Ok(s.epoch),
            state if state.is_connecting() => {
                debug!(operation, %state, "rejected while connecting");
                Err(ProtocolError::OperationInProgress { operation, state }.into())
            }
            _ => Err(ProtocolError::NotConnected.into()),
        }
    }

    fn record_notification(&self, epoch: u64, characteristic_id: &str, enabled: bool) {
        let Some(channel) = self.channel_for(characteristic_id) else {
            return;
        };
        let mut s = self.session.write();
        if s.epoch == epoch {
            s.notifications.set(channel, enabled);
        } else {
            debug!(characteristic_id, "notification change for a superseded session ignored");
        }
    }

    fn channel_for(&self, characteristic_id: &str) -> Option<NotifyChannel> {
        let cfg = &self.config;
        if uuid_eq(&cfg.tx_characteristic_uuid, characteristic_id) {
            Some(NotifyChannel::Tx)
        } else if uuid_eq(&cfg.flow_control_characteristic_uuid, characteristic_id) {
            Some(NotifyChannel::FlowControl)
        } else if uuid_eq(&cfg.battery_characteristic_uuid, characteristic_id) {
            Some(NotifyChannel::Battery)
        } else {
            None
        }
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn transition_locked(&self, session: &mut Session, to: SessionState) {
        let from = session.state;
        if from == to {
            return;
        }
        session.state = to;
        debug!(%from, %to, "session transition");
        self.state_tx.send_replace(to);
        self.publish(SessionEvent::StateChanged { from, to });
    }

    fn advance(&self, epoch: u64, to: SessionState) -> Result<()> {
        let mut s = self.session.write();
        if s.epoch != epoch {
            return Err(ProtocolError::Cancelled.into());
        }
        self.transition_locked(&mut s, to);
        Ok(())
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.session.read().epoch == epoch
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Return to Idle. With `expected` set, only if no other reset happened
    /// since that epoch. Returns whether a reset took place.
    fn reset_inner(
        &self,
        expected: Option<u64>,
        failure: Option<BleError>,
        abort_connect: bool,
    ) -> bool {
        {
            let mut s = self.session.write();
            if matches!(expected, Some(epoch) if epoch != s.epoch) {
                return false;
            }
            let from = s.state;
            s.reset();
            if failure.is_some() {
                s.last_failure = failure;
            }
            self.epoch_tx.send_replace(s.epoch);
            if from != SessionState::Idle {
                debug!(%from, "session reset");
                self.state_tx.send_replace(SessionState::Idle);
                self.publish(SessionEvent::StateChanged {
                    from,
                    to: SessionState::Idle,
                });
            }
        }

        let mut tasks = self.tasks.lock();
        if let Some(handle) = tasks.restart_timer.take() {
            handle.abort();
        }
        if let Some(handle) = tasks.connect_flow.take() {
            if abort_connect {
                handle.abort();
            }
        }
        true
    }

    /// Record a failure of the work started under `epoch` and return to Idle.
    async fn fail(&self, epoch: u64, error: BleError, disconnect: Option<&str>) {
        if !self.is_current(epoch) {
            debug!(error = %error, "failure from a superseded session ignored");
            return;
        }
        error!(error = %error, "session failed");

        if let Some(address) = disconnect {
            self.session.write().mark_released(address);
            if let Err(e) = self.bridge.disconnect(address).await {
                warn!(address, error = %e, "best-effort disconnect failed");
            }
        }

        if self.reset_inner(Some(epoch), Some(error.clone()), false) {
            self.publish(SessionEvent::Failed { error });
        }
    }
}

async fn wait_for_epoch_change(mut rx: watch::Receiver<u64>, epoch: u64) {
    while *rx.borrow_and_update() == epoch {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
