// Desktop radio bridge backed by btleplug
//
// Peripherals are addressed by their Bluetooth address string. The adapter's
// central event stream and each peripheral's notification stream are pumped
// into the listener registry as radio events.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wearlink_core::transport::ble::{
    BlePlatformBridge, BridgeError, ListenerId, ListenerRegistry, PeripheralDescriptor,
    PeripheralHandle, RadioEvent, RadioEventKind, RadioListener,
};

fn platform_error(e: btleplug::Error) -> BridgeError {
    match e {
        btleplug::Error::TimedOut(after) => BridgeError::Timeout(format!("{:?}", after)),
        btleplug::Error::PermissionDenied => {
            BridgeError::Unavailable("Bluetooth permission denied".to_string())
        }
        other => BridgeError::Platform(other.to_string()),
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, BridgeError> {
    Uuid::parse_str(value).map_err(|e| BridgeError::Platform(format!("{}: {}", value, e)))
}

struct Radio {
    _manager: Manager,
    adapter: Adapter,
}

#[derive(Default)]
struct Shared {
    listeners: ListenerRegistry,
    /// Addresses already reported during the current scan
    reported: Mutex<HashSet<String>>,
    allow_duplicates: AtomicBool,
    scanning: AtomicBool,
}

impl Shared {
    fn report_discovery(&self, handle: PeripheralHandle) {
        if !self.scanning.load(Ordering::SeqCst) {
            return;
        }
        if !self.allow_duplicates.load(Ordering::SeqCst)
            && !self.reported.lock().insert(handle.id.clone())
        {
            return;
        }
        self.listeners.emit(RadioEvent::PeripheralDiscovered { handle });
    }

    fn report_scan_stopped(&self) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            self.listeners.emit(RadioEvent::ScanStopped);
        }
    }
}

pub struct BtleplugBridge {
    radio: tokio::sync::Mutex<Option<Radio>>,
    shared: Arc<Shared>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
    scan_timer: Mutex<Option<JoinHandle<()>>>,
    notification_pumps: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BtleplugBridge {
    pub fn new() -> Self {
        Self {
            radio: tokio::sync::Mutex::new(None),
            shared: Arc::new(Shared::default()),
            event_pump: Mutex::new(None),
            scan_timer: Mutex::new(None),
            notification_pumps: Mutex::new(HashMap::new()),
        }
    }

    async fn adapter(&self) -> Result<Adapter, BridgeError> {
        self.radio
            .lock()
            .await
            .as_ref()
            .map(|radio| radio.adapter.clone())
            .ok_or_else(|| BridgeError::Unavailable("radio not started".to_string()))
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral, BridgeError> {
        let adapter = self.adapter().await?;
        let peripherals = adapter.peripherals().await.map_err(platform_error)?;
        peripherals
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            .ok_or_else(|| BridgeError::PeripheralNotFound(address.to_string()))
    }

    async fn characteristic(
        &self,
        peripheral: &Peripheral,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<Characteristic, BridgeError> {
        let service = parse_uuid(service_id)?;
        let uuid = parse_uuid(characteristic_id)?;
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == service)
            .ok_or_else(|| BridgeError::CharacteristicNotFound {
                service_id: service_id.to_string(),
                characteristic_id: characteristic_id.to_string(),
            })
    }

    /// Forward the peripheral's notifications until its stream ends.
    async fn ensure_notification_pump(
        &self,
        address: &str,
        peripheral: &Peripheral,
    ) -> Result<(), BridgeError> {
        if let Some(pump) = self.notification_pumps.lock().get(address) {
            if !pump.is_finished() {
                return Ok(());
            }
        }

        let mut stream = peripheral.notifications().await.map_err(platform_error)?;
        let characteristics = peripheral.characteristics();
        let shared = self.shared.clone();
        let owner = address.to_string();

        let handle = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let service_id = characteristics
                    .iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| c.service_uuid.to_string())
                    .unwrap_or_default();
                shared.listeners.emit(RadioEvent::CharacteristicValueChanged {
                    address: owner.clone(),
                    service_id,
                    characteristic_id: notification.uuid.to_string(),
                    value: notification.value,
                });
            }
            debug!(address = %owner, "notification stream ended");
        });

        if let Some(old) = self
            .notification_pumps
            .lock()
            .insert(address.to_string(), handle)
        {
            old.abort();
        }
        Ok(())
    }

    fn stop_notification_pump(&self, address: &str) {
        if let Some(pump) = self.notification_pumps.lock().remove(address) {
            pump.abort();
        }
    }
}

impl Default for BtleplugBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BtleplugBridge {
    fn drop(&mut self) {
        if let Some(pump) = self.event_pump.lock().take() {
            pump.abort();
        }
        if let Some(timer) = self.scan_timer.lock().take() {
            timer.abort();
        }
        for (_, pump) in self.notification_pumps.lock().drain() {
            pump.abort();
        }
    }
}

async fn handle_for(adapter: &Adapter, id: &PeripheralId) -> Option<PeripheralHandle> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok().flatten();
    let address = peripheral.address().to_string();

    let name = properties.as_ref().and_then(|p| p.local_name.clone());
    let mut handle = PeripheralHandle::new(address, name.as_deref());
    if let Some(rssi) = properties.and_then(|p| p.rssi) {
        handle = handle.with_rssi(rssi);
    }
    Some(handle)
}

async fn pump_central_events(adapter: Adapter, shared: Arc<Shared>) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "cannot subscribe to adapter events");
            return;
        }
    };

    while let Some(event) = events.next().await {
        match event {
            // Names often arrive in a later advertisement, so updates count too
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if let Some(handle) = handle_for(&adapter, &id).await {
                    if handle.name.is_some() {
                        shared.report_discovery(handle);
                    }
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                if let Some(handle) = handle_for(&adapter, &id).await {
                    debug!(peripheral = %handle.id, "peripheral disconnected");
                    shared
                        .listeners
                        .emit(RadioEvent::PeripheralDisconnected { handle });
                }
            }
            _ => {}
        }
    }
    debug!("adapter event stream ended");
}

#[async_trait]
impl BlePlatformBridge for BtleplugBridge {
    async fn start_radio(&self) -> Result<(), BridgeError> {
        let mut radio = self.radio.lock().await;
        if radio.is_some() {
            return Ok(());
        }

        let manager = Manager::new().await.map_err(platform_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(platform_error)?
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::Unavailable("no Bluetooth adapter".to_string()))?;

        let info = adapter.adapter_info().await.unwrap_or_default();
        info!(adapter = %info, "radio started");

        *self.event_pump.lock() = Some(tokio::spawn(pump_central_events(
            adapter.clone(),
            self.shared.clone(),
        )));
        *radio = Some(Radio {
            _manager: manager,
            adapter,
        });
        Ok(())
    }

    async fn scan(
        &self,
        service_ids: &[String],
        duration_secs: u64,
        allow_duplicates: bool,
    ) -> Result<(), BridgeError> {
        let adapter = self.adapter().await?;
        let services = service_ids
            .iter()
            .map(|id| parse_uuid(id))
            .collect::<Result<Vec<_>, _>>()?;

        self.shared.reported.lock().clear();
        self.shared
            .allow_duplicates
            .store(allow_duplicates, Ordering::SeqCst);
        self.shared.scanning.store(true, Ordering::SeqCst);

        if let Err(e) = adapter.start_scan(ScanFilter { services }).await {
            self.shared.scanning.store(false, Ordering::SeqCst);
            return Err(platform_error(e));
        }
        debug!(duration_secs, allow_duplicates, "scan started");

        let shared = self.shared.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(duration_secs)).await;
            if let Err(e) = adapter.stop_scan().await {
                warn!(error = %e, "stopping timed scan failed");
            }
            shared.report_scan_stopped();
        });
        if let Some(old) = self.scan_timer.lock().replace(timer) {
            old.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BridgeError> {
        if let Some(timer) = self.scan_timer.lock().take() {
            timer.abort();
        }
        let adapter = self.adapter().await?;
        let result = adapter.stop_scan().await.map_err(platform_error);
        self.shared.report_scan_stopped();
        result
    }

    async fn get_connected_peripherals(
        &self,
        filter_service_ids: &[String],
    ) -> Result<Vec<PeripheralHandle>, BridgeError> {
        let adapter = self.adapter().await?;
        let filter = filter_service_ids
            .iter()
            .map(|id| parse_uuid(id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut connected = Vec::new();
        for peripheral in adapter.peripherals().await.map_err(platform_error)? {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }
            let properties = peripheral.properties().await.ok().flatten();
            if !filter.is_empty() {
                let advertised = properties
                    .as_ref()
                    .map(|p| p.services.as_slice())
                    .unwrap_or(&[]);
                if !filter.iter().any(|uuid| advertised.contains(uuid)) {
                    continue;
                }
            }
            let name = properties.and_then(|p| p.local_name);
            connected.push(PeripheralHandle::new(
                peripheral.address().to_string(),
                name.as_deref(),
            ));
        }
        Ok(connected)
    }

    async fn connect(&self, address: &str) -> Result<(), BridgeError> {
        let peripheral = self.peripheral(address).await?;
        peripheral.connect().await.map_err(platform_error)?;
        info!(address, "connected");
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), BridgeError> {
        self.stop_notification_pump(address);
        let peripheral = self.peripheral(address).await?;
        peripheral.disconnect().await.map_err(platform_error)?;
        info!(address, "disconnected");
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<PeripheralDescriptor, BridgeError> {
        let peripheral = self.peripheral(address).await?;
        peripheral.discover_services().await.map_err(platform_error)?;

        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name);
        let mut descriptor = PeripheralDescriptor::new(address);
        descriptor.name = name;
        for c in peripheral.characteristics() {
            descriptor =
                descriptor.with_characteristic(&c.service_uuid.to_string(), &c.uuid.to_string());
        }
        debug!(
            address,
            services = descriptor.service_ids.len(),
            characteristics = descriptor.characteristics.len(),
            "services discovered"
        );
        Ok(descriptor)
    }

    async fn start_notify(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(), BridgeError> {
        let peripheral = self.peripheral(address).await?;
        let characteristic = self
            .characteristic(&peripheral, service_id, characteristic_id)
            .await?;
        self.ensure_notification_pump(address, &peripheral).await?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(platform_error)
    }

    async fn stop_notify(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(), BridgeError> {
        let peripheral = self.peripheral(address).await?;
        let characteristic = self
            .characteristic(&peripheral, service_id, characteristic_id)
            .await?;
        peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(platform_error)
    }

    async fn read_characteristic(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<Vec<u8>, BridgeError> {
        let peripheral = self.peripheral(address).await?;
        let characteristic = self
            .characteristic(&peripheral, service_id, characteristic_id)
            .await?;
        peripheral.read(&characteristic).await.map_err(platform_error)
    }

    async fn write_characteristic_no_response(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
        value: &[u8],
    ) -> Result<(), BridgeError> {
        let peripheral = self.peripheral(address).await?;
        let characteristic = self
            .characteristic(&peripheral, service_id, characteristic_id)
            .await?;
        peripheral
            .write(&characteristic, value, WriteType::WithoutResponse)
            .await
            .map_err(platform_error)
    }

    async fn request_mtu(&self, address: &str, mtu: u16) -> Result<u16, BridgeError> {
        debug!(address, mtu, "MTU negotiation requested");
        Err(BridgeError::Unavailable(
            "MTU negotiation is handled by the host stack".to_string(),
        ))
    }

    fn add_listener(&self, kind: RadioEventKind, listener: RadioListener) -> ListenerId {
        self.shared.listeners.add(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.shared.listeners.remove(id);
    }

    fn remove_all_listeners(&self, kind: RadioEventKind) {
        self.shared.listeners.remove_all(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_error_mapping() {
        assert!(matches!(
            platform_error(btleplug::Error::TimedOut(Duration::from_secs(2))),
            BridgeError::Timeout(_)
        ));
        assert!(matches!(
            platform_error(btleplug::Error::PermissionDenied),
            BridgeError::Unavailable(_)
        ));
        assert!(matches!(
            platform_error(btleplug::Error::DeviceNotFound),
            BridgeError::Platform(_)
        ));
    }

    #[test]
    fn test_discovery_reported_once_per_scan() {
        let shared = Shared::default();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        shared.listeners.add(
            RadioEventKind::PeripheralDiscovered,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let handle = PeripheralHandle::new("AA:BB:CC:DD:EE:FF", Some("Watch-42"));
        shared.report_discovery(handle.clone());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        shared.scanning.store(true, Ordering::SeqCst);
        shared.report_discovery(handle.clone());
        shared.report_discovery(handle.clone());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        shared.allow_duplicates.store(true, Ordering::SeqCst);
        shared.report_discovery(handle);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_scan_stopped_emitted_once() {
        let shared = Shared::default();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        shared.listeners.add(
            RadioEventKind::ScanStopped,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        shared.scanning.store(true, Ordering::SeqCst);
        shared.report_scan_stopped();
        shared.report_scan_stopped();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_operations_require_started_radio() {
        let bridge = BtleplugBridge::new();
        assert!(matches!(
            bridge.connect("AA:BB:CC:DD:EE:FF").await,
            Err(BridgeError::Unavailable(_))
        ));
        assert!(matches!(bridge.stop_scan().await, Err(BridgeError::Unavailable(_))));
    }
}
