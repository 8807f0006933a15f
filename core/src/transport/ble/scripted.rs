// In-process bridge with scripted outcomes
//
// Stands in for the native stack in tests and in the CLI `simulate` command.
// Every call is recorded; failures, read values and delays are configured
// up front; radio events are injected with `emit`.

use super::bridge::{
    BlePlatformBridge, BridgeError, ListenerId, PeripheralDescriptor, PeripheralHandle,
    RadioEvent, RadioEventKind, RadioListener,
};
use super::listeners::ListenerRegistry;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One recorded bridge call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCall {
    pub operation: &'static str,
    pub args: Vec<String>,
}

#[derive(Default)]
struct Script {
    /// Failures keyed by operation name
    failures: HashMap<&'static str, BridgeError>,
    /// start_notify failures keyed by lowercase characteristic id
    notify_failures: HashMap<String, BridgeError>,
    /// Delays keyed by operation name
    delays: HashMap<&'static str, Duration>,
    /// Read values keyed by lowercase characteristic id
    values: HashMap<String, Vec<u8>>,
    /// Peripherals announced whenever a scan starts
    advertised: Vec<PeripheralHandle>,
    /// Emit `ScanStopped` after the advertised peripherals
    stop_after_scan: bool,
    connected: Vec<PeripheralHandle>,
    descriptor: Option<PeripheralDescriptor>,
    mtu_limit: Option<u16>,
}

#[derive(Clone, Default)]
pub struct ScriptedBridge {
    script: Arc<RwLock<Script>>,
    calls: Arc<RwLock<Vec<BridgeCall>>>,
    listeners: Arc<ListenerRegistry>,
}

impl ScriptedBridge {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Script setup
    // ------------------------------------------------------------------

    /// Make every call to `operation` fail with `error`
    pub fn fail(&self, operation: &'static str, error: BridgeError) {
        self.script.write().failures.insert(operation, error);
    }

    pub fn clear_failure(&self, operation: &'static str) {
        self.script.write().failures.remove(operation);
    }

    /// Make `start_notify` fail for a single characteristic
    pub fn fail_notify(&self, characteristic_id: &str, error: BridgeError) {
        self.script
            .write()
            .notify_failures
            .insert(characteristic_id.to_ascii_lowercase(), error);
    }

    pub fn delay(&self, operation: &'static str, delay: Duration) {
        self.script.write().delays.insert(operation, delay);
    }

    pub fn set_value(&self, characteristic_id: &str, value: Vec<u8>) {
        self.script
            .write()
            .values
            .insert(characteristic_id.to_ascii_lowercase(), value);
    }

    pub fn advertise(&self, handle: PeripheralHandle) {
        self.script.write().advertised.push(handle);
    }

    pub fn stop_after_scan(&self, enabled: bool) {
        self.script.write().stop_after_scan = enabled;
    }

    pub fn set_connected_peripherals(&self, peripherals: Vec<PeripheralHandle>) {
        self.script.write().connected = peripherals;
    }

    pub fn set_descriptor(&self, descriptor: PeripheralDescriptor) {
        self.script.write().descriptor = Some(descriptor);
    }

    pub fn set_mtu_limit(&self, limit: u16) {
        self.script.write().mtu_limit = Some(limit);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.calls.read().clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .read()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Values written with `write_characteristic_no_response`, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.calls
            .read()
            .iter()
            .filter(|c| c.operation == "write_characteristic_no_response")
            .filter_map(|c| c.args.last().map(|v| v.clone().into_bytes()))
            .collect()
    }

    pub fn listener_count(&self, kind: RadioEventKind) -> usize {
        self.listeners.count(kind)
    }

    pub fn total_listeners(&self) -> usize {
        self.listeners.total()
    }

    /// Deliver a radio event to the installed listeners
    pub fn emit(&self, event: RadioEvent) -> usize {
        self.listeners.emit(event)
    }

    // ------------------------------------------------------------------

    async fn enter(&self, operation: &'static str, args: Vec<String>) -> Result<(), BridgeError> {
        debug!(operation, ?args, "scripted bridge call");
        self.calls.write().push(BridgeCall { operation, args });

        let (delay, failure) = {
            let script = self.script.read();
            (
                script.delays.get(operation).copied(),
                script.failures.get(operation).cloned(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BlePlatformBridge for ScriptedBridge {
    async fn start_radio(&self) -> Result<(), BridgeError> {
        self.enter("start_radio", Vec::new()).await
    }

    async fn scan(
        &self,
        service_ids: &[String],
        duration_secs: u64,
        allow_duplicates: bool,
    ) -> Result<(), BridgeError> {
        let mut args = service_ids.to_vec();
        args.push(duration_secs.to_string());
        args.push(allow_duplicates.to_string());
        self.enter("scan", args).await?;

        let (advertised, stop) = {
            let script = self.script.read();
            (script.advertised.clone(), script.stop_after_scan)
        };
        for handle in advertised {
            self.listeners
                .emit(RadioEvent::PeripheralDiscovered { handle });
        }
        if stop {
            self.listeners.emit(RadioEvent::ScanStopped);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BridgeError> {
        self.enter("stop_scan", Vec::new()).await
    }

    async fn get_connected_peripherals(
        &self,
        filter_service_ids: &[String],
    ) -> Result<Vec<PeripheralHandle>, BridgeError> {
        self.enter("get_connected_peripherals", filter_service_ids.to_vec())
            .await?;
        Ok(self.script.read().connected.clone())
    }

    async fn connect(&self, address: &str) -> Result<(), BridgeError> {
        self.enter("connect", vec![address.to_string()]).await
    }

    async fn disconnect(&self, address: &str) -> Result<(), BridgeError> {
        self.enter("disconnect", vec![address.to_string()]).await
    }

    async fn discover_services(&self, address: &str) -> Result<PeripheralDescriptor, BridgeError> {
        self.enter("discover_services", vec![address.to_string()])
            .await?;
        let descriptor = self.script.read().descriptor.clone();
        Ok(descriptor.unwrap_or_else(|| PeripheralDescriptor::new(address)))
    }

    async fn start_notify(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(), BridgeError> {
        self.enter(
            "start_notify",
            vec![
                address.to_string(),
                service_id.to_string(),
                characteristic_id.to_string(),
            ],
        )
        .await?;

        let failure = self
            .script
            .read()
            .notify_failures
            .get(&characteristic_id.to_ascii_lowercase())
            .cloned();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn stop_notify(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(), BridgeError> {
        self.enter(
            "stop_notify",
            vec![
                address.to_string(),
                service_id.to_string(),
                characteristic_id.to_string(),
            ],
        )
        .await
    }

    async fn read_characteristic(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<Vec<u8>, BridgeError> {
        self.enter(
            "read_characteristic",
            vec![
                address.to_string(),
                service_id.to_string(),
                characteristic_id.to_string(),
            ],
        )
        .await?;

        self.script
            .read()
            .values
            .get(&characteristic_id.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| BridgeError::CharacteristicNotFound {
                service_id: service_id.to_string(),
                characteristic_id: characteristic_id.to_string(),
            })
    }

    async fn write_characteristic_no_response(
        &self,
        address: &str,
        service_id: &str,
        characteristic_id: &str,
        value: &[u8],
    ) -> Result<(), BridgeError> {
        self.enter(
            "write_characteristic_no_response",
            vec![
                address.to_string(),
                service_id.to_string(),
                characteristic_id.to_string(),
                String::from_utf8_lossy(value).into_owned(),
            ],
        )
        .await
    }

    async fn request_mtu(&self, address: &str, mtu: u16) -> Result<u16, BridgeError> {
        self.enter("request_mtu", vec![address.to_string(), mtu.to_string()])
            .await?;
        let limit = self.script.read().mtu_limit;
        Ok(limit.map_or(mtu, |limit| mtu.min(limit)))
    }

    fn add_listener(&self, kind: RadioEventKind, listener: RadioListener) -> ListenerId {
        self.listeners.add(kind, listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    fn remove_all_listeners(&self, kind: RadioEventKind) {
        self.listeners.remove_all(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_records_calls_and_failures() {
        let bridge = ScriptedBridge::new();
        bridge.fail("connect", BridgeError::Timeout("connect".into()));

        assert!(bridge.start_radio().await.is_ok());
        assert_eq!(
            bridge.connect("AA:BB").await,
            Err(BridgeError::Timeout("connect".into()))
        );
        assert_eq!(bridge.call_count("connect"), 1);
        assert_eq!(bridge.calls()[1].args, vec!["AA:BB".to_string()]);

        bridge.clear_failure("connect");
        assert!(bridge.connect("AA:BB").await.is_ok());
    }

    #[tokio::test]
    async fn test_scan_announces_advertised_peripherals() {
        let bridge = ScriptedBridge::new();
        bridge.advertise(PeripheralHandle::new("AA:BB", Some("Watch-42")));
        bridge.stop_after_scan(true);

        let discovered = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let d = discovered.clone();
        let s = stopped.clone();
        bridge.add_listener(
            RadioEventKind::PeripheralDiscovered,
            Box::new(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bridge.add_listener(
            RadioEventKind::ScanStopped,
            Box::new(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bridge.scan(&["svc".to_string()], 3, false).await.unwrap();
        assert_eq!(discovered.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_and_mtu() {
        let bridge = ScriptedBridge::new();
        bridge.set_value("2A19", vec![87]);
        bridge.set_mtu_limit(185);

        assert_eq!(bridge.read_characteristic("AA", "180f", "2a19").await.unwrap(), vec![87]);
        assert!(matches!(
            bridge.read_characteristic("AA", "180f", "2a1a").await,
            Err(BridgeError::CharacteristicNotFound { .. })
        ));
        assert_eq!(bridge.request_mtu("AA", 512).await.unwrap(), 185);
    }

    #[tokio::test]
    async fn test_written_values() {
        let bridge = ScriptedBridge::new();
        bridge
            .write_characteristic_no_response("AA", "svc", "tx", b"deadbeef")
            .await
            .unwrap();
        assert_eq!(bridge.written(), vec![b"deadbeef".to_vec()]);
    }
}
