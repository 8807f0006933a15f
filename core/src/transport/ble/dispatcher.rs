// Radio event dispatcher
//
// Installs one listener per radio event kind on the bridge. All listeners feed
// a single channel, and one pump task hands the events to the session in
// arrival order, awaiting each transition before taking the next event.
//
// A dispatcher only ever removes the listeners it registered itself, so an
// older dispatcher going away cannot strip a newer one.

use super::bridge::{BlePlatformBridge, ListenerId, RadioEvent, RadioEventKind};
use crate::error::Result;
use crate::session::BleSession;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

struct Installation {
    pump: JoinHandle<()>,
    listeners: Vec<ListenerId>,
    // Every strong sender lives inside a listener. Once the bridge has dropped
    // them all, nothing can reach the pump any more.
    sender: mpsc::WeakUnboundedSender<RadioEvent>,
}

impl Installation {
    fn is_live(&self) -> bool {
        !self.pump.is_finished() && self.sender.upgrade().is_some()
    }
}

pub struct EventDispatcher {
    bridge: Arc<dyn BlePlatformBridge>,
    session: BleSession,
    installation: Mutex<Option<Installation>>,
}

impl EventDispatcher {
    pub fn new(bridge: Arc<dyn BlePlatformBridge>, session: BleSession) -> Self {
        Self {
            bridge,
            session,
            installation: Mutex::new(None),
        }
    }

    /// Install the listeners. Does nothing if they are already installed and
    /// still registered on the bridge.
    ///
    /// Must be called from within a tokio runtime.
    pub fn install(&self) {
        let mut installation = self.installation.lock();
        match installation.take() {
            Some(current) if current.is_live() => {
                debug!("radio listeners already installed");
                *installation = Some(current);
                return;
            }
            Some(stale) => {
                debug!("radio listeners were removed externally, reinstalling");
                self.release(stale);
            }
            None => {}
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<RadioEvent>();
        let sender = tx.downgrade();
        let listeners: Vec<ListenerId> = RadioEventKind::ALL
            .into_iter()
            .map(|kind| {
                let tx = tx.clone();
                self.bridge.add_listener(
                    kind,
                    Box::new(move |event| {
                        if tx.send(event).is_err() {
                            trace!(%kind, "dispatcher closed, radio event dropped");
                        }
                    }),
                )
            })
            .collect();
        drop(tx);

        let session = self.session.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let kind = event.kind();
                if let Err(e) = dispatch(&session, event).await {
                    warn!(%kind, error = %e, "radio event handling failed");
                }
            }
            debug!("radio listeners gone, dispatcher pump stopped");
        });

        *installation = Some(Installation {
            pump,
            listeners,
            sender,
        });
        info!(kinds = RadioEventKind::ALL.len(), "radio listeners installed");
    }

    /// Remove this dispatcher's listeners and stop delivering events.
    /// Listeners registered by anyone else stay in place.
    pub fn teardown(&self) {
        if let Some(installation) = self.installation.lock().take() {
            self.release(installation);
            info!("radio listeners removed");
        }
    }

    /// Drop every listener on the bridge, then install a fresh set. Whatever
    /// was registered before, by this dispatcher or an earlier one, stops
    /// receiving events.
    pub fn refresh(&self) {
        self.teardown();
        for kind in RadioEventKind::ALL {
            self.bridge.remove_all_listeners(kind);
        }
        self.install();
    }

    /// True while this dispatcher's listeners are registered and its pump runs
    pub fn is_installed(&self) -> bool {
        self.installation
            .lock()
            .as_ref()
            .map_or(false, Installation::is_live)
    }

    /// Translate one event into its transition, bypassing the listeners
    pub async fn dispatch(&self, event: RadioEvent) -> Result<()> {
        dispatch(&self.session, event).await
    }

    fn release(&self, installation: Installation) {
        for id in installation.listeners {
            self.bridge.remove_listener(id);
        }
        installation.pump.abort();
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn dispatch(session: &BleSession, event: RadioEvent) -> Result<()> {
    match event {
        RadioEvent::PeripheralDiscovered { handle } => session.on_peripheral_discovered(handle).await,
        RadioEvent::ScanStopped => session.on_scan_stopped().await,
        RadioEvent::PeripheralDisconnected { handle } => {
            session.on_peripheral_disconnected(handle).await
        }
        RadioEvent::CharacteristicValueChanged {
            address,
            service_id,
            characteristic_id,
            value,
        } => session.on_characteristic_value_changed(
            &address,
            &service_id,
            &characteristic_id,
            &value,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BleConfig;
    use crate::store::MemoryStorage;
    use crate::transport::ble::ScriptedBridge;

    fn setup() -> (ScriptedBridge, EventDispatcher) {
        let bridge = ScriptedBridge::new();
        let shared: Arc<dyn BlePlatformBridge> = Arc::new(bridge.clone());
        let session =
            BleSession::new(shared.clone(), BleConfig::default(), Arc::new(MemoryStorage::new()))
                .unwrap();
        (bridge, EventDispatcher::new(shared, session))
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let (bridge, dispatcher) = setup();

        dispatcher.install();
        dispatcher.install();

        for kind in RadioEventKind::ALL {
            assert_eq!(bridge.listener_count(kind), 1);
        }
        assert!(dispatcher.is_installed());
    }

    #[tokio::test]
    async fn test_refresh_replaces_listeners() {
        let (bridge, dispatcher) = setup();

        dispatcher.install();
        dispatcher.refresh();
        dispatcher.refresh();
        assert_eq!(bridge.total_listeners(), RadioEventKind::ALL.len());
    }

    #[tokio::test]
    async fn test_drop_removes_listeners() {
        let (bridge, dispatcher) = setup();
        dispatcher.install();
        drop(dispatcher);
        assert_eq!(bridge.total_listeners(), 0);
    }

    #[tokio::test]
    async fn test_teardown_keeps_foreign_listeners() {
        let (bridge, dispatcher) = setup();
        bridge.add_listener(RadioEventKind::ScanStopped, Box::new(|_| {}));

        dispatcher.install();
        assert_eq!(bridge.listener_count(RadioEventKind::ScanStopped), 2);
        dispatcher.teardown();

        assert!(!dispatcher.is_installed());
        assert_eq!(bridge.total_listeners(), 1);
        assert_eq!(bridge.listener_count(RadioEventKind::ScanStopped), 1);
    }

    #[tokio::test]
    async fn test_external_removal_is_detected_and_repaired() {
        let (bridge, dispatcher) = setup();
        dispatcher.install();

        bridge.remove_all_listeners(RadioEventKind::PeripheralDiscovered);
        bridge.remove_all_listeners(RadioEventKind::ScanStopped);
        bridge.remove_all_listeners(RadioEventKind::PeripheralDisconnected);
        bridge.remove_all_listeners(RadioEventKind::CharacteristicValueChanged);
        assert!(!dispatcher.is_installed());

        dispatcher.install();
        assert!(dispatcher.is_installed());
        for kind in RadioEventKind::ALL {
            assert_eq!(bridge.listener_count(kind), 1);
        }
    }
}
