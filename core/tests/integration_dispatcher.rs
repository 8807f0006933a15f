//! Listener lifecycle and event ordering through the dispatcher
//!
//! Run with: cargo test --test integration_dispatcher

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use wearlink_core::config::{BleConfig, DEFAULT_RX_CHARACTERISTIC_UUID, DEFAULT_SERVICE_UUID};
use wearlink_core::store::{MemoryStorage, StorageBackend};
use wearlink_core::{
    BleSession, PeripheralHandle, RadioEvent, RadioEventKind, ScriptedBridge, SessionEvent,
    SessionState,
};

const WATCH_ADDRESS: &str = "C4:7F:51:0A:2B:9E";

fn new_session(bridge: &ScriptedBridge) -> BleSession {
    let storage = MemoryStorage::new();
    storage.put(b"device_name", b"Watch-42").unwrap();
    BleSession::new(Arc::new(bridge.clone()), BleConfig::default(), Arc::new(storage)).unwrap()
}

#[tokio::test]
async fn test_initialize_installs_one_listener_per_kind() {
    let bridge = ScriptedBridge::new();
    let session = new_session(&bridge);

    let first = session.initialize().await.unwrap();
    let second = session.initialize().await.unwrap();

    for kind in RadioEventKind::ALL {
        assert_eq!(bridge.listener_count(kind), 1, "{kind} listeners");
    }
    // The refresh took the first dispatcher's listeners away.
    assert!(!first.is_installed());
    assert!(second.is_installed());

    drop(second);
    assert_eq!(bridge.total_listeners(), 0);
    assert_eq!(bridge.emit(RadioEvent::ScanStopped), 0);
    first.teardown();
}

#[tokio::test]
async fn test_superseded_dispatcher_teardown_keeps_live_listeners() {
    let bridge = ScriptedBridge::new();
    let session = new_session(&bridge);

    let stale = session.initialize().await.unwrap();
    let live = session.initialize().await.unwrap();
    stale.teardown();
    drop(stale);

    assert!(live.is_installed());
    for kind in RadioEventKind::ALL {
        assert_eq!(bridge.listener_count(kind), 1, "{kind} listeners");
    }

    session.start_scan(DEFAULT_SERVICE_UUID, 3).await.unwrap();
    assert_eq!(
        bridge.emit(RadioEvent::PeripheralDiscovered {
            handle: PeripheralHandle::new(WATCH_ADDRESS, Some("Watch-42")),
        }),
        1
    );
    timeout(Duration::from_secs(5), session.wait_for_state(SessionState::Ready))
        .await
        .expect("live dispatcher never delivered the discovery")
        .unwrap();

    drop(live);
    assert_eq!(bridge.total_listeners(), 0);
}

#[tokio::test]
async fn test_matching_peripheral_after_others_in_arrival_order() {
    let bridge = ScriptedBridge::new();
    for i in 0..5 {
        bridge.advertise(PeripheralHandle::new(format!("00:00:00:00:00:0{i}"), Some("Band-7")));
    }
    bridge.advertise(PeripheralHandle::new(WATCH_ADDRESS, Some("Watch-42")));
    bridge.advertise(PeripheralHandle::new("FF:FF:FF:FF:FF:FF", Some("Watch-42")));
    bridge.stop_after_scan(true);

    let session = new_session(&bridge);
    let _dispatcher = session.initialize().await.unwrap();

    session.start_scan(DEFAULT_SERVICE_UUID, 3).await.unwrap();
    timeout(Duration::from_secs(5), session.wait_for_state(SessionState::Ready))
        .await
        .unwrap()
        .unwrap();

    // First match wins; later events see a non-scanning session.
    assert_eq!(session.snapshot().target_address.as_deref(), Some(WATCH_ADDRESS));
    assert_eq!(bridge.call_count("connect"), 1);
    assert_eq!(session.snapshot().restart_attempts, 0);
}

#[tokio::test]
async fn test_notifications_delivered_in_order() {
    let bridge = ScriptedBridge::new();
    bridge.advertise(PeripheralHandle::new(WATCH_ADDRESS, Some("Watch-42")));
    let session = new_session(&bridge);
    let _dispatcher = session.initialize().await.unwrap();

    session.start_scan(DEFAULT_SERVICE_UUID, 3).await.unwrap();
    timeout(Duration::from_secs(5), session.wait_for_state(SessionState::Ready))
        .await
        .unwrap()
        .unwrap();

    let mut events = session.subscribe_events();
    for i in 0u8..20 {
        let wire = session.codec().encode(&[i]).unwrap();
        bridge.emit(RadioEvent::CharacteristicValueChanged {
            address: WATCH_ADDRESS.into(),
            service_id: DEFAULT_SERVICE_UUID.into(),
            characteristic_id: DEFAULT_RX_CHARACTERISTIC_UUID.into(),
            value: wire.into_bytes(),
        });
    }

    let received = timeout(Duration::from_secs(5), async {
        let mut data = Vec::new();
        while data.len() < 20 {
            if let SessionEvent::Notification { data: hex, .. } = events.recv().await.unwrap() {
                data.push(hex);
            }
        }
        data
    })
    .await
    .unwrap();

    let expected: Vec<String> = (0u8..20).map(|i| hex::encode([i])).collect();
    assert_eq!(received, expected);
}
