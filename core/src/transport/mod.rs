// Transport module: radio access for the wearable link

pub mod ble;

pub use ble::{
    BlePlatformBridge, BridgeError, EventDispatcher, PeripheralDescriptor, PeripheralHandle,
    RadioEvent, RadioEventKind, ScriptedBridge,
};
