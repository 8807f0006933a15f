//! BLE transport: the platform bridge contract and everything around it.
//!
//! - **bridge**: `BlePlatformBridge` trait, radio events and peripheral types
//! - **listeners**: per-kind listener registry for bridge implementations
//! - **scripted**: in-process bridge with scripted outcomes
//! - **dispatcher**: listener lifecycle and ordered event delivery

pub mod bridge;
pub mod dispatcher;
pub mod listeners;
pub mod scripted;

pub use bridge::{
    BlePlatformBridge, BridgeError, CharacteristicDescriptor, PeripheralDescriptor,
    ListenerId, PeripheralHandle, RadioEvent, RadioEventKind, RadioListener,
};
pub use dispatcher::EventDispatcher;
pub use listeners::ListenerRegistry;
pub use scripted::{BridgeCall, ScriptedBridge};
