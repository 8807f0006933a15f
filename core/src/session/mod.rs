//! Device session: state, published events and the controller driving them.

pub mod controller;
pub mod events;
pub mod state;

pub use controller::BleSession;
pub use events::SessionEvent;
pub use state::{NotificationFlags, NotifyChannel, Session, SessionSnapshot, SessionState};
