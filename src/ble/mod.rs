//! BLE communication module.
//!
//! This module provides the btleplug-backed [`Transport`](crate::transport::Transport)
//! for ELM327 adapters that expose their serial link over GATT.

pub mod characteristics;
pub mod connection;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use characteristics::CharacteristicHandler;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, LinkState};
pub use scanner::BleScanner;
pub use transport::BleTransport;
pub use uuids::*;
