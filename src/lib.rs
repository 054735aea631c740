// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # elm327-rust-ble
//!
//! An async request/response engine for ELM327 OBD-II adapters that expose
//! their serial link over Bluetooth Low Energy.
//!
//! The adapter speaks a line-oriented ASCII protocol: a command goes out
//! terminated by `\r`, and the reply comes back as notification chunks of
//! arbitrary size, ending with a `>` prompt. This crate reassembles those
//! chunks into frames, pairs each frame with the one command in flight,
//! decodes it and keeps the latest value per PID.
//!
//! ## Features
//!
//! - **Frame Assembly**: Chunk boundaries never matter; the prompt does
//! - **Single Outstanding Command**: Replies are matched positionally, so
//!   only one command is ever in flight
//! - **Per-command Timeouts**: A reply that misses its deadline is dropped
//!   while the link is idle. Matching is positional, so one that arrives
//!   after the next command went out is taken as that command's reply
//! - **Extensible PID Table**: RPM and speed out of the box, more via
//!   [`PidTable::register`]
//! - **Reconnection**: [`Session::run`] re-establishes the link with backoff
//! - **Scripted Adapter**: [`transport::mock::ScriptedAdapter`] drives the
//!   whole stack without a radio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use elm327_rust_ble::{BleTransport, Pid, Result, Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = SessionConfig::new("AA:BB:CC:DD:EE:FF");
//!     let session = Session::new(config, Arc::new(BleTransport::new()));
//!
//!     session.connect().await?;
//!     let report = session.initialize().await?;
//!     println!("Adapter: {:?}", report.banner);
//!
//!     session.poll_once().await?;
//!     if let Some(rpm) = session.latest(Pid::RPM) {
//!         println!("Engine speed: {} {}", rpm.value, rpm.unit);
//!     }
//!
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Peripherals are addressed by their
//! platform identifier rather than a MAC address.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for config and telemetry types

// Public modules
pub mod ble;
pub mod correlator;
pub mod error;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod utils;

// Re-exports for convenience
pub use ble::BleTransport;
pub use correlator::{Correlator, CorrelatorState};
pub use error::{Error, Result};
pub use session::{
    CallbackHandle, InitReport, PollStats, ReconnectPolicy, Session, SessionConfig,
    DEFAULT_INIT_SCRIPT,
};
pub use telemetry::{TelemetrySnapshot, TelemetryStore, TelemetryValue};
pub use transport::{NotificationSink, RawChunk, Transport};
pub use utils::{kph_to_mph, mph_to_kph};

// Re-export commonly used types from submodules
pub use ble::connection::ConnectionState;
pub use protocol::{
    Command, CommandKind, CommandRequest, DecodeError, DecodedReply, Decoder, Frame,
    FrameAssembler, Pid, PidRule, PidTable, Unit,
};
