//! Error types for the elm327-rust-ble crate.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::decoder::DecodeError;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No adapter with the requested address was found while scanning.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Operation requires a connection but the adapter is not connected.
    #[error("Adapter not connected")]
    NotConnected,

    /// Failed to establish a connection to the adapter.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connection to the adapter was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// Writing to the transport failed.
    #[error("Transport write failed: {reason}")]
    Write {
        /// Description of the write failure.
        reason: String,
    },

    /// The frame buffer grew past its cap without seeing a prompt.
    #[error("Frame overflow: discarded {discarded} bytes without a prompt")]
    FrameOverflow {
        /// Number of bytes thrown away.
        discarded: usize,
    },

    /// The adapter did not answer a command before its deadline.
    #[error("Command `{command}` timed out after {timeout:?}")]
    Timeout {
        /// Text of the command that timed out.
        command: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// A command was submitted while another one was still awaiting its reply.
    #[error("Command `{in_flight}` is already awaiting a reply")]
    AlreadyInFlight {
        /// Text of the command currently in flight.
        in_flight: String,
    },

    /// The reply frame could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },
}

impl Error {
    /// Whether this error means the link to the adapter is gone.
    ///
    /// The session treats these as fatal and reconnects.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Bluetooth(_)
                | Self::NotConnected
                | Self::ConnectionLost
                | Self::ConnectionFailed { .. }
                | Self::Write { .. }
        )
    }

    /// Whether the session can carry on after this error without reconnecting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Decode(_) | Self::FrameOverflow { .. }
        )
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::ConnectionLost.is_transport());
        assert!(Error::Write {
            reason: "gone".to_string()
        }
        .is_transport());
        assert!(!Error::ConnectionLost.is_recoverable());

        let timeout = Error::Timeout {
            command: "010C".to_string(),
            timeout: Duration::from_secs(2),
        };
        assert!(timeout.is_recoverable());
        assert!(!timeout.is_transport());

        let decode = Error::from(DecodeError::MalformedHeader);
        assert!(decode.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::AlreadyInFlight {
            in_flight: "ATZ".to_string(),
        };
        assert_eq!(err.to_string(), "Command `ATZ` is already awaiting a reply");

        let err = Error::FrameOverflow { discarded: 513 };
        assert_eq!(
            err.to_string(),
            "Frame overflow: discarded 513 bytes without a prompt"
        );
    }
}
