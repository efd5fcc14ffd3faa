//! Error types for the ble-mqtt-bridge crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket or TLS level failure while talking to the broker.
    #[error("Transport error: {reason}")]
    Transport {
        /// Description of the transport failure.
        reason: String,
    },

    /// The broker rejected the handshake or the credentials.
    #[error("Protocol error: {reason}")]
    Protocol {
        /// Description of the rejection.
        reason: String,
    },

    /// Operation requires a bus session but none is connected.
    #[error("Bus session not connected")]
    NotConnected,

    /// The bus session dropped while in use.
    #[error("Bus connection lost: {reason}")]
    ConnectionLost {
        /// Description of why the connection was lost.
        reason: String,
    },

    /// Reconnecting gave up after the configured number of attempts.
    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of failed attempts.
        attempts: u32,
    },

    /// A command could not be handed to the radio.
    #[error("Radio error: {reason}")]
    Radio {
        /// Description of the radio failure.
        reason: String,
    },

    /// The target characteristic was not present on the peripheral.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// The firmware update failed.
    #[error("OTA update failed: {reason}")]
    Ota {
        /// Description of the failure.
        reason: String,
    },

    /// The operation is not valid in the current state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The attempted operation.
        operation: &'static str,
        /// The state the component was in.
        state: String,
    },

    /// A peripheral address could not be parsed.
    #[error("Invalid peripheral address: {value}")]
    InvalidAddress {
        /// The text that failed to parse.
        value: String,
    },

    /// Joining the given network failed.
    #[error("Network association failed: {ssid}")]
    NetworkAssociation {
        /// The network that could not be joined.
        ssid: String,
    },

    /// The system clock could not be synchronized.
    #[error("Clock synchronization failed: {reason}")]
    ClockSync {
        /// Description of the failure.
        reason: String,
    },

    /// The configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error (configuration file, CA certificate, updater process).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML.
    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether the bus reconnect backoff applies to this error.
    ///
    /// Credential rejection cannot be told apart from a transient refusal,
    /// so protocol errors are retried like transport errors.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Protocol { .. }
                | Self::ConnectionLost { .. }
                | Self::NotConnected
        )
    }

    pub(crate) fn radio(reason: impl Into<String>) -> Self {
        Self::Radio {
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn protocol(reason: impl std::fmt::Display) -> Self {
        Self::Protocol {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn connection_lost(reason: impl std::fmt::Display) -> Self {
        Self::ConnectionLost {
            reason: reason.to_string(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
