//! Radio driver seam.
//!
//! The GATT client issues primitive BLE operations through [`RadioDriver`].
//! Every method only hands the command to the radio; results come back
//! later as [`RadioEvent`](crate::ble::events::RadioEvent)s through the
//! event dispatcher.

use std::time::Duration;

use crate::ble::types::{AttributeRange, ConnectionHandle, PeripheralAddress};
use crate::error::Result;

/// Primitive BLE central operations.
pub trait RadioDriver {
    /// Power the radio on or off.
    fn set_active(&mut self, active: bool) -> Result<()>;

    /// Start scanning for advertisements for at most `window`.
    fn start_scan(&mut self, window: Duration) -> Result<()>;

    /// Stop an ongoing scan.
    fn stop_scan(&mut self) -> Result<()>;

    /// Connect to a peripheral.
    fn connect(&mut self, address: PeripheralAddress) -> Result<()>;

    /// Tear down a connection.
    fn disconnect(&mut self, conn: ConnectionHandle) -> Result<()>;

    /// Discover primary services within `range`.
    fn discover_services(&mut self, conn: ConnectionHandle, range: AttributeRange) -> Result<()>;

    /// Discover characteristics within a service's `range`.
    fn discover_characteristics(
        &mut self,
        conn: ConnectionHandle,
        range: AttributeRange,
    ) -> Result<()>;

    /// Write `value` to the attribute at `handle`.
    fn write_attribute(&mut self, conn: ConnectionHandle, handle: u16, value: &[u8])
        -> Result<()>;
}

/// A radio operation in message form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    /// See [`RadioDriver::set_active`].
    SetActive(bool),
    /// See [`RadioDriver::start_scan`].
    StartScan {
        /// Scan window.
        window: Duration,
    },
    /// See [`RadioDriver::stop_scan`].
    StopScan,
    /// See [`RadioDriver::connect`].
    Connect(PeripheralAddress),
    /// See [`RadioDriver::disconnect`].
    Disconnect(ConnectionHandle),
    /// See [`RadioDriver::discover_services`].
    DiscoverServices {
        /// Connection to discover on.
        conn: ConnectionHandle,
        /// Handle range to search.
        range: AttributeRange,
    },
    /// See [`RadioDriver::discover_characteristics`].
    DiscoverCharacteristics {
        /// Connection to discover on.
        conn: ConnectionHandle,
        /// Service handle range to search.
        range: AttributeRange,
    },
    /// See [`RadioDriver::write_attribute`].
    WriteAttribute {
        /// Connection to write on.
        conn: ConnectionHandle,
        /// Attribute handle.
        handle: u16,
        /// Value to write.
        value: Vec<u8>,
    },
}

impl RadioCommand {
    /// The connection a command targets, if any.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        match self {
            Self::Disconnect(conn)
            | Self::DiscoverServices { conn, .. }
            | Self::DiscoverCharacteristics { conn, .. }
            | Self::WriteAttribute { conn, .. } => Some(*conn),
            Self::SetActive(_) | Self::StartScan { .. } | Self::StopScan | Self::Connect(_) => None,
        }
    }

    /// Whether this is a discovery or write operation.
    pub fn is_gatt_procedure(&self) -> bool {
        matches!(
            self,
            Self::DiscoverServices { .. }
                | Self::DiscoverCharacteristics { .. }
                | Self::WriteAttribute { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_connection() {
        let conn = ConnectionHandle {
            raw: 1,
            generation: 0,
        };
        let cmd = RadioCommand::DiscoverServices {
            conn,
            range: AttributeRange::FULL,
        };
        assert_eq!(cmd.connection(), Some(conn));
        assert!(cmd.is_gatt_procedure());

        assert_eq!(RadioCommand::StopScan.connection(), None);
        assert!(!RadioCommand::Disconnect(conn).is_gatt_procedure());
    }
}
