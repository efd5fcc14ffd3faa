//! Data types shared by the GATT client, the radio driver and the relay.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Link-layer address type reported alongside an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressType {
    /// IEEE-assigned public address.
    #[default]
    Public,
    /// Random (static or private) address.
    Random,
}

/// Six-byte BLE device address plus its type tag.
///
/// Target matching compares the address bytes only; the type tag is kept so
/// the connect command can be issued with what the advertisement reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeripheralAddress {
    bytes: [u8; 6],
    kind: AddressType,
}

impl PeripheralAddress {
    /// Create an address from its bytes, most significant byte first.
    pub const fn new(bytes: [u8; 6], kind: AddressType) -> Self {
        Self { bytes, kind }
    }

    /// The raw address bytes, most significant byte first.
    pub fn bytes(&self) -> [u8; 6] {
        self.bytes
    }

    /// The address type tag.
    pub fn kind(&self) -> AddressType {
        self.kind
    }

    /// Exact byte equality, ignoring the type tag.
    pub fn matches(&self, other: &PeripheralAddress) -> bool {
        self.bytes == other.bytes
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for PeripheralAddress {
    type Err = Error;

    /// Parse the colon separated form, e.g. `AA:BB:CC:DD:EE:FF`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidAddress {
            value: s.to_string(),
        };

        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(':');

        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self::new(bytes, AddressType::Public))
    }
}

impl<'de> Deserialize<'de> for PeripheralAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Connection token: the radio's raw handle plus the connection generation.
///
/// The generation makes a handle unique across connection instances even if
/// the radio stack recycles raw handle values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    /// Handle value issued by the radio stack on connect.
    pub raw: u16,
    /// Generation counter of the GATT client when the link came up.
    pub generation: u32,
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn {}#{}", self.raw, self.generation)
    }
}

/// Inclusive attribute-handle range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeRange {
    /// First handle in the range.
    pub start: u16,
    /// Last handle in the range.
    pub end: u16,
}

impl AttributeRange {
    /// The whole attribute table.
    pub const FULL: AttributeRange = AttributeRange {
        start: 0x0001,
        end: 0xFFFF,
    };

    /// Create a range.
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Check if a handle falls inside the range.
    pub fn contains(&self, handle: u16) -> bool {
        (self.start..=self.end).contains(&handle)
    }
}

/// A primary service discovered on the current connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service UUID.
    pub uuid: Uuid,
    /// Handle range covered by the service.
    pub range: AttributeRange,
}

/// Declared characteristic properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    /// Value can be read.
    pub read: bool,
    /// Value can be written.
    pub write: bool,
    /// Value changes can be notified.
    pub notify: bool,
    /// Value changes can be indicated.
    pub indicate: bool,
}

/// A characteristic reported during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Handle of the characteristic value attribute.
    pub value_handle: u16,
    /// Declared properties.
    pub properties: CharacteristicProperties,
}

impl CharacteristicDescriptor {
    /// Handle of the client characteristic configuration descriptor, which
    /// directly follows the value attribute.
    pub fn cccd_handle(&self) -> u16 {
        self.value_handle.wrapping_add(1)
    }
}

/// A notification received on the retained characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPayload {
    /// Connection the notification arrived on.
    pub conn: ConnectionHandle,
    /// Value handle the notification was sent from.
    pub value_handle: u16,
    /// Raw value bytes.
    pub data: Bytes,
    /// When the GATT client accepted the notification.
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let addr: PeripheralAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(addr.bytes(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(addr.kind(), AddressType::Public);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");

        let lower: PeripheralAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(lower, addr);
    }

    #[test]
    fn test_parse_invalid_address() {
        assert!("AA:BB:CC:DD:EE".parse::<PeripheralAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:FF:00".parse::<PeripheralAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<PeripheralAddress>().is_err());
        assert!("AABBCCDDEEFF".parse::<PeripheralAddress>().is_err());
        assert!("A:BB:CC:DD:EE:FFF".parse::<PeripheralAddress>().is_err());
    }

    #[test]
    fn test_address_matching_ignores_type() {
        let bytes = [1, 2, 3, 4, 5, 6];
        let public = PeripheralAddress::new(bytes, AddressType::Public);
        let random = PeripheralAddress::new(bytes, AddressType::Random);
        assert!(public.matches(&random));
        assert_ne!(public, random);

        let other = PeripheralAddress::new([1, 2, 3, 4, 5, 7], AddressType::Public);
        assert!(!public.matches(&other));
    }

    #[test]
    fn test_attribute_range() {
        let range = AttributeRange::new(0x10, 0x1F);
        assert!(range.contains(0x10));
        assert!(range.contains(0x1F));
        assert!(!range.contains(0x20));
        assert!(AttributeRange::FULL.contains(0xFFFF));
        assert!(!AttributeRange::FULL.contains(0));
    }

    #[test]
    fn test_cccd_handle() {
        let descriptor = CharacteristicDescriptor {
            uuid: Uuid::nil(),
            value_handle: 0x2A,
            properties: CharacteristicProperties::default(),
        };
        assert_eq!(descriptor.cccd_handle(), 0x2B);
    }
}
