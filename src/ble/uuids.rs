//! BLE UUIDs and fixed attribute values.

use uuid::Uuid;

/// Base UUID for 16-bit Bluetooth SIG assigned numbers.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Default telemetry characteristic of the battery monitor.
pub const DEFAULT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_1101_0000_1000_8000_00805f9b34fb);

/// Value written to a CCCD to enable notifications (little endian 0x0001).
pub const NOTIFICATIONS_ENABLE: [u8; 2] = [0x01, 0x00];

/// Expand a 16-bit assigned number into a full UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_from_u16() {
        assert_eq!(uuid_from_u16(0x1101), DEFAULT_CHARACTERISTIC_UUID);
        assert_eq!(
            uuid_from_u16(0x181A).to_string(),
            "0000181a-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_default_characteristic_format() {
        let text = DEFAULT_CHARACTERISTIC_UUID.to_string();
        assert_eq!(text, "00001101-0000-1000-8000-00805f9b34fb");
    }
}
