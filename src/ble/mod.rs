//! BLE central side.
//!
//! This module holds the GATT client state machine, the radio abstraction
//! it drives and the `btleplug` implementation of that abstraction.

pub mod btleplug_radio;
pub mod events;
pub mod gatt;
pub mod radio;
pub mod types;
pub mod uuids;

pub use btleplug_radio::BtleplugRadio;
pub use events::{DiscoveryProcedure, EventDispatcher, EventSender, RadioEvent};
pub use gatt::{GattClient, GattOutput, GattSettings, GattState, RetainedCharacteristic};
pub use radio::{RadioCommand, RadioDriver};
pub use types::{
    AddressType, AttributeRange, CharacteristicDescriptor, CharacteristicProperties,
    ConnectionHandle, NotificationPayload, PeripheralAddress, ServiceDescriptor,
};
pub use uuids::*;
