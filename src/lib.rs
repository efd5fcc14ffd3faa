// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-mqtt-bridge
//!
//! Bridges one Bluetooth Low Energy sensor peripheral to an MQTT broker.
//!
//! The bridge connects to a peripheral with a known address, subscribes to
//! notifications on one characteristic and republishes a prefix of every
//! notification on a data topic. Control topics on the broker trigger
//! firmware updates, restarts and diagnostics.
//!
//! ## Components
//!
//! - **GATT client**: scan, connect, discover and subscribe, driven by radio events
//! - **Event dispatcher**: serializes radio callbacks into the GATT client
//! - **Bus session manager**: broker session with bounded reconnect backoff
//! - **Notification relay**: latest-value handoff from BLE to the broker
//! - **OTA coordinator**: quiesces BLE while an update runs and reports the result
//! - **Supervisor**: owns everything above and runs the cooperative main loop
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_mqtt_bridge::{BridgeConfig, Result};
//!
//! fn main() -> Result<()> {
//!     let config = BridgeConfig::from_toml_str(
//!         r#"
//!         [broker]
//!         host = "broker.local"
//!
//!         [ble]
//!         target = "AA:BB:CC:DD:EE:FF"
//!         "#,
//!     )?;
//!
//!     println!("Relaying to {}", config.topics.data);
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### macOS
//! Requires Bluetooth permission for the terminal or bundled app.

// Public modules
pub mod ble;
pub mod bus;
pub mod config;
pub mod error;
pub mod ota;
pub mod platform;
pub mod relay;
pub mod supervisor;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use config::{BridgeConfig, DEFAULT_CONFIG_PATH};
pub use error::{Error, Result};
pub use ota::{CommandUpdater, OtaCoordinator, OtaOutcome, Updater};
pub use relay::{NotificationRelay, PayloadFormat, RelaySettings, RelayStats};
pub use supervisor::{Components, ExitReason, Platform, Supervisor, SupervisorSettings};

// Re-export commonly used types from submodules
pub use ble::{
    BtleplugRadio, ConnectionHandle, EventDispatcher, GattClient, GattSettings, GattState,
    PeripheralAddress, RadioDriver, RadioEvent,
};
pub use bus::{
    BackoffPolicy, BusClient, BusConnector, BusSessionManager, Command, CommandRouter,
    ControlTopics, MqttConnector, SessionSettings,
};
pub use platform::{
    ClockSync, DeviceRestart, HostNetwork, NetworkAssociation, NetworkCredentials,
    ProcessRestart, SystemClock,
};
