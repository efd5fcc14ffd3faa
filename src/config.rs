//! Bridge configuration.
//!
//! Loaded from a TOML file. Every section and key is optional and falls
//! back to the defaults below.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::ble::gatt::{GattSettings, DEFAULT_SCAN_WINDOW};
use crate::ble::types::PeripheralAddress;
use crate::ble::uuids::DEFAULT_CHARACTERISTIC_UUID;
use crate::bus::client::{BrokerSettings, Credentials};
use crate::bus::reconnect::BackoffPolicy;
use crate::bus::session::{ControlTopics, SessionSettings};
use crate::error::{Error, Result};
use crate::platform::{AssociationPolicy, NetworkCredentials};
use crate::relay::{PayloadFormat, RelaySettings, DEFAULT_PREFIX_LEN};
use crate::supervisor::SupervisorSettings;

/// Path used when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "ble-mqtt-bridge.toml";

/// Upper bound for every duration setting, in seconds. One week.
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Network association.
    pub network: NetworkConfig,
    /// Broker connection.
    pub broker: BrokerConfig,
    /// Topic names.
    pub topics: TopicsConfig,
    /// BLE side.
    pub ble: BleConfig,
    /// Bus reconnect policy.
    pub reconnect: ReconnectConfig,
    /// Firmware updater.
    pub ota: OtaConfig,
}

/// Network association settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network tried first. Association is skipped when unset.
    pub primary: Option<NetworkCredentials>,
    /// Network tried when the primary one cannot be joined.
    pub fallback: Option<NetworkCredentials>,
    /// Attempts per network.
    pub attempts: u32,
    /// Timeout of one attempt in seconds.
    pub attempt_timeout_secs: u64,
    /// Pause between attempts in seconds.
    pub pause_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            primary: None,
            fallback: None,
            attempts: 3,
            attempt_timeout_secs: 5,
            pause_secs: 2,
        }
    }
}

/// Broker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT client identifier.
    pub client_id: String,
    /// User name; empty connects anonymously.
    pub username: String,
    /// Password.
    pub password: String,
    /// CA certificate for TLS; unset connects in plain text.
    pub ca_cert: Option<PathBuf>,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// How long one inbound poll may wait, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            client_id: "ESP32WoMoClient".to_string(),
            username: String::new(),
            password: String::new(),
            ca_cert: Some(PathBuf::from("/ssl/ca.crt")),
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            poll_interval_ms: 100,
        }
    }
}

/// Topic names.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Telemetry topic.
    pub data: String,
    /// OTA trigger and result topic.
    pub ota: String,
    /// Reset topic.
    pub reset: String,
    /// Debug topic.
    pub debug: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            data: "womo/ble/data".to_string(),
            ota: "womo/ota".to_string(),
            reset: "womo/reset".to_string(),
            debug: "womo/debug".to_string(),
        }
    }
}

/// BLE settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Address of the peripheral to connect to.
    pub target: PeripheralAddress,
    /// Characteristic to subscribe to.
    pub characteristic_uuid: Uuid,
    /// Scan window in seconds.
    pub scan_window_secs: u64,
    /// Pause before scanning again after a failure or disconnect, in seconds.
    pub rescan_delay_secs: u64,
    /// Number of notification bytes published.
    pub prefix_len: usize,
    /// Telemetry payload format.
    pub format: PayloadFormat,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            target: PeripheralAddress::new(
                [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
                Default::default(),
            ),
            characteristic_uuid: DEFAULT_CHARACTERISTIC_UUID,
            scan_window_secs: DEFAULT_SCAN_WINDOW.as_secs(),
            rescan_delay_secs: 1,
            prefix_len: DEFAULT_PREFIX_LEN,
            format: PayloadFormat::Raw,
        }
    }
}

/// Reconnect policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Consecutive failures before giving up.
    pub max_attempts: u32,
    /// Delay after the first failure, in seconds.
    pub base_delay_secs: u64,
    /// Added per further failure, in seconds.
    pub step_secs: u64,
    /// Delay cap in seconds.
    pub max_delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_secs: policy.base_delay.as_secs(),
            step_secs: policy.step.as_secs(),
            max_delay_secs: policy.max_delay.as_secs(),
        }
    }
}

/// Firmware updater settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Updater program.
    pub program: PathBuf,
    /// Updater arguments.
    pub args: Vec<String>,
    /// Timeout in seconds.
    pub timeout_secs: u64,
    /// Check for an update once at startup, before the first scan.
    pub check_on_startup: bool,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ble-mqtt-bridge-update"),
            args: Vec::new(),
            timeout_secs: 300,
            check_on_startup: true,
        }
    }
}

impl BridgeConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a configuration document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the bridge unusable.
    pub fn validate(&self) -> Result<()> {
        let topics = [
            ("data", &self.topics.data),
            ("ota", &self.topics.ota),
            ("reset", &self.topics.reset),
            ("debug", &self.topics.debug),
        ];
        for (name, topic) in topics {
            if topic.is_empty() {
                return Err(Error::Config(format!("topics.{} must not be empty", name)));
            }
        }
        if self.broker.host.is_empty() {
            return Err(Error::Config("broker.host must not be empty".to_string()));
        }
        if self.ble.prefix_len == 0 {
            return Err(Error::Config("ble.prefix_len must be at least 1".to_string()));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(Error::Config(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.network.fallback.is_some() && self.network.primary.is_none() {
            return Err(Error::Config(
                "network.fallback requires network.primary".to_string(),
            ));
        }

        let durations = [
            ("network.attempt_timeout_secs", self.network.attempt_timeout_secs, 1),
            ("network.pause_secs", self.network.pause_secs, 0),
            ("broker.connect_timeout_secs", self.broker.connect_timeout_secs, 1),
            ("ble.scan_window_secs", self.ble.scan_window_secs, 1),
            ("ble.rescan_delay_secs", self.ble.rescan_delay_secs, 0),
            ("reconnect.base_delay_secs", self.reconnect.base_delay_secs, 0),
            ("reconnect.step_secs", self.reconnect.step_secs, 0),
            ("reconnect.max_delay_secs", self.reconnect.max_delay_secs, 0),
            ("ota.timeout_secs", self.ota.timeout_secs, 1),
        ];
        for (name, value, min) in durations {
            check_range(name, value, min, MAX_DURATION_SECS)?;
        }
        check_range(
            "broker.keep_alive_secs",
            self.broker.keep_alive_secs,
            1,
            u64::from(u16::MAX),
        )?;
        check_range("broker.poll_interval_ms", self.broker.poll_interval_ms, 1, 60_000)?;
        Ok(())
    }

    /// GATT client settings.
    pub fn gatt_settings(&self) -> GattSettings {
        GattSettings {
            characteristic_uuid: self.ble.characteristic_uuid,
            scan_window: Duration::from_secs(self.ble.scan_window_secs),
        }
    }

    /// Bus session settings.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            broker: BrokerSettings {
                host: self.broker.host.clone(),
                port: self.broker.port,
                client_id: self.broker.client_id.clone(),
                ca_cert: self.broker.ca_cert.clone(),
                keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
                connect_timeout: Duration::from_secs(self.broker.connect_timeout_secs),
            },
            credentials: Credentials {
                username: self.broker.username.clone(),
                password: self.broker.password.clone(),
            },
            control_topics: self.control_topics(),
            backoff: BackoffPolicy {
                max_attempts: self.reconnect.max_attempts,
                base_delay: Duration::from_secs(self.reconnect.base_delay_secs),
                step: Duration::from_secs(self.reconnect.step_secs),
                max_delay: Duration::from_secs(self.reconnect.max_delay_secs),
            },
            poll_interval: Duration::from_millis(self.broker.poll_interval_ms),
        }
    }

    /// Topics the bridge subscribes to.
    pub fn control_topics(&self) -> ControlTopics {
        ControlTopics {
            ota: self.topics.ota.clone(),
            reset: self.topics.reset.clone(),
            debug: self.topics.debug.clone(),
        }
    }

    /// Relay settings.
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            data_topic: self.topics.data.clone(),
            prefix_len: self.ble.prefix_len,
            format: self.ble.format,
        }
    }

    /// Supervisor settings.
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            target: self.ble.target,
            rescan_delay: Duration::from_secs(self.ble.rescan_delay_secs),
            primary_network: self.network.primary.clone(),
            fallback_network: self.network.fallback.clone(),
            association: AssociationPolicy {
                attempts: self.network.attempts,
                attempt_timeout: Duration::from_secs(self.network.attempt_timeout_secs),
                pause: Duration::from_secs(self.network.pause_secs),
            },
            ota_on_startup: self.ota.check_on_startup,
        }
    }
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(Error::Config(format!(
            "{} must be between {} and {}, got {}",
            name, min, max, value
        )));
    }
    Ok(())
}
