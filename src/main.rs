//! BLE to MQTT bridge.
//!
//! Run with: ble-mqtt-bridge [CONFIG]

use ble_mqtt_bridge::{
    BridgeConfig, BtleplugRadio, BusSessionManager, CommandUpdater, Components, EventDispatcher,
    GattClient, HostNetwork, MqttConnector, NotificationRelay, OtaCoordinator, Platform,
    ProcessRestart, Result, Supervisor, SystemClock, DEFAULT_CONFIG_PATH,
};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn load_config(path: Option<String>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::load(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => BridgeConfig::load(DEFAULT_CONFIG_PATH),
        None => {
            warn!("{} not found, using defaults", DEFAULT_CONFIG_PATH);
            Ok(BridgeConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(std::env::args().nth(1))?;
    info!(
        "Bridging {} to {}:{}",
        config.ble.target, config.broker.host, config.broker.port
    );

    let dispatcher = EventDispatcher::new();
    let radio = BtleplugRadio::new(dispatcher.sender()).await?;

    let components = Components {
        radio,
        dispatcher,
        gatt: GattClient::new(config.gatt_settings()),
        relay: NotificationRelay::new(config.relay_settings()),
        bus: BusSessionManager::new(MqttConnector::new(), config.session_settings()),
        ota: OtaCoordinator::new(CommandUpdater::new(
            config.ota.program.clone(),
            config.ota.args.clone(),
            Duration::from_secs(config.ota.timeout_secs),
        )),
    };
    let platform = Platform {
        network: Box::new(HostNetwork::new(config.broker.host.clone(), config.broker.port)),
        clock: Box::new(SystemClock::new()),
        restart: Box::new(ProcessRestart),
    };

    let mut supervisor = Supervisor::new(config.supervisor_settings(), components, platform);
    let reason = supervisor.run().await;
    info!("Bridge stopped: {}", reason);

    Ok(())
}
