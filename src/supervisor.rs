//! Top-level control loop.
//!
//! One task drives everything: radio events are drained into the GATT
//! client, the relay publishes what came out, and the bus is polled for one
//! command per step. The inbound poll is the step's yield point.

use bytes::Bytes;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::ble::events::EventDispatcher;
use crate::ble::gatt::{GattClient, GattOutput, GattState};
use crate::ble::radio::RadioDriver;
use crate::ble::types::PeripheralAddress;
use crate::bus::client::{BusConnector, InboundMessage};
use crate::bus::router::{Command, CommandRouter, OtaRequest, PONG};
use crate::bus::session::BusSessionManager;
use crate::error::Error;
use crate::ota::{OtaCoordinator, Updater};
use crate::platform::{
    associate, AssociationPolicy, ClockSync, DeviceRestart, NetworkAssociation,
    NetworkCredentials,
};
use crate::relay::NotificationRelay;

/// Debug message published before a commanded restart.
pub const RESET_NOTICE: &str = "restarting: reset command";

/// Token of the update check run at startup.
pub const STARTUP_OTA_TOKEN: &[u8] = b"startup";

/// Why the supervisor stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// A reset command was received.
    ResetCommand,
    /// The broker stayed unreachable.
    BusUnreachable {
        /// Failed connect attempts.
        attempts: u32,
    },
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResetCommand => write!(f, "reset command"),
            Self::BusUnreachable { attempts } => {
                write!(f, "broker unreachable after {} attempts", attempts)
            }
        }
    }
}

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Peripheral to connect to.
    pub target: PeripheralAddress,
    /// Pause before scanning again.
    pub rescan_delay: Duration,
    /// Network joined at startup.
    pub primary_network: Option<NetworkCredentials>,
    /// Network joined when the primary one fails.
    pub fallback_network: Option<NetworkCredentials>,
    /// How hard to try each network.
    pub association: AssociationPolicy,
    /// Run one update check once the broker is reachable.
    pub ota_on_startup: bool,
}

/// The core components the supervisor drives.
pub struct Components<R, C: BusConnector, U> {
    /// Radio driver.
    pub radio: R,
    /// Queue the radio posts events to.
    pub dispatcher: EventDispatcher,
    /// GATT client.
    pub gatt: GattClient,
    /// Notification relay.
    pub relay: NotificationRelay,
    /// Bus session manager.
    pub bus: BusSessionManager<C>,
    /// OTA coordinator.
    pub ota: OtaCoordinator<U>,
}

/// Platform collaborators.
pub struct Platform {
    /// Network association.
    pub network: Box<dyn NetworkAssociation>,
    /// Clock sync.
    pub clock: Box<dyn ClockSync>,
    /// Device restart.
    pub restart: Box<dyn DeviceRestart>,
}

/// Owns every component and runs the control loop.
pub struct Supervisor<R, C: BusConnector, U> {
    settings: SupervisorSettings,
    radio: R,
    dispatcher: EventDispatcher,
    gatt: GattClient,
    relay: NotificationRelay,
    bus: BusSessionManager<C>,
    router: CommandRouter,
    ota: OtaCoordinator<U>,
    platform: Platform,
    next_scan_at: Option<Instant>,
    started_at: Instant,
}

impl<R, C, U> Supervisor<R, C, U>
where
    R: RadioDriver,
    C: BusConnector,
    U: Updater,
{
    /// Assemble a supervisor.
    pub fn new(
        settings: SupervisorSettings,
        components: Components<R, C, U>,
        platform: Platform,
    ) -> Self {
        let router = CommandRouter::new(components.bus.settings().control_topics.clone());
        Self {
            settings,
            radio: components.radio,
            dispatcher: components.dispatcher,
            gatt: components.gatt,
            relay: components.relay,
            bus: components.bus,
            router,
            ota: components.ota,
            platform,
            next_scan_at: None,
            started_at: Instant::now(),
        }
    }

    /// The GATT client.
    pub fn gatt(&self) -> &GattClient {
        &self.gatt
    }

    /// The relay.
    pub fn relay(&self) -> &NotificationRelay {
        &self.relay
    }

    /// The bus session manager.
    pub fn bus(&self) -> &BusSessionManager<C> {
        &self.bus
    }

    /// The radio driver.
    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Mutable access to the radio driver.
    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Run until a restart is required, then invoke the restart collaborator.
    pub async fn run(&mut self) -> ExitReason {
        if let Some(reason) = self.startup().await {
            return self.shutdown(reason).await;
        }
        loop {
            if let Some(reason) = self.step().await {
                return self.shutdown(reason).await;
            }
        }
    }

    /// Join the network, check the clock, connect to the broker and,
    /// if enabled, check for a firmware update before the first scan.
    pub async fn startup(&mut self) -> Option<ExitReason> {
        info!("Starting bridge for {}", self.settings.target);

        if let Some(primary) = &self.settings.primary_network {
            let result = associate(
                self.platform.network.as_mut(),
                primary,
                self.settings.fallback_network.as_ref(),
                &self.settings.association,
            )
            .await;
            if let Err(e) = result {
                warn!("Continuing without network association: {}", e);
            }
        }

        if let Err(e) = self.platform.clock.synchronize().await {
            warn!("Clock sync failed: {}", e);
        }

        if let Err(e) = self.bus.reconnect().await {
            error!("Could not reach broker: {}", e);
            return Some(ExitReason::BusUnreachable {
                attempts: self.bus.reconnect_state().attempts(),
            });
        }

        if self.settings.ota_on_startup {
            let request = OtaRequest {
                topic: self.router.topics().ota.clone(),
                token: Bytes::from_static(STARTUP_OTA_TOKEN),
            };
            if let Some(reason) = self.run_ota(request).await {
                return Some(reason);
            }
        }

        self.next_scan_at = Some(Instant::now());
        None
    }

    /// One pass of the control loop.
    pub async fn step(&mut self) -> Option<ExitReason> {
        let now = Instant::now();

        while let Some(event) = self.dispatcher.try_next() {
            if let Some(output) =
                self.dispatcher
                    .dispatch(&mut self.gatt, event, now, &mut self.radio)
            {
                self.handle_output(output, now);
            }
        }
        self.relay.flush(&mut self.bus).await;

        if let Some(output) = self.gatt.check_scan_deadline(now, &mut self.radio) {
            self.handle_output(output, now);
        }
        self.maybe_start_scan(now);

        if self.bus.is_connected() {
            match self.bus.poll_inbound().await {
                Ok(Some(message)) => return self.handle_message(message).await,
                Ok(None) => {}
                Err(e) => warn!("{}", e),
            }
            return None;
        }

        match self.bus.reconnect_if_due(now).await {
            Some(Err(Error::ReconnectExhausted { attempts })) => {
                error!("Broker unreachable after {} attempts", attempts);
                Some(ExitReason::BusUnreachable { attempts })
            }
            Some(Err(e)) => {
                debug!("Reconnect attempt failed: {}", e);
                None
            }
            Some(Ok(())) => None,
            None => {
                tokio::time::sleep(self.bus.settings().poll_interval).await;
                None
            }
        }
    }

    /// One-line status report.
    pub fn status_line(&self) -> String {
        format!(
            "gatt={} generation={} radio_events={} relay: {} bus_published={} reconnect_attempts={} uptime={}s",
            self.gatt.state(),
            self.gatt.generation(),
            self.dispatcher.delivered(),
            self.relay.stats(),
            self.bus.published_count(),
            self.bus.reconnect_state().attempts(),
            self.started_at.elapsed().as_secs()
        )
    }

    fn handle_output(&mut self, output: GattOutput, now: Instant) {
        match output {
            GattOutput::Notification(payload) => {
                self.relay.offer(self.gatt.retained(), payload);
            }
            GattOutput::Active(retained) => {
                info!(
                    "Relaying notifications from handle {:#06x} on {}",
                    retained.value_handle, retained.conn
                );
            }
            GattOutput::ScanWindowElapsed => self.schedule_rescan(now),
            GattOutput::ConnectFailed { address } => {
                warn!("Could not connect to {}", address);
                self.gatt.recover();
                self.schedule_rescan(now);
            }
            GattOutput::CharacteristicNotFound { uuid } => {
                let error = Error::CharacteristicNotFound {
                    uuid: uuid.to_string(),
                };
                warn!("{}", error);
                self.gatt.recover();
                self.schedule_rescan(now);
            }
            GattOutput::LinkFailed { conn, procedure } => {
                warn!("Dropped {} after failing to {}", conn, procedure);
                self.gatt.recover();
                self.schedule_rescan(now);
            }
            GattOutput::Disconnected { conn } => {
                info!("Peripheral disconnected ({})", conn);
                self.gatt.recover();
                self.schedule_rescan(now);
            }
        }
    }

    fn schedule_rescan(&mut self, now: Instant) {
        self.next_scan_at = Some(now + self.settings.rescan_delay);
    }

    fn maybe_start_scan(&mut self, now: Instant) {
        if self.gatt.state() != GattState::Idle {
            return;
        }
        let due = self.next_scan_at.is_some_and(|at| now >= at);
        if !due {
            return;
        }

        match self
            .gatt
            .start_scan(self.settings.target, now, &mut self.radio)
        {
            Ok(()) => self.next_scan_at = None,
            Err(e) => {
                warn!("Failed to start scan: {}", e);
                self.schedule_rescan(now);
            }
        }
    }

    async fn handle_message(&mut self, message: InboundMessage) -> Option<ExitReason> {
        match self.router.route(&message)? {
            Command::OtaTrigger(request) => self.run_ota(request).await,
            command => self.execute(command).await,
        }
    }

    async fn run_ota(&mut self, request: OtaRequest) -> Option<ExitReason> {
        let outcome = self
            .ota
            .handle_trigger(
                request,
                &mut self.gatt,
                &mut self.radio,
                &mut self.bus,
                &self.router,
            )
            .await?;

        if outcome.ignored_triggers > 0 {
            info!(
                "Ignored {} OTA triggers received during the update",
                outcome.ignored_triggers
            );
        }
        self.next_scan_at = Some(Instant::now());

        for message in outcome.deferred {
            if let Some(command) = self.router.route(&message) {
                if let Some(reason) = self.execute(command).await {
                    return Some(reason);
                }
            }
        }
        None
    }

    async fn execute(&mut self, command: Command) -> Option<ExitReason> {
        let debug_topic = self.router.topics().debug.clone();
        match command {
            Command::Reset => {
                info!("Reset requested");
                if let Err(e) = self.bus.publish(&debug_topic, RESET_NOTICE.as_bytes()).await {
                    warn!("Could not announce restart: {}", e);
                }
                Some(ExitReason::ResetCommand)
            }
            Command::Ping => {
                if let Err(e) = self.bus.publish(&debug_topic, PONG.as_bytes()).await {
                    warn!("Could not answer ping: {}", e);
                }
                None
            }
            Command::Status => {
                let status = self.status_line();
                if let Err(e) = self.bus.publish(&debug_topic, status.into_bytes()).await {
                    warn!("Could not publish status: {}", e);
                }
                None
            }
            Command::OtaTrigger(request) => {
                warn!("Ignoring OTA trigger on {} received during an update", request.topic);
                None
            }
        }
    }

    async fn shutdown(&mut self, reason: ExitReason) -> ExitReason {
        error!("Stopping: {}", reason);
        self.gatt.quiesce(&mut self.radio);
        self.bus.disconnect().await;
        self.platform.restart.restart(&reason.to_string());
        reason
    }
}
