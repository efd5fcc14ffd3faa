//! GATT client state machine.
//!
//! Owns the BLE connection lifecycle: scan for the target address, connect,
//! discover services and characteristics, enable notifications on the one
//! characteristic of interest and hand its notifications to the relay.
//!
//! Transitions are driven by [`RadioEvent`]s only, apart from the scan
//! window which the supervisor checks with [`GattClient::check_scan_deadline`].
//! Events that do not fit the current state are logged and dropped.

use bytes::Bytes;
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::events::{DiscoveryProcedure, RadioEvent};
use crate::ble::radio::RadioDriver;
use crate::ble::types::{
    AttributeRange, CharacteristicDescriptor, ConnectionHandle, NotificationPayload,
    PeripheralAddress, ServiceDescriptor,
};
use crate::ble::uuids::{DEFAULT_CHARACTERISTIC_UUID, NOTIFICATIONS_ENABLE};
use crate::error::{Error, Result};

/// Default scan window.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(10);

/// Lifecycle state of the GATT client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GattState {
    /// Radio idle, nothing in progress.
    #[default]
    Idle,
    /// Scanning for the target address.
    Scanning,
    /// Connect issued, waiting for the link.
    Connecting,
    /// Enumerating primary services.
    ServiceDiscovery,
    /// Waiting for the remaining characteristic discovery passes.
    CharacteristicDiscovery,
    /// Notification enable written, waiting for the write to complete.
    SubscribingNotifications,
    /// Relaying notifications.
    Active,
    /// The link went down.
    Disconnected,
    /// The link was abandoned after a failure.
    Error,
}

impl GattState {
    /// Check if a connection handle is held in this state.
    pub fn is_linked(&self) -> bool {
        matches!(
            self,
            Self::ServiceDiscovery
                | Self::CharacteristicDiscovery
                | Self::SubscribingNotifications
                | Self::Active
        )
    }

    /// Check if the supervisor has to recover the client before rescanning.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl std::fmt::Display for GattState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ServiceDiscovery => write!(f, "ServiceDiscovery"),
            Self::CharacteristicDiscovery => write!(f, "CharacteristicDiscovery"),
            Self::SubscribingNotifications => write!(f, "SubscribingNotifications"),
            Self::Active => write!(f, "Active"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// GATT client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattSettings {
    /// UUID of the characteristic to subscribe to.
    pub characteristic_uuid: Uuid,
    /// How long a scan may run without finding the target.
    pub scan_window: Duration,
}

impl Default for GattSettings {
    fn default() -> Self {
        Self {
            characteristic_uuid: DEFAULT_CHARACTERISTIC_UUID,
            scan_window: DEFAULT_SCAN_WINDOW,
        }
    }
}

/// The characteristic notifications are accepted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetainedCharacteristic {
    /// Connection the characteristic belongs to.
    pub conn: ConnectionHandle,
    /// Its value handle.
    pub value_handle: u16,
}

/// Something the supervisor has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOutput {
    /// The scan ended without finding the target.
    ScanWindowElapsed,
    /// The target could not be connected.
    ConnectFailed {
        /// Target address.
        address: PeripheralAddress,
    },
    /// Notifications are enabled.
    Active(RetainedCharacteristic),
    /// A notification to relay.
    Notification(NotificationPayload),
    /// Discovery finished without seeing the target characteristic.
    CharacteristicNotFound {
        /// The configured characteristic UUID.
        uuid: Uuid,
    },
    /// A GATT procedure could not be issued; the link was dropped.
    LinkFailed {
        /// The abandoned connection.
        conn: ConnectionHandle,
        /// Which procedure failed.
        procedure: &'static str,
    },
    /// The peripheral disconnected.
    Disconnected {
        /// The connection that went down.
        conn: ConnectionHandle,
    },
}

/// Everything scoped to one connection; dropped as a unit.
#[derive(Debug)]
struct Link {
    conn: ConnectionHandle,
    peer: PeripheralAddress,
    services: Vec<ServiceDescriptor>,
    services_done: bool,
    pending_passes: usize,
    characteristic: Option<CharacteristicDescriptor>,
}

impl Link {
    fn new(conn: ConnectionHandle, peer: PeripheralAddress) -> Self {
        Self {
            conn,
            peer,
            services: Vec::new(),
            services_done: false,
            pending_passes: 0,
            characteristic: None,
        }
    }
}

/// BLE central state machine for a single peripheral.
pub struct GattClient {
    settings: GattSettings,
    state: GattState,
    target: Option<PeripheralAddress>,
    scan_deadline: Option<Instant>,
    pending_connect: Option<PeripheralAddress>,
    link: Option<Link>,
    generation: u32,
    discarded: u64,
}

impl GattClient {
    /// Create an idle client.
    pub fn new(settings: GattSettings) -> Self {
        Self {
            settings,
            state: GattState::Idle,
            target: None,
            scan_deadline: None,
            pending_connect: None,
            link: None,
            generation: 0,
            discarded: 0,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> GattState {
        self.state
    }

    /// Get the connection generation, bumped on every disconnect.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Get the current connection handle.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.link.as_ref().map(|link| link.conn)
    }

    /// Get the peer of the current connection.
    pub fn peer(&self) -> Option<PeripheralAddress> {
        self.link.as_ref().map(|link| link.peer)
    }

    /// Number of services discovered on the current connection.
    pub fn service_count(&self) -> usize {
        self.link.as_ref().map_or(0, |link| link.services.len())
    }

    /// The characteristic notifications are accepted from, once found.
    pub fn retained(&self) -> Option<RetainedCharacteristic> {
        let link = self.link.as_ref()?;
        let characteristic = link.characteristic.as_ref()?;
        Some(RetainedCharacteristic {
            conn: link.conn,
            value_handle: characteristic.value_handle,
        })
    }

    /// Number of events dropped as unexpected or stale.
    pub fn discarded_events(&self) -> u64 {
        self.discarded
    }

    /// Get the settings.
    pub fn settings(&self) -> &GattSettings {
        &self.settings
    }

    /// Start scanning for `target`. Only valid from [`GattState::Idle`].
    pub fn start_scan<R: RadioDriver>(
        &mut self,
        target: PeripheralAddress,
        now: Instant,
        radio: &mut R,
    ) -> Result<()> {
        if self.state != GattState::Idle {
            return Err(Error::InvalidState {
                operation: "start scan",
                state: self.state.to_string(),
            });
        }

        radio.start_scan(self.settings.scan_window)?;

        info!(
            "Scanning for {} ({}s window)",
            target,
            self.settings.scan_window.as_secs()
        );

        self.target = Some(target);
        self.scan_deadline = Some(now + self.settings.scan_window);
        self.set_state(GattState::Scanning);
        Ok(())
    }

    /// End the scan if its window has elapsed without a match.
    pub fn check_scan_deadline<R: RadioDriver>(
        &mut self,
        now: Instant,
        radio: &mut R,
    ) -> Option<GattOutput> {
        if self.state != GattState::Scanning {
            return None;
        }

        match self.scan_deadline {
            Some(deadline) if now >= deadline => {
                if let Err(e) = radio.stop_scan() {
                    warn!("Failed to stop scan: {}", e);
                }
                info!("Scan window elapsed without finding target");
                self.scan_deadline = None;
                self.set_state(GattState::Idle);
                Some(GattOutput::ScanWindowElapsed)
            }
            _ => None,
        }
    }

    /// Return to [`GattState::Idle`] after a disconnect or failure.
    ///
    /// Returns `false` if the client was not in a terminal state.
    pub fn recover(&mut self) -> bool {
        if !self.state.is_terminal() {
            return false;
        }
        self.set_state(GattState::Idle);
        true
    }

    /// Abandon any scan or link and power the radio down.
    pub fn quiesce<R: RadioDriver>(&mut self, radio: &mut R) {
        match self.state {
            GattState::Scanning => {
                if let Err(e) = radio.stop_scan() {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            _ => {
                if let Some(conn) = self.connection() {
                    if let Err(e) = radio.disconnect(conn) {
                        warn!("Failed to disconnect {}: {}", conn, e);
                    }
                }
            }
        }

        if self.link.is_some() {
            self.invalidate_link();
        }
        self.scan_deadline = None;
        self.pending_connect = None;
        self.set_state(GattState::Idle);

        if let Err(e) = radio.set_active(false) {
            warn!("Failed to power down radio: {}", e);
        }
        info!("BLE quiesced");
    }

    /// Power the radio back up after [`GattClient::quiesce`].
    pub fn resume<R: RadioDriver>(&mut self, radio: &mut R) -> Result<()> {
        radio.set_active(true)?;
        info!("BLE resumed");
        Ok(())
    }

    /// Feed one radio event into the state machine.
    pub fn handle_event<R: RadioDriver>(
        &mut self,
        event: RadioEvent,
        _now: Instant,
        radio: &mut R,
    ) -> Option<GattOutput> {
        match (self.state, event) {
            (GattState::Scanning, RadioEvent::ScanResult { address, rssi }) => {
                self.on_scan_result(address, rssi, radio)
            }
            (GattState::Scanning, RadioEvent::ScanComplete) => {
                info!("Radio ended scan without finding target");
                self.scan_deadline = None;
                self.set_state(GattState::Idle);
                Some(GattOutput::ScanWindowElapsed)
            }
            (GattState::Connecting, RadioEvent::ConnectComplete { raw, address }) => {
                self.on_connected(raw, address, radio)
            }
            (GattState::Connecting, RadioEvent::ConnectFailed { address })
                if self.pending_connect.is_some_and(|p| p.matches(&address)) =>
            {
                warn!("Connection to {} failed", address);
                self.pending_connect = None;
                self.set_state(GattState::Error);
                Some(GattOutput::ConnectFailed { address })
            }
            (_, RadioEvent::Disconnect { raw }) => self.on_disconnect(raw),
            (GattState::ServiceDiscovery, RadioEvent::ServiceResult { conn, service }) => {
                self.on_service(conn, service, radio)
            }
            (
                GattState::ServiceDiscovery | GattState::CharacteristicDiscovery,
                RadioEvent::CharacteristicResult {
                    conn,
                    characteristic,
                },
            ) => self.on_characteristic(conn, characteristic, radio),
            (
                GattState::ServiceDiscovery | GattState::CharacteristicDiscovery,
                RadioEvent::DiscoveryDone { conn, procedure },
            ) => self.on_discovery_done(conn, procedure, radio),
            (
                GattState::SubscribingNotifications | GattState::Active,
                RadioEvent::DiscoveryDone { conn, .. },
            ) if self.is_current(conn) => {
                trace!("Discovery pass finished after target was found");
                None
            }
            (GattState::SubscribingNotifications, RadioEvent::WriteDone { conn, handle }) => {
                self.on_write_done(conn, handle)
            }
            (GattState::SubscribingNotifications, RadioEvent::WriteFailed { conn, handle }) => {
                self.on_write_failed(conn, handle, radio)
            }
            (
                GattState::Active,
                RadioEvent::Notification {
                    conn,
                    value_handle,
                    data,
                },
            ) => self.on_notification(conn, value_handle, data),
            (state, event) => {
                debug!("Ignoring {} in state {}", event.name(), state);
                self.discarded += 1;
                None
            }
        }
    }

    fn on_scan_result<R: RadioDriver>(
        &mut self,
        address: PeripheralAddress,
        rssi: Option<i16>,
        radio: &mut R,
    ) -> Option<GattOutput> {
        let is_target = self.target.is_some_and(|t| t.matches(&address));
        if !is_target {
            trace!("Advertisement from {} (rssi {:?})", address, rssi);
            return None;
        }

        info!("Found target {} (rssi {:?})", address, rssi);

        if let Err(e) = radio.stop_scan() {
            warn!("Failed to stop scan: {}", e);
        }
        self.scan_deadline = None;

        if let Err(e) = radio.connect(address) {
            warn!("Failed to issue connect to {}: {}", address, e);
            self.set_state(GattState::Error);
            return Some(GattOutput::ConnectFailed { address });
        }

        self.pending_connect = Some(address);
        self.set_state(GattState::Connecting);
        None
    }

    fn on_connected<R: RadioDriver>(
        &mut self,
        raw: u16,
        address: PeripheralAddress,
        radio: &mut R,
    ) -> Option<GattOutput> {
        let expected = self.pending_connect.is_some_and(|p| p.matches(&address));
        if !expected {
            debug!("Discarding connect-complete for unexpected peer {}", address);
            self.discarded += 1;
            return None;
        }

        let conn = ConnectionHandle {
            raw,
            generation: self.generation,
        };
        info!("Connected to {} ({})", address, conn);

        self.pending_connect = None;
        self.link = Some(Link::new(conn, address));
        self.set_state(GattState::ServiceDiscovery);

        if let Err(e) = radio.discover_services(conn, AttributeRange::FULL) {
            warn!("Failed to start service discovery: {}", e);
            return self.fail_link(radio, "discover services");
        }
        None
    }

    fn on_disconnect(&mut self, raw: u16) -> Option<GattOutput> {
        let conn = match self.connection() {
            Some(conn) if conn.raw == raw => conn,
            Some(conn) => {
                debug!("Discarding disconnect for handle {} (current {})", raw, conn);
                self.discarded += 1;
                return None;
            }
            None => {
                debug!("Discarding disconnect for handle {} without a link", raw);
                self.discarded += 1;
                return None;
            }
        };

        info!("Disconnected ({})", conn);
        self.invalidate_link();
        self.set_state(GattState::Disconnected);
        Some(GattOutput::Disconnected { conn })
    }

    fn on_service<R: RadioDriver>(
        &mut self,
        conn: ConnectionHandle,
        service: ServiceDescriptor,
        radio: &mut R,
    ) -> Option<GattOutput> {
        if !self.is_current(conn) {
            return self.discard_stale("service-result", conn);
        }

        debug!(
            "Service {} at {:#06x}..{:#06x}",
            service.uuid, service.range.start, service.range.end
        );

        let range = service.range;
        if let Some(link) = self.link.as_mut() {
            link.pending_passes += 1;
            link.services.push(service);
        }

        if let Err(e) = radio.discover_characteristics(conn, range) {
            warn!("Failed to start characteristic discovery: {}", e);
            return self.fail_link(radio, "discover characteristics");
        }
        None
    }

    fn on_characteristic<R: RadioDriver>(
        &mut self,
        conn: ConnectionHandle,
        characteristic: CharacteristicDescriptor,
        radio: &mut R,
    ) -> Option<GattOutput> {
        if !self.is_current(conn) {
            return self.discard_stale("characteristic-result", conn);
        }

        if characteristic.uuid != self.settings.characteristic_uuid {
            trace!("Skipping characteristic {}", characteristic.uuid);
            return None;
        }

        if !(characteristic.properties.notify || characteristic.properties.indicate) {
            warn!(
                "Characteristic {} does not declare notify, subscribing anyway",
                characteristic.uuid
            );
        }

        let cccd = characteristic.cccd_handle();
        info!(
            "Found characteristic {} at value handle {:#06x}",
            characteristic.uuid, characteristic.value_handle
        );

        if let Some(link) = self.link.as_mut() {
            link.characteristic = Some(characteristic);
        }

        if let Err(e) = radio.write_attribute(conn, cccd, &NOTIFICATIONS_ENABLE) {
            warn!("Failed to enable notifications: {}", e);
            return self.fail_link(radio, "enable notifications");
        }

        self.set_state(GattState::SubscribingNotifications);
        None
    }

    fn on_discovery_done<R: RadioDriver>(
        &mut self,
        conn: ConnectionHandle,
        procedure: DiscoveryProcedure,
        radio: &mut R,
    ) -> Option<GattOutput> {
        if !self.is_current(conn) {
            return self.discard_stale("discovery-done", conn);
        }

        let (finished, found) = match self.link.as_mut() {
            Some(link) => {
                match procedure {
                    DiscoveryProcedure::Services => link.services_done = true,
                    DiscoveryProcedure::Characteristics => {
                        link.pending_passes = link.pending_passes.saturating_sub(1)
                    }
                }
                (
                    link.services_done && link.pending_passes == 0,
                    link.characteristic.is_some(),
                )
            }
            None => return None,
        };

        if procedure == DiscoveryProcedure::Services && self.state == GattState::ServiceDiscovery
        {
            debug!("Found {} services", self.service_count());
            self.set_state(GattState::CharacteristicDiscovery);
        }

        if !finished || found {
            return None;
        }

        let uuid = self.settings.characteristic_uuid;
        warn!("Characteristic {} not found, disconnecting", uuid);

        if let Err(e) = radio.disconnect(conn) {
            warn!("Failed to disconnect {}: {}", conn, e);
        }
        self.invalidate_link();
        self.set_state(GattState::Error);
        Some(GattOutput::CharacteristicNotFound { uuid })
    }

    fn on_write_done(&mut self, conn: ConnectionHandle, handle: u16) -> Option<GattOutput> {
        if !self.is_current(conn) {
            return self.discard_stale("write-done", conn);
        }

        let retained = self.retained()?;
        if handle != retained.value_handle.wrapping_add(1) {
            debug!("Ignoring write-done for handle {:#06x}", handle);
            return None;
        }

        info!("Notifications enabled on {}", conn);
        self.set_state(GattState::Active);
        Some(GattOutput::Active(retained))
    }

    fn on_write_failed<R: RadioDriver>(
        &mut self,
        conn: ConnectionHandle,
        handle: u16,
        radio: &mut R,
    ) -> Option<GattOutput> {
        if !self.is_current(conn) {
            return self.discard_stale("write-failed", conn);
        }

        warn!("Write to {:#06x} failed on {}", handle, conn);
        self.fail_link(radio, "enable notifications")
    }

    fn on_notification(
        &mut self,
        conn: ConnectionHandle,
        value_handle: u16,
        data: Bytes,
    ) -> Option<GattOutput> {
        let expected = RetainedCharacteristic { conn, value_handle };
        if self.retained() != Some(expected) {
            return self.discard_stale("notification", conn);
        }

        trace!("Notification: {} bytes", data.len());
        Some(GattOutput::Notification(NotificationPayload {
            conn,
            value_handle,
            data,
            received_at: Utc::now(),
        }))
    }

    /// Drop the link and give up on the connection after a command failed.
    fn fail_link<R: RadioDriver>(
        &mut self,
        radio: &mut R,
        procedure: &'static str,
    ) -> Option<GattOutput> {
        let conn = self.connection()?;
        if let Err(e) = radio.disconnect(conn) {
            warn!("Failed to disconnect {}: {}", conn, e);
        }
        self.invalidate_link();
        self.set_state(GattState::Error);
        Some(GattOutput::LinkFailed { conn, procedure })
    }

    fn discard_stale(&mut self, event: &str, conn: ConnectionHandle) -> Option<GattOutput> {
        debug!("Discarding stale {} for {}", event, conn);
        self.discarded += 1;
        None
    }

    fn is_current(&self, conn: ConnectionHandle) -> bool {
        self.connection() == Some(conn)
    }

    fn invalidate_link(&mut self) {
        self.link = None;
        self.generation = self.generation.wrapping_add(1);
    }

    fn set_state(&mut self, new_state: GattState) {
        if self.state != new_state {
            debug!("GATT state changed: {} -> {}", self.state, new_state);
            self.state = new_state;
        }
    }
}
