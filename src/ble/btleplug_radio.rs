//! Radio driver backed by `btleplug`.
//!
//! Commands are queued to a worker task that owns the adapter. The worker
//! runs each command against `btleplug` and reports the outcome as
//! [`RadioEvent`]s through the event dispatcher.
//!
//! `btleplug` does not expose attribute handles, so the worker assigns them
//! itself. Each service gets a declaration handle followed by three handles
//! per characteristic: declaration, value and client configuration. Writing
//! the notification enable value to a configuration handle subscribes to
//! that characteristic.

use btleplug::api::{
    AddressType as BtAddressType, BDAddr, Central, CentralEvent, CharPropFlags, Characteristic,
    Manager as _, Peripheral as _, ScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::events::{DiscoveryProcedure, EventSender, RadioEvent};
use crate::ble::radio::{RadioCommand, RadioDriver};
use crate::ble::types::{
    AddressType, AttributeRange, CharacteristicDescriptor, CharacteristicProperties,
    ConnectionHandle, PeripheralAddress, ServiceDescriptor,
};
use crate::ble::uuids::NOTIFICATIONS_ENABLE;
use crate::error::{Error, Result};

fn bt_error(e: btleplug::Error) -> Error {
    Error::radio(e.to_string())
}

/// Convert a `btleplug` address.
pub fn peripheral_address(addr: BDAddr, kind: Option<BtAddressType>) -> PeripheralAddress {
    let kind = match kind {
        Some(BtAddressType::Random) => AddressType::Random,
        _ => AddressType::Public,
    };
    PeripheralAddress::new(addr.into_inner(), kind)
}

/// Convert `btleplug` characteristic properties.
pub fn characteristic_properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

/// A characteristic with its assigned value handle.
#[derive(Debug, Clone)]
pub struct MappedCharacteristic {
    /// Descriptor reported to the GATT client.
    pub descriptor: CharacteristicDescriptor,
    /// The `btleplug` characteristic.
    pub characteristic: Characteristic,
}

/// A service with its assigned handle range.
#[derive(Debug, Clone)]
pub struct MappedService {
    /// Descriptor reported to the GATT client.
    pub descriptor: ServiceDescriptor,
    /// Its characteristics.
    pub characteristics: Vec<MappedCharacteristic>,
}

/// Assign attribute handles to discovered services, starting at 1.
pub fn assign_handles<'a>(services: impl IntoIterator<Item = &'a Service>) -> Vec<MappedService> {
    let mut next: u16 = 1;
    let mut mapped = Vec::new();

    for service in services {
        let start = next;
        next = next.saturating_add(1);

        let mut characteristics = Vec::new();
        for characteristic in &service.characteristics {
            let value_handle = next.saturating_add(1);
            next = next.saturating_add(3);
            characteristics.push(MappedCharacteristic {
                descriptor: CharacteristicDescriptor {
                    uuid: characteristic.uuid,
                    value_handle,
                    properties: characteristic_properties(characteristic.properties),
                },
                characteristic: characteristic.clone(),
            });
        }

        mapped.push(MappedService {
            descriptor: ServiceDescriptor {
                uuid: service.uuid,
                range: AttributeRange::new(start, next.saturating_sub(1).max(start)),
            },
            characteristics,
        });
    }

    mapped
}

/// What a write to a synthesized attribute handle turns into.
#[derive(Debug, Clone)]
enum WriteAction {
    /// Enable notifications on the characteristic.
    Subscribe(Characteristic),
    /// Write the value to the characteristic.
    Write(Characteristic),
}

fn resolve_write(services: &[MappedService], handle: u16, value: &[u8]) -> Result<WriteAction> {
    let characteristics = || services.iter().flat_map(|s| s.characteristics.iter());

    if let Some(target) = characteristics().find(|c| c.descriptor.cccd_handle() == handle) {
        if value != NOTIFICATIONS_ENABLE {
            return Err(Error::radio(format!(
                "unsupported configuration value {:02X?}",
                value
            )));
        }
        return Ok(WriteAction::Subscribe(target.characteristic.clone()));
    }

    characteristics()
        .find(|c| c.descriptor.value_handle == handle)
        .map(|target| WriteAction::Write(target.characteristic.clone()))
        .ok_or_else(|| Error::radio(format!("no attribute at handle {:#06x}", handle)))
}

/// The connection the worker currently holds.
struct Link {
    raw: u16,
    id: PeripheralId,
    peripheral: Peripheral,
    conn: Option<ConnectionHandle>,
    services: Vec<MappedService>,
    listener: Option<JoinHandle<()>>,
}

/// [`RadioDriver`] on top of the first `btleplug` adapter.
pub struct BtleplugRadio {
    commands: mpsc::UnboundedSender<RadioCommand>,
    active: Arc<RwLock<bool>>,
    worker: JoinHandle<()>,
}

impl BtleplugRadio {
    /// Open the first adapter and start the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if no Bluetooth adapter is available.
    pub async fn new(events: EventSender) -> Result<Self> {
        let manager = Manager::new().await.map_err(bt_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(bt_error)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::radio("no Bluetooth adapter found"))?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        let central_events = adapter.events().await.map_err(bt_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(RwLock::new(true));

        let worker = Worker {
            adapter,
            events,
            active: active.clone(),
            scan_deadline: None,
            next_raw: 1,
            link: None,
        };
        let worker = tokio::spawn(worker.run(rx, central_events));

        Ok(Self {
            commands: tx,
            active,
            worker,
        })
    }

    fn submit(&self, command: RadioCommand) -> Result<()> {
        if !*self.active.read() {
            return Err(Error::radio("radio is powered down"));
        }
        self.commands
            .send(command)
            .map_err(|_| Error::radio("radio worker stopped"))
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl RadioDriver for BtleplugRadio {
    fn set_active(&mut self, active: bool) -> Result<()> {
        *self.active.write() = active;
        self.commands
            .send(RadioCommand::SetActive(active))
            .map_err(|_| Error::radio("radio worker stopped"))
    }

    fn start_scan(&mut self, window: Duration) -> Result<()> {
        self.submit(RadioCommand::StartScan { window })
    }

    fn stop_scan(&mut self) -> Result<()> {
        self.submit(RadioCommand::StopScan)
    }

    fn connect(&mut self, address: PeripheralAddress) -> Result<()> {
        self.submit(RadioCommand::Connect(address))
    }

    fn disconnect(&mut self, conn: ConnectionHandle) -> Result<()> {
        self.submit(RadioCommand::Disconnect(conn))
    }

    fn discover_services(&mut self, conn: ConnectionHandle, range: AttributeRange) -> Result<()> {
        self.submit(RadioCommand::DiscoverServices { conn, range })
    }

    fn discover_characteristics(
        &mut self,
        conn: ConnectionHandle,
        range: AttributeRange,
    ) -> Result<()> {
        self.submit(RadioCommand::DiscoverCharacteristics { conn, range })
    }

    fn write_attribute(
        &mut self,
        conn: ConnectionHandle,
        handle: u16,
        value: &[u8],
    ) -> Result<()> {
        self.submit(RadioCommand::WriteAttribute {
            conn,
            handle,
            value: value.to_vec(),
        })
    }
}

type CentralEvents = std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>;

struct Worker {
    adapter: Adapter,
    events: EventSender,
    active: Arc<RwLock<bool>>,
    scan_deadline: Option<Instant>,
    next_raw: u16,
    link: Option<Link>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RadioCommand>,
        mut central_events: CentralEvents,
    ) {
        debug!("Radio worker started");

        loop {
            let deadline = self.scan_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.execute(command).await,
                    None => break,
                },
                Some(event) = central_events.next() => self.on_central_event(event).await,
                _ = async { sleep_until(deadline.unwrap_or_else(Instant::now)).await },
                    if deadline.is_some() => {
                    debug!("Scan window over");
                    self.stop_scan().await;
                    self.events.send(RadioEvent::ScanComplete);
                }
            }
        }

        self.drop_link().await;
        debug!("Radio worker stopped");
    }

    async fn execute(&mut self, command: RadioCommand) {
        trace!("Radio command: {:?}", command);

        match command {
            RadioCommand::SetActive(true) => info!("Radio enabled"),
            RadioCommand::SetActive(false) => {
                self.stop_scan().await;
                self.drop_link().await;
                info!("Radio disabled");
            }
            _ if !*self.active.read() => {
                debug!("Radio disabled, dropping {:?}", command);
            }
            RadioCommand::StartScan { window } => {
                match self.adapter.start_scan(ScanFilter::default()).await {
                    Ok(()) => self.scan_deadline = Some(Instant::now() + window),
                    Err(e) => {
                        warn!("Failed to start scan: {}", e);
                        self.events.send(RadioEvent::ScanComplete);
                    }
                }
            }
            RadioCommand::StopScan => self.stop_scan().await,
            RadioCommand::Connect(address) => self.connect(address).await,
            RadioCommand::Disconnect(conn) => {
                if self.link.as_ref().is_some_and(|l| l.raw == conn.raw) {
                    self.drop_link().await;
                }
            }
            RadioCommand::DiscoverServices { conn, range } => {
                self.discover_services(conn, range).await
            }
            RadioCommand::DiscoverCharacteristics { conn, range } => {
                self.discover_characteristics(conn, range)
            }
            RadioCommand::WriteAttribute {
                conn,
                handle,
                value,
            } => self.write_attribute(conn, handle, value).await,
        }
    }

    fn take_link(&mut self, id: &PeripheralId) -> Option<Link> {
        if self.link.as_ref().is_some_and(|l| &l.id == id) {
            self.link.take()
        } else {
            None
        }
    }

    async fn stop_scan(&mut self) {
        if self.scan_deadline.take().is_some() {
            if let Err(e) = self.adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        }
    }

    async fn on_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if self.scan_deadline.is_none() {
                    return;
                }
                let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                    return;
                };
                if let Ok(Some(properties)) = peripheral.properties().await {
                    self.events.send(RadioEvent::ScanResult {
                        address: peripheral_address(properties.address, properties.address_type),
                        rssi: properties.rssi,
                    });
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                if let Some(link) = self.take_link(&id) {
                    info!("Link {} dropped by peer", link.raw);
                    if let Some(listener) = link.listener {
                        listener.abort();
                    }
                    self.events.send(RadioEvent::Disconnect { raw: link.raw });
                }
            }
            _ => {}
        }
    }

    async fn connect(&mut self, address: PeripheralAddress) {
        self.drop_link().await;

        let peripheral = match self.find_peripheral(address).await {
            Some(peripheral) => peripheral,
            None => {
                warn!("Peripheral {} not known to the adapter", address);
                self.events.send(RadioEvent::ConnectFailed { address });
                return;
            }
        };

        if let Err(e) = peripheral.connect().await {
            warn!("Connect to {} failed: {}", address, e);
            self.events.send(RadioEvent::ConnectFailed { address });
            return;
        }

        let raw = self.next_raw;
        self.next_raw = self.next_raw.wrapping_add(1).max(1);

        self.link = Some(Link {
            raw,
            id: peripheral.id(),
            peripheral,
            conn: None,
            services: Vec::new(),
            listener: None,
        });
        self.events.send(RadioEvent::ConnectComplete { raw, address });
    }

    async fn find_peripheral(&self, address: PeripheralAddress) -> Option<Peripheral> {
        let peripherals = self.adapter.peripherals().await.ok()?;
        peripherals
            .into_iter()
            .find(|p| p.address().into_inner() == address.bytes())
    }

    /// The link `conn` refers to, remembering the token on first use.
    fn link_for(&mut self, conn: ConnectionHandle) -> Option<&mut Link> {
        let link = self.link.as_mut().filter(|l| l.raw == conn.raw)?;
        match link.conn {
            Some(current) if current != conn => None,
            _ => {
                link.conn = Some(conn);
                Some(link)
            }
        }
    }

    async fn discover_services(&mut self, conn: ConnectionHandle, range: AttributeRange) {
        let events = self.events.clone();
        let Some(link) = self.link_for(conn) else {
            debug!("Service discovery for stale {}", conn);
            return;
        };

        if let Err(e) = link.peripheral.discover_services().await {
            warn!("Service discovery failed: {}", e);
        }
        link.services = assign_handles(link.peripheral.services().iter());

        for service in &link.services {
            if range.contains(service.descriptor.range.start) {
                events.send(RadioEvent::ServiceResult {
                    conn,
                    service: service.descriptor.clone(),
                });
            }
        }
        events.send(RadioEvent::DiscoveryDone {
            conn,
            procedure: DiscoveryProcedure::Services,
        });
    }

    fn discover_characteristics(&mut self, conn: ConnectionHandle, range: AttributeRange) {
        let events = self.events.clone();
        let Some(link) = self.link_for(conn) else {
            debug!("Characteristic discovery for stale {}", conn);
            return;
        };

        let characteristics = link
            .services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .filter(|c| range.contains(c.descriptor.value_handle));
        for characteristic in characteristics {
            events.send(RadioEvent::CharacteristicResult {
                conn,
                characteristic: characteristic.descriptor.clone(),
            });
        }
        events.send(RadioEvent::DiscoveryDone {
            conn,
            procedure: DiscoveryProcedure::Characteristics,
        });
    }

    async fn write_attribute(&mut self, conn: ConnectionHandle, handle: u16, value: Vec<u8>) {
        let events = self.events.clone();
        let Some(link) = self.link_for(conn) else {
            debug!("Write for stale {}", conn);
            return;
        };

        let outcome = match resolve_write(&link.services, handle, &value) {
            Ok(WriteAction::Subscribe(characteristic)) => {
                match link.peripheral.subscribe(&characteristic).await {
                    Ok(()) => {
                        if link.listener.is_none() {
                            link.listener = Some(spawn_listener(link, conn, events.clone()));
                        }
                        Ok(())
                    }
                    Err(e) => Err(bt_error(e)),
                }
            }
            Ok(WriteAction::Write(characteristic)) => link
                .peripheral
                .write(&characteristic, &value, WriteType::WithResponse)
                .await
                .map_err(bt_error),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                events.send(RadioEvent::WriteDone { conn, handle });
            }
            Err(e) => {
                warn!("Write to {:#06x} on {} failed: {}", handle, conn, e);
                events.send(RadioEvent::WriteFailed { conn, handle });
            }
        }
    }

    async fn drop_link(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        if let Some(listener) = link.listener {
            listener.abort();
        }
        if let Err(e) = link.peripheral.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
        debug!("Link {} closed", link.raw);
        self.events.send(RadioEvent::Disconnect { raw: link.raw });
    }
}

/// Forward notifications of the link's peripheral, tagged with `conn`.
fn spawn_listener(link: &Link, conn: ConnectionHandle, events: EventSender) -> JoinHandle<()> {
    let peripheral = link.peripheral.clone();
    let handles: HashMap<Uuid, u16> = link
        .services
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .map(|c| (c.descriptor.uuid, c.descriptor.value_handle))
        .collect();

    tokio::spawn(async move {
        let mut notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to get notification stream: {}", e);
                return;
            }
        };

        while let Some(notification) = notifications.next().await {
            let Some(&value_handle) = handles.get(&notification.uuid) else {
                trace!("Notification from unmapped {}", notification.uuid);
                continue;
            };
            let event = RadioEvent::Notification {
                conn,
                value_handle,
                data: Bytes::from(notification.value),
            };
            if !events.send(event) {
                break;
            }
        }
        debug!("Notification stream ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::uuid_from_u16;
    use btleplug::api::Descriptor;
    use std::collections::BTreeSet;

    fn characteristic(service: Uuid, short: u16, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid: uuid_from_u16(short),
            service_uuid: service,
            properties,
            descriptors: BTreeSet::<Descriptor>::new(),
        }
    }

    #[test]
    fn test_assign_handles() {
        let battery = uuid_from_u16(0x180F);
        let sensor = uuid_from_u16(0x181A);
        let services = vec![
            Service {
                uuid: battery,
                primary: true,
                characteristics: [characteristic(battery, 0x2A19, CharPropFlags::READ)]
                    .into_iter()
                    .collect(),
            },
            Service {
                uuid: sensor,
                primary: true,
                characteristics: [
                    characteristic(sensor, 0x1101, CharPropFlags::NOTIFY),
                    characteristic(sensor, 0x2A6E, CharPropFlags::READ | CharPropFlags::NOTIFY),
                ]
                .into_iter()
                .collect(),
            },
        ];

        let mapped = assign_handles(services.iter());

        assert_eq!(mapped[0].descriptor.range, AttributeRange::new(1, 4));
        assert_eq!(mapped[0].characteristics[0].descriptor.value_handle, 3);
        assert_eq!(mapped[1].descriptor.range, AttributeRange::new(5, 11));

        let values: Vec<u16> = mapped[1]
            .characteristics
            .iter()
            .map(|c| c.descriptor.value_handle)
            .collect();
        assert_eq!(values, vec![7, 10]);

        // Configuration handles stay inside the service range.
        for c in &mapped[1].characteristics {
            assert!(mapped[1].descriptor.range.contains(c.descriptor.cccd_handle()));
        }
    }

    #[test]
    fn test_resolve_write() {
        let sensor = uuid_from_u16(0x181A);
        let service = Service {
            uuid: sensor,
            primary: true,
            characteristics: [characteristic(sensor, 0x1101, CharPropFlags::NOTIFY | CharPropFlags::WRITE)]
                .into_iter()
                .collect(),
        };
        let mapped = assign_handles([&service]);
        let value_handle = mapped[0].characteristics[0].descriptor.value_handle;
        let cccd = value_handle + 1;

        assert!(matches!(
            resolve_write(&mapped, cccd, &NOTIFICATIONS_ENABLE),
            Ok(WriteAction::Subscribe(c)) if c.uuid == uuid_from_u16(0x1101)
        ));
        assert!(matches!(
            resolve_write(&mapped, value_handle, &[0x05]),
            Ok(WriteAction::Write(_))
        ));
        assert!(matches!(
            resolve_write(&mapped, cccd, &[0x02, 0x00]),
            Err(Error::Radio { .. })
        ));
        assert!(matches!(
            resolve_write(&mapped, 0x0100, &NOTIFICATIONS_ENABLE),
            Err(Error::Radio { .. })
        ));
    }

    #[test]
    fn test_empty_service_range() {
        let service = Service {
            uuid: uuid_from_u16(0x1800),
            primary: true,
            characteristics: BTreeSet::new(),
        };
        let mapped = assign_handles([&service]);
        assert_eq!(mapped[0].descriptor.range, AttributeRange::new(1, 1));
    }

    #[test]
    fn test_property_mapping() {
        let props = characteristic_properties(
            CharPropFlags::NOTIFY | CharPropFlags::WRITE_WITHOUT_RESPONSE,
        );
        assert!(props.notify);
        assert!(props.write);
        assert!(!props.read);
        assert!(!props.indicate);
    }

    #[test]
    fn test_address_conversion() {
        let addr = BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let converted = peripheral_address(addr, Some(BtAddressType::Random));
        assert_eq!(converted.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(converted.kind(), AddressType::Random);
        assert_eq!(peripheral_address(addr, None).kind(), AddressType::Public);
    }
}
