//! Radio events and the event dispatcher.
//!
//! Radio drivers post [`RadioEvent`]s into a single queue; the supervisor
//! drains the queue in delivery order and the dispatcher hands each event to
//! the GATT client.

use bytes::Bytes;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::trace;

use crate::ble::gatt::{GattClient, GattOutput};
use crate::ble::radio::RadioDriver;
use crate::ble::types::{
    CharacteristicDescriptor, ConnectionHandle, PeripheralAddress, ServiceDescriptor,
};

/// Discovery procedure reported complete by [`RadioEvent::DiscoveryDone`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryProcedure {
    /// Primary service discovery.
    Services,
    /// Characteristic discovery within one service.
    Characteristics,
}

/// An asynchronous event reported by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// An advertisement was received.
    ScanResult {
        /// Advertiser address.
        address: PeripheralAddress,
        /// Signal strength in dBm, if known.
        rssi: Option<i16>,
    },
    /// The radio ended the scan on its own.
    ScanComplete,
    /// A connection came up.
    ConnectComplete {
        /// Raw handle issued by the radio.
        raw: u16,
        /// Peer address.
        address: PeripheralAddress,
    },
    /// A connection attempt failed.
    ConnectFailed {
        /// Peer address.
        address: PeripheralAddress,
    },
    /// A connection went down.
    Disconnect {
        /// Raw handle of the connection.
        raw: u16,
    },
    /// A primary service was discovered.
    ServiceResult {
        /// Connection the result belongs to.
        conn: ConnectionHandle,
        /// The service.
        service: ServiceDescriptor,
    },
    /// A characteristic was discovered.
    CharacteristicResult {
        /// Connection the result belongs to.
        conn: ConnectionHandle,
        /// The characteristic.
        characteristic: CharacteristicDescriptor,
    },
    /// A discovery procedure finished.
    DiscoveryDone {
        /// Connection the procedure ran on.
        conn: ConnectionHandle,
        /// Which procedure finished.
        procedure: DiscoveryProcedure,
    },
    /// An attribute write could not be carried out.
    WriteFailed {
        /// Connection the write ran on.
        conn: ConnectionHandle,
        /// Attribute handle written.
        handle: u16,
    },
    /// An attribute write completed.
    WriteDone {
        /// Connection the write ran on.
        conn: ConnectionHandle,
        /// Attribute handle written.
        handle: u16,
    },
    /// A notification arrived.
    Notification {
        /// Connection the notification arrived on.
        conn: ConnectionHandle,
        /// Value handle of the notifying characteristic.
        value_handle: u16,
        /// Notified value.
        data: Bytes,
    },
}

impl RadioEvent {
    /// Short name used in log messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScanResult { .. } => "scan-result",
            Self::ScanComplete => "scan-complete",
            Self::ConnectComplete { .. } => "connect-complete",
            Self::ConnectFailed { .. } => "connect-failed",
            Self::Disconnect { .. } => "disconnect",
            Self::ServiceResult { .. } => "service-result",
            Self::CharacteristicResult { .. } => "characteristic-result",
            Self::DiscoveryDone { .. } => "discovery-done",
            Self::WriteDone { .. } => "write-done",
            Self::WriteFailed { .. } => "write-failed",
            Self::Notification { .. } => "notification",
        }
    }
}

/// Cloneable handle radio drivers use to post events.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<RadioEvent>,
}

impl EventSender {
    /// Post an event. Returns `false` if the dispatcher is gone.
    pub fn send(&self, event: RadioEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Single-consumer queue of radio events feeding the GATT client.
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<RadioEvent>,
    rx: mpsc::UnboundedReceiver<RadioEvent>,
    delivered: u64,
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx, delivered: 0 }
    }

    /// Get a sender for a radio driver.
    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Take the next queued event without waiting.
    pub fn try_next(&mut self) -> Option<RadioEvent> {
        self.rx.try_recv().ok()
    }

    /// Number of events handed to the GATT client so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Hand one event to the GATT client.
    pub fn dispatch<R: RadioDriver>(
        &mut self,
        gatt: &mut GattClient,
        event: RadioEvent,
        now: Instant,
        radio: &mut R,
    ) -> Option<GattOutput> {
        trace!("Dispatching {} in state {}", event.name(), gatt.state());
        self.delivered += 1;
        gatt.handle_event(event, now, radio)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_delivered_in_order() {
        let mut dispatcher = EventDispatcher::new();
        let sender = dispatcher.sender();

        assert!(sender.send(RadioEvent::ScanComplete));
        assert!(sender.send(RadioEvent::Disconnect { raw: 7 }));

        assert_eq!(dispatcher.try_next(), Some(RadioEvent::ScanComplete));
        assert_eq!(dispatcher.try_next(), Some(RadioEvent::Disconnect { raw: 7 }));
        assert_eq!(dispatcher.try_next(), None);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(RadioEvent::ScanComplete.name(), "scan-complete");
        assert_eq!(RadioEvent::Disconnect { raw: 1 }.name(), "disconnect");
    }

    #[test]
    fn test_dispatch_counts_delivered_events() {
        use crate::ble::gatt::{GattSettings, GattState};
        use crate::test_support::{target_address, RecordingRadio};

        let mut dispatcher = EventDispatcher::new();
        let mut gatt = GattClient::new(GattSettings::default());
        let mut radio = RecordingRadio::default();
        gatt.start_scan(target_address(), Instant::now(), &mut radio)
            .unwrap();

        dispatcher.sender().send(RadioEvent::ScanComplete);
        let event = dispatcher.try_next().unwrap();
        let output = dispatcher.dispatch(&mut gatt, event, Instant::now(), &mut radio);

        assert_eq!(output, Some(GattOutput::ScanWindowElapsed));
        assert_eq!(gatt.state(), GattState::Idle);
        assert_eq!(dispatcher.delivered(), 1);
    }
}
