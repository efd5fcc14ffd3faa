//! Notification relay.
//!
//! Forwards notifications from the retained characteristic to the data
//! topic. At most one payload is pending; a newer one replaces it. Nothing
//! is queued while the bus is down and failed publishes are not retried.

use bytes::Bytes;
use serde::Deserialize;
use std::fmt::Write as _;
use tracing::{debug, trace, warn};

use crate::ble::gatt::RetainedCharacteristic;
use crate::ble::types::NotificationPayload;
use crate::bus::client::BusConnector;
use crate::bus::session::BusSessionManager;

/// Default number of notification bytes published.
pub const DEFAULT_PREFIX_LEN: usize = 5;

/// Encoding of the published telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// The bytes as received.
    #[default]
    Raw,
    /// Lowercase hex text.
    Hex,
}

/// Relay settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Topic telemetry is published to.
    pub data_topic: String,
    /// Maximum number of payload bytes published.
    pub prefix_len: usize,
    /// Payload encoding.
    pub format: PayloadFormat,
}

/// Relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Payloads published.
    pub published: u64,
    /// Payloads dropped because the bus was down or the publish failed.
    pub dropped: u64,
    /// Pending payloads replaced by a newer one.
    pub overwritten: u64,
    /// Notifications not from the retained characteristic.
    pub rejected: u64,
}

impl std::fmt::Display for RelayStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "published={} dropped={} overwritten={} rejected={}",
            self.published, self.dropped, self.overwritten, self.rejected
        )
    }
}

/// Moves notifications from the GATT client to the bus.
#[derive(Debug)]
pub struct NotificationRelay {
    settings: RelaySettings,
    pending: Option<NotificationPayload>,
    stats: RelayStats,
}

impl NotificationRelay {
    /// Create a relay with nothing pending.
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            settings,
            pending: None,
            stats: RelayStats::default(),
        }
    }

    /// Relay counters.
    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Check if a payload is waiting to be published.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Settings.
    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Accept a notification if it comes from the retained characteristic.
    ///
    /// Returns `false` if it was rejected.
    pub fn offer(
        &mut self,
        retained: Option<RetainedCharacteristic>,
        payload: NotificationPayload,
    ) -> bool {
        let expected = RetainedCharacteristic {
            conn: payload.conn,
            value_handle: payload.value_handle,
        };
        if retained != Some(expected) {
            debug!(
                "Rejecting notification from handle {:#06x} on {}",
                payload.value_handle, payload.conn
            );
            self.stats.rejected += 1;
            return false;
        }

        if self.pending.replace(payload).is_some() {
            trace!("Pending notification overwritten");
            self.stats.overwritten += 1;
        }
        true
    }

    /// Publish the pending payload, if any.
    ///
    /// Returns `true` if something was published.
    pub async fn flush<C: BusConnector>(&mut self, bus: &mut BusSessionManager<C>) -> bool {
        let Some(payload) = self.pending.take() else {
            return false;
        };

        if !bus.is_connected() {
            debug!("Bus down, dropping notification");
            self.stats.dropped += 1;
            return false;
        }

        let body = self.encode(&payload.data);
        match bus.publish(&self.settings.data_topic, body).await {
            Ok(()) => {
                trace!("Published {} bytes to {}", payload.data.len(), self.settings.data_topic);
                self.stats.published += 1;
                true
            }
            Err(e) => {
                warn!("Failed to publish notification: {}", e);
                self.stats.dropped += 1;
                false
            }
        }
    }

    /// Offer a notification and publish it right away.
    pub async fn on_notification<C: BusConnector>(
        &mut self,
        retained: Option<RetainedCharacteristic>,
        payload: NotificationPayload,
        bus: &mut BusSessionManager<C>,
    ) -> bool {
        self.offer(retained, payload) && self.flush(bus).await
    }

    /// Cut `data` to the prefix length and apply the payload format.
    pub fn encode(&self, data: &Bytes) -> Bytes {
        let prefix = data.slice(..data.len().min(self.settings.prefix_len));
        match self.settings.format {
            PayloadFormat::Raw => prefix,
            PayloadFormat::Hex => {
                let mut text = String::with_capacity(prefix.len() * 2);
                for byte in prefix.iter() {
                    let _ = write!(text, "{:02x}", byte);
                }
                Bytes::from(text)
            }
        }
    }
}
