//! Inbound command routing.
//!
//! Messages are matched by exact topic and exact payload. Anything that does
//! not match a known command is logged and dropped.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::bus::client::InboundMessage;
use crate::bus::session::ControlTopics;

/// Payload on the OTA topic that triggers an update.
pub const OTA_TRIGGER: &str = "now";
/// Payload on the reset topic that restarts the device.
pub const RESET_TRIGGER: &str = "reset";
/// Debug payload answered with [`PONG`].
pub const PING: &str = "ping";
/// Reply to [`PING`].
pub const PONG: &str = "pong";
/// Debug payload answered with a status line.
pub const STATUS: &str = "status";

/// A recognized OTA trigger, consumed once by the OTA coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaRequest {
    /// Topic the trigger arrived on.
    pub topic: String,
    /// Trigger token.
    pub token: Bytes,
}

/// A routed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a firmware update.
    OtaTrigger(OtaRequest),
    /// Restart the device.
    Reset,
    /// Answer with [`PONG`] on the debug topic.
    Ping,
    /// Answer with a status line on the debug topic.
    Status,
}

/// Routes inbound messages to commands by exact topic match.
#[derive(Debug, Clone)]
pub struct CommandRouter {
    topics: ControlTopics,
    dropped: u64,
}

impl CommandRouter {
    /// Create a router for the given control topics.
    pub fn new(topics: ControlTopics) -> Self {
        Self { topics, dropped: 0 }
    }

    /// The control topics.
    pub fn topics(&self) -> &ControlTopics {
        &self.topics
    }

    /// Number of messages that did not map to a command.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Check if a message is an OTA trigger.
    pub fn is_ota_trigger(&self, message: &InboundMessage) -> bool {
        message.topic == self.topics.ota && message.payload.as_ref() == OTA_TRIGGER.as_bytes()
    }

    /// Map a message to a command, or `None` if it is not one.
    pub fn route(&mut self, message: &InboundMessage) -> Option<Command> {
        let payload = message.payload.as_ref();
        let topic = message.topic.as_str();

        let command = if topic == self.topics.ota {
            (payload == OTA_TRIGGER.as_bytes()).then(|| {
                Command::OtaTrigger(OtaRequest {
                    topic: message.topic.clone(),
                    token: message.payload.clone(),
                })
            })
        } else if topic == self.topics.reset {
            (payload == RESET_TRIGGER.as_bytes()).then_some(Command::Reset)
        } else if topic == self.topics.debug {
            match payload {
                p if p == PING.as_bytes() => Some(Command::Ping),
                p if p == STATUS.as_bytes() => Some(Command::Status),
                _ => {
                    // Our own replies land here as well.
                    debug!("Ignoring debug payload {:?}", message.payload_str());
                    self.dropped += 1;
                    return None;
                }
            }
        } else {
            warn!("Dropping message on unrecognized topic {}", topic);
            self.dropped += 1;
            return None;
        };

        if command.is_none() {
            debug!(
                "Ignoring payload {:?} on {}",
                message.payload_str().unwrap_or("<binary>"),
                topic
            );
            self.dropped += 1;
        }
        command
    }
}
