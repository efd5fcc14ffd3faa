//! Message-bus side of the bridge.
//!
//! This module contains:
//! - The client seam the session manager drives
//! - Reconnect bookkeeping and backoff
//! - The session manager itself
//! - Inbound command routing
//! - The MQTT implementation of the client seam

pub mod client;
pub mod mqtt;
pub mod reconnect;
pub mod router;
pub mod session;

pub use client::{BrokerSettings, BusClient, BusConnector, Credentials, InboundMessage};
pub use mqtt::{MqttClient, MqttConnector};
pub use reconnect::{BackoffPolicy, ReconnectDecision, ReconnectState};
pub use router::{Command, CommandRouter, OtaRequest};
pub use session::{BusSessionManager, ControlTopics, Session, SessionSettings};
