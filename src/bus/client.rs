//! Message-bus client seam.
//!
//! The session manager drives the bus through [`BusConnector`] and
//! [`BusClient`]; [`crate::bus::mqtt`] implements them on top of an MQTT
//! client library.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Broker identity and transport parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Broker host name, also used as the TLS server name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier presented in the handshake.
    pub client_id: String,
    /// CA certificate (PEM) the broker certificate must chain to. `None`
    /// connects without TLS.
    pub ca_cert: Option<PathBuf>,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Upper bound for transport setup plus handshake.
    pub connect_timeout: Duration,
}

/// Broker credentials.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published to.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
}

impl InboundMessage {
    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Opens bus sessions: transport setup plus protocol handshake.
#[async_trait]
pub trait BusConnector: Send {
    /// The client type of an established session.
    type Client: BusClient;

    /// Open the transport and complete the handshake.
    ///
    /// Fails with [`Error::Transport`](crate::Error::Transport) for
    /// network/TLS failures and [`Error::Protocol`](crate::Error::Protocol)
    /// when the broker rejects the handshake.
    async fn connect(
        &mut self,
        broker: &BrokerSettings,
        credentials: &Credentials,
    ) -> Result<Self::Client>;
}

/// An established bus session.
#[async_trait]
pub trait BusClient: Send {
    /// Subscribe to a topic.
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Publish a payload. Never retried or buffered by the client.
    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()>;

    /// Wait at most `wait` for the next inbound message.
    ///
    /// Fails with [`Error::ConnectionLost`](crate::Error::ConnectionLost)
    /// when the session is no longer usable.
    async fn poll(&mut self, wait: Duration) -> Result<Option<InboundMessage>>;

    /// Close the session.
    async fn disconnect(&mut self);
}
