//! MQTT bus client built on `rumqttc`.
//!
//! `rumqttc` splits a connection into a request handle ([`AsyncClient`]) and
//! an [`EventLoop`] that does the network I/O. Nothing is sent or received
//! unless the event loop is polled, so [`MqttClient::poll`] is what drives
//! both directions.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::bus::client::{BrokerSettings, BusClient, BusConnector, Credentials, InboundMessage};
use crate::error::{Error, Result};

/// Capacity of the request queue between client handle and event loop.
const REQUEST_CAPACITY: usize = 16;

/// How long a disconnect may take to flush.
const DISCONNECT_FLUSH: Duration = Duration::from_millis(250);

/// Check a SUBACK for `topic`. A refused filter is a protocol error.
pub fn check_suback(topic: &str, ack: &SubAck) -> Result<()> {
    if ack.return_codes.is_empty()
        || ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
    {
        return Err(Error::protocol(format!(
            "broker refused subscription to {}",
            topic
        )));
    }
    Ok(())
}

/// Opens MQTT sessions.
#[derive(Debug, Default, Clone)]
pub struct MqttConnector;

impl MqttConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

/// Build client options, without transport security.
pub fn mqtt_options(broker: &BrokerSettings, credentials: &Credentials) -> MqttOptions {
    let mut options = MqttOptions::new(&broker.client_id, &broker.host, broker.port);
    options.set_keep_alive(broker.keep_alive);
    options.set_clean_session(true);
    if !credentials.username.is_empty() {
        options.set_credentials(&credentials.username, &credentials.password);
    }
    options
}

/// Map a connection failure onto the crate taxonomy.
///
/// Only an explicit CONNACK refusal is a protocol error.
pub fn classify(error: ConnectionError) -> Error {
    match error {
        ConnectionError::ConnectionRefused(code) => {
            Error::protocol(format!("broker refused connection: {:?}", code))
        }
        other => Error::transport(other),
    }
}

#[async_trait]
impl BusConnector for MqttConnector {
    type Client = MqttClient;

    async fn connect(
        &mut self,
        broker: &BrokerSettings,
        credentials: &Credentials,
    ) -> Result<MqttClient> {
        let mut options = mqtt_options(broker, credentials);

        if let Some(path) = &broker.ca_cert {
            let ca = tokio::fs::read(path).await?;
            debug!("Loaded CA certificate from {}", path.display());
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }));
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let deadline = Instant::now() + broker.connect_timeout;
        loop {
            match timeout_at(deadline, eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    debug!("CONNACK received: {:?}", ack.code);
                    break;
                }
                Ok(Ok(event)) => trace!("Handshake event: {:?}", event),
                Ok(Err(e)) => return Err(classify(e)),
                Err(_) => {
                    return Err(Error::transport(format!(
                        "no CONNACK within {}s",
                        broker.connect_timeout.as_secs()
                    )))
                }
            }
        }

        Ok(MqttClient {
            client,
            eventloop,
            ack_timeout: broker.connect_timeout,
            backlog: VecDeque::new(),
        })
    }
}

/// An established MQTT session.
pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    /// How long the broker gets to acknowledge a subscription.
    ack_timeout: Duration,
    /// Messages that arrived while waiting for a SUBACK.
    backlog: VecDeque<InboundMessage>,
}

#[async_trait]
impl BusClient for MqttClient {
    /// Subscribe and wait for the broker's SUBACK.
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(Error::transport)?;

        let deadline = Instant::now() + self.ack_timeout;
        let mut pkid = None;
        loop {
            match timeout_at(deadline, self.eventloop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Subscribe(id)))) if pkid.is_none() => {
                    pkid = Some(id);
                }
                Ok(Ok(Event::Incoming(Packet::SubAck(ack)))) if pkid == Some(ack.pkid) => {
                    trace!("SUBACK for {}: {:?}", topic, ack.return_codes);
                    return check_suback(topic, &ack);
                }
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    self.backlog.push_back(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                    });
                }
                Ok(Ok(event)) => trace!("MQTT event: {:?}", event),
                Ok(Err(e)) => return Err(classify(e)),
                Err(_) => {
                    return Err(Error::transport(format!(
                        "no SUBACK for {} within {}s",
                        topic,
                        self.ack_timeout.as_secs()
                    )))
                }
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(Error::transport)
    }

    async fn poll(&mut self, wait: Duration) -> Result<Option<InboundMessage>> {
        if let Some(message) = self.backlog.pop_front() {
            return Ok(Some(message));
        }

        let deadline = Instant::now() + wait;
        loop {
            match timeout_at(deadline, self.eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    trace!("Inbound message on {}", publish.topic);
                    return Ok(Some(InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                    }));
                }
                Ok(Ok(event)) => trace!("MQTT event: {:?}", event),
                Ok(Err(e)) => return Err(Error::connection_lost(e)),
                Err(_) => return Ok(None),
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to queue disconnect: {}", e);
            return;
        }
        // Drive the event loop so the DISCONNECT packet goes out.
        let _ = timeout(DISCONNECT_FLUSH, self.eventloop.poll()).await;
    }
}
