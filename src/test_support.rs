//! In-memory fakes shared by the unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::ble::radio::{RadioCommand, RadioDriver};
use crate::ble::types::{AttributeRange, ConnectionHandle, PeripheralAddress};
use crate::bus::client::{BrokerSettings, BusClient, BusConnector, Credentials, InboundMessage};
use crate::bus::reconnect::BackoffPolicy;
use crate::bus::session::{ControlTopics, SessionSettings};
use crate::error::{Error, Result};

/// Address used as the scan target in tests.
pub(crate) fn target_address() -> PeripheralAddress {
    "AA:BB:CC:DD:EE:FF".parse().expect("valid test address")
}

/// Radio driver that records every command it is given.
#[derive(Debug)]
pub(crate) struct RecordingRadio {
    pub commands: Vec<RadioCommand>,
    pub active: bool,
    pub fail_gatt_procedures: bool,
}

impl Default for RecordingRadio {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            active: true,
            fail_gatt_procedures: false,
        }
    }
}

impl RecordingRadio {
    pub fn take(&mut self) -> Vec<RadioCommand> {
        std::mem::take(&mut self.commands)
    }

    fn procedure(&mut self, command: RadioCommand) -> Result<()> {
        if self.fail_gatt_procedures {
            return Err(Error::radio("procedure rejected"));
        }
        self.commands.push(command);
        Ok(())
    }
}

impl RadioDriver for RecordingRadio {
    fn set_active(&mut self, active: bool) -> Result<()> {
        self.active = active;
        self.commands.push(RadioCommand::SetActive(active));
        Ok(())
    }

    fn start_scan(&mut self, window: Duration) -> Result<()> {
        self.commands.push(RadioCommand::StartScan { window });
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        self.commands.push(RadioCommand::StopScan);
        Ok(())
    }

    fn connect(&mut self, address: PeripheralAddress) -> Result<()> {
        self.commands.push(RadioCommand::Connect(address));
        Ok(())
    }

    fn disconnect(&mut self, conn: ConnectionHandle) -> Result<()> {
        self.commands.push(RadioCommand::Disconnect(conn));
        Ok(())
    }

    fn discover_services(&mut self, conn: ConnectionHandle, range: AttributeRange) -> Result<()> {
        self.procedure(RadioCommand::DiscoverServices { conn, range })
    }

    fn discover_characteristics(
        &mut self,
        conn: ConnectionHandle,
        range: AttributeRange,
    ) -> Result<()> {
        self.procedure(RadioCommand::DiscoverCharacteristics { conn, range })
    }

    fn write_attribute(
        &mut self,
        conn: ConnectionHandle,
        handle: u16,
        value: &[u8],
    ) -> Result<()> {
        self.procedure(RadioCommand::WriteAttribute {
            conn,
            handle,
            value: value.to_vec(),
        })
    }
}

/// Outcome scripted for one connect attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ConnectScript {
    Accept,
    TransportFailure,
    Rejected,
    MissingCertificate,
}

/// Shared state of the scripted broker.
#[derive(Debug, Default)]
pub(crate) struct BrokerState {
    /// Outcomes for upcoming connect attempts; accept once exhausted.
    pub connect_script: VecDeque<ConnectScript>,
    pub connect_attempts: u32,
    pub sessions_opened: u32,
    pub subscriptions: Vec<String>,
    pub inbound: VecDeque<InboundMessage>,
    pub published: Vec<(String, Bytes)>,
    /// Fail the next poll with a lost connection.
    pub drop_connection: bool,
    pub disconnects: u32,
}

/// Broker double; clones share state with the connector and its clients.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBroker {
    pub state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn script(&self, outcomes: &[ConnectScript]) {
        self.state.lock().connect_script.extend(outcomes.iter().copied());
    }

    pub fn deliver(&self, topic: &str, payload: &str) {
        self.state.lock().inbound.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        });
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.state.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }
}

#[async_trait]
impl BusConnector for FakeBroker {
    type Client = FakeBusClient;

    async fn connect(
        &mut self,
        _broker: &BrokerSettings,
        _credentials: &Credentials,
    ) -> Result<FakeBusClient> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        match state.connect_script.pop_front().unwrap_or(ConnectScript::Accept) {
            ConnectScript::Accept => {
                state.sessions_opened += 1;
                state.drop_connection = false;
                Ok(FakeBusClient {
                    broker: self.clone(),
                    session: state.sessions_opened,
                })
            }
            ConnectScript::TransportFailure => Err(Error::transport("connection refused")),
            ConnectScript::Rejected => Err(Error::protocol("not authorized")),
            ConnectScript::MissingCertificate => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "ca.crt",
            ))),
        }
    }
}

/// Client handed out by [`FakeBroker`].
#[derive(Debug)]
pub(crate) struct FakeBusClient {
    broker: FakeBroker,
    pub session: u32,
}

#[async_trait]
impl BusClient for FakeBusClient {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.broker.state.lock().subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()> {
        let mut state = self.broker.state.lock();
        if state.drop_connection {
            return Err(Error::connection_lost("broker went away"));
        }
        state.published.push((topic.to_string(), payload));
        Ok(())
    }

    async fn poll(&mut self, wait: Duration) -> Result<Option<InboundMessage>> {
        let next = {
            let mut state = self.broker.state.lock();
            if state.drop_connection {
                return Err(Error::connection_lost("broker went away"));
            }
            state.inbound.pop_front()
        };

        match next {
            Some(message) => Ok(Some(message)),
            None => {
                tokio::time::sleep(wait).await;
                Ok(None)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.broker.state.lock().disconnects += 1;
    }
}

/// Session settings with zero backoff and a short poll interval.
pub(crate) fn session_settings() -> SessionSettings {
    SessionSettings {
        broker: BrokerSettings {
            host: "broker.local".to_string(),
            port: 8883,
            client_id: "test-bridge".to_string(),
            ca_cert: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        },
        credentials: Credentials::default(),
        control_topics: ControlTopics {
            ota: "bridge/ota".to_string(),
            reset: "bridge/reset".to_string(),
            debug: "bridge/debug".to_string(),
        },
        backoff: BackoffPolicy {
            base_delay: Duration::ZERO,
            ..Default::default()
        },
        poll_interval: Duration::from_millis(1),
    }
}
