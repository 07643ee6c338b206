//! MQTT 3.1.1 broker client on `rumqttc`.
//!
//! The event loop is driven inline by each call, so nothing runs between
//! publishes and the whole agent stays on one task.

use super::{BrokerClient, SessionInfo, TransportError, KEEP_ALIVE};
use crate::config::AgentConfig;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, StateError,
};

/// Queue depth between the client handle and its event loop.
const REQUEST_CAPACITY: usize = 10;

/// A clean-session MQTT connection identified only by client id.
pub struct MqttBroker {
    options: MqttOptions,
    endpoint: String,
    connection: Option<(AsyncClient, EventLoop)>,
}

impl MqttBroker {
    pub fn new(config: &AgentConfig) -> Self {
        let mut options = MqttOptions::new(
            config.client_id.clone(),
            config.broker_host.clone(),
            config.broker_port,
        );
        options.set_keep_alive(KEEP_ALIVE).set_clean_session(true);

        Self {
            options,
            endpoint: config.broker_address(),
            connection: None,
        }
    }
}

#[async_trait]
impl BrokerClient for MqttBroker {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn open(&mut self) -> Result<SessionInfo, TransportError> {
        self.connection = None;
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Refused(format!("{:?}", ack.code)));
                    }
                    break;
                }
                _ => continue,
            }
        }

        self.connection = Some((client, eventloop));
        Ok(SessionInfo {
            keep_alive: self.options.keep_alive(),
        })
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let (client, eventloop) = self.connection.as_mut().ok_or(TransportError::NotConnected)?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        loop {
            if let Event::Outgoing(Outgoing::Publish(_)) = eventloop.poll().await? {
                return Ok(());
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some((client, mut eventloop)) = self.connection.take() else {
            return Ok(());
        };
        client
            .disconnect()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        loop {
            if let Event::Outgoing(Outgoing::Disconnect) = eventloop.poll().await? {
                return Ok(());
            }
        }
    }
}

impl From<ConnectionError> for TransportError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Io(e) => Self::Io(e),
            ConnectionError::MqttState(StateError::Io(e)) => Self::Io(e),
            ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Self::Timeout,
            ConnectionError::ConnectionRefused(code) => Self::Refused(format!("{:?}", code)),
            other => Self::Protocol(other.to_string()),
        }
    }
}
