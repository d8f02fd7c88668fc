//! MQTT transport for the subscriber, backed by `rumqttc`.
//!
//! `connect()` performs the full handshake (CONNACK and SUBACK) before
//! returning, so a session handed to the worker is known to be subscribed.
//! The `rumqttc` event loop would silently reconnect on the next poll after
//! an error; a session treats the first error as fatal instead and leaves
//! reconnect decisions to the controller.

use std::collections::VecDeque;
use std::time::Duration;

use rumqttc::{
    AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS, SubscribeReasonCode,
};

use super::{Session, Transport, TransportError};

// ---

const REQUEST_CHANNEL_CAPACITY: usize = 32;
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttTransport {
    settings: MqttSettings,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn options(&self) -> MqttOptions {
        // ---
        let s = &self.settings;
        let mut options = MqttOptions::new(s.client_id.clone(), s.host.clone(), s.port);
        options.set_keep_alive(s.keep_alive);
        if let Some(username) = &s.username {
            options.set_credentials(username.clone(), s.password.clone().unwrap_or_default());
        }
        options
    }
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
    /// Publishes that arrived before the SUBACK.
    pending: VecDeque<Vec<u8>>,
}

impl Transport for MqttTransport {
    type Session = MqttSession;

    async fn connect(&self) -> Result<MqttSession, TransportError> {
        // ---
        let topic = self.settings.topic.clone();
        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CHANNEL_CAPACITY);

        // Queued locally; sent once the event loop connects.
        client
            .subscribe(topic.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let mut pending = VecDeque::new();
        let handshake = await_subscription(&mut eventloop, &topic, &mut pending);
        tokio::time::timeout(self.settings.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout(self.settings.connect_timeout))??;

        tracing::info!(
            host = %self.settings.host,
            port = self.settings.port,
            topic = %topic,
            "Connected to MQTT broker"
        );

        Ok(MqttSession {
            client,
            eventloop,
            topic,
            pending,
        })
    }
}

/// Whether a publish on `topic` falls under the subscribed `filter`.
///
/// The filter may carry `+`/`#` wildcards; publishes always name a concrete
/// topic.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    rumqttc::matches(topic, filter)
}

async fn await_subscription(
    eventloop: &mut EventLoop,
    topic: &str,
    pending: &mut VecDeque<Vec<u8>>,
) -> Result<(), TransportError> {
    // ---
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                tracing::debug!("MQTT CONNACK received");
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    return Err(TransportError::Subscribe(format!(
                        "broker refused subscription to {topic}"
                    )));
                }
                return Ok(());
            }
            Ok(Event::Incoming(Incoming::Publish(publish)))
                if topic_matches(topic, &publish.topic) =>
            {
                pending.push_back(publish.payload.to_vec());
            }
            Ok(_) => {}
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
}

impl Session for MqttSession {
    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        // ---
        if let Some(payload) = self.pending.pop_front() {
            return Ok(payload);
        }

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish)))
                    if topic_matches(&self.topic, &publish.topic) =>
                {
                    return Ok(publish.payload.to_vec());
                }
                Ok(_) => {}
                Err(e) => return Err(TransportError::Connection(e.to_string())),
            }
        }
    }

    async fn close(mut self) {
        // ---
        // try_* never blocks on a full request channel.
        let _ = self.client.try_unsubscribe(self.topic.clone());
        let _ = self.client.try_disconnect();

        let drain = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::debug!("MQTT disconnect not flushed before timeout");
        }
        tracing::info!(topic = %self.topic, "Unsubscribed from MQTT topic");
    }
}
