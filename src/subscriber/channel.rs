//! Runtime selection of the upstream channel (`CHANNEL_KIND`).

use std::fmt;
use std::str::FromStr;

use super::mqtt::{MqttSession, MqttSettings, MqttTransport};
use super::redis::{RedisSession, RedisSettings, RedisTransport};
use super::{Session, Transport, TransportError};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Mqtt,
    Redis,
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(ChannelKind::Mqtt),
            "redis" => Ok(ChannelKind::Redis),
            other => Err(format!("unknown channel kind {other:?} (expected mqtt or redis)")),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelKind::Mqtt => "mqtt",
            ChannelKind::Redis => "redis",
        })
    }
}

#[derive(Debug, Clone)]
pub enum ChannelSettings {
    Mqtt(MqttSettings),
    Redis(RedisSettings),
}

impl ChannelSettings {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelSettings::Mqtt(_) => ChannelKind::Mqtt,
            ChannelSettings::Redis(_) => ChannelKind::Redis,
        }
    }
}

/// Either transport behind one concrete type, so the subscriber need not be
/// generic at the call site.
#[derive(Debug, Clone)]
pub enum ChannelTransport {
    Mqtt(MqttTransport),
    Redis(RedisTransport),
}

impl ChannelTransport {
    pub fn new(settings: ChannelSettings) -> Self {
        match settings {
            ChannelSettings::Mqtt(s) => ChannelTransport::Mqtt(MqttTransport::new(s)),
            ChannelSettings::Redis(s) => ChannelTransport::Redis(RedisTransport::new(s)),
        }
    }
}

pub enum ChannelSession {
    Mqtt(MqttSession),
    Redis(RedisSession),
}

impl Transport for ChannelTransport {
    type Session = ChannelSession;

    async fn connect(&self) -> Result<ChannelSession, TransportError> {
        match self {
            ChannelTransport::Mqtt(t) => t.connect().await.map(ChannelSession::Mqtt),
            ChannelTransport::Redis(t) => t.connect().await.map(ChannelSession::Redis),
        }
    }
}

impl Session for ChannelSession {
    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        match self {
            ChannelSession::Mqtt(s) => s.recv().await,
            ChannelSession::Redis(s) => s.recv().await,
        }
    }

    async fn close(self) {
        match self {
            ChannelSession::Mqtt(s) => s.close().await,
            ChannelSession::Redis(s) => s.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_channel_kind_parses_case_insensitively() {
        // ---
        assert_eq!("mqtt".parse::<ChannelKind>(), Ok(ChannelKind::Mqtt));
        assert_eq!(" Redis ".parse::<ChannelKind>(), Ok(ChannelKind::Redis));
        assert!("kafka".parse::<ChannelKind>().is_err());
        assert_eq!(ChannelKind::Redis.to_string(), "redis");
    }

    #[tokio::test]
    async fn test_redis_selection_reaches_redis_transport() {
        // ---
        let settings = ChannelSettings::Redis(RedisSettings {
            host: "127.0.0.1".into(),
            port: 1,
            db: 0,
            password: None,
            channel: "temps".into(),
            connect_timeout: Duration::from_secs(2),
        });
        assert_eq!(settings.kind(), ChannelKind::Redis);

        let transport = ChannelTransport::new(settings);
        assert!(matches!(transport, ChannelTransport::Redis(_)));
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Connect(_)) | Err(TransportError::Timeout(_))
        ));
    }
}
