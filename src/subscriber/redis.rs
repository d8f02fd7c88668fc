//! Redis pub/sub transport for the subscriber.
//!
//! `connect()` checks the server with a PING on a short-lived connection,
//! then opens a dedicated pub/sub connection and waits for the SUBSCRIBE
//! confirmation. A closed message stream is reported as a lost connection.

use std::time::Duration;

use futures::StreamExt;
use redis::aio::PubSub;
use redis::{Client, ConnectionInfo, IntoConnectionInfo};

use super::{Session, Transport, TransportError};

// ---

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub channel: String,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RedisTransport {
    settings: RedisSettings,
}

impl RedisTransport {
    pub fn new(settings: RedisSettings) -> Self {
        Self { settings }
    }

    fn connection_info(&self) -> Result<ConnectionInfo, TransportError> {
        // ---
        let s = &self.settings;
        let mut info = format!("redis://{}:{}/{}", s.host, s.port, s.db)
            .into_connection_info()
            .map_err(connect_error)?;
        // Set after parsing so the password never needs URL escaping.
        info.redis.password = s.password.clone();
        Ok(info)
    }
}

fn connect_error(e: redis::RedisError) -> TransportError {
    TransportError::Connect(e.to_string())
}

pub struct RedisSession {
    pubsub: PubSub,
    channel: String,
}

impl Transport for RedisTransport {
    type Session = RedisSession;

    async fn connect(&self) -> Result<RedisSession, TransportError> {
        // ---
        let client = Client::open(self.connection_info()?).map_err(connect_error)?;
        let channel = self.settings.channel.clone();

        let handshake = async {
            let mut conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(connect_error)?;
            let _pong: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(connect_error)?;

            let mut pubsub = client.get_async_pubsub().await.map_err(connect_error)?;
            pubsub
                .subscribe(channel.as_str())
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;
            Ok::<_, TransportError>(pubsub)
        };

        let pubsub = tokio::time::timeout(self.settings.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout(self.settings.connect_timeout))??;

        tracing::info!(
            host = %self.settings.host,
            port = self.settings.port,
            db = self.settings.db,
            channel = %channel,
            "Connected to Redis"
        );

        Ok(RedisSession { pubsub, channel })
    }
}

impl Session for RedisSession {
    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        // ---
        let stream = self.pubsub.on_message();
        tokio::pin!(stream);
        let msg = stream
            .next()
            .await
            .ok_or_else(|| TransportError::Connection("pub/sub stream closed".into()))?;
        Ok(msg.get_payload_bytes().to_vec())
    }

    async fn close(mut self) {
        // ---
        let unsubscribe = self.pubsub.unsubscribe(self.channel.as_str());
        match tokio::time::timeout(CLOSE_TIMEOUT, unsubscribe).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Redis unsubscribe failed"),
            Err(_) => tracing::debug!("Redis unsubscribe not acknowledged before timeout"),
        }
        tracing::info!(channel = %self.channel, "Unsubscribed from Redis channel");
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn settings() -> RedisSettings {
        RedisSettings {
            host: "127.0.0.1".into(),
            // Reserved port, nothing listens there.
            port: 1,
            db: 2,
            password: Some("p@ss/word".into()),
            channel: "temps".into(),
            connect_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_connection_info_carries_db_and_password() {
        // ---
        let info = RedisTransport::new(settings()).connection_info().unwrap();
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.password.as_deref(), Some("p@ss/word"));
        assert!(matches!(&info.addr, redis::ConnectionAddr::Tcp(host, 1) if host == "127.0.0.1"));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_to_connect() {
        // ---
        let result = RedisTransport::new(settings()).connect().await;
        assert!(matches!(
            result,
            Err(TransportError::Connect(_)) | Err(TransportError::Timeout(_))
        ));
    }
}
