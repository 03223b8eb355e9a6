use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::error::{DispatcherError, DispatcherResult};
use crate::transport::{PubSubMessage, Transport};

/// Production [`Transport`] over Redis.
///
/// Owns one multiplexed connection for commands and publishes, and opens one
/// dedicated pub/sub connection per `subscribe` call, driven by a background
/// forwarding task.
#[derive(Clone)]
pub struct RedisTransport {
    client: Client,
    connection: ConnectionManager,
    connection_timeout: Duration,
}

impl RedisTransport {
    pub async fn connect(redis_url: &str) -> DispatcherResult<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            DispatcherError::Redis(format!("Failed to create Redis client: {}", e))
        })?;

        let connection_timeout = Duration::from_secs(5);
        let connection = timeout(connection_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| DispatcherError::Redis("Connection timeout".to_string()))?
            .map_err(|e| DispatcherError::Redis(format!("Failed to connect: {}", e)))?;

        debug!("Redis transport connected to {}", redis_url);

        Ok(Self {
            client,
            connection,
            connection_timeout,
        })
    }

    fn handle_redis_error(&self, error: RedisError, operation: &str) -> DispatcherError {
        match error.kind() {
            redis::ErrorKind::IoError => {
                warn!("Redis IO error during {}: {}", operation, error);
                DispatcherError::Redis(format!("Connection lost during {}", operation))
            }
            redis::ErrorKind::AuthenticationFailed => {
                error!("Redis authentication failed during {}: {}", operation, error);
                DispatcherError::Redis("Authentication failed".to_string())
            }
            _ => {
                error!("Redis error during {}: {}", operation, error);
                DispatcherError::Redis(format!("Redis error: {}", error))
            }
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn publish(&self, channel: &str, payload: &str) -> DispatcherResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .publish(channel, payload)
            .await
            .map_err(|e| self.handle_redis_error(e, "publish"))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: Vec<String>,
    ) -> DispatcherResult<mpsc::UnboundedReceiver<PubSubMessage>> {
        let mut pubsub = timeout(self.connection_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| DispatcherError::Redis("Subscriber connection timeout".to_string()))?
            .map_err(|e| self.handle_redis_error(e, "subscribe"))?;

        for channel in &channels {
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| self.handle_redis_error(e, "subscribe"))?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let channel = message.get_channel_name().to_string();
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Dropping non-text pub/sub payload on {}: {}", channel, e);
                        continue;
                    }
                };
                if tx.send(PubSubMessage { channel, payload }).is_err() {
                    break;
                }
            }
            debug!("Redis subscriber stream closed");
        });

        Ok(rx)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> DispatcherResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| self.handle_redis_error(e, "set_with_expiry"))?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> DispatcherResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(|e| self.handle_redis_error(e, "expire"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> DispatcherResult<Option<String>> {
        let mut conn = self.connection.clone();
        conn.get(key)
            .await
            .map_err(|e| self.handle_redis_error(e, "get"))
    }

    async fn delete(&self, key: &str) -> DispatcherResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| self.handle_redis_error(e, "delete"))?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> DispatcherResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .sadd(key, member)
            .await
            .map_err(|e| self.handle_redis_error(e, "set_add"))?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> DispatcherResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .srem(key, member)
            .await
            .map_err(|e| self.handle_redis_error(e, "set_remove"))?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> DispatcherResult<Vec<String>> {
        let mut conn = self.connection.clone();
        conn.smembers(key)
            .await
            .map_err(|e| self.handle_redis_error(e, "set_members"))
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> DispatcherResult<()> {
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, value) in fields {
            pipe.hset(key, field, value);
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| self.handle_redis_error(e, "hash_set"))?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> DispatcherResult<HashMap<String, String>> {
        let mut conn = self.connection.clone();
        conn.hgetall(key)
            .await
            .map_err(|e| self.handle_redis_error(e, "hash_get_all"))
    }
}
