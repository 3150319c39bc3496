//! Redis-backed [`StateStore`].
//!
//! Commands run through a [`ConnectionManager`] (auto-reconnecting
//! multiplexed connection) with a short per-command timeout and one retry.
//! Pattern subscriptions use a dedicated pub/sub connection per
//! subscriber, as the Redis protocol requires.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::FromRedisValue;

use ma_domain::config::KvConfig;
use ma_domain::stream::BoxStream;
use ma_domain::{Error, Result};

use crate::kv::{PubSubMessage, StateStore};

pub struct RedisStore {
    manager: ConnectionManager,
    /// Kept for spawning dedicated pub/sub connections.
    client: redis::Client,
    command_timeout: Duration,
}

impl RedisStore {
    /// Connect to the store described by `cfg`. The password is resolved
    /// from the env var named in the config and never logged.
    pub async fn connect(cfg: &KvConfig) -> Result<Self> {
        let url = Self::build_url(cfg);
        let client =
            redis::Client::open(url).map_err(|e| Error::Store(format!("open: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::Store(format!("connect: {e}")))?;
        tracing::info!(host = %cfg.host, port = cfg.port, db = cfg.db, tls = cfg.tls, "state store connected");
        Ok(Self {
            manager,
            client,
            command_timeout: Duration::from_millis(cfg.command_timeout_ms),
        })
    }

    fn build_url(cfg: &KvConfig) -> String {
        let scheme = if cfg.tls { "rediss" } else { "redis" };
        let auth = match std::env::var(&cfg.password_env) {
            Ok(pw) if !pw.is_empty() => format!(":{pw}@"),
            _ => String::new(),
        };
        format!("{scheme}://{auth}{}:{}/{}", cfg.host, cfg.port, cfg.db)
    }

    /// Run a command with a timeout and one retry. The ConnectionManager
    /// reconnects under the hood; the retry covers the command that was
    /// in flight when the connection dropped.
    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut con = self.manager.clone();
        for attempt in 0..2 {
            match tokio::time::timeout(self.command_timeout, cmd.query_async::<T>(&mut con)).await
            {
                Ok(Ok(v)) => return Ok(v),
                Ok(Err(e)) if attempt == 0 => {
                    tracing::debug!(error = %e, "store command failed, retrying once");
                }
                Ok(Err(e)) => return Err(Error::Store(e.to_string())),
                Err(_) if attempt == 0 => {
                    tracing::debug!("store command timed out, retrying once");
                }
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "store command after {:?}",
                        self.command_timeout
                    )))
                }
            }
        }
        unreachable!("loop returns on second attempt")
    }
}

#[async_trait::async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Option<String> {
        match self.query::<Option<String>>(redis::cmd("GET").arg(key)).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, error = %e, "store GET failed, reading as absent");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl_secs {
            cmd.arg("EX").arg(ttl);
        }
        self.query::<()>(&cmd).await.map_err(|e| {
            tracing::warn!(key, error = %e, "store SET failed");
            e
        })
    }

    async fn setnx(&self, key: &str, value: &str, ttl_secs: u64) -> bool {
        let res = self
            .query::<Option<String>>(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs),
            )
            .await;
        match res {
            Ok(reply) => reply.is_some(),
            Err(e) => {
                // A lock we cannot confirm is a lock we do not hold.
                tracing::warn!(key, error = %e, "store SETNX failed, treating as lost");
                false
            }
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.query::<()>(redis::cmd("DEL").arg(key)).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        self.query::<()>(redis::cmd("EXPIRE").arg(key).arg(ttl_secs))
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> Option<String> {
        match self
            .query::<Option<String>>(redis::cmd("HGET").arg(key).arg(field))
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, field, error = %e, "store HGET failed, reading as absent");
                None
            }
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.query::<()>(redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await
    }

    async fn hgetall(&self, key: &str) -> HashMap<String, String> {
        self.query::<HashMap<String, String>>(redis::cmd("HGETALL").arg(key))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(key, error = %e, "store HGETALL failed, reading as empty");
                HashMap::new()
            })
    }

    async fn publish(&self, channel: &str, payload: &str) {
        if let Err(e) = self
            .query::<()>(redis::cmd("PUBLISH").arg(channel).arg(payload))
            .await
        {
            tracing::warn!(channel, error = %e, "store PUBLISH failed, event dropped");
        }
    }

    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, PubSubMessage>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::Store(format!("pubsub connect: {e}")))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| Error::Store(format!("psubscribe {pattern}: {e}")))?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(PubSubMessage { channel, payload }),
                Err(e) => {
                    tracing::warn!(channel, error = %e, "non-utf8 pub/sub payload dropped");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn scan(&self, pattern: &str) -> Vec<String> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let res = self
                .query::<(u64, Vec<String>)>(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(100),
                )
                .await;
            match res {
                Ok((next, batch)) => {
                    keys.extend(batch);
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "store SCAN failed, returning partial set");
                    break;
                }
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_without_password() {
        let cfg = KvConfig {
            password_env: "MAESTRO_TEST_KV_PW_UNSET".into(),
            ..KvConfig::default()
        };
        assert_eq!(RedisStore::build_url(&cfg), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn url_with_tls_and_db() {
        let cfg = KvConfig {
            tls: true,
            db: 3,
            host: "kv.internal".into(),
            port: 6380,
            password_env: "MAESTRO_TEST_KV_PW_UNSET".into(),
            ..KvConfig::default()
        };
        assert_eq!(RedisStore::build_url(&cfg), "rediss://kv.internal:6380/3");
    }
}
