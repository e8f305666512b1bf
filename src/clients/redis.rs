use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use tracing::{debug, info};

use crate::{
    clients::store::BatchStore, config::Config, models::retry::RetryConfig,
    utils::retry_with_backoff,
};

pub struct RedisClient {
    connection: MultiplexedConnection,
    retry_config: RetryConfig,
}

impl RedisClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to Redis");

        let client = Client::open(config.redis_url.as_str())
            .map_err(|_| anyhow!("Failed to create redis client"))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| anyhow!("Failed to connect to redis client"))?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            retry_config: config.retry_config(),
        })
    }

    pub async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.connection.clone();
        conn.ping::<String>()
            .await
            .map_err(|e| anyhow!("Redis ping failed: {}", e))?;
        Ok(())
    }
}

#[async_trait]
impl BatchStore for RedisClient {
    async fn open_or_update(&self, key: &str, payload: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let ttl = ttl.as_secs().max(1);

        // Two rounds: the open batch may expire between the NX and XX writes.
        for _ in 0..2 {
            let opened: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(payload)
                .arg("NX")
                .arg("EX")
                .arg(ttl)
                .query_async(&mut conn)
                .await
                .map_err(|e| anyhow!("Failed to open batch: {}", e))?;

            if opened.is_some() {
                debug!(batch_key = key, ttl, "Batch opened");
                return Ok(true);
            }

            let updated: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(payload)
                .arg("XX")
                .arg("KEEPTTL")
                .query_async(&mut conn)
                .await
                .map_err(|e| anyhow!("Failed to update batch: {}", e))?;

            if updated.is_some() {
                debug!(batch_key = key, "Batch payload replaced");
                return Ok(false);
            }
        }

        Err(anyhow!("Batch key '{}' kept changing state", key))
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();

        retry_with_backoff(&self.retry_config, || {
            let key = key.clone();
            let mut conn = self.connection.clone();

            async move {
                redis::cmd("GETDEL")
                    .arg(&key)
                    .query_async::<Option<String>>(&mut conn)
                    .await
                    .map_err(|e| e.to_string())
            }
        })
        .await
        .map_err(|e| anyhow!("Failed to take batch payload: {}", e))
    }

    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();

        let claimed: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("processing")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to claim '{}': {}", key, e))?;

        Ok(claimed.is_some())
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to release '{}': {}", key, e))?;
        Ok(())
    }
}
