use super::{decode_record, PersistenceError, PositionReader, PositionStore};
use crate::models::PositionRecord;
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use tokio::time::{timeout, Duration};

const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Redis-backed position record
///
/// The record lives under `{prefix}:position:{instrument}` as one JSON
/// string, so a single `SET` replaces both fields at once.
#[derive(Clone)]
pub struct RedisPositionStore {
    conn: ConnectionManager,
    key: String,
}

impl RedisPositionStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `key_prefix` - Namespace for this bot's keys
    /// * `instrument_id` - Instrument the record belongs to
    pub async fn new(
        redis_url: &str,
        key_prefix: &str,
        instrument_id: &str,
    ) -> Result<Self, PersistenceError> {
        let client = Client::open(redis_url)?;

        let conn = timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| PersistenceError::ConnectTimeout(CONNECT_TIMEOUT_SECS))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            key: Self::key_for(key_prefix, instrument_id),
        })
    }

    pub fn key_for(key_prefix: &str, instrument_id: &str) -> String {
        format!("{}:position:{}", key_prefix, instrument_id)
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl PositionReader for RedisPositionStore {
    async fn load(&self) -> PositionRecord {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(&self.key).await {
            Ok(Some(raw)) => decode_record(raw.as_bytes(), &self.key),
            Ok(None) => {
                tracing::info!("No stored position at {}, starting flat", self.key);
                PositionRecord::default()
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to read position from Redis key {} ({}), using default",
                    self.key,
                    e
                );
                PositionRecord::default()
            }
        }
    }
}

#[async_trait]
impl PositionStore for RedisPositionStore {
    async fn save(&self, record: &PositionRecord) -> Result<(), PersistenceError> {
        let value = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(&self.key, value).await?;

        tracing::debug!("Saved position {:?} to Redis key {}", record, self.key);
        Ok(())
    }
}
