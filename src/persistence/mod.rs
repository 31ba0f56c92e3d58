// Durable position state
pub mod file;
pub mod redis;

use crate::models::PositionRecord;
use async_trait::async_trait;
use std::sync::Arc;

pub use self::file::FilePositionStore;
pub use self::redis::RedisPositionStore;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Redis connection timeout after {0} seconds")]
    ConnectTimeout(u64),
}

/// Read-only view of the stored position
///
/// Handed to command handlers that may run alongside a tick.
#[async_trait]
pub trait PositionReader: Send + Sync {
    /// Never fails: a missing or unreadable record yields the default
    async fn load(&self) -> PositionRecord;
}

/// Position storage with atomic overwrite
///
/// Only the decision engine writes through this trait.
#[async_trait]
pub trait PositionStore: PositionReader {
    /// Replace the stored record. On error the previous record is left intact.
    async fn save(&self, record: &PositionRecord) -> Result<(), PersistenceError>;
}

/// Share one backend as both the engine's store and a read-only reader
pub fn split_store<S>(store: S) -> (Arc<dyn PositionStore>, Arc<dyn PositionReader>)
where
    S: PositionStore + 'static,
{
    let store = Arc::new(store);
    let reader: Arc<dyn PositionReader> = store.clone();
    (store, reader)
}

/// Decode a stored record, falling back to the default on corruption
pub(crate) fn decode_record(raw: &[u8], origin: &str) -> PositionRecord {
    match serde_json::from_slice::<PositionRecord>(raw) {
        Ok(record) if record.last_buy_price.is_finite() => record,
        Ok(record) => {
            tracing::warn!(
                "Stored position at {} has invalid buy price {}, using default",
                origin,
                record.last_buy_price
            );
            PositionRecord::default()
        }
        Err(e) => {
            tracing::warn!("Stored position at {} is corrupt ({}), using default", origin, e);
            PositionRecord::default()
        }
    }
}
