//! Redis integration for outstanding-work counters
//!
//! An external caller increments a per-screen counter for every PDF it
//! enqueues; the ingestion service settles it once per job that reaches a
//! terminal state. Settling sets a per-job marker and decrements only when
//! that marker is new, so redelivered jobs never decrement twice. A counter
//! that would reach zero is deleted instead.

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

/// What settling a job did to its counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Marker was new; the counter now holds this value (0 means deleted)
    Decremented(i64),
    /// Marker was new but the counter did not exist
    CounterMissing,
    /// Marker already existed; nothing changed
    AlreadySettled,
}

/// Keyed counter shared with the job producer
#[async_trait]
pub trait WorkCounter: Send + Sync {
    /// Increment the key, creating it at 1 if absent
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Set `marker` for `ttl` and, only if it was not already set, decrement
    /// `key`, deleting it when it would drop to zero
    async fn settle(&self, key: &str, marker: &str, ttl: Duration) -> Result<Settlement>;

    /// Current value, if any
    async fn get(&self, key: &str) -> Result<Option<i64>>;
}

/// Marker-guarded decrement-or-delete in one round trip, so concurrent
/// workers never observe a zero or negative counter and a marker is never
/// set without its decrement
const SETTLE: &str = r#"
if not redis.call('SET', KEYS[2], '1', 'NX', 'EX', ARGV[1]) then
    return -2
end
local current = redis.call('GET', KEYS[1])
if not current then
    return -1
end
if tonumber(current) > 1 then
    return redis.call('DECR', KEYS[1])
end
redis.call('DEL', KEYS[1])
return 0
"#;

fn settle_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(SETTLE))
}

fn settlement(reply: i64) -> Settlement {
    match reply {
        -2 => Settlement::AlreadySettled,
        -1 => Settlement::CounterMissing,
        remaining => Settlement::Decremented(remaining),
    }
}

/// Redis counter client
#[derive(Clone)]
pub struct Cache {
    connection: ConnectionManager,
    key_prefix: String,
}

impl Cache {
    /// Create a new cache client
    pub async fn new(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = Client::open(url).map_err(|e| AppError::CacheError {
            message: format!("Failed to create Redis client: {}", e),
        })?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        Ok(Self {
            connection,
            key_prefix: key_prefix.into(),
        })
    }

    /// Build a prefixed key
    fn key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    /// Ping Redis to check connectivity
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Redis ping failed: {}", e),
            })?;
        Ok(())
    }
}

#[async_trait]
impl WorkCounter for Cache {
    async fn increment(&self, key: &str) -> Result<i64> {
        let full_key = self.key(key);
        let mut conn = self.connection.clone();

        let value: i64 = conn.incr(&full_key, 1).await.map_err(|e| AppError::CacheError {
            message: format!("Failed to increment '{}': {}", full_key, e),
        })?;

        debug!(key = %full_key, value, "Counter incremented");
        Ok(value)
    }

    async fn settle(&self, key: &str, marker: &str, ttl: Duration) -> Result<Settlement> {
        let full_key = self.key(key);
        let full_marker = self.key(marker);
        let mut conn = self.connection.clone();

        let reply: i64 = settle_script()
            .key(&full_key)
            .key(&full_marker)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Failed to settle '{}': {}", full_key, e),
            })?;

        let settled = settlement(reply);
        debug!(key = %full_key, marker = %full_marker, ?settled, "Counter settled");
        Ok(settled)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let full_key = self.key(key);
        let mut conn = self.connection.clone();

        conn.get(&full_key).await.map_err(|e| AppError::CacheError {
            message: format!("Failed to get key '{}': {}", full_key, e),
        })
    }
}

/// Cache key builder helpers
pub mod keys {
    /// Outstanding-work counter for a screen
    pub fn papers_processing(screen_id: i64) -> String {
        format!("screen:{}:papers_processing", screen_id)
    }

    /// Marker recording that one blob of a screen has been settled
    pub fn job_settled(screen_id: i64, blob_location: &str) -> String {
        format!("screen:{}:done:{}", screen_id, blob_location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_builders() {
        assert_eq!(keys::papers_processing(9), "screen:9:papers_processing");
        assert_eq!(keys::job_settled(9, "uploads/a.pdf"), "screen:9:done:uploads/a.pdf");
    }

    #[test]
    fn test_script_replies_map_to_settlements() {
        assert_eq!(settlement(-2), Settlement::AlreadySettled);
        assert_eq!(settlement(-1), Settlement::CounterMissing);
        assert_eq!(settlement(0), Settlement::Decremented(0));
        assert_eq!(settlement(3), Settlement::Decremented(3));
    }

    #[test]
    fn test_script_is_cached() {
        let a = settle_script() as *const Script;
        let b = settle_script() as *const Script;
        assert_eq!(a, b);
    }
}
