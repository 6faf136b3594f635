//! Shared TTL key-value store
//!
//! OTP codes and pause records must be visible to every worker process,
//! so they live behind this trait rather than in process memory. The
//! production backend is Redis (`redis-store` feature); the in-memory
//! backend serves tests and single-process deployments.

use std::time::Duration;

use async_trait::async_trait;
use netrun_core::Result;

/// Namespaced string-keyed store with per-key TTL
#[async_trait]
pub trait TtlStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory TTL store with lazy expiry on read
#[derive(Default)]
pub struct MemoryTtlStore {
    entries: tokio::sync::Mutex<std::collections::HashMap<String, (String, std::time::Instant)>>,
}

impl MemoryTtlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force-expire a key, regardless of its deadline. Test hook for
    /// simulating TTL expiry without sleeping.
    pub async fn expire_now(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }
}

#[async_trait]
impl TtlStore for MemoryTtlStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, deadline)) if *deadline > std::time::Instant::now() => {
                Ok(Some(value.clone()))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(feature = "redis-store")]
pub use redis_store::RedisTtlStore;

#[cfg(feature = "redis-store")]
mod redis_store {
    use super::*;
    use netrun_core::NetrunError;
    use redis::AsyncCommands;

    /// Redis-backed TTL store, the cross-process production backend
    pub struct RedisTtlStore {
        conn: redis::aio::MultiplexedConnection,
    }

    impl RedisTtlStore {
        pub async fn connect(url: &str) -> Result<Self> {
            let client = redis::Client::open(url)
                .map_err(|e| NetrunError::Store(format!("invalid redis url: {}", e)))?;
            let conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| NetrunError::Store(format!("redis connect failed: {}", e)))?;
            Ok(Self { conn })
        }
    }

    #[async_trait]
    impl TtlStore for RedisTtlStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            let mut conn = self.conn.clone();
            let value: Option<String> = conn
                .get(key)
                .await
                .map_err(|e| NetrunError::Store(format!("redis GET {}: {}", key, e)))?;
            Ok(value)
        }

        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            let mut conn = self.conn.clone();
            let _: () = conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| NetrunError::Store(format!("redis SETEX {}: {}", key, e)))?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            let mut conn = self.conn.clone();
            let _: () = conn
                .del(key)
                .await
                .map_err(|e| NetrunError::Store(format!("redis DEL {}: {}", key, e)))?;
            Ok(())
        }
    }
}
