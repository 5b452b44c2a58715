//! Key/value store holding the encoded entity bytes.
//!
//! Two implementations satisfy the same contract: a mutex-guarded in-process
//! map, and Redis for deployments that share one cache between replicas.
//! Reads after a completed `set` on the same key observe the new value;
//! `scan` is a best-effort snapshot that never returns an entry twice.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;

use crate::config::RedisConfig;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// Network-level failure talking to the backing store. Retryable.
    #[error("transient cache error: {0}")]
    Transient(String),
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, CacheError>;
}

#[derive(Default)]
pub struct MemCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemCache {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, CacheError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
        let url = match &config.password {
            Some(password) => format!("redis://:{}@{}/{}", password, config.address, config.db),
            None => format!("redis://{}/{}", config.address, config.db),
        };
        let client = redis::Client::open(url).map_err(|e| CacheError::Transient(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Transient(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(|e| CacheError::Transient(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<Vec<u8>>>(key)
            .await
            .map_err(|e| CacheError::Transient(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| CacheError::Transient(e.to_string()))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, CacheError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut entries = Vec::new();
        // SCAN may return a key on more than one page.
        let mut seen = std::collections::HashSet::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::Transient(e.to_string()))?;

            for key in keys {
                if !seen.insert(key.clone()) {
                    continue;
                }
                // A key can disappear between the SCAN page and the read.
                if let Some(value) = self.get(&key).await? {
                    entries.push((key, value));
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(entries)
    }
}
