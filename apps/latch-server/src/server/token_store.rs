use std::{collections::HashMap, future::Future, time::Duration};

use latch_core::{ActionKind, SessionId, UserId};
use redis::{aio::ConnectionManager, AsyncCommands, RedisResult};
use tokio::{
    sync::{OnceCell, RwLock},
    time::Instant,
};

const KEY_PREFIX: &str = "latch";
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum StoreError {
    #[error("token store unavailable: {0}")]
    Unavailable(String),
    #[error("token store call timed out")]
    Timeout,
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
}

pub(crate) fn challenge_key(user_id: UserId, kind: ActionKind) -> String {
    format!("{KEY_PREFIX}:{}:{user_id}", kind.as_str())
}

pub(crate) fn session_key(session_id: SessionId) -> String {
    format!("{KEY_PREFIX}:session:{session_id}")
}

/// Key-value store whose entries all expire.
///
/// `put` is an unconditional upsert that resets the TTL, `get` reports a
/// missing or expired key as `None`, and `delete` is a no-op on absent keys.
pub(crate) trait EphemeralStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Redis-backed store. The connection manager is dialed on first use and
/// re-dials on its own after the link drops.
pub(crate) struct RedisTokenStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    timeout: Duration,
}

impl RedisTokenStore {
    pub(crate) fn new(redis_url: &str, timeout: Duration) -> RedisResult<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            connection: OnceCell::new(),
            timeout,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let connect = self.connection.get_or_try_init(|| async {
            self.client
                .get_connection_manager()
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))
        });
        let connection = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(connection.clone())
    }

    async fn bounded<T>(&self, call: impl Future<Output = RedisResult<T>>) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl EphemeralStore for RedisTokenStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut connection = self.connection().await?;
        let seconds = ttl.as_secs().max(1);
        self.bounded(connection.set_ex::<_, _, ()>(key, value, seconds))
            .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection().await?;
        self.bounded(connection.get::<_, Option<String>>(key)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut connection = self.connection().await?;
        self.bounded(connection.del::<_, ()>(key)).await
    }
}

struct StoredEntry {
    value: String,
    expires_at: Instant,
}

struct InMemoryEntries {
    entries: HashMap<String, StoredEntry>,
    last_sweep: Instant,
}

impl InMemoryEntries {
    fn sweep_expired(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.last_sweep = now;
    }
}

/// Process-local fallback used when no Redis URL is configured.
pub(crate) struct InMemoryTokenStore {
    inner: RwLock<InMemoryEntries>,
}

impl InMemoryTokenStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(InMemoryEntries {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }
}

impl EphemeralStore for InMemoryTokenStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.sweep_expired(now);
        inner.entries.insert(
            key.to_owned(),
            StoredEntry {
                value: value.to_owned(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.write().await.entries.remove(key);
        Ok(())
    }
}

pub(crate) enum TokenStore {
    Redis(RedisTokenStore),
    InMemory(InMemoryTokenStore),
}

impl TokenStore {
    pub(crate) fn backend(&self) -> &'static str {
        match self {
            Self::Redis(_) => "redis",
            Self::InMemory(_) => "in_memory",
        }
    }
}

impl EphemeralStore for TokenStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        match self {
            Self::Redis(store) => store.put(key, value, ttl).await,
            Self::InMemory(store) => store.put(key, value, ttl).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self {
            Self::Redis(store) => store.get(key).await,
            Self::InMemory(store) => store.get(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Self::Redis(store) => store.delete(key).await,
            Self::InMemory(store) => store.delete(key).await,
        }
    }
}
