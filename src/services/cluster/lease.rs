//! Shared lease store backing leader election.
//!
//! The only primitives needed are an atomic set-if-absent with TTL and
//! conditional extend/delete that succeed only for the current holder.
//! Redis provides them through `SET NX PX` and two small Lua scripts. Tests
//! use an in-memory store with the same semantics.

use async_trait::async_trait;
use redis::{Script, aio::ConnectionManager};
use std::time::Duration;
use thiserror::Error;
#[cfg(test)]
use {
    std::collections::HashMap,
    tokio::{sync::Mutex, time::Instant},
};

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease store unavailable: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type LeaseResult<T> = Result<T, LeaseError>;

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take `key` for `holder` if nobody holds it.
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> LeaseResult<bool>;

    /// Extend the TTL only if `holder` still owns `key`.
    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> LeaseResult<bool>;

    async fn holder(&self, key: &str) -> LeaseResult<Option<String>>;

    /// Drop `key` only if `holder` still owns it.
    async fn release(&self, key: &str, holder: &str) -> LeaseResult<bool>;
}

#[derive(Clone)]
pub struct RedisLeaseStore {
    conn: ConnectionManager,
}

impl RedisLeaseStore {
    pub async fn connect(url: &str) -> LeaseResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> LeaseResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.as_deref() == Some("OK"))
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> LeaseResult<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = Script::new(RENEW_SCRIPT)
            .key(key)
            .arg(holder)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn holder(&self, key: &str) -> LeaseResult<Option<String>> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(holder)
    }

    async fn release(&self, key: &str, holder: &str) -> LeaseResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

/// Process-local lease store. Expiry uses tokio's clock, so paused-time
/// tests can step past the TTL.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

#[cfg(test)]
impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> LeaseResult<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        match leases.get(key) {
            Some((_, expires_at)) if *expires_at > now => Ok(false),
            _ => {
                leases.insert(key.to_string(), (holder.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> LeaseResult<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        match leases.get_mut(key) {
            Some((current, expires_at)) if current == holder && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: &str) -> LeaseResult<Option<String>> {
        let leases = self.leases.lock().await;
        Ok(leases
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(holder, _)| holder.clone()))
    }

    async fn release(&self, key: &str, holder: &str) -> LeaseResult<bool> {
        let mut leases = self.leases.lock().await;
        let owned = leases
            .get(key)
            .is_some_and(|(current, expires_at)| current == holder && *expires_at > Instant::now());
        if owned {
            leases.remove(key);
        }
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "cluster:leader";
    const TTL: Duration = Duration::from_secs(15);

    #[tokio::test(start_paused = true)]
    async fn lease_expires_without_renewal() {
        let store = MemoryLeaseStore::new();
        assert!(store.acquire(KEY, "a", TTL).await.unwrap());
        assert!(!store.acquire(KEY, "b", TTL).await.unwrap());

        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        assert_eq!(store.holder(KEY).await.unwrap(), None);
        assert!(!store.renew(KEY, "a", TTL).await.unwrap());
        assert!(store.acquire(KEY, "b", TTL).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_extends_ttl() {
        let store = MemoryLeaseStore::new();
        store.acquire(KEY, "a", TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.renew(KEY, "a", TTL).await.unwrap());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.holder(KEY).await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn only_holder_may_release() {
        let store = MemoryLeaseStore::new();
        store.acquire(KEY, "a", TTL).await.unwrap();
        assert!(!store.release(KEY, "b").await.unwrap());
        assert!(store.release(KEY, "a").await.unwrap());
        assert_eq!(store.holder(KEY).await.unwrap(), None);
    }
}
