//! Shared key/value store capability.
//!
//! Sessions, rate-limit windows, and queue bookkeeping all live in one shared
//! store. The capability is deliberately narrow: plain keys with TTL, an
//! atomic multi-set, sorted sets scored by timestamp, and a non-blocking
//! cursor scan, so a test double can implement it exactly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::error::{CoreError, CoreResult};

// ─── Capability ─────────────────────────────────────────────────────────────

/// Narrow KV capability shared by sessions, rate limiting, and queues.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Option<String>>;

    /// Set `key` with a TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<()>;

    /// Atomically set several keys with one shared TTL (session blob +
    /// reverse index must never diverge).
    async fn mset_ex(&self, pairs: &[(String, String)], ttl: Duration) -> CoreResult<()>;

    async fn del(&self, key: &str) -> CoreResult<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()>;

    /// Add `member` to the sorted set at `key` with the given score.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> CoreResult<()>;

    /// Cardinality of the sorted set at `key`.
    async fn zcard(&self, key: &str) -> CoreResult<u64>;

    /// Remove members with `min <= score <= max`; returns the removed count.
    async fn zrembyscore(&self, key: &str, min: f64, max: f64) -> CoreResult<u64>;

    /// Cursor-scan keys matching a glob pattern. Never a blocking KEYS call.
    async fn scan_match(&self, pattern: &str) -> CoreResult<Vec<String>>;
}

// ─── Redis implementation ───────────────────────────────────────────────────

/// Redis-backed store using a multiplexed connection manager.
#[derive(Clone)]
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> CoreResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(RedisStore { manager })
    }
}

fn ttl_secs(ttl: Duration) -> usize {
    // Redis rejects a zero TTL; clamp up to one second.
    (ttl.as_secs() as usize).max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        let mut con = self.manager.clone();
        Ok(con.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<()> {
        let mut con = self.manager.clone();
        let _: () = con.set_ex(key, value, ttl_secs(ttl) as u64).await?;
        Ok(())
    }

    async fn mset_ex(&self, pairs: &[(String, String)], ttl: Duration) -> CoreResult<()> {
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in pairs {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs(ttl))
                .ignore();
        }
        let _: () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> CoreResult<()> {
        let mut con = self.manager.clone();
        let _: () = con.del(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()> {
        let mut con = self.manager.clone();
        let _: () = con.expire(key, ttl_secs(ttl) as i64).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CoreResult<()> {
        let mut con = self.manager.clone();
        let _: () = con.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> CoreResult<u64> {
        let mut con = self.manager.clone();
        Ok(con.zcard(key).await?)
    }

    async fn zrembyscore(&self, key: &str, min: f64, max: f64) -> CoreResult<u64> {
        let mut con = self.manager.clone();
        Ok(con.zrembyscore(key, min, max).await?)
    }

    async fn scan_match(&self, pattern: &str) -> CoreResult<Vec<String>> {
        let mut con = self.manager.clone();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> = con.scan_match(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

// ─── In-memory implementation ───────────────────────────────────────────────

struct MemoryInner {
    kv: HashMap<String, (String, Option<Instant>)>,
    zsets: HashMap<String, Vec<(f64, String)>>,
}

/// In-memory store for tests and single-process development.
///
/// `set_fail(true)` makes every operation return an infrastructure error,
/// which is how the fail-open and DLQ paths are exercised.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    fail: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Mutex::new(MemoryInner {
                kv: HashMap::new(),
                zsets: HashMap::new(),
            }),
            fail: AtomicBool::new(false),
        }
    }

    /// Toggle simulated store outage.
    pub fn set_fail(&self, on: bool) {
        self.fail.store(on, Ordering::SeqCst);
    }

    fn check(&self) -> CoreResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(CoreError::infra("memory store outage (simulated)"))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn live(entry: &(String, Option<Instant>)) -> bool {
    entry.1.map(|at| at > Instant::now()).unwrap_or(true)
}

fn glob_match(pattern: &str, key: &str) -> bool {
    // Only the `prefix*` and `a*b` shapes are needed by the core key scheme.
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            key.len() >= prefix.len() + suffix.len()
                && key.starts_with(prefix)
                && key.ends_with(suffix)
        }
        None => pattern == key,
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> CoreResult<Option<String>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let (value, expired) = match inner.kv.get(key) {
            Some(entry) if live(entry) => (Some(entry.0.clone()), false),
            Some(_) => (None, true),
            None => (None, false),
        };
        if expired {
            inner.kv.remove(key);
        }
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        inner
            .kv
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn mset_ex(&self, pairs: &[(String, String)], ttl: Duration) -> CoreResult<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let expires = Some(Instant::now() + ttl);
        for (key, value) in pairs {
            inner.kv.insert(key.clone(), (value.clone(), expires));
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> CoreResult<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        inner.kv.remove(key);
        inner.zsets.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.kv.get_mut(key) {
            entry.1 = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CoreResult<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let set = inner.zsets.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        set.push((score, member.to_string()));
        Ok(())
    }

    async fn zcard(&self, key: &str) -> CoreResult<u64> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner.zsets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn zrembyscore(&self, key: &str, min: f64, max: f64) -> CoreResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let Some(set) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|(score, _)| *score < min || *score > max);
        Ok((before - set.len()) as u64)
    }

    async fn scan_match(&self, pattern: &str) -> CoreResult<Vec<String>> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .kv
            .iter()
            .filter(|(k, entry)| glob_match(pattern, k) && live(entry))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_del() {
        let store = MemoryStore::new();
        store
            .set_ex("session:+20100", "{}", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            store.get("session:+20100").await.unwrap().as_deref(),
            Some("{}")
        );
        store.del("session:+20100").await.unwrap();
        assert_eq!(store.get("session:+20100").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mset_is_all_or_nothing_per_call() {
        let store = MemoryStore::new();
        store
            .mset_ex(
                &[
                    ("session:+20100".into(), "blob".into()),
                    ("session-index:s1".into(), "+20100".into()),
                ],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(store.get("session:+20100").await.unwrap().is_some());
        assert!(store.get("session-index:s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_zset_window_ops() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .zadd("win", &format!("m{i}"), 1000.0 + i as f64)
                .await
                .unwrap();
        }
        assert_eq!(store.zcard("win").await.unwrap(), 5);

        let removed = store.zrembyscore("win", 0.0, 1001.0).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.zcard("win").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_scan_match_prefix() {
        let store = MemoryStore::new();
        store
            .set_ex("session:+1", "a", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_ex("session:+2", "b", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_ex("other:key", "c", Duration::from_secs(60))
            .await
            .unwrap();

        let mut keys = store.scan_match("session:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["session:+1", "session:+2"]);
    }

    #[tokio::test]
    async fn test_fail_mode_errors_every_op() {
        let store = MemoryStore::new();
        store.set_fail(true);
        assert!(store.get("k").await.is_err());
        assert!(store.zcard("k").await.is_err());
        store.set_fail(false);
        assert!(store.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_key_is_gone() {
        let store = MemoryStore::new();
        store
            .set_ex("ephemeral", "v", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("ephemeral").await.unwrap(), None);
    }
}
