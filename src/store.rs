//! Injected stateful collaborators: the nonce ledger and the rate counter
//! store.
//!
//! Both come in two flavours. The in-memory flavour (dashmap) is best-effort
//! and instance-local; when several gateway instances run, each enforces its
//! own view. The Redis flavour delegates atomicity and expiry to the shared
//! store and is authoritative across instances. Redis errors degrade to
//! allow-with-warning rather than failing the request.

use anyhow::Result;
use dashmap::DashMap;

/// Append-only set of (nonce -> first-seen ms) records with a fixed
/// retention window. Expiry is the store's job; the pipeline only needs
/// insert-if-absent.
#[async_trait::async_trait]
pub trait NonceLedger: Send + Sync {
    /// Returns true when the nonce was absent and has now been recorded.
    /// False means the nonce was already present: a replay.
    async fn insert_if_absent(&self, nonce: &str, now_ms: i64) -> bool;

    /// Drop entries first seen before `cutoff_ms`. Stores with native TTL
    /// support may no-op.
    async fn purge_older_than(&self, cutoff_ms: i64);
}

#[derive(Default)]
pub struct MemoryNonceLedger {
    entries: DashMap<String, i64>,
}

impl MemoryNonceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl NonceLedger for MemoryNonceLedger {
    async fn insert_if_absent(&self, nonce: &str, now_ms: i64) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(nonce.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(now_ms);
                true
            }
        }
    }

    async fn purge_older_than(&self, cutoff_ms: i64) {
        self.entries.retain(|_, first_seen| *first_seen >= cutoff_ms);
    }
}

pub struct RedisNonceLedger {
    conn: redis::aio::ConnectionManager,
    ttl_secs: u64,
}

impl RedisNonceLedger {
    pub fn new(conn: redis::aio::ConnectionManager, ttl_secs: u64) -> Self {
        Self { conn, ttl_secs }
    }
}

#[async_trait::async_trait]
impl NonceLedger for RedisNonceLedger {
    async fn insert_if_absent(&self, nonce: &str, now_ms: i64) -> bool {
        let mut conn = self.conn.clone();
        let outcome: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(format!("nonce:{}", nonce))
            .arg(now_ms)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await;
        match outcome {
            Ok(reply) => reply.is_some(),
            Err(err) => {
                tracing::warn!(error=%err, "nonce ledger unavailable, accepting nonce unchecked");
                true
            }
        }
    }

    async fn purge_older_than(&self, _cutoff_ms: i64) {
        // Redis expires entries itself via the EX set at insert time.
    }
}

/// Bucketed counters plus a last-seen marker per identity, keyed by strings
/// the rate limiter constructs. Get/increment/expire only; window arithmetic
/// belongs to the limiter.
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter at `key`, returning the post-increment value.
    /// `ttl_secs` bounds the bucket's lifetime where the store supports it.
    async fn incr(&self, key: &str, ttl_secs: u64) -> Result<u64>;

    async fn last_seen(&self, key: &str) -> Result<Option<i64>>;

    async fn set_last_seen(&self, key: &str, now_ms: i64, ttl_secs: u64) -> Result<()>;
}

/// Instance-local counters. Old buckets are abandoned rather than deleted;
/// each key embeds its bucket id so a rollover simply starts a fresh key.
#[derive(Default)]
pub struct MemoryCounters {
    counts: DashMap<String, u64>,
    last_seen: DashMap<String, i64>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CounterStore for MemoryCounters {
    async fn incr(&self, key: &str, _ttl_secs: u64) -> Result<u64> {
        let mut slot = self.counts.entry(key.to_string()).or_insert(0);
        *slot += 1;
        Ok(*slot)
    }

    async fn last_seen(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.last_seen.get(key).map(|v| *v))
    }

    async fn set_last_seen(&self, key: &str, now_ms: i64, _ttl_secs: u64) -> Result<()> {
        self.last_seen.insert(key.to_string(), now_ms);
        Ok(())
    }
}

pub struct RedisCounters {
    conn: redis::aio::ConnectionManager,
}

impl RedisCounters {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl CounterStore for RedisCounters {
    async fn incr(&self, key: &str, ttl_secs: u64) -> Result<u64> {
        let mut conn = self.conn.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn last_seen(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_last_seen(&self, key: &str, now_ms: i64, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(now_ms)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nonce_insert_is_first_come_only() {
        let ledger = MemoryNonceLedger::new();
        assert!(ledger.insert_if_absent("n1", 1_000).await);
        assert!(!ledger.insert_if_absent("n1", 2_000).await);
        assert!(ledger.insert_if_absent("n2", 2_000).await);
    }

    #[tokio::test]
    async fn purge_bounds_the_ledger_to_the_retention_window() {
        let ledger = MemoryNonceLedger::new();
        for (nonce, seen) in [("old-1", 100), ("old-2", 200), ("fresh", 9_000)] {
            ledger.insert_if_absent(nonce, seen).await;
        }
        ledger.purge_older_than(1_000).await;
        assert_eq!(ledger.len(), 1);
        // A purged nonce can be inserted again.
        assert!(ledger.insert_if_absent("old-1", 9_500).await);
    }

    #[tokio::test]
    async fn memory_counters_increment_per_key() {
        let store = MemoryCounters::new();
        assert_eq!(store.incr("rate:a:minute:1", 60).await.unwrap(), 1);
        assert_eq!(store.incr("rate:a:minute:1", 60).await.unwrap(), 2);
        assert_eq!(store.incr("rate:a:minute:2", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn last_seen_round_trips() {
        let store = MemoryCounters::new();
        assert_eq!(store.last_seen("rate:a:last").await.unwrap(), None);
        store.set_last_seen("rate:a:last", 42, 3_600).await.unwrap();
        assert_eq!(store.last_seen("rate:a:last").await.unwrap(), Some(42));
    }
}
