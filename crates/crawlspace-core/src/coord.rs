//! Ephemeral coordination store abstraction.
//!
//! The coordination store is the platform's low-latency shared state: lease
//! locks with TTL under compare-and-set semantics, per-queue sorted sets of
//! pending request ids, capped per-run log rings, pub/sub channels, and
//! short-lived values such as run tokens. Redis is one production
//! implementation; the bundled [`MemoryCoordStore`] backs tests and
//! single-process deployments.
//!
//! # Lease semantics
//!
//! A lease is a `(key → (client_key, expires_at))` tuple. Acquisition is a
//! compare-and-set: it succeeds only when no unexpired lease exists for the
//! key or the caller already holds it. Expired leases are treated as absent.
//! The coordination store is authoritative for lease ownership; any row
//! mirrors elsewhere are best-effort.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

/// An unexpired lease held on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Opaque holder identity.
    pub client_key: String,
    /// Instant the lease lapses unless prolonged.
    pub expires_at: DateTime<Utc>,
}

/// A live subscription to a pub/sub channel.
///
/// Yields payloads in publish order. Slow subscribers may observe gaps when
/// the channel buffer overflows; consumers that need continuity re-read the
/// backing ring and resubscribe.
pub struct Subscription {
    inner: Pin<Box<dyn Stream<Item = Bytes> + Send>>,
}

impl Subscription {
    /// Wraps a boxed stream of payloads.
    #[must_use]
    pub fn new(inner: Pin<Box<dyn Stream<Item = Bytes> + Send>>) -> Self {
        Self { inner }
    }
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Coordination store contract.
#[async_trait]
pub trait CoordStore: Send + Sync + 'static {
    /// Attempts to acquire (or refresh) the lease on `key` for `client_key`.
    ///
    /// Returns the new lease on success, or `None` when an unexpired lease
    /// held by a different client exists. This is the CAS primitive; it must
    /// not be implemented as read-then-write.
    async fn try_acquire_lease(
        &self,
        key: &str,
        client_key: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>>;

    /// Extends the lease on `key` to `now + ttl`.
    ///
    /// Returns `None` when no unexpired lease is held by `client_key`.
    async fn prolong_lease(
        &self,
        key: &str,
        client_key: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>>;

    /// Releases the lease on `key`.
    ///
    /// Returns `false` when no unexpired lease is held by `client_key`.
    async fn release_lease(&self, key: &str, client_key: &str) -> Result<bool>;

    /// Returns the current unexpired lease on `key`, if any.
    async fn get_lease(&self, key: &str) -> Result<Option<Lease>>;

    /// Stores a short-lived value.
    async fn put_value(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Reads a short-lived value, if present and unexpired.
    async fn get_value(&self, key: &str) -> Result<Option<Bytes>>;

    /// Removes a short-lived value. Idempotent.
    async fn delete_value(&self, key: &str) -> Result<()>;

    /// Adds (or rescores) a member in a sorted set.
    async fn zadd(&self, set: &str, member: &str, score: i64) -> Result<()>;

    /// Removes a member from a sorted set. Idempotent.
    async fn zrem(&self, set: &str, member: &str) -> Result<()>;

    /// Returns members ordered by ascending score, skipping `offset`.
    async fn zrange(&self, set: &str, offset: usize, limit: usize) -> Result<Vec<(String, i64)>>;

    /// Appends to a capped ring, dropping the oldest entry on overflow.
    ///
    /// Each append refreshes the ring's TTL; an untouched ring disappears
    /// after `ttl`. Returns the entry's monotonic sequence number.
    async fn ring_append(&self, ring: &str, entry: Bytes, cap: usize, ttl: Duration)
        -> Result<u64>;

    /// Returns a slice of the ring in append order.
    ///
    /// `offset` is relative to the oldest retained entry.
    async fn ring_range(&self, ring: &str, offset: usize, limit: usize)
        -> Result<Vec<(u64, Bytes)>>;

    /// Returns the most recent `n` entries in append order.
    async fn ring_tail(&self, ring: &str, n: usize) -> Result<Vec<(u64, Bytes)>>;

    /// Returns the number of retained entries.
    async fn ring_len(&self, ring: &str) -> Result<usize>;

    /// Publishes a payload to a channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Subscribes to a channel, receiving payloads published after this call.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Buffered payloads per pub/sub channel before slow subscribers lag.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct StoredLease {
    client_key: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SortedSet {
    by_score: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

#[derive(Debug, Default)]
struct Ring {
    entries: VecDeque<(u64, Bytes)>,
    next_seq: u64,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct CoordState {
    leases: HashMap<String, StoredLease>,
    values: HashMap<String, StoredValue>,
    sets: HashMap<String, SortedSet>,
    rings: HashMap<String, Ring>,
    channels: HashMap<String, broadcast::Sender<Bytes>>,
}

/// In-process coordination store.
///
/// All operations take a single internal mutex, so every compound operation
/// (lease CAS, ring append) is atomic with respect to the others.
#[derive(Clone, Default)]
pub struct MemoryCoordStore {
    state: Arc<Mutex<CoordState>>,
}

impl MemoryCoordStore {
    /// Creates a new empty coordination store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CoordState>> {
        self.state.lock().map_err(|_| Error::Internal {
            message: "coordination state poisoned".into(),
        })
    }
}

impl std::fmt::Debug for MemoryCoordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCoordStore").finish_non_exhaustive()
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

#[async_trait]
impl CoordStore for MemoryCoordStore {
    async fn try_acquire_lease(
        &self,
        key: &str,
        client_key: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let mut state = self.lock()?;
        let now = Utc::now();
        if let Some(existing) = state.leases.get(key) {
            if existing.expires_at > now && existing.client_key != client_key {
                return Ok(None);
            }
        }
        let lease = StoredLease {
            client_key: client_key.to_string(),
            expires_at: now + chrono_ttl(ttl),
        };
        state.leases.insert(key.to_string(), lease.clone());
        Ok(Some(Lease {
            client_key: lease.client_key,
            expires_at: lease.expires_at,
        }))
    }

    async fn prolong_lease(
        &self,
        key: &str,
        client_key: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let mut state = self.lock()?;
        let now = Utc::now();
        match state.leases.get_mut(key) {
            Some(existing) if existing.expires_at > now && existing.client_key == client_key => {
                existing.expires_at = now + chrono_ttl(ttl);
                Ok(Some(Lease {
                    client_key: existing.client_key.clone(),
                    expires_at: existing.expires_at,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn release_lease(&self, key: &str, client_key: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let held = matches!(
            state.leases.get(key),
            Some(existing) if existing.expires_at > now && existing.client_key == client_key
        );
        if held {
            state.leases.remove(key);
        }
        Ok(held)
    }

    async fn get_lease(&self, key: &str) -> Result<Option<Lease>> {
        let state = self.lock()?;
        let now = Utc::now();
        Ok(state.leases.get(key).and_then(|l| {
            (l.expires_at > now).then(|| Lease {
                client_key: l.client_key.clone(),
                expires_at: l.expires_at,
            })
        }))
    }

    async fn put_value(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut state = self.lock()?;
        state.values.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: Utc::now() + chrono_ttl(ttl),
            },
        );
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<Bytes>> {
        let state = self.lock()?;
        let now = Utc::now();
        Ok(state
            .values
            .get(key)
            .and_then(|v| (v.expires_at > now).then(|| v.value.clone())))
    }

    async fn delete_value(&self, key: &str) -> Result<()> {
        self.lock()?.values.remove(key);
        Ok(())
    }

    async fn zadd(&self, set: &str, member: &str, score: i64) -> Result<()> {
        let mut state = self.lock()?;
        let entry = state.sets.entry(set.to_string()).or_default();
        if let Some(old) = entry.scores.insert(member.to_string(), score) {
            entry.by_score.remove(&(old, member.to_string()));
        }
        entry.by_score.insert((score, member.to_string()));
        Ok(())
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(entry) = state.sets.get_mut(set) {
            if let Some(score) = entry.scores.remove(member) {
                entry.by_score.remove(&(score, member.to_string()));
            }
        }
        Ok(())
    }

    async fn zrange(&self, set: &str, offset: usize, limit: usize) -> Result<Vec<(String, i64)>> {
        let state = self.lock()?;
        Ok(state.sets.get(set).map_or_else(Vec::new, |entry| {
            entry
                .by_score
                .iter()
                .skip(offset)
                .take(limit)
                .map(|(score, member)| (member.clone(), *score))
                .collect()
        }))
    }

    async fn ring_append(
        &self,
        ring: &str,
        entry: Bytes,
        cap: usize,
        ttl: Duration,
    ) -> Result<u64> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let slot = state.rings.entry(ring.to_string()).or_default();
        if slot.expires_at.is_some_and(|at| at <= now) {
            slot.entries.clear();
        }
        let seq = slot.next_seq;
        slot.next_seq += 1;
        slot.entries.push_back((seq, entry));
        while slot.entries.len() > cap {
            slot.entries.pop_front();
        }
        slot.expires_at = Some(now + chrono_ttl(ttl));
        Ok(seq)
    }

    async fn ring_range(
        &self,
        ring: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(u64, Bytes)>> {
        let state = self.lock()?;
        let now = Utc::now();
        Ok(state
            .rings
            .get(ring)
            .filter(|r| r.expires_at.is_none_or(|at| at > now))
            .map_or_else(Vec::new, |r| {
                r.entries
                    .iter()
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            }))
    }

    async fn ring_tail(&self, ring: &str, n: usize) -> Result<Vec<(u64, Bytes)>> {
        let state = self.lock()?;
        let now = Utc::now();
        Ok(state
            .rings
            .get(ring)
            .filter(|r| r.expires_at.is_none_or(|at| at > now))
            .map_or_else(Vec::new, |r| {
                let skip = r.entries.len().saturating_sub(n);
                r.entries.iter().skip(skip).cloned().collect()
            }))
    }

    async fn ring_len(&self, ring: &str) -> Result<usize> {
        let state = self.lock()?;
        let now = Utc::now();
        Ok(state
            .rings
            .get(ring)
            .filter(|r| r.expires_at.is_none_or(|at| at > now))
            .map_or(0, |r| r.entries.len()))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let sender = {
            let state = self.lock()?;
            state.channels.get(channel).cloned()
        };
        if let Some(sender) = sender {
            // No receivers is fine; pub/sub has no delivery guarantee.
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let receiver = {
            let mut state = self.lock()?;
            state
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subscriber lagged; dropping entries");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Subscription::new(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn lease_cas_excludes_second_client() {
        let store = MemoryCoordStore::new();
        let ttl = Duration::from_secs(60);

        let first = store.try_acquire_lease("req:1", "w1", ttl).await.unwrap();
        assert!(first.is_some());

        let second = store.try_acquire_lease("req:1", "w2", ttl).await.unwrap();
        assert!(second.is_none());

        // Same holder refreshes.
        let again = store.try_acquire_lease("req:1", "w1", ttl).await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_acquirable() {
        let store = MemoryCoordStore::new();
        store
            .try_acquire_lease("req:1", "w1", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let lease = store
            .try_acquire_lease("req:1", "w2", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(lease.unwrap().client_key, "w2");

        // The previous holder's key is now stale.
        let prolonged = store
            .prolong_lease("req:1", "w1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(prolonged.is_none());
    }

    #[tokio::test]
    async fn release_requires_ownership() {
        let store = MemoryCoordStore::new();
        let ttl = Duration::from_secs(60);
        store.try_acquire_lease("req:1", "w1", ttl).await.unwrap();

        assert!(!store.release_lease("req:1", "w2").await.unwrap());
        assert!(store.release_lease("req:1", "w1").await.unwrap());
        assert!(store.get_lease("req:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zrange_orders_by_score() {
        let store = MemoryCoordStore::new();
        store.zadd("q", "fifo-1", 1).await.unwrap();
        store.zadd("q", "fifo-2", 2).await.unwrap();
        store.zadd("q", "front", -3).await.unwrap();

        let members = store.zrange("q", 0, 10).await.unwrap();
        let names: Vec<_> = members.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(names, vec!["front", "fifo-1", "fifo-2"]);

        store.zrem("q", "fifo-1").await.unwrap();
        assert_eq!(store.zrange("q", 0, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ring_drops_oldest_at_cap() {
        let store = MemoryCoordStore::new();
        let ttl = Duration::from_secs(60);
        for i in 0..5u8 {
            store
                .ring_append("r", Bytes::from(vec![i]), 3, ttl)
                .await
                .unwrap();
        }
        let entries = store.ring_range("r", 0, 10).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].1, Bytes::from(vec![2u8]));
        assert_eq!(entries[2].1, Bytes::from(vec![4u8]));

        let tail = store.ring_tail("r", 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].1, Bytes::from(vec![4u8]));
    }

    #[tokio::test]
    async fn ring_sequence_survives_overflow() {
        let store = MemoryCoordStore::new();
        let ttl = Duration::from_secs(60);
        let mut last = 0;
        for i in 0..4u8 {
            last = store
                .ring_append("r", Bytes::from(vec![i]), 2, ttl)
                .await
                .unwrap();
        }
        assert_eq!(last, 3);
        let entries = store.ring_range("r", 0, 10).await.unwrap();
        assert_eq!(entries.first().unwrap().0, 2);
    }

    #[tokio::test]
    async fn pubsub_delivers_to_subscriber() {
        let store = MemoryCoordStore::new();
        let mut sub = store.subscribe("ch").await.unwrap();
        store.publish("ch", Bytes::from("hello")).await.unwrap();
        let payload = sub.next().await.unwrap();
        assert_eq!(payload, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn values_expire() {
        let store = MemoryCoordStore::new();
        store
            .put_value("tok", Bytes::from("x"), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(store.get_value("tok").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get_value("tok").await.unwrap().is_none());
    }
}
