//! Rotating identity pool with time-boxed rate-limit exclusion.
//!
//! One pool instance holds either egress proxies or authenticated accounts.
//! Selection is uniform among identities that are neither checked out nor
//! inside their exclusion window. The exclusion map is persisted after every
//! mutation so a restart does not immediately reuse a penalized identity.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::store::JsonStore;

/// An identity the pool can rotate. The key addresses the identity in the
/// exclusion map and in persisted state.
pub trait PoolItem: Clone + Send + Sync + 'static {
    fn key(&self) -> &str;
}

/// Egress proxy as `host:port`, or the direct (proxy-less) sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proxy(String);

impl Proxy {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Sentinel for runs without any proxy roster.
    pub fn direct() -> Self {
        Self(String::new())
    }

    pub fn is_direct(&self) -> bool {
        self.0.is_empty()
    }

    pub fn addr(&self) -> &str {
        &self.0
    }
}

impl PoolItem for Proxy {
    fn key(&self) -> &str {
        if self.is_direct() {
            "direct"
        } else {
            &self.0
        }
    }
}

/// Subscription account credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub password: String,
}

impl PoolItem for Account {
    fn key(&self) -> &str {
        &self.email
    }
}

struct PoolInner {
    rate_limited: HashMap<String, DateTime<Utc>>,
    checked_out: HashSet<String>,
}

pub struct ResourcePool<T: PoolItem> {
    items: Vec<T>,
    inner: Mutex<PoolInner>,
    store: JsonStore,
    state_key: String,
    exclusion: Duration,
}

impl<T: PoolItem> ResourcePool<T> {
    /// Build a pool over a fixed roster, reloading any persisted exclusion
    /// map under `state_key`.
    pub fn load(
        items: Vec<T>,
        store: JsonStore,
        state_key: impl Into<String>,
        exclusion: Duration,
    ) -> Result<Self> {
        let state_key = state_key.into();
        let rate_limited: HashMap<String, DateTime<Utc>> =
            store.load(&state_key)?.unwrap_or_default();
        if !rate_limited.is_empty() {
            tracing::info!(
                pool = %state_key,
                excluded = rate_limited.len(),
                "restored rate-limit exclusions"
            );
        }
        Ok(Self {
            items,
            inner: Mutex::new(PoolInner {
                rate_limited,
                checked_out: HashSet::new(),
            }),
            store,
            state_key,
            exclusion,
        })
    }

    pub fn acquire(&self) -> Result<T, PoolError> {
        self.acquire_at(Utc::now())
    }

    /// Check out a random eligible identity. Expired exclusions are pruned
    /// (and the pruned map persisted) before selection.
    pub fn acquire_at(&self, now: DateTime<Utc>) -> Result<T, PoolError> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");

        let expired: Vec<String> = inner
            .rate_limited
            .iter()
            .filter(|(_, limited_at)| elapsed(now, **limited_at) >= self.exclusion)
            .map(|(k, _)| k.clone())
            .collect();
        if !expired.is_empty() {
            for key in &expired {
                inner.rate_limited.remove(key);
                tracing::info!(pool = %self.state_key, identity = %key, "exclusion expired");
            }
            self.persist(&inner);
        }

        let eligible: Vec<&T> = self
            .items
            .iter()
            .filter(|item| {
                !inner.rate_limited.contains_key(item.key())
                    && !inner.checked_out.contains(item.key())
            })
            .collect();

        let chosen = eligible
            .choose(&mut rand::thread_rng())
            .map(|item| (*item).clone())
            .ok_or(PoolError::NoneAvailable)?;
        inner.checked_out.insert(chosen.key().to_string());
        self.update_gauge(&inner, now);
        Ok(chosen)
    }

    pub fn release(&self, item: &T) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        inner.checked_out.remove(item.key());
        self.update_gauge(&inner, Utc::now());
    }

    pub fn mark_rate_limited(&self, item: &T) {
        self.mark_rate_limited_at(item, Utc::now());
    }

    pub fn mark_rate_limited_at(&self, item: &T, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        inner.rate_limited.insert(item.key().to_string(), now);
        self.persist(&inner);
        self.update_gauge(&inner, now);
        metrics::counter!("pool_rate_limited_total", "pool" => self.state_key.clone())
            .increment(1);
        tracing::warn!(pool = %self.state_key, identity = %item.key(), "identity rate limited");
    }

    /// Clear all exclusions and delete the persisted map. Called once per
    /// trading-day close.
    pub fn reset_all(&self) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        inner.rate_limited.clear();
        if let Err(e) = self.store.remove(&self.state_key) {
            tracing::warn!(pool = %self.state_key, "failed to delete exclusion state: {e:#}");
        }
        self.update_gauge(&inner, Utc::now());
        tracing::info!(pool = %self.state_key, "all rate-limit exclusions cleared");
    }

    /// Identities currently eligible for checkout.
    pub fn available_at(&self, now: DateTime<Utc>) -> usize {
        let inner = self.inner.lock().expect("pool mutex poisoned");
        self.eligible_count(&inner, now)
    }

    pub fn available(&self) -> usize {
        self.available_at(Utc::now())
    }

    pub fn roster_len(&self) -> usize {
        self.items.len()
    }

    fn eligible_count(&self, inner: &PoolInner, now: DateTime<Utc>) -> usize {
        self.items
            .iter()
            .filter(|item| {
                !inner.checked_out.contains(item.key())
                    && inner
                        .rate_limited
                        .get(item.key())
                        .map_or(true, |at| elapsed(now, *at) >= self.exclusion)
            })
            .count()
    }

    // Every mutation refreshes the gauge so it tracks the pool in between
    // acquisitions too.
    fn update_gauge(&self, inner: &PoolInner, now: DateTime<Utc>) {
        metrics::gauge!("pool_available", "pool" => self.state_key.clone())
            .set(self.eligible_count(inner, now) as f64);
    }

    fn persist(&self, inner: &PoolInner) {
        if let Err(e) = self.store.save(&self.state_key, &inner.rate_limited) {
            tracing::warn!(pool = %self.state_key, "failed to persist exclusions: {e:#}");
        }
    }
}

fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const EXCLUSION: Duration = Duration::from_secs(900);

    fn pool(proxies: &[&str]) -> (ResourcePool<Proxy>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let items = proxies.iter().map(|p| Proxy::new(*p)).collect();
        let pool = ResourcePool::load(items, store, "rate_limited_proxies", EXCLUSION).unwrap();
        (pool, dir)
    }

    #[test]
    fn acquire_release_cycle() {
        let (pool, _dir) = pool(&["p1:80"]);
        let p = pool.acquire().unwrap();
        assert_eq!(pool.acquire().unwrap_err(), PoolError::NoneAvailable);
        pool.release(&p);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn no_double_checkout() {
        let (pool, _dir) = pool(&["p1:80", "p2:80"]);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.key(), b.key());
        assert_eq!(pool.acquire().unwrap_err(), PoolError::NoneAvailable);
    }

    #[test]
    fn exclusion_expires_after_window() {
        let (pool, _dir) = pool(&["p1:80"]);
        let p = Proxy::new("p1:80");
        let t0 = Utc::now();
        pool.mark_rate_limited_at(&p, t0);

        let before = t0 + ChronoDuration::seconds(899);
        assert_eq!(pool.acquire_at(before).unwrap_err(), PoolError::NoneAvailable);

        let after = t0 + ChronoDuration::seconds(901);
        let got = pool.acquire_at(after).unwrap();
        assert_eq!(got.key(), "p1:80");
    }

    #[test]
    fn exclusions_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let items = vec![Proxy::new("p1:80")];
        let pool =
            ResourcePool::load(items.clone(), store.clone(), "rl", EXCLUSION).unwrap();
        pool.mark_rate_limited(&items[0]);
        drop(pool);

        let reborn = ResourcePool::load(items, store, "rl", EXCLUSION).unwrap();
        assert_eq!(reborn.acquire().unwrap_err(), PoolError::NoneAvailable);
    }

    #[test]
    fn reset_all_clears_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let items = vec![Proxy::new("p1:80")];
        let pool =
            ResourcePool::load(items.clone(), store.clone(), "rl", EXCLUSION).unwrap();
        pool.mark_rate_limited(&items[0]);
        pool.reset_all();
        assert!(pool.acquire().is_ok());

        let persisted: Option<HashMap<String, DateTime<Utc>>> = store.load("rl").unwrap();
        assert!(persisted.is_none());
    }

    fn gauge_value(snapshotter: &metrics_util::debugging::Snapshotter) -> f64 {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find_map(|(key, _, _, value)| {
                (key.key().name() == "pool_available").then(|| match value {
                    metrics_util::debugging::DebugValue::Gauge(v) => v.into_inner(),
                    other => panic!("unexpected metric shape: {other:?}"),
                })
            })
            .expect("pool_available gauge recorded")
    }

    #[test]
    fn availability_gauge_tracks_every_mutation() {
        let recorder = metrics_util::debugging::DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let (pool, _dir) = pool(&["p1:80"]);

        metrics::with_local_recorder(&recorder, || {
            let p = pool.acquire().unwrap();
            assert_eq!(gauge_value(&snapshotter), 0.0);

            pool.release(&p);
            assert_eq!(gauge_value(&snapshotter), 1.0);

            pool.mark_rate_limited(&p);
            assert_eq!(gauge_value(&snapshotter), 0.0);

            pool.reset_all();
            assert_eq!(gauge_value(&snapshotter), 1.0);
        });
    }

    #[test]
    fn direct_proxy_sentinel() {
        let p = Proxy::direct();
        assert!(p.is_direct());
        assert_eq!(p.key(), "direct");
    }
}
