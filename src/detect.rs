//! Novelty detection against durable "already alerted" state.
//!
//! Two shapes of upstream feed exist: an append-only list of discrete posts
//! (dedup by canonical id, monotonic set) and a single mutable alert slot
//! (dedup by title+price fingerprint, replaced on change). `detect` never
//! mutates state; the dispatcher commits after notifier sends.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One item as returned by a poll attempt, already reduced to the fields the
/// pipeline cares about. Source-specific extraction happens upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    /// Canonical identifier (URL, trade id). Items without one are treated
    /// as not-yet-final and never alerted.
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl FeedItem {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            title: self.title.clone(),
            price: self.price.clone().unwrap_or_default(),
        }
    }
}

/// Discriminating tuple for the single-slot feed shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub title: String,
    pub price: String,
}

/// Durable record of what has already been alerted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeenState {
    Set { ids: BTreeSet<String> },
    Fingerprint { last: Option<Fingerprint> },
}

impl SeenState {
    pub fn new_set() -> Self {
        SeenState::Set {
            ids: BTreeSet::new(),
        }
    }

    pub fn new_fingerprint() -> Self {
        SeenState::Fingerprint { last: None }
    }

    /// Items genuinely new against this state, in fetch order. Items with a
    /// missing canonical id (set variant) or empty title (slot variant) are
    /// dropped without alerting.
    pub fn detect(&self, fetched: &[FeedItem]) -> Vec<FeedItem> {
        match self {
            SeenState::Set { ids } => fetched
                .iter()
                .filter(|item| match &item.id {
                    Some(id) => !ids.contains(id),
                    None => {
                        tracing::debug!(title = %item.title, "dropping item without canonical id");
                        false
                    }
                })
                .cloned()
                .collect(),
            SeenState::Fingerprint { last } => {
                let Some(item) = fetched.first() else {
                    return Vec::new();
                };
                if item.title.is_empty() {
                    tracing::debug!("dropping slot item without title");
                    return Vec::new();
                }
                let fp = item.fingerprint();
                match last {
                    Some(prev) if *prev == fp => Vec::new(),
                    _ => vec![item.clone()],
                }
            }
        }
    }

    /// Record one dispatched item. Append-only for the set variant,
    /// replace-on-change for the fingerprint variant.
    pub fn commit(&mut self, item: &FeedItem) {
        match self {
            SeenState::Set { ids } => {
                if let Some(id) = &item.id {
                    ids.insert(id.clone());
                }
            }
            SeenState::Fingerprint { last } => {
                *last = Some(item.fingerprint());
            }
        }
    }
}
