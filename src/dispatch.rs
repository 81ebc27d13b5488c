//! Novelty check, notifier fan-out and durable commit for fetched items.
//!
//! The whole read-detect-send-commit sequence runs under one exclusive
//! section over the seen-state ledger. Two concurrent tasks observing the
//! same upstream change therefore produce exactly one alert: the second
//! task re-reads state the first one already committed.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::config::FeedKind;
use crate::detect::{FeedItem, SeenState};
use crate::extract::SignalExtractor;
use crate::notify::{ChatNotifier, EventNotifier};
use crate::store::JsonStore;

/// Durable seen-state with its exclusive section and backing document.
pub struct SeenLedger {
    state: tokio::sync::Mutex<SeenState>,
    store: JsonStore,
    key: String,
}

impl SeenLedger {
    pub fn load(store: JsonStore, key: impl Into<String>, kind: FeedKind) -> Result<Self> {
        let key = key.into();
        let state = match store.load::<SeenState>(&key)? {
            Some(state) => state,
            None => match kind {
                FeedKind::PostList => SeenState::new_set(),
                FeedKind::AlertSlot => SeenState::new_fingerprint(),
            },
        };
        Ok(Self {
            state: tokio::sync::Mutex::new(state),
            store,
            key,
        })
    }
}

pub struct Dispatcher {
    feed: String,
    ledger: Arc<SeenLedger>,
    extractor: Arc<dyn SignalExtractor>,
    chat: Option<Arc<dyn ChatNotifier>>,
    event: Option<Arc<dyn EventNotifier>>,
    /// When set, a failed chat send leaves the item uncommitted so the next
    /// cycle alerts again.
    commit_requires_notify: bool,
}

impl Dispatcher {
    pub fn new(
        feed: impl Into<String>,
        ledger: Arc<SeenLedger>,
        extractor: Arc<dyn SignalExtractor>,
        chat: Option<Arc<dyn ChatNotifier>>,
        event: Option<Arc<dyn EventNotifier>>,
        commit_requires_notify: bool,
    ) -> Self {
        Self {
            feed: feed.into(),
            ledger,
            extractor,
            chat,
            event,
            commit_requires_notify,
        }
    }

    /// Run fetched items through detect -> notify -> commit. Returns how
    /// many alerts went out. Never fatal: notifier and persistence problems
    /// are logged and absorbed.
    pub async fn process(&self, fetched: Vec<FeedItem>) -> usize {
        if fetched.is_empty() {
            return 0;
        }

        let mut state = self.ledger.state.lock().await;
        let novel = state.detect(&fetched);
        if novel.is_empty() {
            tracing::debug!(feed = %self.feed, "no new items");
            return 0;
        }
        tracing::info!(feed = %self.feed, count = novel.len(), "new items to dispatch");

        let mut sent = 0usize;
        for item in &novel {
            let text = format_alert(&self.feed, item);

            let chat_ok = match &self.chat {
                Some(chat) => match chat.notify_chat(&text).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!(feed = %self.feed, "chat notify failed: {e:#}");
                        false
                    }
                },
                None => true,
            };

            // Event channel is independent of the chat channel.
            if let Some(signal) = self.extractor.extract(item) {
                if let Some(event) = &self.event {
                    if let Err(e) = event.notify_event(&signal).await {
                        tracing::error!(feed = %self.feed, "event notify failed: {e:#}");
                    } else {
                        tracing::info!(
                            feed = %self.feed,
                            ticker = %signal.ticker,
                            action = signal.action.as_str(),
                            "signal relayed"
                        );
                    }
                }
            }

            if self.commit_requires_notify && !chat_ok {
                tracing::warn!(feed = %self.feed, title = %item.title, "commit withheld, will re-alert");
                continue;
            }

            state.commit(item);
            if let Err(e) = self.ledger.store.save(&self.ledger.key, &*state) {
                // Worst case after a crash here: one duplicate alert.
                tracing::error!(feed = %self.feed, "failed to persist seen state: {e:#}");
            }
            sent += 1;
            metrics::counter!("alerts_sent_total").increment(1);
            tracing::info!(feed = %self.feed, title = %item.title, "alert dispatched");
        }
        sent
    }
}

/// Draft posts are published under an editor path rather than a canonical
/// slug; they are alerted, but flagged.
pub fn is_draft(url: &str) -> bool {
    url.contains("/publish/post/")
}

/// Pure payload formatting for the chat channel.
pub fn format_alert(feed: &str, item: &FeedItem) -> String {
    let draft = item.url.as_deref().map(is_draft).unwrap_or(false);
    let mut msg = format!(
        "<b>{}New {feed} Alert!</b>\n\n",
        if draft { "[DRAFT] " } else { "" }
    );
    msg.push_str(&format!("<b>Title:</b> {}\n", item.title));
    if let Some(price) = &item.price {
        msg.push_str(&format!("<b>Price:</b> {price}\n"));
    }
    if let Some(published) = &item.published_at {
        msg.push_str(&format!(
            "<b>Published:</b> {}\n",
            published.format("%Y-%m-%d %H:%M:%S %Z")
        ));
    }
    if let Some(url) = &item.url {
        msg.push_str(&format!("<b>URL:</b> {url}\n"));
    }
    msg.push_str(&format!(
        "<b>Current Time:</b> {}\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S %Z")
    ));
    msg
}
