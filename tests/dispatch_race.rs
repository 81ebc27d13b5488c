// tests/dispatch_race.rs
// Two concurrent tasks observing the same stale seen-state and the same new
// item must produce exactly one alert and one commit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use feed_sentinel::config::FeedKind;
use feed_sentinel::detect::{FeedItem, SeenState};
use feed_sentinel::dispatch::{Dispatcher, SeenLedger};
use feed_sentinel::extract::KeywordTickerExtractor;
use feed_sentinel::notify::ChatNotifier;
use feed_sentinel::store::JsonStore;

struct CountingChat {
    sent: AtomicUsize,
}

#[async_trait]
impl ChatNotifier for CountingChat {
    async fn notify_chat(&self, _text: &str) -> Result<()> {
        // widen the race window: the send suspends while holding the ledger
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn slot(title: &str, price: &str) -> FeedItem {
    FeedItem {
        id: None,
        title: title.into(),
        price: Some(price.into()),
        ticker: None,
        url: None,
        published_at: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_tasks_dispatch_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::open(dir.path()).unwrap();
    let ledger = Arc::new(SeenLedger::load(store.clone(), "seen_state", FeedKind::AlertSlot).unwrap());
    let chat = Arc::new(CountingChat {
        sent: AtomicUsize::new(0),
    });

    let dispatcher = Arc::new(Dispatcher::new(
        "Hedge",
        ledger,
        Arc::new(KeywordTickerExtractor::new("Hedge")),
        Some(Arc::clone(&chat) as Arc<dyn ChatNotifier>),
        None,
        false,
    ));

    let fetched = vec![slot("Buy AAPL $150", "150")];
    let a = {
        let d = Arc::clone(&dispatcher);
        let f = fetched.clone();
        tokio::spawn(async move { d.process(f).await })
    };
    let b = {
        let d = Arc::clone(&dispatcher);
        let f = fetched.clone();
        tokio::spawn(async move { d.process(f).await })
    };

    let (sent_a, sent_b) = (a.await.unwrap(), b.await.unwrap());
    assert_eq!(sent_a + sent_b, 1, "exactly one task dispatches");
    assert_eq!(chat.sent.load(Ordering::SeqCst), 1);

    // the committed fingerprint is durable and silences further fetches
    let persisted: SeenState = store.load("seen_state").unwrap().expect("committed state");
    assert!(persisted.detect(&fetched).is_empty());
}
