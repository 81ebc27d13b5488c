// tests/cancellation.rs
// Cancelling the scheduler mid-fetch must let in-flight tasks unwind and
// hand their identities back: nothing stays checked out, nothing gets
// excluded.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use feed_sentinel::config::FeedKind;
use feed_sentinel::detect::FeedItem;
use feed_sentinel::dispatch::{Dispatcher, SeenLedger};
use feed_sentinel::error::FetchError;
use feed_sentinel::extract::ShortReportExtractor;
use feed_sentinel::fetch::FetchSource;
use feed_sentinel::pool::{Account, Proxy, ResourcePool};
use feed_sentinel::scheduler::{Scheduler, SchedulerCfg};
use feed_sentinel::session::{Authenticator, SessionCache, SessionState};
use feed_sentinel::store::JsonStore;
use tokio_util::sync::CancellationToken;

struct AlwaysAuth;

#[async_trait]
impl Authenticator for AlwaysAuth {
    async fn authenticate(&self, _account: &Account) -> Result<Option<SessionState>> {
        Ok(Some(SessionState::new(BTreeMap::new())))
    }

    async fn probe(&self, _account: &Account, _session: &SessionState) -> bool {
        true
    }
}

/// Never completes: the fetch only ends when the task observes cancellation.
struct HangingSource;

#[async_trait]
impl FetchSource for HangingSource {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn fetch(
        &self,
        _session: &SessionState,
        _proxy: &Proxy,
    ) -> Result<Vec<FeedItem>, FetchError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_mid_fetch_releases_identities() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::open(dir.path()).unwrap();

    let sessions = Arc::new(SessionCache::new(Arc::new(AlwaysAuth), store.clone()).unwrap());
    let accounts = Arc::new(
        ResourcePool::load(
            vec![Account {
                email: "a@x.com".into(),
                password: "pw".into(),
            }],
            store.clone(),
            "rate_limited_accounts",
            Duration::from_secs(900),
        )
        .unwrap(),
    );
    let proxies = Arc::new(
        ResourcePool::load(
            vec![Proxy::new("p1:8080")],
            store.clone(),
            "rate_limited_proxies",
            Duration::from_secs(900),
        )
        .unwrap(),
    );
    let ledger = Arc::new(SeenLedger::load(store, "seen_state", FeedKind::PostList).unwrap());
    let dispatcher = Arc::new(Dispatcher::new(
        "Cave",
        ledger,
        Arc::new(ShortReportExtractor::new("Cave")),
        None,
        None,
        false,
    ));

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&accounts),
        Arc::clone(&proxies),
        sessions,
        Arc::new(HangingSource),
        dispatcher,
        SchedulerCfg {
            concurrency: 1,
            // far above the test duration so only cancellation can end the fetch
            fetch_timeout: Duration::from_secs(600),
            slow_fetch_warn: Duration::from_secs(600),
            acquire_pacing: Duration::from_millis(1),
            idle_delay: Duration::from_millis(5),
        },
    ));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&scheduler).run(cancel.clone()));

    // give the task time to check the pair out and suspend inside the fetch
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(accounts.available(), 0, "identity is in flight");

    cancel.cancel();
    // run() drains in-flight tasks before returning
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler wound down after cancel")
        .unwrap();

    assert_eq!(accounts.available(), 1, "account released on unwind");
    assert_eq!(proxies.available(), 1, "proxy released on unwind");
    assert!(accounts.acquire().is_ok(), "no stray exclusion left behind");
}
