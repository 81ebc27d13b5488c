//! The concurrency core: checks out (account, proxy) pairs, launches
//! bounded concurrent fetch tasks and keeps topping concurrency up instead
//! of running lockstep batches. Identities always come back to their pool,
//! and a rate-limit signal excludes the offender before release.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge};
use once_cell::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Dispatcher;
use crate::error::{FetchError, PoolError};
use crate::fetch::FetchSource;
use crate::pool::{Account, PoolItem, Proxy, ResourcePool};
use crate::session::SessionCache;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("poll_fetches_total", "Completed fetch attempts.");
        describe_counter!("poll_timeouts_total", "Fetches abandoned on timeout.");
        describe_counter!(
            "pool_rate_limited_total",
            "Identities excluded after an upstream rate-limit signal."
        );
        describe_counter!("alerts_sent_total", "Novel items dispatched to notifiers.");
        describe_gauge!("pool_available", "Identities currently eligible for checkout.");
    });
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerCfg {
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub slow_fetch_warn: Duration,
    /// Pause between successive acquisitions within one round.
    pub acquire_pacing: Duration,
    /// Pause when no identity is available.
    pub idle_delay: Duration,
}

pub struct Scheduler {
    accounts: Arc<ResourcePool<Account>>,
    proxies: Arc<ResourcePool<Proxy>>,
    sessions: Arc<SessionCache>,
    source: Arc<dyn FetchSource>,
    dispatcher: Arc<Dispatcher>,
    cfg: SchedulerCfg,
}

impl Scheduler {
    pub fn new(
        accounts: Arc<ResourcePool<Account>>,
        proxies: Arc<ResourcePool<Proxy>>,
        sessions: Arc<SessionCache>,
        source: Arc<dyn FetchSource>,
        dispatcher: Arc<Dispatcher>,
        cfg: SchedulerCfg,
    ) -> Self {
        Self {
            accounts,
            proxies,
            sessions,
            source,
            dispatcher,
            cfg,
        }
    }

    /// Poll continuously until the token cancels. Each round checks out up
    /// to N pairs and spawns an independent task per pair; in-flight tasks
    /// keep their identities checked out, so the next round naturally only
    /// tops up what finished.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        ensure_metrics_described();
        tracing::info!(source = self.source.name(), "scheduler started");
        let mut tasks = tokio::task::JoinSet::new();

        'rounds: loop {
            if cancel.is_cancelled() {
                break;
            }
            // reap whatever finished since the last round
            while tasks.try_join_next().is_some() {}

            let mut launched = 0usize;
            for _ in 0..self.cfg.concurrency {
                let account = match self.accounts.acquire() {
                    Ok(a) => a,
                    Err(PoolError::NoneAvailable) => break,
                };
                if self.sessions.is_disqualified(&account.email) {
                    self.accounts.release(&account);
                    continue;
                }
                let proxy = match self.proxies.acquire() {
                    Ok(p) => p,
                    Err(PoolError::NoneAvailable) => {
                        self.accounts.release(&account);
                        break;
                    }
                };

                launched += 1;
                let me = Arc::clone(&self);
                let task_cancel = cancel.clone();
                tasks.spawn(async move {
                    me.poll_once(account, proxy, task_cancel).await;
                });

                if !sleep_or_cancel(self.cfg.acquire_pacing, &cancel).await {
                    break 'rounds;
                }
            }

            let pause = if launched == 0 {
                self.cfg.idle_delay
            } else {
                Duration::from_millis(100)
            };
            if !sleep_or_cancel(pause, &cancel).await {
                break;
            }
        }

        // Let in-flight tasks observe cancellation and release their
        // identities before the controller moves on.
        while tasks.join_next().await.is_some() {}
        tracing::info!(source = self.source.name(), "scheduler stopped");
    }

    /// One fetch task: fetch -> detect -> dispatch, then release both
    /// identities no matter what happened. Rate-limit exclusion is stamped
    /// before release so the identity cannot be re-acquired in between.
    async fn poll_once(&self, account: Account, proxy: Proxy, cancel: CancellationToken) {
        let started = Instant::now();
        match self.poll_inner(&account, &proxy, &cancel).await {
            Ok(Some(sent)) => {
                let elapsed = started.elapsed();
                counter!("poll_fetches_total").increment(1);
                if elapsed > self.cfg.slow_fetch_warn {
                    tracing::warn!(
                        account = %account.email,
                        proxy = %proxy.key(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "slow fetch"
                    );
                } else {
                    tracing::debug!(
                        account = %account.email,
                        proxy = %proxy.key(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        sent,
                        "fetch completed"
                    );
                }
            }
            Ok(None) => {
                // cancelled mid-task; fall through to release
            }
            Err(FetchError::RateLimited) => {
                self.accounts.mark_rate_limited(&account);
                self.proxies.mark_rate_limited(&proxy);
            }
            Err(FetchError::Timeout(bound)) => {
                counter!("poll_timeouts_total").increment(1);
                tracing::warn!(
                    account = %account.email,
                    proxy = %proxy.key(),
                    bound_ms = bound.as_millis() as u64,
                    "fetch abandoned on timeout"
                );
            }
            Err(FetchError::Other(e)) => {
                tracing::error!(account = %account.email, proxy = %proxy.key(), "fetch failed: {e:#}");
            }
        }

        self.accounts.release(&account);
        self.proxies.release(&proxy);
    }

    /// `Ok(None)` means the task observed cancellation and unwound early.
    async fn poll_inner(
        &self,
        account: &Account,
        proxy: &Proxy,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>, FetchError> {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let session = match self.sessions.get(account).await {
            Ok(s) => s,
            Err(e @ crate::error::SessionError::AuthFailed(_)) => {
                tracing::error!(account = %account.email, "{e}, disqualifying for this run");
                self.sessions.disqualify(&account.email);
                return Ok(None);
            }
            Err(e) => {
                tracing::error!(account = %account.email, "session unavailable: {e:#}");
                return Ok(None);
            }
        };

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            res = tokio::time::timeout(self.cfg.fetch_timeout, self.source.fetch(&session, proxy)) => {
                match res {
                    Err(_) => return Err(FetchError::Timeout(self.cfg.fetch_timeout)),
                    Ok(Err(e)) => return Err(e),
                    Ok(Ok(items)) => items,
                }
            }
        };

        if cancel.is_cancelled() {
            return Ok(None);
        }
        let sent = self.dispatcher.process(fetched).await;
        Ok(Some(sent))
    }
}

/// Sleep that unwinds on cancellation; returns false when cancelled.
async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}
