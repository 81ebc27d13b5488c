//! Gates the scheduler to the trading window: sleeps until open, runs the
//! scheduler as a tracked background task, cancels it cooperatively at
//! close, then resets daily exclusion state and waits for the next window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::market::MarketClock;
use crate::pool::{Account, Proxy, ResourcePool};
use crate::scheduler::Scheduler;
use crate::session::SessionCache;

pub struct SessionController {
    clock: MarketClock,
    scheduler: Arc<Scheduler>,
    accounts: Arc<ResourcePool<Account>>,
    proxies: Arc<ResourcePool<Proxy>>,
    sessions: Arc<SessionCache>,
    /// Coarse wall-clock re-check interval while the window is open.
    monitor_interval: Duration,
}

impl SessionController {
    pub fn new(
        clock: MarketClock,
        scheduler: Arc<Scheduler>,
        accounts: Arc<ResourcePool<Account>>,
        proxies: Arc<ResourcePool<Proxy>>,
        sessions: Arc<SessionCache>,
        monitor_interval: Duration,
    ) -> Self {
        Self {
            clock,
            scheduler,
            accounts,
            proxies,
            sessions,
            monitor_interval,
        }
    }

    /// Loop over trading windows until `shutdown` fires. No polling happens
    /// outside a window; this is a hard gate, re-checked after every sleep.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let window = self.clock.next_window(Utc::now());
            let now = Utc::now();
            if now < window.opens_at {
                let wait = (window.opens_at - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tracing::info!(
                    opens_at = %window.opens_at,
                    wait_secs = wait.as_secs(),
                    "waiting for trading window"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                // Clock may have drifted during a long sleep; never start
                // early.
                if !self.clock.next_window(Utc::now()).contains(Utc::now()) {
                    continue;
                }
            }

            tracing::info!(closes_at = %window.closes_at, "trading window open, starting scheduler");
            let cancel = shutdown.child_token();
            let handle = tokio::spawn(Arc::clone(&self.scheduler).run(cancel.clone()));

            while Utc::now() < window.closes_at && !shutdown.is_cancelled() {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(self.monitor_interval) => {}
                }
            }

            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::error!("scheduler task panicked: {e}");
            }

            // Daily reset at close: exclusions and the disqualification
            // roster start fresh next window.
            self.accounts.reset_all();
            self.proxies.reset_all();
            self.sessions.clear_disqualified();
            tracing::info!("trading window closed, waiting for the next one");
        }
    }
}
