//! feed-sentinel — binary entrypoint.
//!
//! Wires the resource pools, session cache, fetch source, dispatcher and
//! session controller from environment configuration, then runs windows
//! until shut down. Startup is fatal only on unreadable credentials or an
//! empty valid-account roster; everything past startup degrades and logs.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feed_sentinel::config::{load_credentials, load_proxies, Config, FeedKind};
use feed_sentinel::controller::SessionController;
use feed_sentinel::dispatch::{Dispatcher, SeenLedger};
use feed_sentinel::extract::{KeywordTickerExtractor, ShortReportExtractor, SignalExtractor};
use feed_sentinel::fetch::JsonPostsSource;
use feed_sentinel::market::MarketClock;
use feed_sentinel::notify::relay::SignalRelayNotifier;
use feed_sentinel::notify::telegram::TelegramNotifier;
use feed_sentinel::notify::{ChatNotifier, EventNotifier};
use feed_sentinel::pool::ResourcePool;
use feed_sentinel::scheduler::{Scheduler, SchedulerCfg};
use feed_sentinel::session::{HttpProbeAuthenticator, SessionCache};
use feed_sentinel::store::JsonStore;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("feed_sentinel=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = Config::from_env().context("loading configuration")?;
    let store = JsonStore::open(&cfg.data_dir)?;

    // Unreadable credentials are the one fatal startup condition besides an
    // empty roster.
    let accounts = load_credentials(&cfg.credentials_file)?;
    let proxies = load_proxies(&cfg.proxies_file);

    let auth = Arc::new(HttpProbeAuthenticator::new(
        cfg.probe_url.clone(),
        cfg.fetch_timeout,
    )?);
    let sessions = Arc::new(SessionCache::new(auth, store.clone())?);

    tracing::info!(total = accounts.len(), "initializing accounts");
    let valid = sessions
        .initialize(&accounts, cfg.auth_batch_size, cfg.auth_batch_pause)
        .await;
    if valid.is_empty() {
        bail!("no valid accounts available");
    }
    tracing::info!(valid = valid.len(), "accounts initialized");

    let accounts_pool = Arc::new(ResourcePool::load(
        valid,
        store.clone(),
        "rate_limited_accounts",
        cfg.rate_limit_exclusion,
    )?);
    let proxy_pool = Arc::new(ResourcePool::load(
        proxies,
        store.clone(),
        "rate_limited_proxies",
        cfg.rate_limit_exclusion,
    )?);

    let ledger = Arc::new(SeenLedger::load(store.clone(), "seen_state", cfg.feed_kind)?);
    let extractor: Arc<dyn SignalExtractor> = match cfg.feed_kind {
        FeedKind::AlertSlot => Arc::new(KeywordTickerExtractor::new(cfg.feed_name.clone())),
        FeedKind::PostList => Arc::new(ShortReportExtractor::new(cfg.feed_name.clone())),
    };

    let chat: Option<Arc<dyn ChatNotifier>> =
        match (&cfg.telegram_bot_token, &cfg.telegram_chat_id) {
            (Some(token), Some(chat_id)) => Some(Arc::new(TelegramNotifier::new(
                token.clone(),
                chat_id.clone(),
            ))),
            _ => {
                tracing::warn!("telegram not configured, chat alerts disabled");
                None
            }
        };
    let event: Option<Arc<dyn EventNotifier>> = cfg
        .signal_url
        .clone()
        .map(|url| Arc::new(SignalRelayNotifier::new(url)) as Arc<dyn EventNotifier>);

    let dispatcher = Arc::new(Dispatcher::new(
        cfg.feed_name.clone(),
        ledger,
        extractor,
        chat,
        event,
        cfg.commit_requires_notify,
    ));

    let source = Arc::new(JsonPostsSource::new(
        cfg.feed_name.clone(),
        cfg.feed_url.clone(),
        cfg.fetch_timeout,
    ));

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&accounts_pool),
        Arc::clone(&proxy_pool),
        Arc::clone(&sessions),
        source,
        dispatcher,
        SchedulerCfg {
            concurrency: cfg.concurrency,
            fetch_timeout: cfg.fetch_timeout,
            slow_fetch_warn: cfg.slow_fetch_warn,
            acquire_pacing: cfg.acquire_pacing,
            idle_delay: cfg.idle_delay,
        },
    ));

    let controller = SessionController::new(
        MarketClock::new(cfg.timezone, cfg.window_open_hour, cfg.window_close_hour),
        scheduler,
        accounts_pool,
        proxy_pool,
        sessions,
        cfg.monitor_interval,
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    controller.run(shutdown).await;
    tracing::info!("shut down cleanly");
    Ok(())
}
