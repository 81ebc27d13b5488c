//! Runtime configuration, read from the environment after `dotenvy::dotenv()`.
//!
//! Every knob has an enumerated effect and a default; nothing is positional.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::pool::{Account, Proxy};

/// Which shape the upstream feed has, and therefore which dedup state and
/// signal extraction rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    /// Append-only list of discrete posts/trades; dedup by canonical id.
    PostList,
    /// Single mutable "current alert" slot; dedup by title+price fingerprint.
    AlertSlot,
}

impl FromStr for FeedKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "posts" | "post_list" => Ok(FeedKind::PostList),
            "alert" | "alert_slot" => Ok(FeedKind::AlertSlot),
            other => Err(anyhow!("unknown feed kind: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub feed_name: String,
    pub feed_kind: FeedKind,
    pub feed_url: String,
    /// Lightweight authenticated URL that answers 200 for a live session.
    pub probe_url: Option<String>,

    pub data_dir: PathBuf,
    pub credentials_file: PathBuf,
    pub proxies_file: PathBuf,

    pub window_open_hour: u32,
    pub window_close_hour: u32,
    pub timezone: Tz,

    /// Desired number of concurrent fetch tasks.
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    /// Successful fetches slower than this still log a warning.
    pub slow_fetch_warn: Duration,
    pub rate_limit_exclusion: Duration,
    /// Pause between successive acquisitions within one scheduler round.
    pub acquire_pacing: Duration,
    /// Pause when no identity is available.
    pub idle_delay: Duration,
    /// Coarse interval at which the controller re-checks the wall clock.
    pub monitor_interval: Duration,

    pub auth_batch_size: usize,
    pub auth_batch_pause: Duration,

    /// When true, a failed chat send blocks the SeenState commit so the
    /// item is re-alerted next cycle. Default false: commit anyway.
    pub commit_requires_notify: bool,

    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    /// Endpoint that receives the structured signal document.
    pub signal_url: Option<String>,
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let feed_name = env_str("FEED_NAME").unwrap_or_else(|| "feed".to_string());
        let feed_kind: FeedKind = env_str("FEED_KIND")
            .unwrap_or_else(|| "posts".to_string())
            .parse()?;
        let feed_url =
            env_str("FEED_URL").ok_or_else(|| anyhow!("FEED_URL must be set"))?;

        let timezone: Tz = env_str("MARKET_TIMEZONE")
            .unwrap_or_else(|| "America/New_York".to_string())
            .parse()
            .map_err(|e| anyhow!("invalid MARKET_TIMEZONE: {e}"))?;

        let window_open_hour = env_parse("MARKET_OPEN_HOUR", 8u32);
        let window_close_hour = env_parse("MARKET_CLOSE_HOUR", 15u32);
        if window_open_hour > 23 || window_close_hour > 23 {
            return Err(anyhow!("market hours must be within 0..=23"));
        }
        if window_open_hour >= window_close_hour {
            return Err(anyhow!("MARKET_OPEN_HOUR must be before MARKET_CLOSE_HOUR"));
        }

        Ok(Self {
            feed_name,
            feed_kind,
            feed_url,
            probe_url: env_str("PROBE_URL"),
            data_dir: env_str("DATA_DIR").unwrap_or_else(|| "data".into()).into(),
            credentials_file: env_str("CREDENTIALS_FILE")
                .unwrap_or_else(|| "cred/credentials.toml".into())
                .into(),
            proxies_file: env_str("PROXIES_FILE")
                .unwrap_or_else(|| "cred/proxies.toml".into())
                .into(),
            window_open_hour,
            window_close_hour,
            timezone,
            concurrency: env_parse("POLL_CONCURRENCY", 2usize).max(1),
            fetch_timeout: env_secs("FETCH_TIMEOUT_SECS", 3),
            slow_fetch_warn: env_secs("SLOW_FETCH_WARN_SECS", 2),
            rate_limit_exclusion: env_secs("RATE_LIMIT_EXCLUSION_SECS", 900),
            acquire_pacing: env_millis("ACQUIRE_PACING_MS", 800),
            idle_delay: env_millis("IDLE_DELAY_MS", 400),
            monitor_interval: env_secs("MONITOR_INTERVAL_SECS", 10),
            auth_batch_size: env_parse("AUTH_BATCH_SIZE", 3usize).max(1),
            auth_batch_pause: env_millis("AUTH_BATCH_PAUSE_MS", 800),
            commit_requires_notify: env_parse("COMMIT_REQUIRES_NOTIFY", false),
            telegram_bot_token: env_str("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env_str("TELEGRAM_CHAT_ID"),
            signal_url: env_str("SIGNAL_URL"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct CredentialsDoc {
    accounts: Vec<Account>,
}

#[derive(Debug, Deserialize)]
struct ProxiesDoc {
    proxies: Vec<String>,
}

/// Load the account roster. Unreadable credentials are a fatal startup error.
pub fn load_credentials(path: &std::path::Path) -> Result<Vec<Account>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading credentials from {}", path.display()))?;
    let doc: CredentialsDoc = toml::from_str(&raw)
        .with_context(|| format!("parsing credentials from {}", path.display()))?;
    if doc.accounts.is_empty() {
        return Err(anyhow!("credentials file lists no accounts"));
    }
    Ok(doc.accounts)
}

/// Load egress proxies. A missing or empty document is not fatal: the run
/// falls back to a single direct (proxy-less) egress identity.
pub fn load_proxies(path: &std::path::Path) -> Vec<Proxy> {
    let parsed = std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| toml::from_str::<ProxiesDoc>(&raw).ok());
    match parsed {
        Some(doc) if !doc.proxies.is_empty() => {
            doc.proxies.into_iter().map(Proxy::new).collect()
        }
        _ => {
            tracing::warn!(
                path = %path.display(),
                "no proxies available, running with direct egress only"
            );
            vec![Proxy::direct()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn from_env_applies_defaults() {
        std::env::set_var("FEED_URL", "https://example.com/api/v1/posts");
        std::env::remove_var("FEED_KIND");
        std::env::remove_var("MARKET_OPEN_HOUR");
        std::env::remove_var("MARKET_CLOSE_HOUR");
        std::env::remove_var("POLL_CONCURRENCY");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.feed_kind, FeedKind::PostList);
        assert_eq!(cfg.window_open_hour, 8);
        assert_eq!(cfg.window_close_hour, 15);
        assert_eq!(cfg.concurrency, 2);
        assert_eq!(cfg.rate_limit_exclusion, Duration::from_secs(900));
        assert!(!cfg.commit_requires_notify);

        std::env::remove_var("FEED_URL");
    }

    #[test]
    #[serial]
    fn from_env_rejects_inverted_hours() {
        std::env::set_var("FEED_URL", "https://example.com/api/v1/posts");
        std::env::set_var("MARKET_OPEN_HOUR", "15");
        std::env::set_var("MARKET_CLOSE_HOUR", "8");

        assert!(Config::from_env().is_err());

        std::env::remove_var("FEED_URL");
        std::env::remove_var("MARKET_OPEN_HOUR");
        std::env::remove_var("MARKET_CLOSE_HOUR");
    }

    #[test]
    #[serial]
    fn from_env_requires_feed_url() {
        std::env::remove_var("FEED_URL");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn feed_kind_parses_both_spellings() {
        assert_eq!("posts".parse::<FeedKind>().unwrap(), FeedKind::PostList);
        assert_eq!("alert_slot".parse::<FeedKind>().unwrap(), FeedKind::AlertSlot);
        assert!("rss".parse::<FeedKind>().is_err());
    }

    #[test]
    fn credentials_doc_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.toml");
        std::fs::write(
            &path,
            r#"
            [[accounts]]
            email = "a@example.com"
            password = "pw"

            [[accounts]]
            email = "b@example.com"
            password = "pw2"
            "#,
        )
        .unwrap();
        let accounts = load_credentials(&path).unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].email, "a@example.com");
    }

    #[test]
    fn missing_proxies_fall_back_to_direct() {
        let dir = tempfile::tempdir().unwrap();
        let proxies = load_proxies(&dir.path().join("proxies.toml"));
        assert_eq!(proxies.len(), 1);
        assert!(proxies[0].is_direct());
    }
}
