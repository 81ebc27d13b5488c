//! Fetch collaborator seam plus the HTTP plumbing shared by sources:
//! per-proxy clients, cache-busting query variables, rotating user agents.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::StatusCode;

use crate::detect::FeedItem;
use crate::error::FetchError;
use crate::pool::Proxy;
use crate::session::SessionState;

/// One upstream feed. The scheduler drives this through a rotating
/// (account session, proxy) pair; rate limiting must surface distinctly.
#[async_trait]
pub trait FetchSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(
        &self,
        session: &SessionState,
        proxy: &Proxy,
    ) -> Result<Vec<FeedItem>, FetchError>;
}

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.2903.86",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Random cache-busting query parameter so intermediaries never serve a
/// stale copy of the feed.
pub fn cache_buster() -> String {
    let mut rng = rand::thread_rng();
    let now = chrono::Utc::now();
    let secs = now.timestamp().max(0);
    let millis = now.timestamp_millis().max(0);
    match rng.gen_range(0..8u8) {
        0 => format!("timestamp={}", millis * 10),
        1 => format!("request_uuid={}", uuid::Uuid::new_v4()),
        2 => format!("cache_time={secs}"),
        3 => format!("ran_time={millis}"),
        4 => format!("no_cache_uuid={}", &uuid::Uuid::new_v4().simple().to_string()[..16]),
        5 => format!("unique={secs}-{}", rng.gen_range(1000..10_000)),
        6 => format!("req_uuid=req-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
        _ => format!("tist={secs}"),
    }
}

/// Build a client routed through `proxy` (or direct for the sentinel) with
/// the per-fetch timeout baked in.
pub fn client_for(proxy: &Proxy, timeout: Duration) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if !proxy.is_direct() {
        let url = format!("http://{}", proxy.addr());
        let proxy = reqwest::Proxy::all(&url)
            .map_err(|e| FetchError::Other(anyhow!("invalid proxy {url}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| FetchError::Other(anyhow!("building http client: {e}")))
}

/// Map a response status onto the fetch taxonomy. 429 is the explicit
/// rate-limit signal; 5xx is a soft upstream hiccup reported as empty.
pub fn check_status(status: StatusCode) -> Result<bool, FetchError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::RateLimited);
    }
    if status.is_server_error() {
        tracing::warn!(status = %status, "server error, safe to ignore if infrequent");
        return Ok(false);
    }
    if !status.is_success() {
        return Err(FetchError::Other(anyhow!("unexpected status {status}")));
    }
    Ok(true)
}

pub fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(timeout)
    } else {
        FetchError::Other(anyhow::Error::new(e).context("upstream request failed"))
    }
}

/// JSON list feed: GETs `{url}?limit=10&{cache_buster}` and maps the posts
/// array onto [`FeedItem`]s. Field names follow the substack-style post API.
pub struct JsonPostsSource {
    name: String,
    url: String,
    timeout: Duration,
}

#[derive(Debug, serde::Deserialize)]
struct RawPost {
    #[serde(default)]
    canonical_url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    social_title: Option<String>,
    #[serde(default)]
    post_date: Option<chrono::DateTime<chrono::Utc>>,
}

impl JsonPostsSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            timeout,
        }
    }

    fn item_from(raw: RawPost) -> FeedItem {
        let title = match raw.title {
            Some(t) if !t.trim().is_empty() => t,
            _ => raw.social_title.clone().unwrap_or_default(),
        };
        FeedItem {
            id: raw.canonical_url.clone(),
            title,
            price: None,
            ticker: None,
            url: raw.canonical_url,
            published_at: raw.post_date,
        }
    }
}

#[async_trait]
impl FetchSource for JsonPostsSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        session: &SessionState,
        proxy: &Proxy,
    ) -> Result<Vec<FeedItem>, FetchError> {
        let client = client_for(proxy, self.timeout)?;
        let url = format!("{}?limit=10&{}", self.url, cache_buster());

        let mut req = client
            .get(&url)
            .header(reqwest::header::USER_AGENT, random_user_agent())
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        if !session.cookies.is_empty() {
            req = req.header(reqwest::header::COOKIE, session.cookie_header());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout))?;
        if !check_status(resp.status())? {
            return Ok(Vec::new());
        }

        let posts: Vec<RawPost> = resp
            .json()
            .await
            .map_err(|e| FetchError::Other(anyhow::Error::new(e).context("decoding feed json")))?;
        Ok(posts.into_iter().map(Self::item_from).collect())
    }
}
