//! Per-account authentication state: cookie documents cached in memory,
//! persisted per account, validated lazily against a liveness probe and
//! refreshed through the external authenticator collaborator.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::error::SessionError;
use crate::pool::Account;
use crate::store::JsonStore;

const DISQUALIFIED_KEY: &str = "disqualified_accounts";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub cookies: BTreeMap<String, String>,
    pub validated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(cookies: BTreeMap<String, String>) -> Self {
        Self {
            cookies,
            validated_at: Utc::now(),
        }
    }

    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// External login collaborator. The interactive (browser) flow lives outside
/// this daemon; only its interface is modeled here.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Mint a fresh session for the account, or `Ok(None)` when the account
    /// cannot be logged in (bad credentials, upstream refusal).
    async fn authenticate(&self, account: &Account) -> Result<Option<SessionState>>;

    /// Cheap authenticated request that must come back with a logged-in
    /// signal for the session to count as live.
    async fn probe(&self, account: &Account, session: &SessionState) -> bool;
}

/// Probe-only collaborator for deployments where sessions are provisioned
/// out of band as cookie documents: it validates them against a configured
/// logged-in URL but cannot mint new ones.
pub struct HttpProbeAuthenticator {
    client: reqwest::Client,
    probe_url: Option<String>,
}

impl HttpProbeAuthenticator {
    pub fn new(probe_url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, probe_url })
    }
}

#[async_trait]
impl Authenticator for HttpProbeAuthenticator {
    async fn authenticate(&self, account: &Account) -> Result<Option<SessionState>> {
        tracing::error!(
            account = %account.email,
            "no stored session and interactive login is provisioned externally"
        );
        Ok(None)
    }

    async fn probe(&self, account: &Account, session: &SessionState) -> bool {
        let Some(url) = &self.probe_url else {
            // No probe endpoint configured: trust the stored document.
            return true;
        };
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::COOKIE, session.cookie_header())
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => true,
            Ok(r) => {
                tracing::info!(account = %account.email, status = %r.status(), "session probe rejected");
                false
            }
            Err(e) => {
                tracing::warn!(account = %account.email, "session probe failed: {e}");
                false
            }
        }
    }
}

/// One account's cached state plus the lock that serializes its probe/login.
type SessionSlot = Arc<tokio::sync::Mutex<Option<SessionState>>>;

pub struct SessionCache {
    auth: Arc<dyn Authenticator>,
    store: JsonStore,
    sessions: std::sync::Mutex<HashMap<String, SessionSlot>>,
    disqualified: std::sync::Mutex<BTreeSet<String>>,
}

impl SessionCache {
    pub fn new(auth: Arc<dyn Authenticator>, store: JsonStore) -> Result<Self> {
        let disqualified: BTreeSet<String> =
            store.load(DISQUALIFIED_KEY)?.unwrap_or_default();
        Ok(Self {
            auth,
            store,
            sessions: std::sync::Mutex::new(HashMap::new()),
            disqualified: std::sync::Mutex::new(disqualified),
        })
    }

    /// Per-account slot; the map lock is held only for this lookup, never
    /// across a network await.
    fn slot(&self, email: &str) -> SessionSlot {
        let mut map = self.sessions.lock().expect("session map poisoned");
        Arc::clone(map.entry(email.to_string()).or_default())
    }

    /// A live session for the account: memory hit, or persisted document
    /// that passes the probe, or a freshly minted one. The slot lock keeps
    /// two tasks from racing the same account while logins for different
    /// accounts proceed in parallel.
    pub async fn get(&self, account: &Account) -> Result<SessionState, SessionError> {
        let slot = self.slot(&account.email);
        let mut entry = slot.lock().await;
        if let Some(state) = entry.as_ref() {
            return Ok(state.clone());
        }

        let key = JsonStore::key_for("session", &account.email);
        if let Some(stored) = self.store.load::<SessionState>(&key)? {
            if self.auth.probe(account, &stored).await {
                tracing::info!(account = %account.email, "using stored session");
                let state = SessionState {
                    validated_at: Utc::now(),
                    ..stored
                };
                *entry = Some(state.clone());
                return Ok(state);
            }
            tracing::info!(account = %account.email, "stored session stale, re-authenticating");
        }

        match self.auth.authenticate(account).await? {
            Some(state) => {
                self.store.save(&key, &state)?;
                tracing::info!(account = %account.email, "minted and saved new session");
                *entry = Some(state.clone());
                Ok(state)
            }
            None => Err(SessionError::AuthFailed(account.email.clone())),
        }
    }

    /// Validate a roster of accounts in small throttled batches and return
    /// the ones that came up with a live session. Failures disqualify the
    /// account for the rest of the run.
    pub async fn initialize(
        self: &Arc<Self>,
        accounts: &[Account],
        batch_size: usize,
        batch_pause: Duration,
    ) -> Vec<Account> {
        let mut valid = Vec::new();
        let chunks: Vec<&[Account]> = accounts.chunks(batch_size.max(1)).collect();
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut set = JoinSet::new();
            for account in chunk.iter().cloned() {
                let me = Arc::clone(self);
                set.spawn(async move {
                    let outcome = me.get(&account).await;
                    (account, outcome)
                });
            }
            while let Some(joined) = set.join_next().await {
                let Ok((account, outcome)) = joined else {
                    continue;
                };
                match outcome {
                    Ok(_) => {
                        tracing::info!(account = %account.email, "account validated");
                        valid.push(account);
                    }
                    Err(e) => {
                        tracing::error!(account = %account.email, "account validation failed: {e}");
                        self.disqualify(&account.email);
                    }
                }
            }
            if i < last {
                tokio::time::sleep(batch_pause).await;
            }
        }
        valid
    }

    /// Permanent-for-this-run disqualification; distinct from a rate-limit
    /// exclusion and cleared only at window close.
    pub fn disqualify(&self, email: &str) {
        let mut set = self.disqualified.lock().expect("disqualified mutex poisoned");
        if set.insert(email.to_string()) {
            if let Err(e) = self.store.save(DISQUALIFIED_KEY, &*set) {
                tracing::warn!("failed to persist disqualified roster: {e:#}");
            }
        }
    }

    pub fn is_disqualified(&self, email: &str) -> bool {
        self.disqualified
            .lock()
            .expect("disqualified mutex poisoned")
            .contains(email)
    }

    pub fn clear_disqualified(&self) {
        let mut set = self.disqualified.lock().expect("disqualified mutex poisoned");
        set.clear();
        if let Err(e) = self.store.remove(DISQUALIFIED_KEY) {
            tracing::warn!("failed to delete disqualified roster: {e:#}");
        }
    }
}
