use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by [`crate::pool::ResourcePool`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// Every identity is either checked out or inside its rate-limit
    /// exclusion window. Callers back off and retry; they must not spin.
    #[error("no identity available")]
    NoneAvailable,
}

/// Failures surfaced by one poll attempt against the upstream feed.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Upstream signalled throttling (HTTP 429). The scheduler excludes
    /// the identity that triggered it before releasing it.
    #[error("upstream rate limited")]
    RateLimited,

    /// Soft failure: the fetch exceeded its per-attempt bound. No alert,
    /// no retry inside the task; the next cycle tries again.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("fetch failed: {0}")]
    Other(#[from] anyhow::Error),
}

/// Failures surfaced by [`crate::session::SessionCache::get`].
#[derive(Error, Debug)]
pub enum SessionError {
    /// The authenticator could not mint a session for this account.
    /// Disqualifies the account for the rest of the run.
    #[error("authentication failed for {0}")]
    AuthFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
