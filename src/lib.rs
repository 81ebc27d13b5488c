// Public library surface for integration tests (and potential reuse).

pub mod config;
pub mod controller;
pub mod detect;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod market;
pub mod notify;
pub mod pool;
pub mod scheduler;
pub mod session;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::config::{Config, FeedKind};
pub use crate::controller::SessionController;
pub use crate::detect::{FeedItem, Fingerprint, SeenState};
pub use crate::dispatch::{Dispatcher, SeenLedger};
pub use crate::error::{FetchError, PoolError, SessionError};
pub use crate::market::{MarketClock, TradingWindow};
pub use crate::pool::{Account, PoolItem, Proxy, ResourcePool};
pub use crate::scheduler::{Scheduler, SchedulerCfg};
pub use crate::session::{Authenticator, SessionCache, SessionState};
pub use crate::store::JsonStore;
