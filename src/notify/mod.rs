//! Outbound notification seams. Dispatch treats both as fire-and-forget:
//! failures are logged, never retried inline, and one channel's failure
//! must not block the other.

pub mod relay;
pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

use crate::extract::TradeSignal;

#[async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn notify_chat(&self, text: &str) -> Result<()>;
}

#[async_trait]
pub trait EventNotifier: Send + Sync {
    async fn notify_event(&self, signal: &TradeSignal) -> Result<()>;
}
