use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;

use super::EventNotifier;
use crate::extract::TradeSignal;

/// Posts resolved trade signals as a small JSON document to the downstream
/// signal server.
pub struct SignalRelayNotifier {
    url: String,
    client: Client,
    timeout: Duration,
}

impl SignalRelayNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: Client::new(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl EventNotifier for SignalRelayNotifier {
    async fn notify_event(&self, signal: &TradeSignal) -> Result<()> {
        let body = serde_json::json!({
            "name": signal.feed,
            "type": signal.action.as_str(),
            "ticker": signal.ticker,
            "sender": signal.feed.to_ascii_lowercase(),
        });

        self.client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context("signal relay post")?
            .error_for_status()
            .context("signal relay non-2xx")?;
        Ok(())
    }
}
