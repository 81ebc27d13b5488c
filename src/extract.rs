//! Source-specific signal classification, injected into the dispatcher.
//!
//! Each feed variant carries its own rules for turning an item's text fields
//! into a structured trade signal. The scheduler never sees these rules.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Serialize;

use crate::detect::FeedItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalAction {
    Buy,
    Sell,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "Buy",
            SignalAction::Sell => "Sell",
        }
    }
}

/// Structured event forwarded to the event notifier when classification
/// resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeSignal {
    pub feed: String,
    pub action: SignalAction,
    /// `-` when the rule matched but no ticker could be captured.
    pub ticker: String,
}

pub trait SignalExtractor: Send + Sync {
    /// `None` means no classification; the chat alert still goes out, the
    /// structured event does not.
    fn extract(&self, item: &FeedItem) -> Option<TradeSignal>;
}

/// Buy/Sell keyword in the title, ticker captured as 1-5 capitals directly
/// before a `$` price.
pub struct KeywordTickerExtractor {
    feed: String,
}

impl KeywordTickerExtractor {
    pub fn new(feed: impl Into<String>) -> Self {
        Self { feed: feed.into() }
    }
}

impl SignalExtractor for KeywordTickerExtractor {
    fn extract(&self, item: &FeedItem) -> Option<TradeSignal> {
        static RE_TICKER: OnceCell<Regex> = OnceCell::new();
        let re = RE_TICKER.get_or_init(|| Regex::new(r"\b([A-Z]{1,5})\s*\$").unwrap());

        let lower = item.title.to_ascii_lowercase();
        let action = if lower.contains("buy") {
            SignalAction::Buy
        } else if lower.contains("sell") {
            SignalAction::Sell
        } else {
            return None;
        };

        let ticker = re
            .captures(&item.title)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "-".to_string());

        Some(TradeSignal {
            feed: self.feed.clone(),
            action,
            ticker,
        })
    }
}

/// Short-report rule: a "Problems at ... (TICKER)" title is a sell signal on
/// the parenthesized all-caps ticker.
pub struct ShortReportExtractor {
    feed: String,
}

impl ShortReportExtractor {
    pub fn new(feed: impl Into<String>) -> Self {
        Self { feed: feed.into() }
    }
}

impl SignalExtractor for ShortReportExtractor {
    fn extract(&self, item: &FeedItem) -> Option<TradeSignal> {
        static RE_PAREN: OnceCell<Regex> = OnceCell::new();
        let re = RE_PAREN.get_or_init(|| Regex::new(r"\(([^)]+)\)").unwrap());

        if !item.title.contains("Problems at") {
            return None;
        }
        let ticker = re.captures(&item.title).and_then(|c| c.get(1))?;
        let ticker = ticker.as_str();
        if ticker.is_empty() || !ticker.chars().all(|c| c.is_ascii_uppercase()) {
            return None;
        }

        Some(TradeSignal {
            feed: self.feed.clone(),
            action: SignalAction::Sell,
            ticker: ticker.to_string(),
        })
    }
}

/// Feeds where every item carries the same action and its own ticker field
/// (swing-trade style entries).
pub struct FixedActionExtractor {
    feed: String,
    action: SignalAction,
}

impl FixedActionExtractor {
    pub fn new(feed: impl Into<String>, action: SignalAction) -> Self {
        Self {
            feed: feed.into(),
            action,
        }
    }
}

impl SignalExtractor for FixedActionExtractor {
    fn extract(&self, item: &FeedItem) -> Option<TradeSignal> {
        let ticker = item.ticker.clone()?;
        Some(TradeSignal {
            feed: self.feed.clone(),
            action: self.action,
            ticker,
        })
    }
}
