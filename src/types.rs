// =============================================================================
// Shared domain types used across the market-data synchronizer
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::price::Price;

/// A depositable/withdrawable currency on one chain. Natural key:
/// `(code, chain)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub code: String,
    pub chain: String,
    pub can_deposit: bool,
    pub can_withdraw: bool,
}

/// Composite key of a stored candle.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct CandleKey {
    pub pair: String,
    pub bar: String,
    pub timestamp: DateTime<Utc>,
}

/// One OHLCV candle. Natural key: `(pair, timestamp, bar)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candle {
    pub pair: String,
    pub timestamp: DateTime<Utc>,
    pub bar: String,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Price,
}

impl Candle {
    pub fn key(&self) -> CandleKey {
        CandleKey {
            pair: self.pair.clone(),
            bar: self.bar.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Aggressor side of a trade print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Human-readable projection of one trade print, used for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeRecord {
    pub inst_id: String,
    pub trade_id: String,
    pub price: Price,
    pub size: Price,
    pub side: TradeSide,
    pub time: DateTime<Utc>,
}

/// Parse an exchange-native millisecond timestamp string.
pub fn parse_millis(text: &str) -> Option<DateTime<Utc>> {
    let ms: i64 = text.trim().parse().ok()?;
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_text_parses_to_utc() {
        let ts = parse_millis("1738857600000").unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-02-06T16:00:00+00:00");
        assert_eq!(ts.timestamp_millis(), 1_738_857_600_000);
    }

    #[test]
    fn bad_millis_are_rejected() {
        assert!(parse_millis("").is_none());
        assert!(parse_millis("17388x").is_none());
    }

    #[test]
    fn side_uses_exchange_spelling() {
        let side: TradeSide = serde_json::from_str("\"sell\"").unwrap();
        assert_eq!(side, TradeSide::Sell);
        assert_eq!(side.to_string(), "sell");
    }
}
