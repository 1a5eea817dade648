// =============================================================================
// OKX wire types — REST bodies and public WebSocket frames
// =============================================================================
//
// Everything the exchange sends is decoded into fixed shapes at the boundary.
// Candle rows are positional string arrays; they decode into a 9-tuple so that
// a row of any other width is a decode error instead of being truncated.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::price::Price;
use crate::types::{parse_millis, Candle, Instrument, TradeRecord, TradeSide};

// ---------------------------------------------------------------------------
// REST: GET /api/v5/asset/currencies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CurrenciesResponse {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Vec<CurrencyRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyRecord {
    pub ccy: String,
    pub chain: String,
    #[serde(rename = "canDep")]
    pub can_dep: bool,
    #[serde(rename = "canWd")]
    pub can_wd: bool,
}

impl From<CurrencyRecord> for Instrument {
    fn from(r: CurrencyRecord) -> Self {
        Instrument {
            code: r.ccy,
            chain: r.chain,
            can_deposit: r.can_dep,
            can_withdraw: r.can_wd,
        }
    }
}

// ---------------------------------------------------------------------------
// REST: GET /api/v5/market/(history-)candles
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CandlesResponse {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Vec<CandleRow>,
}

/// `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`
#[derive(Debug, Clone, Deserialize)]
pub struct CandleRow(
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
    pub String,
);

impl CandleRow {
    /// Map the positional row onto a [`Candle`] for `pair`/`bar`.
    pub fn into_candle(self, pair: &str, bar: &str) -> SyncResult<Candle> {
        let timestamp = parse_millis(&self.0)
            .ok_or_else(|| SyncError::decode(format!("invalid candle timestamp {:?}", self.0)))?;

        Ok(Candle {
            pair: pair.to_string(),
            timestamp,
            bar: bar.to_string(),
            open: Price::parse(&self.1)?,
            high: Price::parse(&self.2)?,
            low: Price::parse(&self.3)?,
            close: Price::parse(&self.4)?,
            volume: Price::parse(&self.5)?,
        })
    }
}

/// Fail on a non-zero OKX envelope code. An absent code is treated as success.
pub fn check_envelope(code: &str, msg: &str) -> SyncResult<()> {
    if code.is_empty() || code == "0" {
        Ok(())
    } else {
        Err(SyncError::Exchange {
            code: code.to_string(),
            msg: msg.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// WebSocket: subscribe request and trade frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelArg {
    pub channel: String,
    #[serde(rename = "instId")]
    pub inst_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest {
    pub op: &'static str,
    pub args: Vec<ChannelArg>,
}

impl SubscribeRequest {
    /// One `trades` subscription argument per pair.
    pub fn trades(pairs: &[String]) -> Self {
        Self {
            op: "subscribe",
            args: pairs
                .iter()
                .map(|p| ChannelArg {
                    channel: "trades".to_string(),
                    inst_id: p.clone(),
                })
                .collect(),
        }
    }
}

/// Push frame of the public `trades` channel. Event frames (`subscribe`
/// acknowledgements, errors) have no `data` and do not decode as this type.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeMessage {
    pub arg: ChannelArg,
    pub data: Vec<TradeData>,
}

/// `{"event":"subscribe"|"error", ...}` control frames.
#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    pub event: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeData {
    #[serde(rename = "tradeId")]
    pub trade_id: String,
    pub px: String,
    pub sz: String,
    pub side: String,
    pub ts: String,
}

impl TradeMessage {
    pub fn parse(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode every print in the frame; each entry fails independently.
    pub fn records(&self) -> Vec<SyncResult<TradeRecord>> {
        self.data
            .iter()
            .map(|d| {
                Ok(TradeRecord {
                    inst_id: self.arg.inst_id.clone(),
                    trade_id: d.trade_id.clone(),
                    price: Price::parse(&d.px)?,
                    size: Price::parse(&d.sz)?,
                    side: parse_side(&d.side)?,
                    time: parse_millis(&d.ts).ok_or_else(|| {
                        SyncError::decode(format!("invalid trade timestamp {:?}", d.ts))
                    })?,
                })
            })
            .collect()
    }
}

fn parse_side(side: &str) -> SyncResult<TradeSide> {
    match side {
        "buy" => Ok(TradeSide::Buy),
        "sell" => Ok(TradeSide::Sell),
        other => Err(SyncError::decode(format!("unknown trade side {other:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
