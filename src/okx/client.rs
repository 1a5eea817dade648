// =============================================================================
// OKX REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key and passphrase are never logged or serialized.
// Private endpoints carry OK-ACCESS-KEY / -SIGN / -TIMESTAMP / -PASSPHRASE
// headers; the signature is base64(HMAC-SHA256(secret, ts + method + path +
// body)) with an RFC3339 millisecond timestamp.  Market-data endpoints are
// public and unsigned.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::config::{Credentials, ExchangeConfig};
use crate::error::{SyncError, SyncResult};
use crate::market_data::candle_sync::{CandleSource, PageRequest};
use crate::market_data::instrument_sync::InstrumentSource;
use crate::okx::messages::{check_envelope, CandlesResponse, CurrenciesResponse};
use crate::types::{Candle, Instrument};

type HmacSha256 = Hmac<Sha256>;

/// Request timeout for every REST call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// OKX REST API client.
#[derive(Clone)]
pub struct OkxClient {
    credentials: Credentials,
    base_url: String,
    candles_path: String,
    currencies_path: String,
    client: reqwest::Client,
}

impl OkxClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(exchange: &ExchangeConfig, credentials: Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %exchange.api_uri, "OkxClient initialised");

        Ok(Self {
            credentials,
            base_url: exchange.api_uri.trim_end_matches('/').to_string(),
            candles_path: exchange.candles_path.clone(),
            currencies_path: exchange.currencies_path.clone(),
            client,
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// base64(HMAC-SHA256(secret, timestamp + method + path + body)).
    pub fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Current UTC time as OKX expects it: `2020-12-08T09:08:57.715Z`.
    pub fn timestamp_iso() -> String {
        chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string()
    }

    fn auth_headers(&self, method: &str, path: &str) -> SyncResult<HeaderMap> {
        let timestamp = Self::timestamp_iso();
        let signature = self.sign(&timestamp, method, path, "");

        let header = |v: &str| {
            HeaderValue::from_str(v)
                .map_err(|_| SyncError::decode("credential contains invalid header characters"))
        };

        let mut headers = HeaderMap::new();
        headers.insert("ok-access-key", header(&self.credentials.api_key)?);
        headers.insert("ok-access-sign", header(&signature)?);
        headers.insert("ok-access-timestamp", header(&timestamp)?);
        headers.insert("ok-access-passphrase", header(&self.credentials.passphrase)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Full candle URL for one page request.
    pub fn candle_url(&self, req: &PageRequest) -> String {
        let mut url = format!(
            "{}{}?instId={}&bar={}&limit={}",
            self.base_url, self.candles_path, req.pair, req.bar, req.limit
        );
        if let Some(before) = req.before {
            url.push_str(&format!("&before={before}"));
        }
        if let Some(after) = req.after {
            url.push_str(&format!("&after={after}"));
        }
        url
    }

    /// Read the body and fail on a non-success status before decoding.
    async fn read_body(resp: reqwest::Response) -> SyncResult<String> {
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(SyncError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Endpoints
    // -------------------------------------------------------------------------

    /// GET currencies (signed).
    #[instrument(skip(self), name = "okx::fetch_instruments")]
    pub async fn fetch_instruments(&self) -> SyncResult<Vec<Instrument>> {
        let url = format!("{}{}", self.base_url, self.currencies_path);
        let headers = self.auth_headers("GET", &self.currencies_path)?;

        let resp = self.client.get(&url).headers(headers).send().await?;
        let body = Self::read_body(resp).await?;

        let parsed: CurrenciesResponse = serde_json::from_str(&body)?;
        check_envelope(&parsed.code, &parsed.msg)?;

        let instruments: Vec<Instrument> = parsed.data.into_iter().map(Instrument::from).collect();
        debug!(count = instruments.len(), "instruments fetched");
        Ok(instruments)
    }

    /// GET candles (public).
    #[instrument(skip(self), name = "okx::fetch_candles")]
    pub async fn fetch_candles(&self, req: &PageRequest) -> SyncResult<Vec<Candle>> {
        let url = self.candle_url(req);

        let resp = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let body = Self::read_body(resp).await?;

        let parsed: CandlesResponse = serde_json::from_str(&body)?;
        check_envelope(&parsed.code, &parsed.msg)?;

        let candles = parsed
            .data
            .into_iter()
            .map(|row| row.into_candle(&req.pair, &req.bar))
            .collect::<SyncResult<Vec<_>>>()?;

        debug!(pair = %req.pair, count = candles.len(), "candles fetched");
        Ok(candles)
    }
}

#[async_trait]
impl InstrumentSource for OkxClient {
    async fn instruments(&self) -> SyncResult<Vec<Instrument>> {
        self.fetch_instruments().await
    }
}

#[async_trait]
impl CandleSource for OkxClient {
    async fn candles(&self, req: &PageRequest) -> SyncResult<Vec<Candle>> {
        self.fetch_candles(req).await
    }
}

impl std::fmt::Debug for OkxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxClient")
            .field("credentials", &self.credentials)
            .field("base_url", &self.base_url)
            .finish()
    }
}
