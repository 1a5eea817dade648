// =============================================================================
// Candle Synchronization Engine — store-cursor driven pagination
// =============================================================================
//
// Two modes per configured pair:
//
//   * Historical backfill walks backwards from "now" with `after=<cursor>`,
//     taking the next cursor from the oldest stored candle, until the exchange
//     runs out of history or the walk reaches the newest candle that was
//     already stored when the run began.
//   * Incremental refresh walks forwards with `before=<newest stored>` until
//     the exchange returns an empty page.
//
// The engine keeps no cursor state between iterations or runs; every cursor
// is read back from `CursorProvider`, so a page that failed to persist is
// simply fetched again.  Pages for one pair are strictly sequential and pairs
// are processed one after another.  Callers must not run two invocations
// against the same series at once (see `scheduler::JobGuard`).
// =============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::AppConfig;
use crate::error::SyncResult;
use crate::store::{CandleStore, CursorProvider};
use crate::types::Candle;

/// One page request against the exchange candle endpoint.  Cursor values are
/// exchange-native millisecond timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub pair: String,
    pub bar: String,
    pub limit: usize,
    /// Return candles newer than this timestamp.
    pub before: Option<i64>,
    /// Return candles older than this timestamp.
    pub after: Option<i64>,
}

#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn candles(&self, req: &PageRequest) -> SyncResult<Vec<Candle>>;
}

#[derive(Debug, Clone)]
pub struct CandleSyncSettings {
    pub pairs: Vec<String>,
    pub bar: String,
    pub page_limit: usize,
    pub epoch_floor_ms: i64,
}

impl CandleSyncSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            pairs: config.pairs(),
            bar: config.exchange.candles_bar.clone(),
            page_limit: config.exchange.page_limit,
            epoch_floor_ms: config.exchange.epoch_floor_ms,
        }
    }
}

/// Outcome of one backfill or refresh run across all pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub pages: usize,
    pub candles: usize,
    pub failed_pairs: Vec<String>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed_pairs.is_empty()
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pages, {} candles", self.pages, self.candles)?;
        if !self.failed_pairs.is_empty() {
            write!(f, ", failed: {}", self.failed_pairs.join(","))?;
        }
        Ok(())
    }
}

pub struct CandleSyncEngine {
    source: Arc<dyn CandleSource>,
    store: Arc<dyn CandleStore>,
    cursor: Arc<dyn CursorProvider>,
    settings: CandleSyncSettings,
}

impl CandleSyncEngine {
    pub fn new(
        source: Arc<dyn CandleSource>,
        store: Arc<dyn CandleStore>,
        cursor: Arc<dyn CursorProvider>,
        settings: CandleSyncSettings,
    ) -> Self {
        Self {
            source,
            store,
            cursor,
            settings,
        }
    }

    // -------------------------------------------------------------------------
    // Entry points
    // -------------------------------------------------------------------------

    /// Fill history older than anything stored.  A failing pair is logged and
    /// abandoned until the next invocation; the other pairs still run.
    #[instrument(skip(self), name = "candle_backfill")]
    pub async fn run_historical_backfill(&self) -> SyncReport {
        let mut report = SyncReport::default();
        for pair in &self.settings.pairs {
            if let Err(e) = self.backfill_pair(pair, &mut report).await {
                warn!(pair = %pair, error = %e, "backfill aborted for pair");
                report.failed_pairs.push(pair.clone());
            }
        }
        info!(
            pages = report.pages,
            candles = report.candles,
            failed = report.failed_pairs.len(),
            "historical backfill finished"
        );
        report
    }

    /// Pull candles newer than the newest stored one, for every pair.
    #[instrument(skip(self), name = "candle_refresh")]
    pub async fn run_incremental_refresh(&self) -> SyncReport {
        let mut report = SyncReport::default();
        for pair in &self.settings.pairs {
            if let Err(e) = self.refresh_pair(pair, &mut report).await {
                warn!(pair = %pair, error = %e, "refresh aborted for pair");
                report.failed_pairs.push(pair.clone());
            }
        }
        info!(
            pages = report.pages,
            candles = report.candles,
            failed = report.failed_pairs.len(),
            "incremental refresh finished"
        );
        report
    }

    // -------------------------------------------------------------------------
    // Per-pair loops
    // -------------------------------------------------------------------------

    async fn backfill_pair(&self, pair: &str, report: &mut SyncReport) -> SyncResult<()> {
        let bar = &self.settings.bar;

        // Captured once: the walk stops when it reaches what was already stored.
        let min_after = self
            .cursor
            .max_timestamp(pair, bar)
            .await?
            .map(|ts| ts.timestamp_millis())
            .unwrap_or(self.settings.epoch_floor_ms);
        let mut after = Utc::now().timestamp_millis();

        debug!(pair = %pair, min_after, after, "backfill started");

        loop {
            let page = self.source.candles(&self.page(pair, None, Some(after))).await?;
            self.persist(&page).await?;
            report.pages += 1;
            report.candles += page.len();

            if page.len() < self.settings.page_limit {
                debug!(pair = %pair, rows = page.len(), "short page, history exhausted");
                break;
            }

            let next = match self.cursor.min_timestamp(pair, bar).await? {
                Some(ts) => ts.timestamp_millis(),
                None => break,
            };
            if next <= min_after {
                debug!(pair = %pair, next, min_after, "reached previously stored range");
                break;
            }
            if next >= after {
                warn!(pair = %pair, after, "backfill cursor did not move backwards; stopping");
                break;
            }
            after = next;
        }
        Ok(())
    }

    async fn refresh_pair(&self, pair: &str, report: &mut SyncReport) -> SyncResult<()> {
        let bar = &self.settings.bar;
        let mut before = self.newest(pair).await?;

        loop {
            let page = self.source.candles(&self.page(pair, Some(before), None)).await?;
            if page.is_empty() {
                break;
            }
            self.persist(&page).await?;
            report.pages += 1;
            report.candles += page.len();

            let next = self.newest(pair).await?;
            if next <= before {
                warn!(pair = %pair, bar = %bar, before, "refresh cursor did not advance; stopping");
                break;
            }
            before = next;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn newest(&self, pair: &str) -> SyncResult<i64> {
        Ok(self
            .cursor
            .max_timestamp(pair, &self.settings.bar)
            .await?
            .map(|ts| ts.timestamp_millis())
            .unwrap_or(self.settings.epoch_floor_ms))
    }

    async fn persist(&self, page: &[Candle]) -> SyncResult<()> {
        if page.is_empty() {
            return Ok(());
        }
        self.store.upsert_candles(page).await
    }

    fn page(&self, pair: &str, before: Option<i64>, after: Option<i64>) -> PageRequest {
        PageRequest {
            pair: pair.to_string(),
            bar: self.settings.bar.clone(),
            limit: self.settings.page_limit,
            before,
            after,
        }
    }
}
