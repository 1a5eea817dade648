// =============================================================================
// Persistence contracts — upsert repositories and the store-derived cursor
// =============================================================================
//
// The store is the only record of sync progress.  The candle engine never
// keeps a cursor of its own: it asks `CursorProvider` for the newest/oldest
// stored timestamp of a series every time it needs one.
// =============================================================================

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::types::{Candle, Instrument};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Last-write-wins upsert keyed by `(code, chain)`.
#[async_trait]
pub trait InstrumentStore: Send + Sync {
    /// Apply the whole batch in one transaction; all rows commit or none do.
    async fn upsert_instruments(&self, batch: &[Instrument]) -> SyncResult<()>;
}

/// Upsert keyed by `(pair, timestamp, bar)`; OHLCV fields are overwritten.
#[async_trait]
pub trait CandleStore: Send + Sync {
    async fn upsert_candles(&self, batch: &[Candle]) -> SyncResult<()>;
}

/// Pagination bounds of a stored candle series.
#[async_trait]
pub trait CursorProvider: Send + Sync {
    /// Newest stored candle timestamp for `(pair, bar)`, if any.
    async fn max_timestamp(&self, pair: &str, bar: &str) -> SyncResult<Option<DateTime<Utc>>>;

    /// Oldest stored candle timestamp for `(pair, bar)`, if any.
    async fn min_timestamp(&self, pair: &str, bar: &str) -> SyncResult<Option<DateTime<Utc>>>;
}
