// =============================================================================
// In-memory store — development fallback and deterministic test double
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::SyncResult;
use crate::store::{CandleStore, CursorProvider, InstrumentStore};
use crate::types::{Candle, CandleKey, Instrument};

/// Process-local store with the same upsert semantics as the SQL store.
/// Each batch is applied under a single write lock, so readers never observe
/// a half-applied batch.
#[derive(Default)]
pub struct MemoryStore {
    instruments: RwLock<HashMap<(String, String), Instrument>>,
    candles: RwLock<BTreeMap<CandleKey, Candle>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All instruments ordered by `(code, chain)`.
    pub fn instruments(&self) -> Vec<Instrument> {
        let mut all: Vec<Instrument> = self.instruments.read().values().cloned().collect();
        all.sort_by(|a, b| (&a.code, &a.chain).cmp(&(&b.code, &b.chain)));
        all
    }

    /// All candles of a series, oldest first.
    pub fn candles(&self, pair: &str, bar: &str) -> Vec<Candle> {
        self.candles
            .read()
            .values()
            .filter(|c| c.pair == pair && c.bar == bar)
            .cloned()
            .collect()
    }

    pub fn candle_count(&self) -> usize {
        self.candles.read().len()
    }

    fn bound(
        &self,
        pair: &str,
        bar: &str,
        pick: impl Fn(DateTime<Utc>, DateTime<Utc>) -> DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.candles
            .read()
            .keys()
            .filter(|k| k.pair == pair && k.bar == bar)
            .map(|k| k.timestamp)
            .reduce(pick)
    }
}

#[async_trait]
impl InstrumentStore for MemoryStore {
    async fn upsert_instruments(&self, batch: &[Instrument]) -> SyncResult<()> {
        let mut map = self.instruments.write();
        for inst in batch {
            map.insert((inst.code.clone(), inst.chain.clone()), inst.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    async fn upsert_candles(&self, batch: &[Candle]) -> SyncResult<()> {
        let mut map = self.candles.write();
        for candle in batch {
            map.insert(candle.key(), candle.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl CursorProvider for MemoryStore {
    async fn max_timestamp(&self, pair: &str, bar: &str) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.bound(pair, bar, std::cmp::max))
    }

    async fn min_timestamp(&self, pair: &str, bar: &str) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.bound(pair, bar, std::cmp::min))
    }
}
