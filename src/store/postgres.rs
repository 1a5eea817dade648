// =============================================================================
// PostgreSQL store — sqlx-backed repositories
// =============================================================================
//
// Each upsert batch runs inside one transaction.  A failing row returns early;
// dropping the uncommitted transaction rolls the whole batch back.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::SyncResult;
use crate::store::{CandleStore, CursorProvider, InstrumentStore};
use crate::types::{Candle, Instrument};

const UPSERT_INSTRUMENT: &str = r#"
    INSERT INTO instruments (code, chain, can_deposit, can_withdraw, updated_at)
    VALUES ($1, $2, $3, $4, now())
    ON CONFLICT (code, chain)
    DO UPDATE SET can_deposit = EXCLUDED.can_deposit,
                  can_withdraw = EXCLUDED.can_withdraw,
                  updated_at = EXCLUDED.updated_at
"#;

const UPSERT_CANDLE: &str = r#"
    INSERT INTO candles (pair, ts, bar, open_price, high_price, low_price, close_price, volume)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (pair, ts, bar)
    DO UPDATE SET open_price = EXCLUDED.open_price,
                  high_price = EXCLUDED.high_price,
                  low_price = EXCLUDED.low_price,
                  close_price = EXCLUDED.close_price,
                  volume = EXCLUDED.volume
"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await
            .context("failed to connect to PostgreSQL")?;

        let store = Self { pool };
        store
            .ensure_schema()
            .await
            .context("failed to create/verify market-data tables")?;

        info!(max_connections = config.max_connections, "PostgreSQL store ready");
        Ok(store)
    }

    /// Create the tables and the cursor index if they do not exist yet.
    /// One statement per `execute()`.
    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instruments (
                code          TEXT        NOT NULL,
                chain         TEXT        NOT NULL,
                can_deposit   BOOLEAN     NOT NULL,
                can_withdraw  BOOLEAN     NOT NULL,
                updated_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (code, chain)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                pair          TEXT        NOT NULL,
                ts            TIMESTAMPTZ NOT NULL,
                bar           TEXT        NOT NULL,
                open_price    BIGINT      NOT NULL,
                high_price    BIGINT      NOT NULL,
                low_price     BIGINT      NOT NULL,
                close_price   BIGINT      NOT NULL,
                volume        BIGINT      NOT NULL,
                PRIMARY KEY (pair, ts, bar)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS candles_series_ts ON candles (pair, bar, ts);")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn bound(&self, sql: &str, pair: &str, bar: &str) -> SyncResult<Option<DateTime<Utc>>> {
        let ts = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(sql)
            .bind(pair)
            .bind(bar)
            .fetch_one(&self.pool)
            .await?;
        Ok(ts)
    }
}

#[async_trait]
impl InstrumentStore for PgStore {
    async fn upsert_instruments(&self, batch: &[Instrument]) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        for inst in batch {
            sqlx::query(UPSERT_INSTRUMENT)
                .bind(&inst.code)
                .bind(&inst.chain)
                .bind(inst.can_deposit)
                .bind(inst.can_withdraw)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(count = batch.len(), "instrument batch committed");
        Ok(())
    }
}

#[async_trait]
impl CandleStore for PgStore {
    async fn upsert_candles(&self, batch: &[Candle]) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        for c in batch {
            sqlx::query(UPSERT_CANDLE)
                .bind(&c.pair)
                .bind(c.timestamp)
                .bind(&c.bar)
                .bind(c.open.raw())
                .bind(c.high.raw())
                .bind(c.low.raw())
                .bind(c.close.raw())
                .bind(c.volume.raw())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(count = batch.len(), "candle batch committed");
        Ok(())
    }
}

#[async_trait]
impl CursorProvider for PgStore {
    async fn max_timestamp(&self, pair: &str, bar: &str) -> SyncResult<Option<DateTime<Utc>>> {
        self.bound("SELECT MAX(ts) FROM candles WHERE pair = $1 AND bar = $2", pair, bar)
            .await
    }

    async fn min_timestamp(&self, pair: &str, bar: &str) -> SyncResult<Option<DateTime<Utc>>> {
        self.bound("SELECT MIN(ts) FROM candles WHERE pair = $1 AND bar = $2", pair, bar)
            .await
    }
}
