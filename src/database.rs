//! PostgreSQL persistence layer.
//!
//! Owns the connection pool, the schema, and every query the service
//! issues. Three tables: `candle` (one row per symbol per five-minute
//! bucket), `index_row` (one row per bucket), `base_price` (one row per
//! symbol). Candle and index inserts conflict on their natural keys and
//! do nothing, so every write path is idempotent.

use crate::binance::Candle;
use crate::config::DatabaseConfig;
use crate::errors::{MarketBreadthError, Result};
use chrono::{DateTime, Utc};
use deadpool_postgres::{GenericClient, Manager, ManagerConfig, Pool, RecyclingMethod};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::info;

/// Upper bound on rows per multi-row INSERT statement.
const INSERT_CHUNK: usize = 2000;

/// Schema DDL, applied idempotently at startup.
const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS candle (
        symbol        TEXT NOT NULL,
        bucket_start  TIMESTAMPTZ NOT NULL,
        open          DOUBLE PRECISION NOT NULL,
        high          DOUBLE PRECISION NOT NULL,
        low           DOUBLE PRECISION NOT NULL,
        close         DOUBLE PRECISION NOT NULL,
        quote_volume  DOUBLE PRECISION NOT NULL DEFAULT 0,
        PRIMARY KEY (symbol, bucket_start)
    );
    CREATE INDEX IF NOT EXISTS idx_candle_bucket_start ON candle (bucket_start);

    CREATE TABLE IF NOT EXISTS index_row (
        bucket_start  TIMESTAMPTZ PRIMARY KEY,
        index_value   DOUBLE PRECISION NOT NULL,
        total_volume  DOUBLE PRECISION NOT NULL,
        coin_count    INTEGER NOT NULL,
        up_count      INTEGER NOT NULL,
        down_count    INTEGER NOT NULL,
        adr           DOUBLE PRECISION NOT NULL
    );

    CREATE TABLE IF NOT EXISTS base_price (
        symbol      TEXT PRIMARY KEY,
        price       DOUBLE PRECISION NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL
    );
"#;

const CANDLE_COLUMNS: &str = "symbol, bucket_start, open, high, low, close, quote_volume";

const INSERT_INDEX_ROW_SQL: &str = r#"
    INSERT INTO index_row (bucket_start, index_value, total_volume, coin_count, up_count, down_count, adr)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    ON CONFLICT (bucket_start) DO NOTHING
"#;

/// One aggregated breadth-index point.
#[derive(Debug, Clone, Serialize)]
pub struct IndexRow {
    pub bucket_start: DateTime<Utc>,
    pub index_value: f64,
    pub total_volume: f64,
    pub coin_count: i32,
    pub up_count: i32,
    pub down_count: i32,
    pub adr: f64,
}

/// One persisted base price.
#[derive(Debug, Clone, Serialize)]
pub struct BasePriceRow {
    pub symbol: String,
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

/// Connection pool plus every query the service runs.
pub struct Database {
    pool: Pool,
}

impl Database {
    /// Build the pool and smoke-test the connection.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pg_config = config
            .to_pool_config()
            .get_pg_config()
            .map_err(|e| MarketBreadthError::config(format!("Invalid PG config: {e}")))?;

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);

        let pool = Pool::builder(mgr)
            .max_size(config.pool_max)
            .wait_timeout(Some(Duration::from_secs(10)))
            .create_timeout(Some(Duration::from_secs(10)))
            .recycle_timeout(Some(Duration::from_secs(10)))
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .map_err(|e| MarketBreadthError::config(format!("Failed to create pool: {e}")))?;

        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;
        info!("Database connection pool established");

        Ok(Self { pool })
    }

    /// Apply the schema DDL.
    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA_SQL).await?;
        Ok(())
    }

    // ── candles ──────────────────────────────────────────────────────

    /// Bulk-append candles, silently skipping (symbol, bucket_start)
    /// pairs that already exist. Returns the number actually inserted.
    pub async fn insert_candles(&self, candles: &[Candle]) -> Result<u64> {
        let client = self.pool.get().await?;
        insert_candles_with(&client, candles).await
    }

    /// Write one index row and its contributing candles in a single
    /// transaction. Returns false (writing nothing) when the bucket's
    /// index row already exists, so a repeated tick is a no-op.
    pub async fn insert_bucket(&self, row: &IndexRow, candles: &[Candle]) -> Result<bool> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let affected = tx
            .execute(
                INSERT_INDEX_ROW_SQL,
                &[
                    &row.bucket_start,
                    &row.index_value,
                    &row.total_volume,
                    &row.coin_count,
                    &row.up_count,
                    &row.down_count,
                    &row.adr,
                ],
            )
            .await?;

        if affected == 0 {
            tx.commit().await?;
            return Ok(false);
        }

        insert_candles_with(&tx, candles).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Distinct candle buckets in `[start, end]`, ascending.
    pub async fn distinct_bucket_starts(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT DISTINCT bucket_start FROM candle
                 WHERE bucket_start >= $1 AND bucket_start <= $2
                 ORDER BY bucket_start",
                &[&start, &end],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// All candles sharing one exact bucket.
    pub async fn candles_at(&self, bucket_start: DateTime<Utc>) -> Result<Vec<Candle>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!("SELECT {CANDLE_COLUMNS} FROM candle WHERE bucket_start = $1"),
                &[&bucket_start],
            )
            .await?;
        Ok(rows.iter().map(candle_from_row).collect())
    }

    /// One symbol's candles in `[start, end]`, time ascending.
    pub async fn candles_for_symbol(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {CANDLE_COLUMNS} FROM candle
                     WHERE symbol = $1 AND bucket_start >= $2 AND bucket_start <= $3
                     ORDER BY bucket_start"
                ),
                &[&symbol, &start, &end],
            )
            .await?;
        Ok(rows.iter().map(candle_from_row).collect())
    }

    /// Every candle in `[start, end]` ordered by (symbol, bucket_start),
    /// so per-symbol series arrive as contiguous runs.
    pub async fn candles_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {CANDLE_COLUMNS} FROM candle
                     WHERE bucket_start >= $1 AND bucket_start <= $2
                     ORDER BY symbol, bucket_start"
                ),
                &[&start, &end],
            )
            .await?;
        Ok(rows.iter().map(candle_from_row).collect())
    }

    /// Per-symbol highest high over `[start, end]`.
    pub async fn max_high_by_symbol(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, f64>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT symbol, MAX(high) FROM candle
                 WHERE bucket_start >= $1 AND bucket_start <= $2
                 GROUP BY symbol",
                &[&start, &end],
            )
            .await?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    /// Per-symbol lowest low over `[start, end]`.
    pub async fn min_low_by_symbol(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<String, f64>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT symbol, MIN(low) FROM candle
                 WHERE bucket_start >= $1 AND bucket_start <= $2
                 GROUP BY symbol",
                &[&start, &end],
            )
            .await?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    /// All symbols' candles at the single earliest bucket at or after `t`.
    pub async fn earliest_snapshot_after(&self, t: DateTime<Utc>) -> Result<Vec<Candle>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {CANDLE_COLUMNS} FROM candle
                     WHERE bucket_start = (SELECT MIN(bucket_start) FROM candle WHERE bucket_start >= $1)"
                ),
                &[&t],
            )
            .await?;
        Ok(rows.iter().map(candle_from_row).collect())
    }

    /// All symbols' candles at the single latest bucket at or before `t`.
    pub async fn latest_snapshot_before(&self, t: DateTime<Utc>) -> Result<Vec<Candle>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {CANDLE_COLUMNS} FROM candle
                     WHERE bucket_start = (SELECT MAX(bucket_start) FROM candle WHERE bucket_start <= $1)"
                ),
                &[&t],
            )
            .await?;
        Ok(rows.iter().map(candle_from_row).collect())
    }

    /// The newest candle bucket in the store, if any.
    pub async fn latest_candle_bucket(&self) -> Result<Option<DateTime<Utc>>> {
        let client = self.pool.get().await?;
        let row = client
            .query_one("SELECT MAX(bucket_start) FROM candle", &[])
            .await?;
        Ok(row.get(0))
    }

    /// Admin range-delete of candles. Returns rows removed.
    pub async fn delete_candles_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let client = self.pool.get().await?;
        let affected = client
            .execute(
                "DELETE FROM candle WHERE bucket_start >= $1 AND bucket_start <= $2",
                &[&start, &end],
            )
            .await?;
        Ok(affected)
    }

    /// Admin per-symbol purge of candles. Returns rows removed.
    pub async fn delete_candles_for_symbol(&self, symbol: &str) -> Result<u64> {
        let client = self.pool.get().await?;
        let affected = client
            .execute("DELETE FROM candle WHERE symbol = $1", &[&symbol])
            .await?;
        Ok(affected)
    }

    // ── index rows ───────────────────────────────────────────────────

    /// Bulk-append index rows, skipping buckets that already exist.
    pub async fn insert_index_rows(&self, rows: &[IndexRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let client = self.pool.get().await?;
        let mut inserted = 0u64;
        for chunk in rows.chunks(500) {
            let mut sql = String::from(
                "INSERT INTO index_row (bucket_start, index_value, total_volume, coin_count, up_count, down_count, adr) VALUES ",
            );
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 7);
            for (i, row) in chunk.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                let base = i * 7;
                sql.push_str(&format!(
                    "(${},${},${},${},${},${},${})",
                    base + 1,
                    base + 2,
                    base + 3,
                    base + 4,
                    base + 5,
                    base + 6,
                    base + 7
                ));
                params.push(&row.bucket_start);
                params.push(&row.index_value);
                params.push(&row.total_volume);
                params.push(&row.coin_count);
                params.push(&row.up_count);
                params.push(&row.down_count);
                params.push(&row.adr);
            }
            sql.push_str(" ON CONFLICT (bucket_start) DO NOTHING");
            inserted += client.execute(&sql, &params).await?;
        }
        Ok(inserted)
    }

    /// Index rows at or after `t`, ascending.
    pub async fn index_rows_after(&self, t: DateTime<Utc>) -> Result<Vec<IndexRow>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT bucket_start, index_value, total_volume, coin_count, up_count, down_count, adr
                 FROM index_row WHERE bucket_start >= $1 ORDER BY bucket_start",
                &[&t],
            )
            .await?;
        Ok(rows.iter().map(index_row_from_row).collect())
    }

    /// The most recent index row, if any.
    pub async fn latest_index_row(&self) -> Result<Option<IndexRow>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT bucket_start, index_value, total_volume, coin_count, up_count, down_count, adr
                 FROM index_row ORDER BY bucket_start DESC LIMIT 1",
                &[],
            )
            .await?;
        Ok(row.as_ref().map(index_row_from_row))
    }

    /// Whether an index row exists at exactly `t`.
    pub async fn index_row_exists(&self, t: DateTime<Utc>) -> Result<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM index_row WHERE bucket_start = $1)",
                &[&t],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Buckets already holding an index row within `[start, end]`.
    pub async fn index_bucket_starts_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT bucket_start FROM index_row
                 WHERE bucket_start >= $1 AND bucket_start <= $2
                 ORDER BY bucket_start",
                &[&start, &end],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// Admin range-delete of index rows. Returns rows removed.
    pub async fn delete_index_rows_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let client = self.pool.get().await?;
        let affected = client
            .execute(
                "DELETE FROM index_row WHERE bucket_start >= $1 AND bucket_start <= $2",
                &[&start, &end],
            )
            .await?;
        Ok(affected)
    }

    // ── base prices ──────────────────────────────────────────────────

    /// All persisted base prices.
    pub async fn load_base_prices(&self) -> Result<Vec<BasePriceRow>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT symbol, price, created_at FROM base_price ORDER BY symbol",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| BasePriceRow {
                symbol: r.get(0),
                price: r.get(1),
                created_at: r.get(2),
            })
            .collect())
    }

    /// Persist base prices for symbols that have none yet. First
    /// observation wins; existing rows are left untouched.
    pub async fn save_base_prices(&self, entries: &[(String, f64)]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        let client = self.pool.get().await?;
        let created_at = Utc::now();
        let mut inserted = 0u64;
        for chunk in entries.chunks(500) {
            let mut sql =
                String::from("INSERT INTO base_price (symbol, price, created_at) VALUES ");
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 2 + 1);
            for (i, (symbol, price)) in chunk.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                let base = i * 2;
                sql.push_str(&format!("(${},${},${})", base + 1, base + 2, chunk.len() * 2 + 1));
                params.push(symbol);
                params.push(price);
            }
            params.push(&created_at);
            sql.push_str(" ON CONFLICT (symbol) DO NOTHING");
            inserted += client.execute(&sql, &params).await?;
        }
        Ok(inserted)
    }

    /// Revoke one symbol's base price. Returns whether a row existed.
    pub async fn delete_base_price(&self, symbol: &str) -> Result<bool> {
        let client = self.pool.get().await?;
        let affected = client
            .execute("DELETE FROM base_price WHERE symbol = $1", &[&symbol])
            .await?;
        Ok(affected > 0)
    }
}

/// Chunked multi-row candle insert against a client or transaction.
async fn insert_candles_with<C: GenericClient>(client: &C, candles: &[Candle]) -> Result<u64> {
    let mut inserted = 0u64;
    for chunk in candles.chunks(INSERT_CHUNK) {
        let mut sql = format!("INSERT INTO candle ({CANDLE_COLUMNS}) VALUES ");
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 7);
        for (i, candle) in chunk.iter().enumerate() {
            if i > 0 {
                sql.push(',');
            }
            let base = i * 7;
            sql.push_str(&format!(
                "(${},${},${},${},${},${},${})",
                base + 1,
                base + 2,
                base + 3,
                base + 4,
                base + 5,
                base + 6,
                base + 7
            ));
            params.push(&candle.symbol);
            params.push(&candle.bucket_start);
            params.push(&candle.open);
            params.push(&candle.high);
            params.push(&candle.low);
            params.push(&candle.close);
            params.push(&candle.quote_volume);
        }
        sql.push_str(" ON CONFLICT (symbol, bucket_start) DO NOTHING");
        inserted += client.execute(&sql, &params).await?;
    }
    Ok(inserted)
}

fn candle_from_row(row: &Row) -> Candle {
    Candle {
        symbol: row.get(0),
        bucket_start: row.get(1),
        open: row.get(2),
        high: row.get(3),
        low: row.get(4),
        close: row.get(5),
        quote_volume: row.get(6),
    }
}

fn index_row_from_row(row: &Row) -> IndexRow {
    IndexRow {
        bucket_start: row.get(0),
        index_value: row.get(1),
        total_volume: row.get(2),
        coin_count: row.get(3),
        up_count: row.get(4),
        down_count: row.get(5),
        adr: row.get(6),
    }
}
