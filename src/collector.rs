//! Live five-minute collection tick.
//!
//! Fires 10 seconds past every five-minute boundary: reconciles the
//! base-price registry against the exchange's active list, fans out one
//! latest-closed-candle fetch per symbol through a bounded pool,
//! aggregates the batch into one index row, and commits the row plus
//! its candles in a single idempotent transaction. Symbols observed for
//! the first time adopt their close as base and sit this bucket out.

use crate::aggregator::{aggregate_bucket, into_index_row};
use crate::base_price::BasePriceRegistry;
use crate::binance::{BinanceClient, Candle};
use crate::database::{Database, IndexRow};
use crate::errors::Result;
use crate::timeutil::latest_closed_bucket;
use crate::uptrend::UptrendCache;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub struct LiveCollector {
    db: Arc<Database>,
    client: Arc<BinanceClient>,
    registry: Arc<BasePriceRegistry>,
    uptrend_cache: Arc<UptrendCache>,
    backfill_in_progress: Arc<AtomicBool>,
    backfill_complete: Arc<AtomicBool>,
    concurrency: usize,
}

impl LiveCollector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        client: Arc<BinanceClient>,
        registry: Arc<BasePriceRegistry>,
        uptrend_cache: Arc<UptrendCache>,
        backfill_in_progress: Arc<AtomicBool>,
        backfill_complete: Arc<AtomicBool>,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            client,
            registry,
            uptrend_cache,
            backfill_in_progress,
            backfill_complete,
            concurrency,
        }
    }

    /// Run one collection tick. Returns the committed index row, or
    /// `None` when the tick was skipped or lost the write race.
    pub async fn tick(&self) -> Result<Option<IndexRow>> {
        if self.backfill_in_progress.load(Ordering::SeqCst) {
            debug!("Backfill in progress, skipping collection tick");
            return Ok(None);
        }
        if !self.backfill_complete.load(Ordering::SeqCst) {
            debug!("Backfill has not completed, collection stays blocked");
            return Ok(None);
        }

        // Cheap idempotency check before any network traffic.
        let expected_bucket = latest_closed_bucket(Utc::now());
        if self.db.index_row_exists(expected_bucket).await? {
            debug!("Index row for {expected_bucket} already exists, skipping tick");
            return Ok(None);
        }

        let symbols = self.client.list_active_symbols().await?;
        if symbols.is_empty() {
            warn!("No active symbols available, skipping tick");
            return Ok(None);
        }

        let active: HashSet<String> = symbols.iter().cloned().collect();
        let revoked = self.registry.reconcile_with_active(&active).await?;
        if !revoked.is_empty() {
            info!("Revoked {} delisted base prices", revoked.len());
        }

        let candles = self.fetch_latest_candles(symbols).await;
        if candles.is_empty() {
            warn!("No candles returned this tick");
            return Ok(None);
        }

        // The batch defines the bucket; stragglers from an older bucket
        // are dropped so every contributor shares one instant.
        let bucket = match candles.iter().map(|c| c.bucket_start).max() {
            Some(bucket) => bucket,
            None => return Ok(None),
        };
        let batch: Vec<Candle> = candles
            .into_iter()
            .filter(|c| c.bucket_start == bucket)
            .collect();

        // Re-check now that the real bucket is known.
        if self.db.index_row_exists(bucket).await? {
            debug!("Index row for {bucket} appeared concurrently, skipping");
            return Ok(None);
        }

        // First-seen symbols adopt their close and join from the next
        // bucket on; everything else contributes now.
        let mut contributing = Vec::with_capacity(batch.len());
        for candle in &batch {
            if self.registry.get(&candle.symbol).is_some() {
                contributing.push(candle.clone());
            } else {
                self.registry
                    .adopt_if_missing(&candle.symbol, candle.close)
                    .await?;
            }
        }

        let bases = self.registry.snapshot();
        let Some(agg) = aggregate_bucket(&contributing, &bases) else {
            warn!("No symbol contributed to bucket {bucket}, nothing written");
            return Ok(None);
        };
        let row = into_index_row(bucket, agg);

        let to_store: Vec<Candle> = batch.into_iter().filter(|c| c.close > 0.0).collect();
        let written = self.db.insert_bucket(&row, &to_store).await?;
        if !written {
            debug!("Lost the write race for {bucket}, no-op");
            return Ok(None);
        }

        self.uptrend_cache.invalidate_all();
        info!(
            "Stored index: bucket={}, value={:.4}%, up/down={}/{}, adr={:.2}, coins={}",
            row.bucket_start, row.index_value, row.up_count, row.down_count, row.adr, row.coin_count
        );
        Ok(Some(row))
    }

    /// Fetch every symbol's latest closed candle through a bounded pool.
    /// Per-symbol failures are logged and the symbol skipped this tick.
    async fn fetch_latest_candles(&self, symbols: Vec<String>) -> Vec<Candle> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let started = std::time::Instant::now();
        let total = symbols.len();

        let mut handles = Vec::with_capacity(total);
        for symbol in symbols {
            let client = self.client.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                match client.fetch_latest_closed_candle(&symbol, Utc::now()).await {
                    Ok(candle) => candle,
                    Err(e) => {
                        debug!("Latest candle fetch failed for {symbol}: {e}");
                        None
                    }
                }
            }));
        }

        let mut candles = Vec::with_capacity(total);
        for handle in handles {
            if let Ok(Some(candle)) = handle.await {
                candles.push(candle);
            }
        }

        info!(
            "Fetched {}/{} latest candles in {:.0}ms",
            candles.len(),
            total,
            started.elapsed().as_millis()
        );
        candles
    }
}
