//! Historical backfill orchestrator.
//!
//! Two-phase concurrent fill on startup:
//! - phase 1 fills from the stored high-water mark (or `days` back on an
//!   empty table) to the latest closed bucket frozen at startup, one
//!   semaphore-gated worker per symbol, inserting each fetched page
//!   immediately so DB latency spaces out the API calls;
//! - phase 2 re-reads the clock and catches up the buckets that closed
//!   while phase 1 ran.
//!
//! Each phase ends by computing index rows for every bucket in its range
//! that has none. Gap repair is a separate offline pass over an explicit
//! window, re-requesting only the contiguous runs a symbol is missing.

use crate::aggregator::{aggregate_bucket, into_index_row};
use crate::base_price::BasePriceRegistry;
use crate::binance::{BinanceClient, Candle};
use crate::database::Database;
use crate::errors::Result;
use crate::timeutil::{floor_five_minutes, latest_closed_bucket, BUCKET_MINUTES, BUCKET_MS};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Klines requested per page during the fill.
const PAGE_LIMIT: usize = 500;

/// Cool-down applied every tenth consecutive worker failure.
const FAILURE_COOLDOWN: std::time::Duration = std::time::Duration::from_secs(5);

pub struct BackfillOrchestrator {
    db: Arc<Database>,
    client: Arc<BinanceClient>,
    registry: Arc<BasePriceRegistry>,
    days: i64,
    concurrency: usize,
}

/// Result of a gap-repair pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairOutcome {
    pub checked_symbols: usize,
    pub repaired_symbol_count: usize,
    pub total_repaired_records: u64,
    pub details: Vec<SymbolRepair>,
}

/// Gap-repair detail for one symbol.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolRepair {
    pub symbol: String,
    pub repaired: u64,
    pub ranges: Vec<String>,
}

impl BackfillOrchestrator {
    pub fn new(
        db: Arc<Database>,
        client: Arc<BinanceClient>,
        registry: Arc<BasePriceRegistry>,
        days: i64,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            client,
            registry,
            days,
            concurrency,
        }
    }

    /// Run the full two-phase fill.
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting historical backfill ({} days, concurrency {})",
            self.days, self.concurrency
        );
        let started = std::time::Instant::now();

        let loaded = self.registry.load().await?;
        if loaded > 0 {
            info!("Loaded {loaded} base prices from store");
        } else {
            info!("No stored base prices, will initialize from this fill");
        }

        let phase1_end = latest_closed_bucket(Utc::now());
        let db_latest = self.db.latest_candle_bucket().await?;

        let phase1_start = match db_latest {
            None => {
                info!("Candle table empty, filling {} days", self.days);
                phase1_end - Duration::days(self.days)
            }
            Some(latest) if latest >= phase1_end => {
                info!("Store already at latest closed bucket {latest}, nothing to fill");
                return Ok(());
            }
            Some(latest) => {
                let start = latest + Duration::minutes(BUCKET_MINUTES);
                info!("Incremental fill from {start} to {phase1_end}");
                start
            }
        };

        // Phase 1: main fill against the endpoint frozen at startup.
        let collect_bases = self.registry.is_empty();
        let collected = self
            .fill_phase(phase1_start, phase1_end, collect_bases)
            .await?;
        if !collected.is_empty() {
            self.registry.adopt_missing(&collected).await?;
        }
        self.compute_index_range(phase1_start, phase1_end).await?;

        // Phase 2: catch up buckets that closed while phase 1 ran.
        let phase2_start = phase1_end + Duration::minutes(BUCKET_MINUTES);
        let phase2_end = latest_closed_bucket(Utc::now());
        if phase2_start <= phase2_end {
            info!("Catch-up fill from {phase2_start} to {phase2_end}");
            self.fill_phase(phase2_start, phase2_end, false).await?;
            self.compute_index_range(phase2_start, phase2_end).await?;
        } else {
            info!("No catch-up needed, store is current");
        }

        info!(
            "Historical backfill finished in {:.1}s",
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    /// Fill one phase window with semaphore-gated per-symbol workers.
    /// Returns each symbol's first observed open price when
    /// `collect_bases` is set.
    async fn fill_phase(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        collect_bases: bool,
    ) -> Result<HashMap<String, f64>> {
        let symbols = self.client.list_active_symbols().await?;
        if symbols.is_empty() {
            warn!("No active symbols available, skipping fill phase");
            return Ok(HashMap::new());
        }

        let start_ms = start.timestamp_millis();
        let end_ms = end.timestamp_millis();

        // Buckets already present in this window are not re-written.
        let existing: Arc<HashSet<DateTime<Utc>>> = Arc::new(
            self.db
                .distinct_bucket_starts(start, end)
                .await?
                .into_iter()
                .collect(),
        );
        if !existing.is_empty() {
            info!("{} buckets already present in this window", existing.len());
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let completed = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicU32::new(0));
        let api_calls = Arc::new(AtomicU64::new(0));
        let saved = Arc::new(AtomicU64::new(0));
        let collected: Arc<Mutex<HashMap<String, f64>>> = Arc::new(Mutex::new(HashMap::new()));

        let total_symbols = symbols.len();
        let phase_started = std::time::Instant::now();
        let mut handles = Vec::with_capacity(total_symbols);

        for symbol in symbols {
            let db = self.db.clone();
            let client = self.client.clone();
            let semaphore = semaphore.clone();
            let existing = existing.clone();
            let completed = completed.clone();
            let failed = failed.clone();
            let api_calls = api_calls.clone();
            let saved = saved.clone();
            let collected = collected.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let mut current = start_ms;
                let mut first_batch = true;

                while current <= end_ms {
                    if client.is_rate_limited() {
                        warn!("Rate-limit latch engaged, aborting fill for {symbol}");
                        break;
                    }

                    let batch = match client
                        .fetch_candle_range(&symbol, "5m", current, end_ms, PAGE_LIMIT)
                        .await
                    {
                        Ok(batch) => batch,
                        Err(e) => {
                            let failures = failed.fetch_add(1, Ordering::SeqCst) + 1;
                            warn!("Fill failed for {symbol}: {e}");
                            if failures % 10 == 0 {
                                warn!("{failures} fill failures, cooling down 5s");
                                tokio::time::sleep(FAILURE_COOLDOWN).await;
                            }
                            break;
                        }
                    };
                    api_calls.fetch_add(1, Ordering::SeqCst);

                    if batch.is_empty() {
                        break;
                    }

                    if collect_bases && first_batch {
                        if let Some(first) = batch.first() {
                            collected
                                .lock()
                                .entry(symbol.clone())
                                .or_insert(first.open);
                        }
                        first_batch = false;
                    }

                    // Insert this page immediately; the DB round-trip is
                    // natural spacing between API calls.
                    let fresh: Vec<Candle> = batch
                        .iter()
                        .filter(|c| !existing.contains(&c.bucket_start) && c.close > 0.0)
                        .cloned()
                        .collect();
                    if !fresh.is_empty() {
                        match db.insert_candles(&fresh).await {
                            Ok(n) => {
                                saved.fetch_add(n, Ordering::SeqCst);
                            }
                            Err(e) => warn!("Candle insert failed for {symbol}: {e}"),
                        }
                    }

                    let last_ms = match batch.last() {
                        Some(last) => last.bucket_start.timestamp_millis(),
                        None => break,
                    };
                    current = last_ms + BUCKET_MS;

                    tokio::time::sleep(client.request_interval()).await;
                }

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if done % 50 == 0 || done == total_symbols {
                    info!(
                        "Fill progress: {done}/{total_symbols} symbols ({} API calls, {} rows) in {:.0}s",
                        api_calls.load(Ordering::SeqCst),
                        saved.load(Ordering::SeqCst),
                        phase_started.elapsed().as_secs_f64()
                    );
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Fill worker panicked: {e}");
            }
        }

        info!(
            "Fill phase done: {} symbols, {} failures, {} API calls, {} rows saved",
            completed.load(Ordering::SeqCst),
            failed.load(Ordering::SeqCst),
            api_calls.load(Ordering::SeqCst),
            saved.load(Ordering::SeqCst)
        );

        let collected = std::mem::take(&mut *collected.lock());
        Ok(collected)
    }

    /// Compute and store an index row for every bucket in `[start, end]`
    /// that has candles but no index row yet.
    pub async fn compute_index_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let existing: HashSet<DateTime<Utc>> = self
            .db
            .index_bucket_starts_between(start, end)
            .await?
            .into_iter()
            .collect();
        let buckets = self.db.distinct_bucket_starts(start, end).await?;
        info!(
            "Computing index rows: {} buckets in range, {} already present",
            buckets.len(),
            existing.len()
        );

        let bases = self.registry.snapshot();
        let mut rows = Vec::new();
        for bucket in buckets {
            if existing.contains(&bucket) {
                continue;
            }
            let candles = self.db.candles_at(bucket).await?;
            if let Some(agg) = aggregate_bucket(&candles, &bases) {
                rows.push(into_index_row(bucket, agg));
            }
        }

        let inserted = self.db.insert_index_rows(&rows).await?;
        if inserted > 0 {
            info!("Stored {inserted} new index rows");
        }
        Ok(inserted)
    }

    /// Offline gap repair over `[start, end]`: for each active symbol,
    /// diff the expected five-minute grid against stored buckets, group
    /// the missing instants into contiguous runs, and re-request each
    /// run from the exchange.
    pub async fn repair_missing(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RepairOutcome> {
        // Never inspect the still-open bucket.
        let cutoff = latest_closed_bucket(Utc::now());
        let end = if end > cutoff { cutoff } else { end };
        info!("Repairing missing candles from {start} to {end}");

        let symbols = self.client.list_active_symbols().await?;
        let expected = expected_grid(start, end);
        let mut details: Vec<SymbolRepair> = Vec::new();
        let mut total_repaired = 0u64;

        for (checked, symbol) in symbols.iter().enumerate() {
            let stored: HashSet<DateTime<Utc>> = self
                .db
                .candles_for_symbol(symbol, start, end)
                .await?
                .into_iter()
                .map(|c| c.bucket_start)
                .collect();

            let missing: Vec<DateTime<Utc>> = expected
                .iter()
                .filter(|t| !stored.contains(t))
                .copied()
                .collect();
            if missing.is_empty() {
                continue;
            }

            let mut repaired = 0u64;
            let mut ranges = Vec::new();
            for (run_start, run_end) in group_missing_ranges(&missing) {
                let start_ms = run_start.timestamp_millis();
                // A single-bucket run still needs a non-empty window.
                let end_ms = run_end.timestamp_millis().max(start_ms + BUCKET_MS);

                let klines = match self
                    .client
                    .fetch_candle_range_paged(symbol, "5m", start_ms, end_ms, PAGE_LIMIT)
                    .await
                {
                    Ok(klines) => klines,
                    Err(e) => {
                        warn!("Repair fetch failed for {symbol}: {e}");
                        continue;
                    }
                };

                let to_insert: Vec<Candle> =
                    klines.into_iter().filter(|c| c.close > 0.0).collect();
                if to_insert.is_empty() {
                    continue;
                }
                let inserted = self.db.insert_candles(&to_insert).await?;
                if inserted > 0 {
                    repaired += inserted;
                    ranges.push(format!("{run_start} ~ {run_end}"));
                }
            }

            if repaired > 0 {
                info!("Repaired {symbol}: {repaired} rows over {:?}", ranges);
                total_repaired += repaired;
                details.push(SymbolRepair {
                    symbol: symbol.clone(),
                    repaired,
                    ranges,
                });
            }

            if (checked + 1) % 50 == 0 {
                info!("Repair progress: {}/{} symbols", checked + 1, symbols.len());
            }
        }

        info!(
            "Repair finished: {} symbols repaired, {} rows",
            details.len(),
            total_repaired
        );
        Ok(RepairOutcome {
            checked_symbols: symbols.len(),
            repaired_symbol_count: details.len(),
            total_repaired_records: total_repaired,
            details,
        })
    }
}

/// The aligned five-minute instants expected in `[start, end]`.
fn expected_grid(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let mut grid = Vec::new();
    let mut t = floor_five_minutes(start);
    while t <= end {
        grid.push(t);
        t += Duration::minutes(BUCKET_MINUTES);
    }
    grid
}

/// Group sorted missing instants into contiguous runs, splitting where
/// consecutive instants are more than one bucket apart.
fn group_missing_ranges(missing: &[DateTime<Utc>]) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut ranges = Vec::new();
    let Some(&first) = missing.first() else {
        return ranges;
    };

    let mut run_start = first;
    let mut run_end = first;
    for &t in &missing[1..] {
        if (t - run_end) > Duration::minutes(BUCKET_MINUTES) {
            ranges.push((run_start, run_end));
            run_start = t;
        }
        run_end = t;
    }
    ranges.push((run_start, run_end));
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 2, h, m, 0).unwrap()
    }

    #[test]
    fn test_expected_grid() {
        let grid = expected_grid(utc(9, 3), utc(9, 20));
        // floored start 09:00, then 09:05, 09:10, 09:15, 09:20
        assert_eq!(grid, vec![utc(9, 0), utc(9, 5), utc(9, 10), utc(9, 15), utc(9, 20)]);
    }

    #[test]
    fn test_group_missing_ranges_merges_adjacent() {
        let missing = vec![utc(9, 0), utc(9, 5), utc(9, 10)];
        assert_eq!(group_missing_ranges(&missing), vec![(utc(9, 0), utc(9, 10))]);
    }

    #[test]
    fn test_group_missing_ranges_splits_on_gap() {
        let missing = vec![utc(9, 0), utc(9, 5), utc(9, 30), utc(9, 35), utc(10, 0)];
        assert_eq!(
            group_missing_ranges(&missing),
            vec![
                (utc(9, 0), utc(9, 5)),
                (utc(9, 30), utc(9, 35)),
                (utc(10, 0), utc(10, 0)),
            ]
        );
    }

    #[test]
    fn test_group_missing_ranges_empty() {
        assert!(group_missing_ranges(&[]).is_empty());
    }
}
