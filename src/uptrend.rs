//! One-sided uptrend wave segmentation.
//!
//! For each symbol the candle series is scanned once, tracking a wave
//! from a low to a running peak. A wave ends when the close gives back
//! too much of the gain (position ratio below the keep ratio) or when
//! the peak goes stale for too many candles. A candle undercutting the
//! wave's lowest low invalidates the wave entirely. After a termination
//! the next wave starts at the lowest low strictly after the peak, so a
//! post-peak dip that is now rebounding is measured from the dip.
//!
//! Reports are cached per (aligned range, parameters); the cache is
//! dropped whenever the live collector commits a new index row.

use crate::binance::Candle;
use crate::database::Database;
use crate::errors::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::distribution::{bucket_bounds, bucket_index, bucket_label, bucket_step};

/// Cache capacity.
const CACHE_MAX_ENTRIES: usize = 10;

/// Cache entry lifetime.
const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Tuning knobs of the wave detector.
#[derive(Debug, Clone, Copy)]
pub struct UptrendParams {
    /// Minimum fraction of the peak-over-start gain the close must
    /// retain to keep the wave alive
    pub keep_ratio: f64,
    /// Candles without a new peak that end a wave as sideways
    pub no_new_high_candles: usize,
    /// Minimum wave magnitude (percent) worth reporting
    pub min_uptrend: f64,
}

/// One detected wave.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Wave {
    pub symbol: String,
    /// Peak-over-start gain in percent, rounded to 2 decimals
    pub uptrend_percent: f64,
    /// Whether the wave was still making progress at the end of the range
    pub ongoing: bool,
    /// Wave start (ms since epoch)
    pub start_time: i64,
    /// Peak instant (ms since epoch)
    pub peak_time: i64,
    pub start_price: f64,
    pub peak_price: f64,
}

/// Waves grouped into one percent bucket.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UptrendBucket {
    pub range: String,
    pub count: usize,
    pub ongoing_count: usize,
    pub waves: Vec<Wave>,
}

/// Full uptrend query response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UptrendReport {
    pub timestamp: i64,
    /// Total wave count across all symbols
    pub total_coins: usize,
    /// The keep ratio echoed back
    pub pullback_threshold: f64,
    pub ongoing_count: usize,
    pub avg_uptrend: f64,
    pub max_uptrend: f64,
    pub distribution: Vec<UptrendBucket>,
    pub all_coins_ranking: Vec<Wave>,
}

/// Scan one symbol's time-ordered candles into waves.
pub fn scan_waves(symbol: &str, candles: &[Candle], params: &UptrendParams) -> Vec<Wave> {
    if candles.len() < 2 {
        return Vec::new();
    }

    let mut waves = Vec::new();

    let mut in_wave = false;
    let mut ws_price = 0.0;
    let mut ws_time = candles[0].bucket_start;
    let mut peak_price = 0.0;
    let mut peak_time = candles[0].bucket_start;
    let mut wave_lowest_low = 0.0;
    let mut no_new_high = 0usize;

    for (i, candle) in candles.iter().enumerate() {
        let (high, low, close, t) = (candle.high, candle.low, candle.close, candle.bucket_start);

        if !in_wave {
            ws_price = low;
            ws_time = t;
            wave_lowest_low = low;
            peak_price = high;
            peak_time = t;
            no_new_high = 0;
            in_wave = true;
            continue;
        }

        let made_new_high = if high > peak_price {
            peak_price = high;
            peak_time = t;
            no_new_high = 0;
            true
        } else {
            no_new_high += 1;
            false
        };

        // Undercutting the wave's lowest low invalidates it outright;
        // the scan restarts at this candle and nothing is emitted.
        if low < wave_lowest_low {
            ws_price = low;
            ws_time = t;
            wave_lowest_low = low;
            peak_price = high;
            peak_time = t;
            no_new_high = 0;
            continue;
        }

        let range = peak_price - ws_price;
        let position_ratio = if range > 0.0 {
            (close - ws_price) / range
        } else {
            1.0
        };

        // A candle that just set the peak never triggers giveback: its
        // close is below its own high by construction.
        let giveback = !made_new_high && position_ratio < params.keep_ratio && range > 0.0;
        let sideways = no_new_high >= params.no_new_high_candles;

        if giveback || sideways {
            let pct = if ws_price > 0.0 {
                (peak_price - ws_price) / ws_price * 100.0
            } else {
                0.0
            };
            if pct >= params.min_uptrend && ws_time != peak_time {
                waves.push(Wave {
                    symbol: symbol.to_string(),
                    uptrend_percent: round2(pct),
                    ongoing: false,
                    start_time: ws_time.timestamp_millis(),
                    peak_time: peak_time.timestamp_millis(),
                    start_price: ws_price,
                    peak_price,
                });
            }

            // Back-scan strictly after the peak, up to and including
            // this candle, for the lowest low: the next wave measures
            // from the post-peak dip, not from today.
            let mut lowest = low;
            let mut lowest_time = t;
            for prior in candles[..=i].iter().rev() {
                if prior.bucket_start <= peak_time {
                    break;
                }
                if prior.low < lowest {
                    lowest = prior.low;
                    lowest_time = prior.bucket_start;
                }
            }

            ws_price = lowest;
            ws_time = lowest_time;
            wave_lowest_low = lowest;
            peak_price = high;
            peak_time = t;
            no_new_high = 0;
        }
    }

    // The trailing wave is reported as ongoing while the peak is fresh.
    if in_wave && ws_price > 0.0 && peak_price > ws_price {
        let pct = (peak_price - ws_price) / ws_price * 100.0;
        let ongoing = no_new_high < params.no_new_high_candles;
        if pct >= params.min_uptrend && ws_time != peak_time {
            waves.push(Wave {
                symbol: symbol.to_string(),
                uptrend_percent: round2(pct),
                ongoing,
                start_time: ws_time.timestamp_millis(),
                peak_time: peak_time.timestamp_millis(),
                start_price: ws_price,
                peak_price,
            });
        }
    }

    waves
}

/// Assemble the bucketed report from all symbols' waves.
/// `None` when no wave qualified.
pub fn assemble_uptrend(
    mut waves: Vec<Wave>,
    keep_ratio: f64,
    timestamp: i64,
) -> Option<UptrendReport> {
    if waves.is_empty() {
        return None;
    }

    waves.sort_by(|a, b| {
        b.uptrend_percent
            .partial_cmp(&a.uptrend_percent)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let ongoing_count = waves.iter().filter(|w| w.ongoing).count();
    let total: f64 = waves.iter().map(|w| w.uptrend_percent).sum();
    let avg = total / waves.len() as f64;
    let max = waves[0].uptrend_percent;
    let min = waves[waves.len() - 1].uptrend_percent;

    let step = bucket_step(max - min);
    let (lo_idx, hi_idx) = bucket_bounds(min, max, step);

    let mut grouped: Vec<Vec<Wave>> = vec![Vec::new(); (hi_idx - lo_idx) as usize];
    for wave in &waves {
        let idx = bucket_index(wave.uptrend_percent, step) - lo_idx;
        if idx >= 0 && (idx as usize) < grouped.len() {
            grouped[idx as usize].push(wave.clone());
        }
    }

    let distribution = grouped
        .into_iter()
        .enumerate()
        .map(|(offset, members)| {
            let lo = (lo_idx + offset as i64) as f64 * step;
            UptrendBucket {
                range: bucket_label(lo, step),
                count: members.len(),
                ongoing_count: members.iter().filter(|w| w.ongoing).count(),
                waves: members,
            }
        })
        .collect();

    Some(UptrendReport {
        timestamp,
        total_coins: waves.len(),
        pullback_threshold: keep_ratio,
        ongoing_count,
        avg_uptrend: round2(avg),
        max_uptrend: round2(max),
        distribution,
        all_coins_ranking: waves,
    })
}

/// Run the uptrend query over `[start, end]`, serving from the cache
/// when the same aligned range and knobs were computed recently.
pub async fn compute_uptrend(
    db: &Database,
    cache: &UptrendCache,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    params: &UptrendParams,
) -> Result<Option<Arc<UptrendReport>>> {
    let key = cache_key(start, end, params);
    if let Some(hit) = cache.get(&key) {
        debug!("Uptrend cache hit: {key}");
        return Ok(Some(hit));
    }

    let candles = db.candles_in_range(start, end).await?;
    if candles.is_empty() {
        return Ok(None);
    }

    // candles arrive ordered by (symbol, bucket_start); scan each
    // contiguous symbol run in place.
    let mut waves = Vec::new();
    let mut run_start = 0;
    for i in 1..=candles.len() {
        if i == candles.len() || candles[i].symbol != candles[run_start].symbol {
            let series = &candles[run_start..i];
            waves.extend(scan_waves(&series[0].symbol, series, params));
            run_start = i;
        }
    }

    let report = assemble_uptrend(waves, params.keep_ratio, Utc::now().timestamp_millis());
    match report {
        Some(report) => {
            info!(
                "Uptrend scan complete: {} waves, {} ongoing",
                report.total_coins, report.ongoing_count
            );
            let report = Arc::new(report);
            cache.put(key, report.clone());
            Ok(Some(report))
        }
        None => Ok(None),
    }
}

fn cache_key(start: DateTime<Utc>, end: DateTime<Utc>, params: &UptrendParams) -> String {
    format!(
        "{}_{}_{:.2}_{}_{:.2}",
        start.timestamp_millis(),
        end.timestamp_millis(),
        params.keep_ratio,
        params.no_new_high_candles,
        params.min_uptrend
    )
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Bounded, time-expiring report cache. Oldest entry is evicted at
/// capacity; everything is dropped when a new index row commits.
pub struct UptrendCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    inserted: Instant,
    value: Arc<UptrendReport>,
}

impl UptrendCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<UptrendReport>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.inserted.elapsed() < CACHE_TTL => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, value: Arc<UptrendReport>) {
        let mut entries = self.entries.lock();
        if entries.len() >= CACHE_MAX_ENTRIES && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                inserted: Instant::now(),
                value,
            },
        );
    }

    pub fn invalidate_all(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for UptrendCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn series(ohlc: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 2, 9, 0, 0).unwrap();
        ohlc.iter()
            .enumerate()
            .map(|(i, (open, high, low, close))| Candle {
                symbol: "AAAUSDT".to_string(),
                bucket_start: t0 + ChronoDuration::minutes(5 * i as i64),
                open: *open,
                high: *high,
                low: *low,
                close: *close,
                quote_volume: 1000.0,
            })
            .collect()
    }

    /// Flat candles: open = high = low = close.
    fn flat_series(closes: &[f64]) -> Vec<Candle> {
        let ohlc: Vec<(f64, f64, f64, f64)> =
            closes.iter().map(|c| (*c, *c, *c, *c)).collect();
        series(&ohlc)
    }

    fn params(keep_ratio: f64, n: usize, min: f64) -> UptrendParams {
        UptrendParams {
            keep_ratio,
            no_new_high_candles: n,
            min_uptrend: min,
        }
    }

    #[test]
    fn test_giveback_termination() {
        // rises 100 -> 112, then closes at 108.5: position ratio
        // (108.5-100)/(112-100) = 0.708 < 0.75 ends the wave at 12%
        let candles = flat_series(&[100.0, 104.0, 108.0, 112.0, 108.5]);
        let waves = scan_waves("AAAUSDT", &candles, &params(0.75, 6, 1.0));
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].uptrend_percent, 12.0);
        assert!(!waves[0].ongoing);
        assert_eq!(waves[0].start_price, 100.0);
        assert_eq!(waves[0].peak_price, 112.0);
    }

    #[test]
    fn test_sideways_termination() {
        // peak at the 2nd candle, then six candles without a new high
        let candles = flat_series(&[100.0, 105.0, 105.0, 105.0, 105.0, 105.0, 105.0, 105.0]);
        let waves = scan_waves("AAAUSDT", &candles, &params(0.75, 6, 1.0));
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].uptrend_percent, 5.0);
        assert!(!waves[0].ongoing);
    }

    #[test]
    fn test_monotone_rise_is_one_ongoing_wave() {
        let candles = flat_series(&[100.0, 102.0, 104.0, 106.0, 108.0, 110.0]);
        let waves = scan_waves("AAAUSDT", &candles, &params(0.75, 6, 1.0));
        assert_eq!(waves.len(), 1);
        let wave = &waves[0];
        assert!(wave.ongoing);
        assert_eq!(wave.uptrend_percent, 10.0);
        assert_eq!(wave.start_time, candles[0].bucket_start.timestamp_millis());
        assert_eq!(
            wave.peak_time,
            candles.last().unwrap().bucket_start.timestamp_millis()
        );
        assert!(wave.peak_time > wave.start_time);
        assert!(wave.peak_price > wave.start_price);
    }

    #[test]
    fn test_break_below_invalidates_without_emission() {
        // rises, then a candle undercuts the starting low: no wave from
        // the rise, and too little range remains afterwards to emit
        let candles = flat_series(&[100.0, 104.0, 108.0, 99.0, 99.5]);
        let waves = scan_waves("AAAUSDT", &candles, &params(0.75, 6, 4.0));
        assert!(waves.is_empty());
    }

    #[test]
    fn test_min_magnitude_filters_small_waves() {
        let candles = flat_series(&[100.0, 102.0, 102.0, 102.0, 102.0, 102.0, 102.0, 102.0]);
        // 2% wave, threshold 4%: nothing reported
        assert!(scan_waves("AAAUSDT", &candles, &params(0.75, 6, 4.0)).is_empty());
        // threshold 1%: reported
        assert_eq!(scan_waves("AAAUSDT", &candles, &params(0.75, 6, 1.0)).len(), 1);
    }

    #[test]
    fn test_same_candle_peak_is_not_a_wave() {
        // single spike candle: start and peak share the instant
        let candles = series(&[(100.0, 120.0, 100.0, 101.0), (101.0, 101.0, 101.0, 101.0)]);
        let waves = scan_waves("AAAUSDT", &candles, &params(0.75, 1, 1.0));
        for wave in waves {
            assert!(wave.peak_time > wave.start_time);
        }
    }

    #[test]
    fn test_restart_measures_from_post_peak_dip() {
        // wave peaks at 110, gives back to 104 (terminates), dips to 103,
        // then rebounds to 112: second wave starts from the 103 dip
        let candles = flat_series(&[100.0, 105.0, 110.0, 104.0, 103.0, 107.0, 112.0]);
        let waves = scan_waves("AAAUSDT", &candles, &params(0.75, 6, 1.0));
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].uptrend_percent, 10.0);
        assert_eq!(waves[1].start_price, 103.0);
        assert_eq!(waves[1].peak_price, 112.0);
        assert!(waves[1].ongoing);
    }

    #[test]
    fn test_short_series_is_skipped() {
        let candles = flat_series(&[100.0]);
        assert!(scan_waves("AAAUSDT", &candles, &params(0.75, 6, 1.0)).is_empty());
    }

    #[test]
    fn test_assemble_uptrend_summary() {
        let wave = |pct: f64, ongoing: bool| Wave {
            symbol: "AAAUSDT".to_string(),
            uptrend_percent: pct,
            ongoing,
            start_time: 0,
            peak_time: 1,
            start_price: 100.0,
            peak_price: 100.0 + pct,
        };
        let report =
            assemble_uptrend(vec![wave(4.0, false), wave(8.0, true), wave(6.0, false)], 0.75, 42)
                .unwrap();
        assert_eq!(report.total_coins, 3);
        assert_eq!(report.ongoing_count, 1);
        assert_eq!(report.max_uptrend, 8.0);
        assert_eq!(report.avg_uptrend, 6.0);
        assert_eq!(report.all_coins_ranking[0].uptrend_percent, 8.0);
        let bucket_total: usize = report.distribution.iter().map(|b| b.count).sum();
        assert_eq!(bucket_total, 3);
    }

    #[test]
    fn test_assemble_uptrend_empty() {
        assert!(assemble_uptrend(Vec::new(), 0.75, 0).is_none());
    }

    #[test]
    fn test_cache_hit_and_invalidate() {
        let cache = UptrendCache::new();
        let report = Arc::new(UptrendReport {
            timestamp: 0,
            total_coins: 1,
            pullback_threshold: 0.75,
            ongoing_count: 0,
            avg_uptrend: 5.0,
            max_uptrend: 5.0,
            distribution: Vec::new(),
            all_coins_ranking: Vec::new(),
        });

        cache.put("k1".to_string(), report.clone());
        assert!(cache.get("k1").is_some());
        assert!(cache.get("k2").is_none());

        cache.invalidate_all();
        assert!(cache.get("k1").is_none());
    }

    #[test]
    fn test_cache_evicts_at_capacity() {
        let cache = UptrendCache::new();
        let report = Arc::new(UptrendReport {
            timestamp: 0,
            total_coins: 0,
            pullback_threshold: 0.75,
            ongoing_count: 0,
            avg_uptrend: 0.0,
            max_uptrend: 0.0,
            distribution: Vec::new(),
            all_coins_ranking: Vec::new(),
        });
        for i in 0..15 {
            cache.put(format!("k{i}"), report.clone());
        }
        assert_eq!(cache.len(), CACHE_MAX_ENTRIES);
    }
}
