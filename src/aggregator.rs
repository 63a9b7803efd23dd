//! Per-bucket index aggregation.
//!
//! Pure: turns a batch of candles sharing one bucket plus the base-price
//! map into one index point. Shared by the live tick and the backfill
//! index computation.

use crate::binance::Candle;
use crate::database::IndexRow;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Aggregate of one bucket's contributing symbols.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketAggregate {
    /// Simple mean of per-symbol percent changes, in percent
    pub index_value: f64,
    /// Sum of quote-asset turnover
    pub total_volume: f64,
    /// Symbols that contributed
    pub coin_count: i32,
    /// Symbols with positive change
    pub up_count: i32,
    /// Symbols with negative change
    pub down_count: i32,
    /// Advance/decline ratio
    pub adr: f64,
}

/// Aggregate one bucket. Symbols without a base, with a non-positive
/// base, or with a non-positive close are skipped. `None` when nothing
/// contributes.
pub fn aggregate_bucket(
    candles: &[Candle],
    bases: &HashMap<String, f64>,
) -> Option<BucketAggregate> {
    let mut total_change = 0.0;
    let mut total_volume = 0.0;
    let mut valid = 0i32;
    let mut up = 0i32;
    let mut down = 0i32;

    for candle in candles {
        let base = match bases.get(&candle.symbol) {
            Some(b) if *b > 0.0 => *b,
            _ => continue,
        };
        if candle.close <= 0.0 {
            continue;
        }

        let change_percent = (candle.close - base) / base * 100.0;
        if change_percent > 0.0 {
            up += 1;
        } else if change_percent < 0.0 {
            down += 1;
        }

        total_change += change_percent;
        total_volume += candle.quote_volume;
        valid += 1;
    }

    if valid == 0 {
        return None;
    }

    Some(BucketAggregate {
        index_value: total_change / valid as f64,
        total_volume,
        coin_count: valid,
        up_count: up,
        down_count: down,
        adr: advance_decline_ratio(up, down),
    })
}

/// up/down, or the advance count alone when nothing declined.
pub fn advance_decline_ratio(up: i32, down: i32) -> f64 {
    if down > 0 {
        up as f64 / down as f64
    } else {
        up as f64
    }
}

/// Attach a bucket instant to an aggregate.
pub fn into_index_row(bucket_start: DateTime<Utc>, agg: BucketAggregate) -> IndexRow {
    IndexRow {
        bucket_start,
        index_value: agg.index_value,
        total_volume: agg.total_volume,
        coin_count: agg.coin_count,
        up_count: agg.up_count,
        down_count: agg.down_count,
        adr: agg.adr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(symbol: &str, close: f64, quote_volume: f64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            bucket_start: Utc.with_ymd_and_hms(2025, 1, 2, 12, 5, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            quote_volume,
        }
    }

    fn bases(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries
            .iter()
            .map(|(s, p)| (s.to_string(), *p))
            .collect()
    }

    #[test]
    fn test_single_symbol_change() {
        // (107.1 - 102) / 102 * 100 = 5.0
        let agg = aggregate_bucket(
            &[candle("AAAUSDT", 107.1, 1500.0)],
            &bases(&[("AAAUSDT", 102.0)]),
        )
        .unwrap();
        assert!((agg.index_value - 5.0).abs() < 1e-9);
        assert_eq!(agg.coin_count, 1);
        assert_eq!(agg.up_count, 1);
        assert_eq!(agg.down_count, 0);
        assert_eq!(agg.adr, 1.0);
        assert_eq!(agg.total_volume, 1500.0);
    }

    #[test]
    fn test_mean_is_simple_not_volume_weighted() {
        let agg = aggregate_bucket(
            &[
                candle("AAAUSDT", 110.0, 1.0),
                candle("BBBUSDT", 90.0, 1_000_000.0),
            ],
            &bases(&[("AAAUSDT", 100.0), ("BBBUSDT", 100.0)]),
        )
        .unwrap();
        // (+10 - 10) / 2 = 0 regardless of volume
        assert!(agg.index_value.abs() < 1e-9);
        assert_eq!(agg.up_count, 1);
        assert_eq!(agg.down_count, 1);
        assert_eq!(agg.adr, 1.0);
    }

    #[test]
    fn test_symbols_without_base_are_skipped() {
        let agg = aggregate_bucket(
            &[
                candle("AAAUSDT", 105.0, 100.0),
                candle("NEWUSDT", 50.0, 100.0),
            ],
            &bases(&[("AAAUSDT", 100.0)]),
        )
        .unwrap();
        assert_eq!(agg.coin_count, 1);
        assert_eq!(agg.total_volume, 100.0);
    }

    #[test]
    fn test_non_positive_base_and_close_are_skipped() {
        assert!(aggregate_bucket(
            &[candle("AAAUSDT", 105.0, 100.0)],
            &bases(&[("AAAUSDT", 0.0)]),
        )
        .is_none());
        assert!(aggregate_bucket(
            &[candle("AAAUSDT", 0.0, 100.0)],
            &bases(&[("AAAUSDT", 100.0)]),
        )
        .is_none());
    }

    #[test]
    fn test_adr_with_no_decliners_is_up_count() {
        let agg = aggregate_bucket(
            &[
                candle("AAAUSDT", 105.0, 1.0),
                candle("BBBUSDT", 103.0, 1.0),
                candle("CCCUSDT", 100.0, 1.0),
            ],
            &bases(&[("AAAUSDT", 100.0), ("BBBUSDT", 100.0), ("CCCUSDT", 100.0)]),
        )
        .unwrap();
        assert_eq!(agg.up_count, 2);
        assert_eq!(agg.down_count, 0);
        assert_eq!(agg.adr, 2.0);
        // the flat symbol still contributes to coin_count
        assert_eq!(agg.coin_count, 3);
    }

    #[test]
    fn test_empty_batch() {
        assert!(aggregate_bucket(&[], &HashMap::new()).is_none());
    }
}
