//! Rise-distribution histogram.
//!
//! Compares each symbol's close at the end of a window against its open
//! at the start, tracks the extreme excursions in between, and buckets
//! the percent changes with a step that adapts to the observed spread.

use crate::database::Database;
use crate::errors::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

/// One symbol's percent changes over the window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinChange {
    pub symbol: String,
    /// (end close − base open) / base open · 100
    pub change_percent: f64,
    /// highest high over the window, relative to the base
    pub max_change_percent: f64,
    /// lowest low over the window, relative to the base
    pub min_change_percent: f64,
}

/// One histogram bucket.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionBucket {
    pub range: String,
    pub count: usize,
    pub coins: Vec<String>,
    pub coin_details: Vec<CoinChange>,
}

/// Full distribution query response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionReport {
    pub timestamp: i64,
    pub total_coins: usize,
    pub up_count: usize,
    pub down_count: usize,
    pub distribution: Vec<DistributionBucket>,
    pub all_coins_ranking: Vec<CoinChange>,
}

/// Histogram step for an observed percent spread.
pub(crate) fn bucket_step(range: f64) -> f64 {
    if range <= 2.0 {
        0.2
    } else if range <= 5.0 {
        0.5
    } else if range <= 20.0 {
        1.0
    } else if range <= 50.0 {
        2.0
    } else {
        5.0
    }
}

/// Index of the half-open bucket `x` falls into.
pub(crate) fn bucket_index(x: f64, step: f64) -> i64 {
    (x / step).floor() as i64
}

/// Inclusive-low / exclusive-high bucket index range covering
/// `[min, max]`. Always spans at least the bucket holding `max`, so
/// every value lands in an emitted bucket.
pub(crate) fn bucket_bounds(min: f64, max: f64, step: f64) -> (i64, i64) {
    let lo = bucket_index(min, step);
    let hi = ((max / step).ceil() as i64).max(bucket_index(max, step) + 1);
    (lo, hi)
}

/// Bucket label, one decimal when the step is sub-percent.
pub(crate) fn bucket_label(lo: f64, step: f64) -> String {
    // normalize -0.0 so labels never read "-0.0%"
    let lo = lo + 0.0;
    let hi = lo + step;
    if step < 1.0 {
        format!("{lo:.1}%~{hi:.1}%")
    } else {
        format!("{lo:.0}%~{hi:.0}%")
    }
}

/// Run the distribution query over `[start, end]`. `None` when either
/// snapshot is missing or nothing qualifies.
pub async fn compute_distribution(
    db: &Database,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Option<DistributionReport>> {
    let base_snapshot = db.earliest_snapshot_after(start).await?;
    if base_snapshot.is_empty() {
        warn!("No base snapshot at or after {start}");
        return Ok(None);
    }
    let actual_start = base_snapshot[0].bucket_start;

    let end_snapshot = db.latest_snapshot_before(end).await?;
    if end_snapshot.is_empty() {
        warn!("No end snapshot at or before {end}");
        return Ok(None);
    }
    let actual_end = end_snapshot[0].bucket_start;

    // base uses the opening price, end uses the close
    let base_map: HashMap<String, f64> = base_snapshot
        .iter()
        .map(|c| (c.symbol.clone(), c.open))
        .collect();
    let end_map: HashMap<String, f64> = end_snapshot
        .iter()
        .map(|c| (c.symbol.clone(), c.close))
        .collect();

    let max_map = db.max_high_by_symbol(actual_start, actual_end).await?;
    let min_map = db.min_low_by_symbol(actual_start, actual_end).await?;

    let changes = compute_changes(&end_map, &base_map, &max_map, &min_map);
    if changes.is_empty() {
        warn!("No symbol qualified for distribution over {actual_start}..{actual_end}");
        return Ok(None);
    }

    let report = assemble_distribution(changes, Utc::now().timestamp_millis());
    info!(
        "Distribution over {actual_start}..{actual_end}: {} coins, {} up / {} down",
        report.total_coins, report.up_count, report.down_count
    );
    Ok(Some(report))
}

/// Per-symbol changes for symbols present in both snapshots with
/// positive base and end prices.
pub(crate) fn compute_changes(
    end_map: &HashMap<String, f64>,
    base_map: &HashMap<String, f64>,
    max_map: &HashMap<String, f64>,
    min_map: &HashMap<String, f64>,
) -> Vec<CoinChange> {
    let mut changes = Vec::new();
    for (symbol, end_price) in end_map {
        let Some(base) = base_map.get(symbol) else {
            continue;
        };
        if *base <= 0.0 || *end_price <= 0.0 {
            continue;
        }

        let change_percent = (end_price - base) / base * 100.0;
        let max_change_percent = max_map
            .get(symbol)
            .filter(|p| **p > 0.0)
            .map(|p| (p - base) / base * 100.0)
            .unwrap_or(0.0);
        let min_change_percent = min_map
            .get(symbol)
            .filter(|p| **p > 0.0)
            .map(|p| (p - base) / base * 100.0)
            .unwrap_or(0.0);

        changes.push(CoinChange {
            symbol: symbol.clone(),
            change_percent,
            max_change_percent,
            min_change_percent,
        });
    }
    changes
}

/// Bucket the changes and build the ordered report.
pub(crate) fn assemble_distribution(changes: Vec<CoinChange>, timestamp: i64) -> DistributionReport {
    let min = changes
        .iter()
        .map(|c| c.change_percent)
        .fold(f64::INFINITY, f64::min);
    let max = changes
        .iter()
        .map(|c| c.change_percent)
        .fold(f64::NEG_INFINITY, f64::max);

    let step = bucket_step(max - min);
    let (lo_idx, hi_idx) = bucket_bounds(min, max, step);

    let up_count = changes.iter().filter(|c| c.change_percent > 0.0).count();
    let down_count = changes.iter().filter(|c| c.change_percent < 0.0).count();

    let mut grouped: Vec<Vec<CoinChange>> = vec![Vec::new(); (hi_idx - lo_idx) as usize];
    for change in &changes {
        let idx = bucket_index(change.change_percent, step) - lo_idx;
        if idx >= 0 && (idx as usize) < grouped.len() {
            grouped[idx as usize].push(change.clone());
        }
    }

    let distribution = grouped
        .into_iter()
        .enumerate()
        .map(|(offset, mut members)| {
            members.sort_by(|a, b| {
                b.change_percent
                    .partial_cmp(&a.change_percent)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let lo = (lo_idx + offset as i64) as f64 * step;
            DistributionBucket {
                range: bucket_label(lo, step),
                count: members.len(),
                coins: members.iter().map(|c| c.symbol.clone()).collect(),
                coin_details: members,
            }
        })
        .collect();

    let mut ranking = changes;
    ranking.sort_by(|a, b| {
        b.change_percent
            .partial_cmp(&a.change_percent)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    DistributionReport {
        timestamp,
        total_coins: ranking.len(),
        up_count,
        down_count,
        distribution,
        all_coins_ranking: ranking,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(symbol: &str, pct: f64) -> CoinChange {
        CoinChange {
            symbol: symbol.to_string(),
            change_percent: pct,
            max_change_percent: pct,
            min_change_percent: pct,
        }
    }

    #[test]
    fn test_bucket_step_thresholds() {
        assert_eq!(bucket_step(1.2), 0.2);
        assert_eq!(bucket_step(2.0), 0.2);
        assert_eq!(bucket_step(2.1), 0.5);
        assert_eq!(bucket_step(5.0), 0.5);
        assert_eq!(bucket_step(12.0), 1.0);
        assert_eq!(bucket_step(20.0), 1.0);
        assert_eq!(bucket_step(35.0), 2.0);
        assert_eq!(bucket_step(50.0), 2.0);
        assert_eq!(bucket_step(51.0), 5.0);
    }

    #[test]
    fn test_bucket_label_decimals() {
        assert_eq!(bucket_label(-0.4, 0.2), "-0.4%~-0.2%");
        assert_eq!(bucket_label(-0.2, 0.2), "-0.2%~0.0%");
        assert_eq!(bucket_label(2.0, 1.0), "2%~3%");
        assert_eq!(bucket_label(-5.0, 5.0), "-5%~0%");
    }

    #[test]
    fn test_adaptive_bucketing_small_range() {
        // range 1.2 <= 2 so the step is 0.2
        let changes = vec![
            change("AUSDT", -0.3),
            change("BUSDT", 0.1),
            change("CUSDT", 0.4),
            change("DUSDT", 0.9),
        ];
        let report = assemble_distribution(changes, 0);

        let occupied: Vec<(&str, usize)> = report
            .distribution
            .iter()
            .filter(|b| b.count > 0)
            .map(|b| (b.range.as_str(), b.count))
            .collect();
        assert_eq!(
            occupied,
            vec![
                ("-0.4%~-0.2%", 1),
                ("0.0%~0.2%", 1),
                ("0.4%~0.6%", 1),
                ("0.8%~1.0%", 1),
            ]
        );
        assert_eq!(report.up_count, 3);
        assert_eq!(report.down_count, 1);
        assert_eq!(report.total_coins, 4);
    }

    #[test]
    fn test_bucket_counts_cover_all_coins() {
        // max exactly on a bucket boundary must still land in a bucket
        let changes = vec![change("AUSDT", 0.0), change("BUSDT", 1.0)];
        let report = assemble_distribution(changes, 0);
        let total: usize = report.distribution.iter().map(|b| b.count).sum();
        assert_eq!(total, report.total_coins);
        assert_eq!(
            report.total_coins,
            report.up_count + report.down_count + 1 // one flat symbol
        );
    }

    #[test]
    fn test_degenerate_range_single_bucket() {
        // identical changes: a single bucket holds everything
        let changes = vec![change("AUSDT", 0.0), change("BUSDT", 0.0)];
        let report = assemble_distribution(changes, 0);
        let non_empty: Vec<_> = report.distribution.iter().filter(|b| b.count > 0).collect();
        assert_eq!(non_empty.len(), 1);
        assert_eq!(non_empty[0].count, 2);
    }

    #[test]
    fn test_ranking_sorted_descending() {
        let changes = vec![change("AUSDT", 1.0), change("BUSDT", 7.0), change("CUSDT", -2.0)];
        let report = assemble_distribution(changes, 0);
        let order: Vec<&str> = report
            .all_coins_ranking
            .iter()
            .map(|c| c.symbol.as_str())
            .collect();
        assert_eq!(order, vec!["BUSDT", "AUSDT", "CUSDT"]);
    }

    #[test]
    fn test_bucket_details_sorted_descending() {
        let changes = vec![change("AUSDT", 10.2), change("BUSDT", 10.7)];
        let report = assemble_distribution(changes, 0);
        for bucket in report.distribution.iter().filter(|b| b.count > 1) {
            for pair in bucket.coin_details.windows(2) {
                assert!(pair[0].change_percent >= pair[1].change_percent);
            }
        }
    }

    #[test]
    fn test_compute_changes_requires_both_snapshots() {
        let end: HashMap<String, f64> =
            [("AUSDT".to_string(), 102.0), ("BUSDT".to_string(), 55.0)]
                .into_iter()
                .collect();
        let base: HashMap<String, f64> = [("AUSDT".to_string(), 100.0)].into_iter().collect();
        let max: HashMap<String, f64> = [("AUSDT".to_string(), 104.0)].into_iter().collect();
        let min: HashMap<String, f64> = [("AUSDT".to_string(), 99.0)].into_iter().collect();

        let changes = compute_changes(&end, &base, &max, &min);
        assert_eq!(changes.len(), 1);
        let c = &changes[0];
        assert_eq!(c.symbol, "AUSDT");
        assert!((c.change_percent - 2.0).abs() < 1e-9);
        assert!((c.max_change_percent - 4.0).abs() < 1e-9);
        assert!((c.min_change_percent + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_changes_skips_non_positive_prices() {
        let end: HashMap<String, f64> = [("AUSDT".to_string(), 0.0)].into_iter().collect();
        let base: HashMap<String, f64> = [("AUSDT".to_string(), 100.0)].into_iter().collect();
        assert!(compute_changes(&end, &base, &HashMap::new(), &HashMap::new()).is_empty());
    }
}
