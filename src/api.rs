//! HTTP query surface.
//!
//! Serves the index, distribution, and uptrend queries plus the admin
//! operations. Every response is a JSON envelope: `success=true` with a
//! payload, or `success=false` with a message when inputs are valid but
//! data is missing. Malformed input gets a 400 naming the expected
//! format; nothing else leaks error internals to the client.

use crate::backfill::BackfillOrchestrator;
use crate::base_price::BasePriceRegistry;
use crate::binance::BinanceClient;
use crate::database::{Database, IndexRow};
use crate::distribution::compute_distribution;
use crate::errors::MarketBreadthError;
use crate::timeutil::{latest_closed_bucket, local_to_utc, parse_datetime, parse_zone, TimeSpec};
use crate::uptrend::{compute_uptrend, UptrendCache, UptrendParams};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

const DEFAULT_TIMEZONE: &str = "Asia/Shanghai";
const DEFAULT_LOOKBACK_HOURS: f64 = 168.0;

/// Shared handles behind every endpoint.
pub struct AppContext {
    pub db: Arc<Database>,
    pub client: Arc<BinanceClient>,
    pub registry: Arc<BasePriceRegistry>,
    pub uptrend_cache: Arc<UptrendCache>,
    pub backfill: Arc<BackfillOrchestrator>,
    pub backfill_in_progress: Arc<AtomicBool>,
    pub backfill_complete: Arc<AtomicBool>,
}

type ApiResponse = Result<(StatusCode, Json<Value>), MarketBreadthError>;

impl IntoResponse for MarketBreadthError {
    fn into_response(self) -> Response {
        let status = match &self {
            MarketBreadthError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {self}");
        }
        let body = Json(json!({"success": false, "message": self.to_string()}));
        (status, body).into_response()
    }
}

/// Build the service router.
pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/index/current", get(current_index))
        .route("/index/history", get(index_history))
        .route("/index/stats", get(index_stats))
        .route("/index/distribution", get(distribution))
        .route("/index/uptrend-distribution", get(uptrend_distribution))
        .route("/index/data", delete(delete_data_range))
        .route("/index/symbol/:symbol", delete(delete_symbol))
        .route("/index/repair", post(repair))
        .route("/index/status", get(service_status))
        .route("/index/base-prices", get(base_prices))
        .route("/index/admin/rate-limit/reset", post(reset_rate_limit))
        .with_state(ctx)
}

fn ok(body: Value) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(body))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "message": message.into()})),
    )
}

fn index_point(row: &IndexRow) -> Value {
    json!({
        "timestamp": row.bucket_start.timestamp_millis(),
        "indexValue": row.index_value,
        "totalVolume": row.total_volume,
        "coinCount": row.coin_count,
        "upCount": row.up_count,
        "downCount": row.down_count,
        "adr": row.adr,
    })
}

// ── index endpoints ──────────────────────────────────────────────────

async fn current_index(State(ctx): State<Arc<AppContext>>) -> ApiResponse {
    match ctx.db.latest_index_row().await? {
        Some(row) => Ok(ok(json!({"success": true, "data": index_point(&row)}))),
        None => Ok(ok(json!({"success": false, "message": "no index data yet"}))),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_hours")]
    hours: i64,
}

fn default_history_hours() -> i64 {
    168
}

async fn index_history(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResponse {
    if query.hours <= 0 {
        return Ok(bad_request("hours must be positive"));
    }
    let start = Utc::now() - Duration::hours(query.hours);
    let rows = ctx.db.index_rows_after(start).await?;
    let data: Vec<Value> = rows.iter().map(index_point).collect();
    Ok(ok(json!({"success": true, "count": data.len(), "data": data})))
}

async fn index_stats(State(ctx): State<Arc<AppContext>>) -> ApiResponse {
    let now = Utc::now();
    let rows = ctx.db.index_rows_after(now - Duration::hours(720)).await?;

    let mut stats = serde_json::Map::new();
    if let Some(latest) = ctx.db.latest_index_row().await? {
        stats.insert("current".into(), json!(latest.index_value));
        stats.insert("coinCount".into(), json!(latest.coin_count));
        stats.insert(
            "lastUpdate".into(),
            json!(latest.bucket_start.timestamp_millis()),
        );
    }

    for (hours, suffix) in [(24, "24h"), (72, "3d"), (168, "7d"), (720, "30d")] {
        if let Some((change, high, low)) = window_stats(&rows, now - Duration::hours(hours)) {
            stats.insert(format!("change{suffix}"), json!(change));
            stats.insert(format!("high{suffix}"), json!(high));
            stats.insert(format!("low{suffix}"), json!(low));
        }
    }

    Ok(ok(json!({"success": true, "stats": stats})))
}

/// first-to-last change plus extremes over the rows at or after
/// `start`. `None` with fewer than two points.
fn window_stats(rows: &[IndexRow], start: DateTime<Utc>) -> Option<(f64, f64, f64)> {
    let window: Vec<&IndexRow> = rows.iter().filter(|r| r.bucket_start >= start).collect();
    if window.len() < 2 {
        return None;
    }
    let change = window[window.len() - 1].index_value - window[0].index_value;
    let high = window
        .iter()
        .map(|r| r.index_value)
        .fold(f64::NEG_INFINITY, f64::max);
    let low = window
        .iter()
        .map(|r| r.index_value)
        .fold(f64::INFINITY, f64::min);
    Some((change, high, low))
}

// ── analytical queries ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RangeQuery {
    hours: Option<f64>,
    start: Option<String>,
    end: Option<String>,
    timezone: Option<String>,
}

/// Absolute range wins when both modes are supplied.
fn build_time_spec(query: &RangeQuery) -> Result<(TimeSpec, &'static str), MarketBreadthError> {
    match (&query.start, &query.end) {
        (Some(start), Some(end)) if !start.is_empty() && !end.is_empty() => {
            let zone = parse_zone(query.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE))?;
            Ok((
                TimeSpec::AbsoluteRange {
                    start: parse_datetime(start)?,
                    end: parse_datetime(end)?,
                    zone,
                },
                "timeRange",
            ))
        }
        _ => Ok((
            TimeSpec::LookbackHours(query.hours.unwrap_or(DEFAULT_LOOKBACK_HOURS)),
            "hours",
        )),
    }
}

/// Echo fields describing how a range-mode request was interpreted.
fn mode_echo(query: &RangeQuery, mode: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Value {
    match mode {
        "timeRange" => json!({
            "mode": mode,
            "inputTimezone": query.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE),
            "inputStart": query.start.as_deref(),
            "inputEnd": query.end.as_deref(),
            "utcStart": start.to_rfc3339(),
            "utcEnd": end.to_rfc3339(),
        }),
        _ => json!({
            "mode": mode,
            "hours": query.hours.unwrap_or(DEFAULT_LOOKBACK_HOURS),
        }),
    }
}

fn merge(base: Value, extra: Value) -> Value {
    match (base, extra) {
        (Value::Object(mut base), Value::Object(extra)) => {
            base.extend(extra);
            Value::Object(base)
        }
        (base, _) => base,
    }
}

async fn distribution(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<RangeQuery>,
) -> ApiResponse {
    let (spec, mode) = match build_time_spec(&query) {
        Ok(built) => built,
        Err(MarketBreadthError::InvalidInput(msg)) => return Ok(bad_request(msg)),
        Err(e) => return Err(e),
    };
    let (start, end) = match spec.resolve(Utc::now()) {
        Ok(range) => range,
        Err(MarketBreadthError::InvalidInput(msg)) => return Ok(bad_request(msg)),
        Err(e) => return Err(e),
    };

    match compute_distribution(&ctx.db, start, end).await? {
        Some(report) => Ok(ok(merge(
            json!({"success": true, "data": report}),
            mode_echo(&query, mode, start, end),
        ))),
        None => Ok(ok(json!({
            "success": false,
            "message": "no price data in the requested range",
        }))),
    }
}

#[derive(Debug, Deserialize)]
struct UptrendQuery {
    hours: Option<f64>,
    start: Option<String>,
    end: Option<String>,
    timezone: Option<String>,
    #[serde(rename = "keepRatio", default = "default_keep_ratio")]
    keep_ratio: f64,
    #[serde(rename = "noNewHighCandles", default = "default_no_new_high")]
    no_new_high_candles: i64,
    #[serde(rename = "minUptrend", default = "default_min_uptrend")]
    min_uptrend: f64,
}

impl UptrendQuery {
    fn range(&self) -> RangeQuery {
        RangeQuery {
            hours: self.hours,
            start: self.start.clone(),
            end: self.end.clone(),
            timezone: self.timezone.clone(),
        }
    }
}

fn default_keep_ratio() -> f64 {
    0.75
}

fn default_no_new_high() -> i64 {
    6
}

fn default_min_uptrend() -> f64 {
    4.0
}

async fn uptrend_distribution(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<UptrendQuery>,
) -> ApiResponse {
    if !(query.keep_ratio > 0.0 && query.keep_ratio <= 1.0) {
        return Ok(bad_request("keepRatio must be in (0, 1]"));
    }
    if query.no_new_high_candles < 1 {
        return Ok(bad_request("noNewHighCandles must be at least 1"));
    }
    if !query.min_uptrend.is_finite() || query.min_uptrend < 0.0 {
        return Ok(bad_request("minUptrend must be non-negative"));
    }

    let range_query = query.range();
    let (spec, mode) = match build_time_spec(&range_query) {
        Ok(built) => built,
        Err(MarketBreadthError::InvalidInput(msg)) => return Ok(bad_request(msg)),
        Err(e) => return Err(e),
    };
    let (start, end) = match spec.resolve(Utc::now()) {
        Ok(range) => range,
        Err(MarketBreadthError::InvalidInput(msg)) => return Ok(bad_request(msg)),
        Err(e) => return Err(e),
    };

    let params = UptrendParams {
        keep_ratio: query.keep_ratio,
        no_new_high_candles: query.no_new_high_candles as usize,
        min_uptrend: query.min_uptrend,
    };

    match compute_uptrend(&ctx.db, &ctx.uptrend_cache, start, end, &params).await? {
        Some(report) => Ok(ok(merge(
            merge(
                json!({"success": true, "data": &*report}),
                mode_echo(&range_query, mode, start, end),
            ),
            json!({
                "keepRatio": query.keep_ratio,
                "noNewHighCandles": query.no_new_high_candles,
                "minUptrend": query.min_uptrend,
            }),
        ))),
        None => Ok(ok(json!({
            "success": false,
            "message": "no qualifying waves in the requested range",
        }))),
    }
}

// ── admin endpoints ──────────────────────────────────────────────────

async fn delete_data_range(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<RangeQuery>,
) -> ApiResponse {
    let (Some(start_raw), Some(end_raw)) = (&query.start, &query.end) else {
        return Ok(bad_request("start and end are required"));
    };
    let spec = TimeSpec::AbsoluteRange {
        start: match parse_datetime(start_raw) {
            Ok(parsed) => parsed,
            Err(e) => return Ok(bad_request(e.to_string())),
        },
        end: match parse_datetime(end_raw) {
            Ok(parsed) => parsed,
            Err(e) => return Ok(bad_request(e.to_string())),
        },
        zone: match parse_zone(query.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE)) {
            Ok(zone) => zone,
            Err(e) => return Ok(bad_request(e.to_string())),
        },
    };
    let (start, end) = match spec.resolve(Utc::now()) {
        Ok(range) => range,
        Err(MarketBreadthError::InvalidInput(msg)) => return Ok(bad_request(msg)),
        Err(e) => return Err(e),
    };

    let deleted_index = ctx.db.delete_index_rows_in_range(start, end).await?;
    let deleted_candles = ctx.db.delete_candles_in_range(start, end).await?;

    Ok(ok(json!({
        "success": true,
        "deletedIndexCount": deleted_index,
        "deletedCandleCount": deleted_candles,
        "utcStart": start.to_rfc3339(),
        "utcEnd": end.to_rfc3339(),
    })))
}

async fn delete_symbol(
    State(ctx): State<Arc<AppContext>>,
    Path(symbol): Path<String>,
) -> ApiResponse {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Ok(bad_request("symbol must not be empty"));
    }

    let deleted_candles = ctx.db.delete_candles_for_symbol(&symbol).await?;
    let deleted_base = ctx.registry.remove(&symbol).await?;

    Ok(ok(json!({
        "success": true,
        "symbol": symbol,
        "deletedPriceCount": deleted_candles,
        "deletedBasePrice": deleted_base,
    })))
}

#[derive(Debug, Deserialize)]
struct RepairQuery {
    days: Option<i64>,
    start: Option<String>,
    end: Option<String>,
    timezone: Option<String>,
}

async fn repair(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<RepairQuery>,
) -> ApiResponse {
    let now = Utc::now();
    let latest_closed = latest_closed_bucket(now);

    let (start, end) = if let Some(start_raw) = query.start.as_deref().filter(|s| !s.is_empty()) {
        let zone = match parse_zone(query.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE)) {
            Ok(zone) => zone,
            Err(e) => return Ok(bad_request(e.to_string())),
        };
        let start = match parse_datetime(start_raw).and_then(|t| local_to_utc(t, zone)) {
            Ok(t) => t,
            Err(e) => return Ok(bad_request(e.to_string())),
        };
        let end = match query.end.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => match parse_datetime(raw).and_then(|t| local_to_utc(t, zone)) {
                Ok(t) => t,
                Err(e) => return Ok(bad_request(e.to_string())),
            },
            None => latest_closed,
        };
        if start > end {
            return Ok(bad_request("start must not be after end"));
        }
        (start, end)
    } else {
        let days = query.days.unwrap_or(7);
        if !(1..=60).contains(&days) {
            return Ok(bad_request("days must be between 1 and 60"));
        }
        (now - Duration::days(days), latest_closed)
    };

    let outcome = ctx.backfill.repair_missing(start, end).await?;
    Ok(ok(merge(
        json!({"success": true, "timeRange": format!("{start} ~ {end}")}),
        serde_json::to_value(&outcome)?,
    )))
}

async fn service_status(State(ctx): State<Arc<AppContext>>) -> ApiResponse {
    let latest = ctx.db.latest_index_row().await?;
    Ok(ok(json!({
        "success": true,
        "backfillInProgress": ctx.backfill_in_progress.load(Ordering::SeqCst),
        "backfillComplete": ctx.backfill_complete.load(Ordering::SeqCst),
        "rateLimited": ctx.client.is_rate_limited(),
        "rateLimitReason": ctx.client.rate_limit_reason(),
        "basePriceCount": ctx.registry.len(),
        "latestIndex": latest.as_ref().map(index_point),
    })))
}

async fn base_prices(State(ctx): State<Arc<AppContext>>) -> ApiResponse {
    let rows = ctx.db.load_base_prices().await?;
    let data: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "symbol": row.symbol,
                "price": row.price,
                "createdAt": row.created_at.timestamp_millis(),
            })
        })
        .collect();
    Ok(ok(json!({"success": true, "count": data.len(), "data": data})))
}

async fn reset_rate_limit(State(ctx): State<Arc<AppContext>>) -> ApiResponse {
    ctx.client.reset_rate_limit();
    Ok(ok(json!({
        "success": true,
        "message": "rate-limit latch cleared",
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(minute_offset: i64, value: f64) -> IndexRow {
        IndexRow {
            bucket_start: Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap()
                + Duration::minutes(minute_offset),
            index_value: value,
            total_volume: 0.0,
            coin_count: 10,
            up_count: 5,
            down_count: 5,
            adr: 1.0,
        }
    }

    #[test]
    fn test_window_stats() {
        let rows = vec![row(0, 1.0), row(5, 3.5), row(10, 2.0)];
        let start = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        let (change, high, low) = window_stats(&rows, start).unwrap();
        assert_eq!(change, 1.0);
        assert_eq!(high, 3.5);
        assert_eq!(low, 1.0);
    }

    #[test]
    fn test_window_stats_requires_two_points() {
        let rows = vec![row(0, 1.0)];
        let start = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        assert!(window_stats(&rows, start).is_none());
        // window start excludes everything
        let rows = vec![row(0, 1.0), row(5, 2.0)];
        let late = Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap();
        assert!(window_stats(&rows, late).is_none());
    }

    #[test]
    fn test_build_time_spec_prefers_absolute_range() {
        let query = RangeQuery {
            hours: Some(24.0),
            start: Some("2025-01-02 10:00".to_string()),
            end: Some("2025-01-02 12:00".to_string()),
            timezone: None,
        };
        let (spec, mode) = build_time_spec(&query).unwrap();
        assert_eq!(mode, "timeRange");
        assert!(matches!(spec, TimeSpec::AbsoluteRange { .. }));
    }

    #[test]
    fn test_build_time_spec_defaults_to_week_lookback() {
        let query = RangeQuery {
            hours: None,
            start: None,
            end: None,
            timezone: None,
        };
        let (spec, mode) = build_time_spec(&query).unwrap();
        assert_eq!(mode, "hours");
        match spec {
            TimeSpec::LookbackHours(h) => assert_eq!(h, 168.0),
            _ => panic!("expected lookback"),
        }
    }

    #[test]
    fn test_build_time_spec_rejects_bad_format() {
        let query = RangeQuery {
            hours: None,
            start: Some("02/01/2025".to_string()),
            end: Some("2025-01-02 12:00".to_string()),
            timezone: None,
        };
        assert!(build_time_spec(&query).is_err());
    }
}
