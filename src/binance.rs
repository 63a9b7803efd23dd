//! Binance USDT-margined futures REST client.
//!
//! This module handles all outbound exchange traffic:
//! - active symbol discovery via /fapi/v1/ticker/24hr
//! - five-minute candle fetches via /fapi/v1/klines, single page and paginated
//!
//! A process-wide rate-limit latch guards every call: any 429/418
//! response engages it, after which all calls short-circuit without
//! network I/O until an operator resets it.

use crate::config::Config;
use crate::errors::{MarketBreadthError, Result};
use crate::timeutil::{latest_closed_bucket, BUCKET_MS};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One five-minute candle for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Trading pair, uppercase, e.g. SOLUSDT
    pub symbol: String,
    /// Opening instant of the five-minute bucket (UTC aligned)
    pub bucket_start: DateTime<Utc>,
    /// Opening price
    pub open: f64,
    /// Highest price
    pub high: f64,
    /// Lowest price
    pub low: f64,
    /// Closing price
    pub close: f64,
    /// Quote-asset (USDT) turnover of the bucket
    pub quote_volume: f64,
}

/// One row of the 24h ticker response; only the symbol is consumed.
#[derive(Debug, Deserialize)]
struct Ticker24h {
    symbol: String,
}

/// REST client with a one-way rate-limit latch.
pub struct BinanceClient {
    /// REST base URL
    base_url: String,
    /// Shared HTTP client with a bounded total timeout
    http: reqwest::Client,
    /// Per-page throttle in paginated fetches
    request_interval: Duration,
    /// Quote suffix an eligible symbol must end with
    quote_suffix: String,
    /// Symbols removed from the active set
    exclude_symbols: HashSet<String>,
    /// One-way latch: set on 429/418, cleared only by an operator
    rate_limited: AtomicBool,
    /// Human-readable latch reason for the status endpoint
    rate_limit_reason: RwLock<Option<String>>,
}

impl BinanceClient {
    /// Create a new client from the service configuration.
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;

        Ok(Self {
            base_url: config.exchange_base_url.trim_end_matches('/').to_string(),
            http,
            request_interval: config.request_interval,
            quote_suffix: config.quote_suffix.clone(),
            exclude_symbols: config.exclude_symbols.clone(),
            rate_limited: AtomicBool::new(false),
            rate_limit_reason: RwLock::new(None),
        })
    }

    /// Check whether the rate-limit latch is engaged.
    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited.load(Ordering::SeqCst)
    }

    /// The reason the latch engaged, if it did.
    pub fn rate_limit_reason(&self) -> Option<String> {
        self.rate_limit_reason.read().clone()
    }

    /// Operator reset of the latch. There is no automatic recovery.
    pub fn reset_rate_limit(&self) {
        self.rate_limited.store(false, Ordering::SeqCst);
        *self.rate_limit_reason.write() = None;
        info!("Rate-limit latch cleared, exchange calls resumed");
    }

    /// The configured per-page throttle.
    pub fn request_interval(&self) -> Duration {
        self.request_interval
    }

    /// Engage the latch. One-way: every subsequent call short-circuits.
    fn trip_rate_limit(&self, status: u16, context: &str) {
        self.rate_limited.store(true, Ordering::SeqCst);
        let reason = format!("status={status}, context={context}, at={}", Utc::now());
        *self.rate_limit_reason.write() = Some(reason.clone());
        error!("Exchange returned {status} - rate-limit latch engaged, all calls stopped");
        error!("Latch reason: {reason}; operator reset required");
    }

    /// Whether a symbol belongs to the index universe.
    fn accepts_symbol(&self, symbol: &str) -> bool {
        symbol.ends_with(&self.quote_suffix) && !self.exclude_symbols.contains(symbol)
    }

    /// Fetch the current active symbol list, filtered to the quote
    /// suffix minus the exclusion set. Returns an empty list when the
    /// latch is engaged.
    pub async fn list_active_symbols(&self) -> Result<Vec<String>> {
        if self.is_rate_limited() {
            return Ok(Vec::new());
        }

        let url = format!("{}/fapi/v1/ticker/24hr", self.base_url);
        let response = self.http.get(&url).send().await?;
        let status = response.status().as_u16();

        if status == 429 || status == 418 {
            self.trip_rate_limit(status, "list_active_symbols");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(MarketBreadthError::exchange(format!(
                "ticker endpoint returned status {status}"
            )));
        }

        let tickers: Vec<Ticker24h> = response.json().await?;
        let symbols: Vec<String> = tickers
            .into_iter()
            .map(|t| t.symbol)
            .filter(|s| self.accepts_symbol(s))
            .collect();

        info!(
            "Discovered {} active symbols (excluded {:?})",
            symbols.len(),
            self.exclude_symbols
        );
        Ok(symbols)
    }

    /// Fetch one page of five-minute candles for a symbol.
    /// Returns an empty batch when the latch is engaged.
    pub async fn fetch_candle_range(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        if self.is_rate_limited() {
            return Ok(Vec::new());
        }

        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.base_url, symbol, interval, start_ms, end_ms, limit
        );
        let response = self.http.get(&url).send().await?;
        let status = response.status().as_u16();

        if status == 429 || status == 418 {
            self.trip_rate_limit(status, symbol);
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(MarketBreadthError::exchange(format!(
                "kline fetch for {symbol} returned status {status}"
            )));
        }

        let rows: Vec<Vec<serde_json::Value>> = response.json().await?;
        Ok(parse_kline_rows(symbol, &rows))
    }

    /// Fetch a full window of candles page by page, advancing each page
    /// to one bucket past the previous last candle. Sleeps the request
    /// interval between pages and stops on the latch, an empty batch,
    /// or window exhaustion.
    pub async fn fetch_candle_range_paged(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
        batch_limit: usize,
    ) -> Result<Vec<Candle>> {
        let mut all = Vec::new();
        let mut current_start = start_ms;

        while current_start < end_ms {
            if self.is_rate_limited() {
                warn!("Rate-limit latch engaged, aborting paged fetch for {symbol}");
                break;
            }

            let batch = self
                .fetch_candle_range(symbol, interval, current_start, end_ms, batch_limit)
                .await?;
            if batch.is_empty() {
                break;
            }

            let last_ms = batch
                .last()
                .map(|c| c.bucket_start.timestamp_millis())
                .unwrap_or(end_ms);
            all.extend(batch);
            current_start = last_ms + BUCKET_MS;

            tokio::time::sleep(self.request_interval).await;
        }

        Ok(all)
    }

    /// Fetch the most recent fully closed candle for a symbol.
    ///
    /// The exchange may include the just-opening bucket in its latest
    /// klines, so two are requested and the newest one at or before the
    /// latest closed bucket is returned. `None` when the latch is
    /// engaged or no closed candle is available.
    pub async fn fetch_latest_closed_candle(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Candle>> {
        if self.is_rate_limited() {
            return Ok(None);
        }

        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval=5m&limit=2",
            self.base_url, symbol
        );
        let response = self.http.get(&url).send().await?;
        let status = response.status().as_u16();

        if status == 429 || status == 418 {
            self.trip_rate_limit(status, symbol);
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(MarketBreadthError::exchange(format!(
                "latest kline fetch for {symbol} returned status {status}"
            )));
        }

        let rows: Vec<Vec<serde_json::Value>> = response.json().await?;
        let candles = parse_kline_rows(symbol, &rows);
        Ok(select_latest_closed(candles, now))
    }
}

/// Keep the newest candle whose bucket is already closed, discarding
/// any just-opening bucket the exchange may have included.
fn select_latest_closed(candles: Vec<Candle>, now: DateTime<Utc>) -> Option<Candle> {
    let cutoff = latest_closed_bucket(now);
    candles
        .into_iter()
        .filter(|c| c.bucket_start <= cutoff)
        .max_by_key(|c| c.bucket_start)
}

/// Parse the positional kline arrays of the exchange response.
/// Positions consumed: 0 openTime(ms), 1 open, 2 high, 3 low, 4 close,
/// 7 quoteVolume. Malformed rows are dropped with a log line.
fn parse_kline_rows(symbol: &str, rows: &[Vec<serde_json::Value>]) -> Vec<Candle> {
    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        match parse_kline_row(symbol, row) {
            Some(candle) => candles.push(candle),
            None => debug!("Dropped malformed kline row for {symbol}"),
        }
    }
    candles
}

/// Parse one kline row; `None` if any consumed field is missing or
/// unparseable.
fn parse_kline_row(symbol: &str, row: &[serde_json::Value]) -> Option<Candle> {
    let open_time = row.first()?.as_i64()?;
    let open = numeric_field(row.get(1)?)?;
    let high = numeric_field(row.get(2)?)?;
    let low = numeric_field(row.get(3)?)?;
    let close = numeric_field(row.get(4)?)?;
    let quote_volume = numeric_field(row.get(7)?)?;
    let bucket_start = DateTime::from_timestamp_millis(open_time)?;

    Some(Candle {
        symbol: symbol.to_string(),
        bucket_start,
        open,
        high,
        low,
        close,
        quote_volume,
    })
}

/// The exchange serializes prices as JSON strings and times as numbers;
/// accept both.
fn numeric_field(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn kline_json(open_time: i64, close: &str) -> Vec<serde_json::Value> {
        serde_json::from_str(&format!(
            r#"[{open_time}, "100.0", "105.0", "99.0", "{close}", "1234.5", {end}, "98765.4", 100, "600.0", "49000.0", "0"]"#,
            end = open_time + 299_999
        ))
        .unwrap()
    }

    #[test]
    fn test_parse_kline_row() {
        let row = kline_json(1735800000000, "102.5");
        let candle = parse_kline_row("AAAUSDT", &row).unwrap();
        assert_eq!(candle.symbol, "AAAUSDT");
        assert_eq!(candle.bucket_start.timestamp_millis(), 1735800000000);
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 105.0);
        assert_eq!(candle.low, 99.0);
        assert_eq!(candle.close, 102.5);
        assert_eq!(candle.quote_volume, 98765.4);
    }

    #[test]
    fn test_parse_kline_row_rejects_short_rows() {
        let row: Vec<serde_json::Value> = serde_json::from_str("[1735800000000]").unwrap();
        assert!(parse_kline_row("AAAUSDT", &row).is_none());
    }

    #[test]
    fn test_numeric_field_accepts_strings_and_numbers() {
        assert_eq!(
            numeric_field(&serde_json::json!("3.25")),
            Some(3.25)
        );
        assert_eq!(numeric_field(&serde_json::json!(3.25)), Some(3.25));
        assert_eq!(numeric_field(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_select_latest_closed_discards_open_bucket() {
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 9, 5, 10).unwrap();
        // closed bucket 09:00 plus the just-opening 09:05 bucket
        let closed = parse_kline_row(
            "AAAUSDT",
            &kline_json(
                Utc.with_ymd_and_hms(2025, 1, 2, 9, 0, 0)
                    .unwrap()
                    .timestamp_millis(),
                "101.0",
            ),
        )
        .unwrap();
        let opening = parse_kline_row(
            "AAAUSDT",
            &kline_json(
                Utc.with_ymd_and_hms(2025, 1, 2, 9, 5, 0)
                    .unwrap()
                    .timestamp_millis(),
                "102.0",
            ),
        )
        .unwrap();

        let picked = select_latest_closed(vec![closed.clone(), opening], now).unwrap();
        assert_eq!(picked.bucket_start, closed.bucket_start);
        assert_eq!(picked.close, 101.0);
    }

    #[test]
    fn test_symbol_filter() {
        let client = BinanceClient {
            base_url: "https://fapi.binance.com".to_string(),
            http: reqwest::Client::new(),
            request_interval: Duration::from_millis(0),
            quote_suffix: "USDT".to_string(),
            exclude_symbols: ["BTCUSDT".to_string(), "ETHUSDT".to_string()]
                .into_iter()
                .collect(),
            rate_limited: AtomicBool::new(false),
            rate_limit_reason: RwLock::new(None),
        };

        assert!(client.accepts_symbol("SOLUSDT"));
        assert!(!client.accepts_symbol("BTCUSDT"));
        assert!(!client.accepts_symbol("ETHUSDT"));
        assert!(!client.accepts_symbol("SOLBUSD"));
    }

    #[test]
    fn test_select_latest_closed_empty_when_all_open() {
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 9, 5, 10).unwrap();
        let opening = parse_kline_row(
            "AAAUSDT",
            &kline_json(
                Utc.with_ymd_and_hms(2025, 1, 2, 9, 5, 0)
                    .unwrap()
                    .timestamp_millis(),
                "102.0",
            ),
        )
        .unwrap();
        assert!(select_latest_closed(vec![opening], now).is_none());
    }
}
