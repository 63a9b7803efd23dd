//! Configuration module for the market breadth service.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::errors::{MarketBreadthError, Result};
use std::collections::HashSet;
use std::env;
use std::time::Duration;

/// Main configuration struct for the service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Exchange REST API base URL
    pub exchange_base_url: String,

    /// Per-page throttle in paginated candle fetches
    pub request_interval: Duration,

    /// Total timeout applied to every outbound HTTP call
    pub http_timeout: Duration,

    /// How many days to fill when the candle table is empty
    pub backfill_days: i64,

    /// Semaphore permits for backfill workers
    pub backfill_concurrency: usize,

    /// Worker-pool bound for the live tick fan-out
    pub collect_concurrency: usize,

    /// Symbols removed from the active set (flagship assets)
    pub exclude_symbols: HashSet<String>,

    /// Quote-asset suffix an eligible symbol must carry
    pub quote_suffix: String,

    /// Query surface listen port
    pub http_port: u16,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Log level
    pub log_level: String,
}

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub pool_max: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let exclude_raw =
            env::var("EXCLUDE_SYMBOLS").unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string());
        let exclude_symbols = parse_symbol_list(&exclude_raw);

        Ok(Self {
            exchange_base_url: env::var("EXCHANGE_BASE_URL")
                .unwrap_or_else(|_| "https://fapi.binance.com".to_string()),

            request_interval: Duration::from_millis(
                env::var("REQUEST_INTERVAL_MS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300),
            ),

            http_timeout: Duration::from_secs(
                env::var("HTTP_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            ),

            backfill_days: env::var("BACKFILL_DAYS")
                .unwrap_or_else(|_| "7".to_string())
                .parse()
                .unwrap_or(7),

            backfill_concurrency: env::var("BACKFILL_CONCURRENCY")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),

            collect_concurrency: env::var("COLLECT_CONCURRENCY")
                .unwrap_or_else(|_| "12".to_string())
                .parse()
                .unwrap_or(12),

            exclude_symbols,

            quote_suffix: env::var("QUOTE_SUFFIX").unwrap_or_else(|_| "USDT".to_string()),

            http_port: env::var("HTTP_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|_| MarketBreadthError::config("Invalid HTTP_PORT"))?,

            database: DatabaseConfig {
                host: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env::var("DB_PORT")
                    .unwrap_or_else(|_| "5432".to_string())
                    .parse()
                    .map_err(|_| MarketBreadthError::config("Invalid DB_PORT"))?,
                name: env::var("DB_NAME").unwrap_or_else(|_| "market_breadth".to_string()),
                user: env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
                password: env::var("DB_PASSWORD")
                    .map_err(|_| MarketBreadthError::config("DB_PASSWORD is required"))?,
                pool_max: env::var("DB_POOL_MAX")
                    .unwrap_or_else(|_| "8".to_string())
                    .parse()
                    .unwrap_or(8),
            },

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

impl DatabaseConfig {
    /// Create a deadpool configuration.
    pub fn to_pool_config(&self) -> deadpool_postgres::Config {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.name.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg
    }
}

/// Parse a comma-separated symbol list into an uppercase set.
fn parse_symbol_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_symbol_list() {
        let set = parse_symbol_list("btcusdt, ETHUSDT ,,");
        assert_eq!(set.len(), 2);
        assert!(set.contains("BTCUSDT"));
        assert!(set.contains("ETHUSDT"));
    }

    #[test]
    fn test_parse_symbol_list_empty() {
        assert!(parse_symbol_list("").is_empty());
    }
}
