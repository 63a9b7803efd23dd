//! Market Breadth Index Library
//!
//! Components for computing and serving a market-breadth index over the
//! USDT-margined perpetual futures universe: candle ingestion, base
//! price lifecycle, per-bucket aggregation, historical backfill, and
//! the distribution / uptrend analytical queries.

pub mod aggregator;
pub mod api;
pub mod backfill;
pub mod base_price;
pub mod binance;
pub mod collector;
pub mod config;
pub mod database;
pub mod distribution;
pub mod errors;
pub mod timeutil;
pub mod uptrend;

pub use aggregator::{aggregate_bucket, BucketAggregate};
pub use api::AppContext;
pub use backfill::BackfillOrchestrator;
pub use base_price::BasePriceRegistry;
pub use binance::{BinanceClient, Candle};
pub use collector::LiveCollector;
pub use config::Config;
pub use database::{Database, IndexRow};
pub use errors::{MarketBreadthError, Result};
pub use uptrend::{UptrendCache, UptrendParams};
