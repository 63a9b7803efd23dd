//! Base-price registry.
//!
//! Owns the per-symbol reference price against which every percent
//! change is computed. A base is adopted once, at the symbol's first
//! observation with a positive close (or the first backfilled open),
//! and persists until the symbol leaves the exchange's active list, at
//! which point it is revoked so a re-listing re-initializes at the
//! then-current price. Candle history survives revocation.
//!
//! The registry is the only writer of the base-price table; all other
//! components read through it.

use crate::database::Database;
use crate::errors::Result;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

pub struct BasePriceRegistry {
    db: Arc<Database>,
    prices: RwLock<HashMap<String, f64>>,
}

impl BasePriceRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Populate the in-memory map from the durable store.
    pub async fn load(&self) -> Result<usize> {
        let rows = self.db.load_base_prices().await?;
        let mut map = self.prices.write();
        map.clear();
        for row in rows {
            map.insert(row.symbol, row.price);
        }
        Ok(map.len())
    }

    /// The base price for a symbol, if one is held.
    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.prices.read().get(symbol).copied()
    }

    /// A consistent copy of the whole map.
    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.prices.read().clone()
    }

    /// Number of symbols currently holding a base.
    pub fn len(&self) -> usize {
        self.prices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.read().is_empty()
    }

    /// Adopt `price` as the symbol's base iff it holds none. Returns
    /// whether adoption happened. The durable row conflicts on symbol
    /// and does nothing, so a concurrent adopter cannot overwrite.
    pub async fn adopt_if_missing(&self, symbol: &str, price: f64) -> Result<bool> {
        if price <= 0.0 {
            return Ok(false);
        }
        {
            let mut map = self.prices.write();
            if map.contains_key(symbol) {
                return Ok(false);
            }
            map.insert(symbol.to_string(), price);
        }
        if let Err(e) = self
            .db
            .save_base_prices(&[(symbol.to_string(), price)])
            .await
        {
            self.prices.write().remove(symbol);
            return Err(e);
        }
        info!("Adopted base price for new symbol {symbol}: {price}");
        Ok(true)
    }

    /// Merge backfill-collected candidates: any candidate symbol
    /// without a base adopts its candidate price; held bases are left
    /// untouched. Returns the symbols adopted.
    pub async fn adopt_missing(&self, candidates: &HashMap<String, f64>) -> Result<Vec<String>> {
        let missing: Vec<(String, f64)> = {
            let map = self.prices.read();
            candidates
                .iter()
                .filter(|(symbol, price)| **price > 0.0 && !map.contains_key(*symbol))
                .map(|(symbol, price)| (symbol.clone(), *price))
                .collect()
        };
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        self.db.save_base_prices(&missing).await?;
        let mut map = self.prices.write();
        let mut adopted = Vec::with_capacity(missing.len());
        for (symbol, price) in missing {
            map.entry(symbol.clone()).or_insert(price);
            adopted.push(symbol);
        }
        info!("Adopted {} new base prices from backfill", adopted.len());
        Ok(adopted)
    }

    /// Revoke the base of every held symbol absent from `active`.
    /// Candle history is untouched; a later re-listing re-adopts at the
    /// then-current close. Returns the revoked symbols.
    pub async fn reconcile_with_active(&self, active: &HashSet<String>) -> Result<Vec<String>> {
        if active.is_empty() {
            return Ok(Vec::new());
        }

        let stored: HashSet<String> = self.prices.read().keys().cloned().collect();
        let delisted = delisted_symbols(&stored, active);
        if delisted.is_empty() {
            return Ok(Vec::new());
        }

        warn!(
            "Detected {} delisted symbols, revoking base prices (history retained): {:?}",
            delisted.len(),
            delisted
        );
        for symbol in &delisted {
            self.db.delete_base_price(symbol).await?;
            self.prices.write().remove(symbol);
        }
        Ok(delisted)
    }

    /// Admin purge: drop the base from memory and store.
    pub async fn remove(&self, symbol: &str) -> Result<bool> {
        let existed_in_db = self.db.delete_base_price(symbol).await?;
        let existed_in_memory = self.prices.write().remove(symbol).is_some();
        Ok(existed_in_db || existed_in_memory)
    }
}

/// Symbols holding a base that the exchange no longer lists.
fn delisted_symbols(stored: &HashSet<String>, active: &HashSet<String>) -> Vec<String> {
    let mut delisted: Vec<String> = stored.difference(active).cloned().collect();
    delisted.sort();
    delisted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(symbols: &[&str]) -> HashSet<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_delisted_symbols() {
        let stored = set(&["AAAUSDT", "BBBUSDT", "CCCUSDT"]);
        let active = set(&["AAAUSDT", "CCCUSDT", "DDDUSDT"]);
        assert_eq!(delisted_symbols(&stored, &active), vec!["BBBUSDT"]);
    }

    #[test]
    fn test_delisted_symbols_none() {
        let stored = set(&["AAAUSDT"]);
        let active = set(&["AAAUSDT", "BBBUSDT"]);
        assert!(delisted_symbols(&stored, &active).is_empty());
    }
}
