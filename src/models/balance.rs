//! Canonical per-asset balance view.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::Serialize;

/// Aggregated holdings of one canonical asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssetBalance {
    pub total: Decimal,

    /// Raw wallet keys and amounts that make up `total`, sorted by key
    pub sources: Vec<(String, Decimal)>,
}

/// Canonical asset to aggregated balance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BalanceView {
    assets: BTreeMap<String, AssetBalance>,
}

impl BalanceView {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, canonical: String, raw_key: String, amount: Decimal) {
        let entry = self.assets.entry(canonical).or_default();
        entry.total += amount;
        let pos = entry
            .sources
            .binary_search_by(|(k, _)| k.as_str().cmp(raw_key.as_str()))
            .unwrap_or_else(|p| p);
        entry.sources.insert(pos, (raw_key, amount));
    }

    pub fn get(&self, asset: &str) -> Option<&AssetBalance> {
        self.assets.get(asset)
    }

    /// Total for `asset`, zero when absent.
    pub fn total(&self, asset: &str) -> Decimal {
        self.assets
            .get(asset)
            .map(|b| b.total)
            .unwrap_or(Decimal::ZERO)
    }

    /// Reserve `amount` of `asset` so later checks in the same tick see less.
    pub fn commit(&mut self, asset: &str, amount: Decimal) {
        if let Some(balance) = self.assets.get_mut(asset) {
            balance.total -= amount;
        }
    }

    pub fn assets(&self) -> impl Iterator<Item = (&String, &AssetBalance)> {
        self.assets.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}
