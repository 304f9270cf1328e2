//! Cleaning balance maps keyed by asset
//!
//! [`BalanceMap`] is the arithmetic workhorse behind reserved volumes:
//! a pointwise `Asset → Decimal` map that drops zero-valued entries on
//! every combination, so key iteration stays bounded by the assets that
//! actually carry value. Reads default missing keys to zero, which makes
//! the dropping transparent to callers.
//!
//! Authoritative spendable-balance snapshots use the raw
//! [`BalanceSnapshot`] alias instead: there an explicit zero entry means
//! "this asset is known to be empty", which must not be erased.

use crate::asset::Asset;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Raw per-asset snapshot as pushed by the chain watcher. Zero entries
/// are meaningful here (an asset can be known-empty).
pub type BalanceSnapshot = BTreeMap<Asset, Decimal>;

/// Pointwise asset/amount map with cleaning semantics: no stored entry
/// is ever zero, and no stored entry is negative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BalanceMap(BTreeMap<Asset, Decimal>);

impl BalanceMap {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build from entries, skipping zeros and merging duplicate assets.
    ///
    /// # Panics
    /// Panics if a merged value ends up negative.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Asset, Decimal)>,
    {
        let mut map = Self::new();
        for (asset, value) in entries {
            map.set(asset, map.get(&asset) + value);
        }
        map
    }

    /// Value for an asset, defaulting to zero.
    pub fn get(&self, asset: &Asset) -> Decimal {
        self.0.get(asset).copied().unwrap_or(Decimal::ZERO)
    }

    /// Set an asset's value, dropping the entry when it reaches zero.
    ///
    /// # Panics
    /// Panics if the value is negative.
    fn set(&mut self, asset: Asset, value: Decimal) {
        assert!(
            value >= Decimal::ZERO,
            "balance map entry for {} went negative: {}",
            asset,
            value
        );
        if value == Decimal::ZERO {
            self.0.remove(&asset);
        } else {
            self.0.insert(asset, value);
        }
    }

    /// Pointwise addition.
    pub fn add(&mut self, other: &BalanceMap) {
        for (asset, value) in &other.0 {
            self.set(*asset, self.get(asset) + *value);
        }
    }

    /// Pointwise subtraction; None if any resulting value would be
    /// negative (the receiver is left untouched in that case).
    pub fn checked_sub(&self, other: &BalanceMap) -> Option<BalanceMap> {
        let mut result = self.clone();
        for (asset, value) in &other.0 {
            let remaining = result.get(asset) - *value;
            if remaining < Decimal::ZERO {
                return None;
            }
            result.set(*asset, remaining);
        }
        Some(result)
    }

    /// Pointwise subtraction clamped at zero.
    pub fn saturating_sub(&self, other: &BalanceMap) -> BalanceMap {
        let mut result = self.clone();
        for (asset, value) in &other.0 {
            result.set(*asset, (result.get(asset) - *value).max(Decimal::ZERO));
        }
        result
    }

    /// Entries whose value here strictly exceeds the other map's value,
    /// carrying the excess. `a.positive_diff(&b)` is `max(a − b, 0)`
    /// pointwise, cleaned.
    pub fn positive_diff(&self, other: &BalanceMap) -> BalanceMap {
        let mut result = BalanceMap::new();
        for (asset, value) in &self.0 {
            let excess = *value - other.get(asset);
            if excess > Decimal::ZERO {
                result.set(*asset, excess);
            }
        }
        result
    }

    /// Intersection with an asset set.
    pub fn restrict(&self, keys: &BTreeSet<Asset>) -> BalanceMap {
        Self(
            self.0
                .iter()
                .filter(|(asset, _)| keys.contains(asset))
                .map(|(a, v)| (*a, *v))
                .collect(),
        )
    }

    /// Whether `required` is covered pointwise by this map.
    pub fn covers(&self, required: &BalanceMap) -> bool {
        required
            .0
            .iter()
            .all(|(asset, value)| self.get(asset) >= *value)
    }

    pub fn assets(&self) -> impl Iterator<Item = &Asset> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Asset, &Decimal)> {
        self.0.iter()
    }

    pub fn contains(&self, asset: &Asset) -> bool {
        self.0.contains_key(asset)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(Asset, Decimal)> for BalanceMap {
    fn from_iter<I: IntoIterator<Item = (Asset, Decimal)>>(iter: I) -> Self {
        Self::from_entries(iter)
    }
}
