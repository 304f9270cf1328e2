//! Asset tags and trading pairs
//!
//! An asset is either the chain's native coin or an issued token keyed
//! by an opaque [`AssetId`]. Assets serialize as strings (`"NATIVE"` or
//! the issued id) so they can key JSON maps.

use crate::ids::AssetId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Tagged asset identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Asset {
    /// The chain's native coin.
    Native,
    /// An issued token.
    Issued(AssetId),
}

impl Asset {
    pub fn is_native(&self) -> bool {
        matches!(self, Asset::Native)
    }

    /// Convenience constructor for issued assets.
    pub fn issued(id: AssetId) -> Self {
        Asset::Issued(id)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Native => write!(f, "NATIVE"),
            Asset::Issued(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for Asset {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "NATIVE" {
            Ok(Asset::Native)
        } else {
            Ok(Asset::Issued(AssetId::from_uuid(Uuid::parse_str(s)?)))
        }
    }
}

// String form so assets can key JSON maps.
impl Serialize for Asset {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Asset {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Asset::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Trading pair: the asset being traded and the asset it is priced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetPair {
    pub amount_asset: Asset,
    pub price_asset: Asset,
}

impl AssetPair {
    /// Create a new pair
    ///
    /// # Panics
    /// Panics if both sides name the same asset
    pub fn new(amount_asset: Asset, price_asset: Asset) -> Self {
        assert!(
            amount_asset != price_asset,
            "AssetPair sides must be distinct"
        );
        Self {
            amount_asset,
            price_asset,
        }
    }

    /// Both assets of the pair, amount side first.
    pub fn assets(&self) -> [Asset; 2] {
        [self.amount_asset, self.price_asset]
    }

    pub fn contains(&self, asset: &Asset) -> bool {
        self.amount_asset == *asset || self.price_asset == *asset
    }
}

impl fmt::Display for AssetPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.amount_asset, self.price_asset)
    }
}
