//! Opaque identifiers
//!
//! Every entity the matcher tracks — accounts, orders, issued assets —
//! is keyed by a fixed-width binary id backed by UUID v7. The embedded
//! timestamp makes freshly minted ids chronologically sortable, which
//! order-history queries lean on for cheap tiebreaking.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declares a v7-backed id newtype with the accessors all ids share.
/// Serde sees the bare UUID, not a wrapper object.
macro_rules! uuid_id {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Mint a fresh, time-ordered id.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an id received from outside.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Borrow the raw UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

uuid_id! {
    /// Trading account identifier: the address orders are signed by and
    /// routed on.
    Address
}

uuid_id! {
    /// Order identifier. Sorting minted ids follows submission time, so
    /// they double as a tiebreaker after the order timestamp.
    OrderId
}

uuid_id! {
    /// Identifier of an issued (non-native) asset.
    AssetId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_ids_are_distinct() {
        assert_ne!(Address::new(), Address::new());
        assert_ne!(OrderId::new(), OrderId::new());
        assert_ne!(AssetId::new(), AssetId::new());
    }

    #[test]
    fn test_minted_order_ids_come_out_sorted() {
        let ids: Vec<OrderId> = (0..8).map(|_| OrderId::new()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted, "v7 ids carry their mint time");
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = OrderId::new();
        let json = serde_json::to_string(&id).unwrap();
        // A bare UUID string, no wrapper object.
        assert_eq!(json, format!("\"{id}\""));
        let back: OrderId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_display_round_trips_through_uuid() {
        let id = AssetId::new();
        let parsed = Uuid::parse_str(&id.to_string()).unwrap();
        assert_eq!(AssetId::from_uuid(parsed), id);
    }
}
