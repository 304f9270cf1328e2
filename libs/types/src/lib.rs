//! Types library for the matcher account core
//!
//! This library provides the domain types shared by the account-state
//! service and its collaborators: identifiers, assets, fixed-point
//! numerics, orders with their filling state, balance maps and the
//! client-facing error taxonomy.
//!
//! # Modules
//! - `ids`: Unique identifiers (Address, OrderId, AssetId)
//! - `asset`: Asset tags and trading pairs
//! - `numeric`: Fixed-point decimal types (Price, Quantity)
//! - `balance`: Cleaning balance maps keyed by asset
//! - `order`: Order lifecycle types
//! - `errors`: Error taxonomy

pub mod asset;
pub mod balance;
pub mod errors;
pub mod ids;
pub mod numeric;
pub mod order;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::asset::*;
    pub use crate::balance::*;
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::order::*;
}
