//! Pre-placement validation
//!
//! Pure checks run once the asynchronous inputs (tradable balance,
//! on-chain duplicate lookup) are in hand. Returns the accepted order or
//! the first failing check.

use types::prelude::*;

/// Validate a placement against the account's tradable balance.
///
/// `tradable` reads default missing assets to zero. `already_known` is
/// the combined duplicate predicate: the id is active, persisted, or
/// already seen on-chain.
///
/// Checks performed (in order):
/// 1. Duplicate id
/// 2. Limit orders: full required balance must be tradable
/// 3. Market orders: the spend-asset cap must be positive and the fee
///    remainder must be tradable
pub fn validate_placement(
    order: Order,
    is_market: bool,
    tradable: &BalanceMap,
    already_known: bool,
) -> Result<AcceptedOrder, MatcherError> {
    if already_known {
        return Err(MatcherError::OrderDuplicate(order.id));
    }

    if is_market {
        validate_market(order, tradable)
    } else {
        validate_limit(order, tradable)
    }
}

fn validate_limit(order: Order, tradable: &BalanceMap) -> Result<AcceptedOrder, MatcherError> {
    let accepted = AcceptedOrder::limit(order);
    let required = accepted.required_balance();
    if !tradable.covers(&required) {
        let keys = required.assets().copied().collect();
        return Err(MatcherError::BalanceNotEnough {
            required,
            available: tradable.restrict(&keys),
        });
    }
    Ok(accepted)
}

fn validate_market(order: Order, tradable: &BalanceMap) -> Result<AcceptedOrder, MatcherError> {
    let spend_asset = order.spend_asset();
    let cap = tradable.get(&spend_asset);

    // Fee must be coverable in full even for a capped market order.
    let fee_need = BalanceMap::from_entries([(order.fee_asset, order.matcher_fee.as_decimal())]);

    if cap <= rust_decimal::Decimal::ZERO || !tradable.covers(&fee_need) {
        let accepted = AcceptedOrder::limit(order);
        let required = accepted.required_balance();
        let keys = required.assets().copied().collect();
        return Err(MatcherError::BalanceNotEnough {
            required,
            available: tradable.restrict(&keys),
        });
    }

    let cap = Quantity::try_new(cap).expect("tradable balances are non-negative");
    Ok(AcceptedOrder::market(order, cap))
}
