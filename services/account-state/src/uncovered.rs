//! Selection of orders no longer covered by the account's balance
//!
//! When the chain watcher reports that some assets of an account changed,
//! the account must cancel just enough open orders for the remaining
//! reservations to fit the new balance. Orders are walked oldest-first so
//! that senior orders keep their reservations and the newest orders
//! absorb the deficit.

use rust_decimal::Decimal;
use std::collections::BTreeSet;
use types::prelude::*;

/// One order that lost its coverage, with the first missing asset and
/// how much of it is short.
#[derive(Debug, Clone, PartialEq)]
pub struct UncoveredOrder {
    pub order_id: OrderId,
    pub pair: AssetPair,
    pub asset: Asset,
    pub insufficient_amount: Decimal,
}

/// Fold the account's limit orders over the changed balances.
///
/// `new_balance` holds only the assets that actually changed; orders not
/// touching any of them are unaffected. Orders listed in `skip` (those
/// with a cancellation already pending) are never reported.
pub fn select_uncovered<'a>(
    orders: impl IntoIterator<Item = &'a AcceptedOrder>,
    new_balance: &BalanceSnapshot,
    skip: &BTreeSet<OrderId>,
) -> Vec<UncoveredOrder> {
    let changed: BTreeSet<Asset> = new_balance.keys().copied().collect();

    let mut by_age: Vec<&AcceptedOrder> = orders.into_iter().filter(|ao| !ao.is_market).collect();
    by_age.sort_by_key(|ao| (ao.order.timestamp, ao.order.id));

    let mut rest = new_balance.clone();
    let mut uncovered = Vec::new();

    for ao in by_age {
        let need = ao.required_balance().restrict(&changed);
        if need.is_empty() {
            continue;
        }

        let mut deficit: Option<(Asset, Decimal)> = None;
        for (asset, value) in need.iter() {
            let remaining = rest.get(asset).copied().unwrap_or(Decimal::ZERO) - *value;
            if remaining < Decimal::ZERO {
                deficit = Some((*asset, -remaining));
                break;
            }
        }

        match deficit {
            None => {
                // Covered: this order keeps its reservation.
                for (asset, value) in need.iter() {
                    *rest.entry(*asset).or_insert(Decimal::ZERO) -= *value;
                }
            }
            Some((asset, insufficient_amount)) => {
                if !skip.contains(&ao.order.id) {
                    uncovered.push(UncoveredOrder {
                        order_id: ao.order.id,
                        pair: ao.order.pair,
                        asset,
                        insufficient_amount,
                    });
                }
            }
        }
    }

    uncovered
}
