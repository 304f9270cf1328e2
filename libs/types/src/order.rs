//! Order lifecycle types
//!
//! An [`Order`] is the signed placement directive a client submits; an
//! [`AcceptedOrder`] is the matcher-side view of it: the order plus its
//! filling state, the market flag, and the derived balance maps that
//! drive the reserved-volume ledger.

use crate::asset::{Asset, AssetPair};
use crate::balance::BalanceMap;
use crate::ids::{Address, OrderId};
use crate::numeric::{Price, Quantity};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side (buyer or seller)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buy order (bid)
    Buy,
    /// Sell order (ask)
    Sell,
}

impl Side {
    /// Get the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Signed placement directive.
///
/// Timestamps are Unix milliseconds. Signature material is validated
/// upstream; this core treats the record as already authenticated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub sender: Address,
    pub pair: AssetPair,
    pub side: Side,
    pub price: Price,
    pub amount: Quantity,
    pub matcher_fee: Quantity,
    pub fee_asset: Asset,
    pub timestamp: i64,
    pub expiration: i64,
}

impl Order {
    /// The asset this order spends when it trades.
    pub fn spend_asset(&self) -> Asset {
        match self.side {
            Side::Buy => self.pair.price_asset,
            Side::Sell => self.pair.amount_asset,
        }
    }

    /// The asset this order receives when it trades.
    pub fn receive_asset(&self) -> Asset {
        match self.side {
            Side::Buy => self.pair.amount_asset,
            Side::Sell => self.pair.price_asset,
        }
    }

    /// Spend-asset value of a given amount of this order.
    pub fn spend_value(&self, amount: Quantity) -> Decimal {
        match self.side {
            Side::Buy => amount * self.price,
            Side::Sell => amount.as_decimal(),
        }
    }
}

/// Status of an order as reported to clients.
///
/// `Filled` and `Cancelled` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Accepted,
    PartiallyFilled {
        filled_amount: Quantity,
        filled_fee: Quantity,
    },
    Filled {
        filled_amount: Quantity,
        filled_fee: Quantity,
    },
    Cancelled {
        filled_amount: Quantity,
        filled_fee: Quantity,
    },
    NotFound,
}

impl OrderStatus {
    /// Check if status is terminal (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled { .. } | OrderStatus::Cancelled { .. }
        )
    }
}

/// An accepted order: placement directive plus current filling state.
///
/// Market orders additionally carry the spend-asset cap recorded at
/// acceptance (`available_for_spending`): their reservation never
/// exceeds what the account could actually spend at that moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedOrder {
    pub order: Order,
    pub is_market: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub available_for_spending: Option<Quantity>,
    pub filled_amount: Quantity,
    pub filled_fee: Quantity,
}

impl AcceptedOrder {
    /// A freshly accepted limit order with no fills.
    pub fn limit(order: Order) -> Self {
        Self {
            order,
            is_market: false,
            available_for_spending: None,
            filled_amount: Quantity::zero(),
            filled_fee: Quantity::zero(),
        }
    }

    /// A freshly accepted market order, capped by what the account can
    /// spend at acceptance time.
    pub fn market(order: Order, available_for_spending: Quantity) -> Self {
        Self {
            order,
            is_market: true,
            available_for_spending: Some(available_for_spending),
            filled_amount: Quantity::zero(),
            filled_fee: Quantity::zero(),
        }
    }

    pub fn id(&self) -> OrderId {
        self.order.id
    }

    pub fn sender(&self) -> Address {
        self.order.sender
    }

    /// Unfilled amount.
    ///
    /// # Panics
    /// Panics if the filled amount exceeds the order amount.
    pub fn remaining_amount(&self) -> Quantity {
        self.order
            .amount
            .checked_sub(self.filled_amount)
            .expect("filled amount exceeds order amount")
    }

    /// Unpaid matcher fee.
    pub fn remaining_fee(&self) -> Quantity {
        self.order
            .matcher_fee
            .checked_sub(self.filled_fee)
            .expect("filled fee exceeds matcher fee")
    }

    /// Whether the order still has a strictly positive remainder.
    pub fn is_valid(&self) -> bool {
        !self.remaining_amount().is_zero()
    }

    /// Funds needed to execute the remaining amount: the spend-asset
    /// remainder plus the unpaid fee, merged when they share an asset.
    pub fn required_balance(&self) -> BalanceMap {
        BalanceMap::from_entries([
            (
                self.order.spend_asset(),
                self.order.spend_value(self.remaining_amount()),
            ),
            (self.order.fee_asset, self.remaining_fee().as_decimal()),
        ])
    }

    /// Funds locked while the order lives. Equal to `required_balance`
    /// for limit orders; market orders cap the spend-asset component at
    /// the amount recorded when the order was accepted.
    ///
    /// Key-set invariant: `reservable ⊆ required`.
    pub fn reservable_balance(&self) -> BalanceMap {
        let spend = self.order.spend_value(self.remaining_amount());
        let spend = match self.available_for_spending {
            Some(cap) => spend.min(cap.as_decimal()),
            None => spend,
        };
        BalanceMap::from_entries([
            (self.order.spend_asset(), spend),
            (self.order.fee_asset, self.remaining_fee().as_decimal()),
        ])
    }

    /// Current client-visible status derived from the fill counters.
    pub fn status(&self) -> OrderStatus {
        if self.filled_amount.is_zero() {
            OrderStatus::Accepted
        } else if self.is_valid() {
            OrderStatus::PartiallyFilled {
                filled_amount: self.filled_amount,
                filled_fee: self.filled_fee,
            }
        } else {
            OrderStatus::Filled {
                filled_amount: self.filled_amount,
                filled_fee: self.filled_fee,
            }
        }
    }

    /// Terminal status for a cancellation at the current fill level.
    pub fn cancelled_status(&self) -> OrderStatus {
        OrderStatus::Cancelled {
            filled_amount: self.filled_amount,
            filled_fee: self.filled_fee,
        }
    }

    /// Copy with the fill counters advanced by one execution.
    ///
    /// # Panics
    /// Panics if the fill would exceed the order amount.
    pub fn with_fill(&self, executed_amount: Quantity, executed_fee: Quantity) -> Self {
        let filled_amount = self.filled_amount + executed_amount;
        assert!(
            filled_amount <= self.order.amount,
            "fill would exceed order amount"
        );
        Self {
            filled_amount,
            filled_fee: self.filled_fee + executed_fee,
            ..self.clone()
        }
    }
}

/// Persisted order summary used by status and history queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderInfo {
    pub id: OrderId,
    pub pair: AssetPair,
    pub side: Side,
    pub price: Price,
    pub amount: Quantity,
    pub timestamp: i64,
    pub status: OrderStatus,
}

impl OrderInfo {
    pub fn from_accepted(ao: &AcceptedOrder, status: OrderStatus) -> Self {
        Self {
            id: ao.order.id,
            pair: ao.order.pair,
            side: ao.order.side,
            price: ao.order.price,
            amount: ao.order.amount,
            timestamp: ao.order.timestamp,
            status,
        }
    }
}
