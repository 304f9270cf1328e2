//! Websocket snapshot/diff stream scenarios.

mod support;

use rust_decimal::Decimal;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use account_state::ws::{WsMessage, WsOrderUpdate};
use account_state::{CancelOutcome, PlacementOutcome};
use support::*;
use types::prelude::*;

async fn next_message(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> WsMessage {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no websocket message within deadline")
        .expect("websocket stream closed")
}

#[tokio::test]
async fn test_subscriber_gets_snapshot_then_diffs() {
    let ex = TestExchange::start();
    let alice = Address::new();
    ex.node.set_balance(alice, usd(), "1000");
    ex.node.set_balance(alice, Asset::Native, "10");

    let account = ex.directory.account(alice);
    let (tx, mut rx) = mpsc::unbounded_channel();
    account.subscribe(tx);

    // Exactly one snapshot first: full balances, no orders yet.
    match next_message(&mut rx).await {
        WsMessage::Snapshot { balances, orders } => {
            assert!(orders.is_empty());
            let entry = balances.get(&usd()).expect("usd balance in snapshot");
            assert_eq!(entry.tradable, Decimal::from(1000));
            assert_eq!(entry.reserved, Decimal::ZERO);
        }
        other => panic!("expected snapshot first, got {other:?}"),
    }

    // A placement stages a reserve change and a full order payload.
    let order = limit_buy(alice, "1", 300);
    let id = order.id;
    assert_eq!(
        account.place_order(order, false).await,
        PlacementOutcome::Accepted(id)
    );

    match next_message(&mut rx).await {
        WsMessage::Diff { balances, orders } => {
            let entry = balances.get(&usd()).expect("usd balance in diff");
            assert_eq!(entry.reserved, Decimal::from(300));
            assert_eq!(entry.tradable, Decimal::from(700));
            assert_eq!(orders.len(), 1);
            match &orders[0] {
                WsOrderUpdate::Full {
                    order_id, status, ..
                } => {
                    assert_eq!(*order_id, id);
                    assert_eq!(*status, OrderStatus::Accepted);
                }
                other => panic!("first sight must carry full info, got {other:?}"),
            }
        }
        other => panic!("expected diff, got {other:?}"),
    }

    // Cancellation arrives as a status-only update and frees the reserve.
    assert_eq!(account.cancel_order(id).await, CancelOutcome::Canceled(id));
    match next_message(&mut rx).await {
        WsMessage::Diff { balances, orders } => {
            let entry = balances.get(&usd()).expect("usd balance in diff");
            assert_eq!(entry.reserved, Decimal::ZERO);
            assert_eq!(entry.tradable, Decimal::from(1000));
            assert_eq!(orders.len(), 1);
            match &orders[0] {
                WsOrderUpdate::Status { order_id, status } => {
                    assert_eq!(*order_id, id);
                    assert!(status.is_terminal());
                }
                other => panic!("cancellation must be status-only, got {other:?}"),
            }
        }
        other => panic!("expected diff, got {other:?}"),
    }
}

#[tokio::test]
async fn test_quiet_account_emits_no_diffs() {
    let ex = TestExchange::start();
    let alice = Address::new();
    ex.node.set_balance(alice, usd(), "50");

    let account = ex.directory.account(alice);
    let (tx, mut rx) = mpsc::unbounded_channel();
    account.subscribe(tx);

    assert!(matches!(
        next_message(&mut rx).await,
        WsMessage::Snapshot { .. }
    ));

    // Several diff intervals pass without any change: nothing is sent.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        rx.try_recv().is_err(),
        "no diff may be emitted without staged changes"
    );
}

#[tokio::test]
async fn test_second_subscriber_also_gets_snapshot() {
    let ex = TestExchange::start();
    let alice = Address::new();
    ex.node.set_balance(alice, usd(), "50");
    let account = ex.directory.account(alice);

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    account.subscribe(tx1);
    assert!(matches!(
        next_message(&mut rx1).await,
        WsMessage::Snapshot { .. }
    ));

    let (tx2, mut rx2) = mpsc::unbounded_channel();
    account.subscribe(tx2);
    assert!(matches!(
        next_message(&mut rx2).await,
        WsMessage::Snapshot { .. }
    ));
}

#[tokio::test]
async fn test_fill_streams_reserve_drop() {
    let ex = TestExchange::start();
    let alice = Address::new();
    let bob = Address::new();
    ex.node.set_balance(alice, usd(), "1000");
    ex.node.set_balance(alice, Asset::Native, "10");

    let account = ex.directory.account(alice);
    let order = limit_buy(alice, "1", 300);
    let id = order.id;
    assert_eq!(
        account.place_order(order.clone(), false).await,
        PlacementOutcome::Accepted(id)
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    account.subscribe(tx);
    match next_message(&mut rx).await {
        WsMessage::Snapshot { orders, .. } => {
            assert_eq!(orders.len(), 1, "snapshot carries the active order");
        }
        other => panic!("expected snapshot, got {other:?}"),
    }

    // Half the order executes against bob.
    let ours = AcceptedOrder::limit(order).with_fill(
        Quantity::from_str("0.5").unwrap(),
        Quantity::from_str("0.0015").unwrap(),
    );
    let mut counter_order = limit_buy(bob, "0.5", 300);
    counter_order.side = Side::Sell;
    let counter = AcceptedOrder::limit(counter_order).with_fill(
        Quantity::from_str("0.5").unwrap(),
        Quantity::from_str("0.003").unwrap(),
    );
    ex.directory
        .process_event(account_state::events::MatcherEvent::OrderExecuted {
            submitted: counter,
            counter: ours,
            timestamp: now_millis(),
        });

    match next_message(&mut rx).await {
        WsMessage::Diff { balances, orders } => {
            let entry = balances.get(&usd()).expect("usd balance in diff");
            assert_eq!(entry.reserved, Decimal::from(150));
            // The reserve drop is mirrored into the spendable cache
            // before settlement, so tradable does not jump up.
            assert_eq!(entry.tradable, Decimal::from(700));
            assert_eq!(orders.len(), 1);
            match &orders[0] {
                WsOrderUpdate::Fill { status, .. } => {
                    assert!(matches!(status, OrderStatus::PartiallyFilled { .. }));
                }
                other => panic!("snapshot-known orders fill as deltas, got {other:?}"),
            }
        }
        other => panic!("expected diff, got {other:?}"),
    }
}
