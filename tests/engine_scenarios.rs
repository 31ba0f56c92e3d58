mod common;

use common::*;
use rsibot::engine::{EngineError, EngineState, TickOutcome};
use rsibot::messaging::confirmation::{NO, YES};
use rsibot::models::{PositionRecord, TradeSide};
use std::time::Duration;
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

fn oversold() -> BrokerState {
    BrokerState {
        closes: closes_rsi_30(),
        ..Default::default()
    }
}

fn overbought_holding(quantity: u64) -> BrokerState {
    BrokerState {
        closes: closes_rsi_75(),
        held: quantity,
        last_price: Some(110.0),
        ..Default::default()
    }
}

// ============================================================================
// Buy path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_approved_buy_records_fill_price() {
    let mut h = harness(
        BrokerState {
            fill: Ok(101.0),
            ..oversold()
        },
        PositionRecord::default(),
        &[Some("yes"), Some("5")],
    )
    .await;

    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(
        outcome,
        TickOutcome::Bought {
            quantity: 5,
            fill_price: 101.0
        }
    );
    assert_eq!(h.store.record(), PositionRecord::bought(101.0));
    assert_eq!(h.engine.position(), PositionRecord::bought(101.0));
    assert_eq!(h.broker.snapshot().orders, vec![(TradeSide::Buy, 5)]);

    let prompts = h.messenger.prompts();
    assert_eq!(prompts.len(), 2);
    let values: Vec<&str> = prompts[0].buttons.iter().map(|b| b.value.as_str()).collect();
    assert_eq!(values, vec![YES, NO]);
    // 1000 / 100 = 10 lots affordable
    assert_eq!(prompts[1].buttons.len(), 10);
    assert_eq!(prompts[1].buttons[9].value, "10");

    assert!(h.messenger.has_notice("Account balance: 1000.00"));
    assert!(h.messenger.has_notice("Bought 5 lots at 101.00"));
    assert_eq!(h.engine.state(), EngineState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_declined_buy_changes_nothing() {
    let mut h = harness(oversold(), PositionRecord::default(), &[Some("no")]).await;

    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(outcome, TickOutcome::BuyDeclined);
    assert!(h.broker.snapshot().orders.is_empty());
    assert_eq!(h.store.saves(), 0);
    assert_eq!(h.messenger.prompts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_buy_times_out_as_decline() {
    let mut h = harness(oversold(), PositionRecord::default(), &[]).await;

    let started = tokio::time::Instant::now();
    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(outcome, TickOutcome::BuyDeclined);
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(h.broker.snapshot().orders.is_empty());
    assert!(h.messenger.has_notice("No answer in time"));
}

#[tokio::test(start_paused = true)]
async fn test_quantity_timeout_cancels_purchase() {
    let mut h = harness(oversold(), PositionRecord::default(), &[Some("yes")]).await;

    let started = tokio::time::Instant::now();
    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(outcome, TickOutcome::QuantityNotSelected);
    assert!(started.elapsed() >= Duration::from_secs(45));
    assert!(h.broker.snapshot().orders.is_empty());
    assert_eq!(h.store.record(), PositionRecord::default());
    assert!(h.messenger.has_notice("Purchase cancelled"));
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_funds_skips_quantity_prompt() {
    let mut h = harness(
        BrokerState {
            balance: 50.0,
            ..oversold()
        },
        PositionRecord::default(),
        &[Some("yes")],
    )
    .await;

    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(
        outcome,
        TickOutcome::InsufficientFunds {
            balance: 50.0,
            price: 100.0
        }
    );
    assert_eq!(h.messenger.prompts().len(), 1);
    assert!(h.broker.snapshot().orders.is_empty());
    assert!(h.messenger.has_notice("Not enough funds"));
}

#[tokio::test(start_paused = true)]
async fn test_quantity_options_are_capped() {
    let mut h = harness(
        BrokerState {
            balance: 1_000_000.0,
            ..oversold()
        },
        PositionRecord::default(),
        &[Some("yes"), Some("50")],
    )
    .await;

    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(
        outcome,
        TickOutcome::Bought {
            quantity: 50,
            fill_price: 100.0
        }
    );
    assert_eq!(h.messenger.prompts()[1].buttons.len(), 50);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_order_leaves_position_flat() {
    let mut h = harness(
        BrokerState {
            fill: Err("not enough liquidity".to_string()),
            ..oversold()
        },
        PositionRecord::default(),
        &[Some("yes"), Some("1")],
    )
    .await;

    let outcome = assert_ok!(h.engine.tick().await);

    match outcome {
        TickOutcome::BuyFailed { reason } => assert!(reason.contains("not enough liquidity")),
        other => panic!("expected BuyFailed, got {:?}", other),
    }
    assert_eq!(h.store.record(), PositionRecord::default());
    assert_eq!(h.store.saves(), 0);
    assert!(h.messenger.has_notice("Buy failed"));

    // The next tick proceeds normally
    h.broker.update(|s| s.closes = neutral_closes());
    let outcome = assert_ok!(h.engine.tick().await);
    assert_eq!(outcome, TickOutcome::Hold { rsi: 50.0 });
}

#[tokio::test(start_paused = true)]
async fn test_pending_confirmation_elsewhere_counts_as_decline() {
    let mut h = harness(oversold(), PositionRecord::default(), &[]).await;

    let blocker = {
        let gateway = h.gateway.clone();
        tokio::spawn(async move {
            gateway
                .ask_yes_no(CHAT, "Someone else asking", Duration::from_secs(600))
                .await
        })
    };
    while h.gateway.pending_request(CHAT).is_none() {
        tokio::task::yield_now().await;
    }

    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(outcome, TickOutcome::BuyDeclined);
    assert!(h.broker.snapshot().orders.is_empty());
    blocker.abort();
}

#[tokio::test(start_paused = true)]
async fn test_unpriced_buy_is_recorded_at_quote() {
    let mut h = harness(
        BrokerState {
            fill: Ok(0.0),
            ..oversold()
        },
        PositionRecord::default(),
        &[Some("yes"), Some("4")],
    )
    .await;

    let outcome = assert_ok!(h.engine.tick().await);

    // The order went through, so the holding is kept at the quoted 100.00
    assert_eq!(
        outcome,
        TickOutcome::Bought {
            quantity: 4,
            fill_price: 100.0
        }
    );
    assert_eq!(h.store.record(), PositionRecord::bought(100.0));
    assert_eq!(h.broker.snapshot().orders, vec![(TradeSide::Buy, 4)]);
    assert!(h.messenger.has_notice("fill price was not reported"));
    assert!(!h.messenger.has_notice("Buy failed"));
}

// ============================================================================
// Sell path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_declined_sell_keeps_position() {
    let record = PositionRecord::bought(101.0);
    let mut h = harness(overbought_holding(5), record, &[Some("no")]).await;

    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(outcome, TickOutcome::SellDeclined);
    assert_eq!(h.store.record(), record);
    assert_eq!(h.store.saves(), 0);
    assert!(h.broker.snapshot().orders.is_empty());

    let prompts = h.messenger.prompts();
    let prompt = &prompts[0];
    assert!(prompt.text.contains("Bought at: 101.00"));
    assert!(prompt.text.contains("Selling at: 110.00"));
    assert!(prompt.text.contains("Profit: 45.00"));
}

#[tokio::test(start_paused = true)]
async fn test_approved_sell_closes_position() {
    let mut h = harness(
        BrokerState {
            fill: Ok(110.0),
            ..overbought_holding(5)
        },
        PositionRecord::bought(101.0),
        &[Some("yes")],
    )
    .await;

    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(
        outcome,
        TickOutcome::Sold {
            quantity: 5,
            profit: 45.0
        }
    );
    assert!(!h.store.record().held);
    assert!(!h.engine.position().held);
    assert_eq!(h.broker.snapshot().orders, vec![(TradeSide::Sell, 5)]);
    assert!(h.messenger.has_notice("Profit: 45.00"));
}

#[tokio::test(start_paused = true)]
async fn test_vanished_position_is_marked_flat() {
    let mut h = harness(
        overbought_holding(0),
        PositionRecord::bought(101.0),
        &[Some("yes")],
    )
    .await;

    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(outcome, TickOutcome::PositionDrifted);
    assert!(!h.store.record().held);
    assert!(h.broker.snapshot().orders.is_empty());
    assert!(h.messenger.has_notice("Nothing to sell"));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_sell_keeps_position() {
    let mut h = harness(
        BrokerState {
            fill: Err("instrument not tradable".to_string()),
            ..overbought_holding(5)
        },
        PositionRecord::bought(101.0),
        &[Some("yes")],
    )
    .await;

    let outcome = assert_ok!(h.engine.tick().await);

    match outcome {
        TickOutcome::SellFailed { reason } => assert!(reason.contains("instrument not tradable")),
        other => panic!("expected SellFailed, got {:?}", other),
    }
    assert_eq!(h.store.record(), PositionRecord::bought(101.0));
    assert_eq!(h.engine.position(), PositionRecord::bought(101.0));
    assert_eq!(h.store.saves(), 0);
    assert_eq!(h.broker.snapshot().held, 5);
    assert!(h.messenger.has_notice("Sell failed"));
}

// ============================================================================
// Reconciliation and persistence
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_external_holding_is_adopted() {
    let mut h = harness(
        BrokerState {
            held: 3,
            average_price: Some(98.5),
            ..Default::default()
        },
        PositionRecord::default(),
        &[],
    )
    .await;

    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(outcome, TickOutcome::Hold { rsi: 50.0 });
    assert_eq!(h.store.record(), PositionRecord::bought(98.5));
    assert!(h.engine.position().held);
    assert!(h.broker.snapshot().orders.is_empty());
    assert!(h.messenger.prompts().is_empty());
    assert!(h.messenger.has_notice("Found 3 lots"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_save_after_buy_is_repaired_without_trading() {
    let mut h = harness(
        BrokerState {
            fill: Ok(101.0),
            ..oversold()
        },
        PositionRecord::default(),
        &[Some("yes"), Some("2")],
    )
    .await;
    h.store.set_failing(true);

    let err = assert_err!(h.engine.tick().await);
    match &err {
        EngineError::PositionDesync { expected, .. } => {
            assert_eq!(*expected, PositionRecord::bought(101.0))
        }
        other => panic!("expected PositionDesync, got {:?}", other),
    }
    assert!(!err.is_transient());
    assert!(h.engine.has_unsaved_position());
    assert_eq!(h.engine.position(), PositionRecord::default());
    assert_eq!(h.store.record(), PositionRecord::default());
    assert_eq!(h.broker.snapshot().orders, vec![(TradeSide::Buy, 2)]);

    // Still failing: only the write is retried
    assert_err!(h.engine.tick().await);
    assert_eq!(h.broker.snapshot().orders.len(), 1);
    assert_eq!(h.messenger.prompts().len(), 2);

    h.store.set_failing(false);
    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(outcome, TickOutcome::Recovered);
    assert!(!h.engine.has_unsaved_position());
    assert_eq!(h.store.record(), PositionRecord::bought(101.0));
    assert_eq!(h.broker.snapshot().orders.len(), 1);
    assert_eq!(h.messenger.prompts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_save_after_sell_is_repaired_without_trading() {
    let mut h = harness(
        BrokerState {
            fill: Ok(110.0),
            ..overbought_holding(5)
        },
        PositionRecord::bought(101.0),
        &[Some("yes")],
    )
    .await;
    h.store.set_failing(true);

    let err = assert_err!(h.engine.tick().await);
    match &err {
        EngineError::PositionDesync { expected, .. } => {
            assert_eq!(*expected, PositionRecord::bought(101.0).flat())
        }
        other => panic!("expected PositionDesync, got {:?}", other),
    }
    assert!(h.engine.has_unsaved_position());
    assert!(h.engine.position().held);
    assert_eq!(h.broker.snapshot().orders, vec![(TradeSide::Sell, 5)]);

    // Still failing: no second sell is attempted
    assert_err!(h.engine.tick().await);
    assert_eq!(h.broker.snapshot().orders.len(), 1);
    assert_eq!(h.messenger.prompts().len(), 1);

    h.store.set_failing(false);
    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(outcome, TickOutcome::Recovered);
    assert!(!h.store.record().held);
    assert!(!h.engine.position().held);
    assert_eq!(h.broker.snapshot().orders.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_adoption_write_pauses_trading() {
    let mut h = harness(
        BrokerState {
            held: 3,
            average_price: Some(98.5),
            closes: closes_rsi_75(),
            ..Default::default()
        },
        PositionRecord::default(),
        &[Some("yes")],
    )
    .await;
    h.store.set_failing(true);

    let err = assert_err!(h.engine.tick().await);
    match &err {
        EngineError::PositionDesync { expected, .. } => {
            assert_eq!(*expected, PositionRecord::bought(98.5))
        }
        other => panic!("expected PositionDesync, got {:?}", other),
    }
    assert!(h.engine.has_unsaved_position());
    assert_eq!(h.engine.position(), PositionRecord::default());
    // Nothing evaluated or traded against an unrecorded holding
    assert_eq!(h.broker.snapshot().closes_calls, 0);
    assert!(h.broker.snapshot().orders.is_empty());
    assert!(h.messenger.prompts().is_empty());

    assert_err!(h.engine.tick().await);
    assert_eq!(h.broker.snapshot().closes_calls, 0);

    h.store.set_failing(false);
    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(outcome, TickOutcome::Recovered);
    assert_eq!(h.store.record(), PositionRecord::bought(98.5));
    assert!(h.broker.snapshot().orders.is_empty());
    assert!(h.messenger.prompts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_market_closed_skips_everything() {
    let mut h = harness(
        BrokerState {
            market_open: false,
            ..oversold()
        },
        PositionRecord::default(),
        &[Some("yes"), Some("1")],
    )
    .await;

    let outcome = assert_ok!(h.engine.tick().await);

    assert_eq!(outcome, TickOutcome::MarketClosed);
    assert_eq!(h.broker.snapshot().closes_calls, 0);
    assert!(h.messenger.prompts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_candles_is_transient() {
    let mut h = harness(
        BrokerState {
            closes: Vec::new(),
            ..Default::default()
        },
        PositionRecord::default(),
        &[],
    )
    .await;

    let err = assert_err!(h.engine.tick().await);
    assert!(matches!(err, EngineError::NoPriceData(_)));
    assert!(err.is_transient());
}

#[tokio::test(start_paused = true)]
async fn test_stored_position_loaded_at_startup() {
    let h = harness(
        BrokerState::default(),
        PositionRecord::bought(87.25),
        &[],
    )
    .await;

    assert_eq!(h.engine.position(), PositionRecord::bought(87.25));
    assert_eq!(h.engine.state(), EngineState::Idle);
}

// ============================================================================
// Loop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_loop_survives_errors_and_retries_sooner() {
    let h = harness(
        BrokerState {
            closes: Vec::new(),
            ..Default::default()
        },
        PositionRecord::default(),
        &[],
    )
    .await;
    let broker = h.broker.clone();
    let messenger = h.messenger.clone();

    let (stop, stopped) = watch::channel(false);
    let task = tokio::spawn(h.engine.run(stopped));

    // Retry interval is 30s: ticks at 0, 30, 60 and 90
    tokio::time::sleep(Duration::from_secs(100)).await;
    let _ = stop.send(true);
    task.await.unwrap();

    let calls = broker.snapshot().closes_calls;
    assert_eq!(calls, 4);
    // One notification per failed tick
    assert_eq!(messenger.notices().len(), calls);
}

#[tokio::test(start_paused = true)]
async fn test_loop_polls_at_regular_interval() {
    let h = harness(BrokerState::default(), PositionRecord::default(), &[]).await;
    let broker = h.broker.clone();

    let (stop, stopped) = watch::channel(false);
    let task = tokio::spawn(h.engine.run(stopped));

    // Poll interval is 60s: ticks at 0 and 60
    tokio::time::sleep(Duration::from_secs(100)).await;
    let _ = stop.send(true);
    task.await.unwrap();

    assert_eq!(broker.snapshot().closes_calls, 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_order_in_flight() {
    let h = harness(
        BrokerState {
            order_delay: Some(Duration::from_secs(2)),
            ..oversold()
        },
        PositionRecord::default(),
        &[Some("yes"), Some("3")],
    )
    .await;
    let broker = h.broker.clone();
    let store = h.store.clone();
    let messenger = h.messenger.clone();

    let (stop, stopped) = watch::channel(false);
    let task = tokio::spawn(h.engine.run(stopped));

    // The order is submitted at 0s and reports back at 2s
    tokio::time::sleep(Duration::from_secs(1)).await;
    let _ = stop.send(true);
    task.await.unwrap();

    assert_eq!(broker.snapshot().orders, vec![(TradeSide::Buy, 3)]);
    assert_eq!(store.record(), PositionRecord::bought(100.0));
    assert!(messenger.has_notice("Bought 3 lots"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_pending_confirmation() {
    let h = harness(oversold(), PositionRecord::default(), &[]).await;
    let broker = h.broker.clone();
    let store = h.store.clone();
    let messenger = h.messenger.clone();

    let (stop, stopped) = watch::channel(false);
    let task = tokio::spawn(h.engine.run(stopped));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(messenger.prompts().len(), 1);
    let _ = stop.send(true);

    // Well before the 30s confirmation timeout
    let finished = tokio::time::timeout(Duration::from_secs(1), task).await;
    assert!(finished.is_ok());
    assert!(broker.snapshot().orders.is_empty());
    assert_eq!(store.saves(), 0);
}
