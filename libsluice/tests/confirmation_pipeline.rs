//! Exercises the chain service's confirmation pipeline against the mock
//! chain: confirmation depth, reorg discard, missed-event recovery and
//! subscription loss.

use alloy_primitives::{Address, B256, U256};
use libsluice::chain::client::LogPayload;
use libsluice::chain::mock::MockChain;
use libsluice::chain::service::{ChainService, ChainServiceConfig, ChainServiceError};
use libsluice::chain::{ChainEvent, ChainEventDetail};
use libsluice::types::Destination;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const SIGNER: Address = Address::repeat_byte(0x5e);
const ADJUDICATOR: Address = Address::repeat_byte(0x0a);

fn channel_id(byte: u8) -> Destination {
    Destination(B256::repeat_byte(byte))
}

fn test_config() -> ChainServiceConfig {
    ChainServiceConfig {
        required_confirmations: 2,
        min_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_secs(5),
        resub_interval: Duration::from_secs(600),
        max_query_block_range: 10,
        event_buffer_capacity: 64,
    }
}

async fn start_service(chain: &MockChain) -> (ChainService<MockChain>, mpsc::Receiver<ChainEvent>) {
    let mut service = ChainService::new(chain.clone(), ADJUDICATOR, SIGNER, 0, test_config())
        .await
        .expect("chain service should start");
    let events = service.event_feed().unwrap();
    (service, events)
}

async fn expect_event(events: &mut mpsc::Receiver<ChainEvent>) -> ChainEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a chain event")
        .expect("event feed closed")
}

async fn expect_no_event(events: &mut mpsc::Receiver<ChainEvent>) {
    if let Ok(event) = timeout(Duration::from_millis(200), events.recv()).await {
        panic!("expected no event, got {:?}", event);
    }
}

#[tokio::test]
async fn events_wait_for_confirmation_depth() {
    env_logger::try_init().ok();
    let chain = MockChain::new(SIGNER);
    let (service, mut events) = start_service(&chain).await;

    let id = channel_id(1);
    chain.emit_log(id, LogPayload::Deposited { asset: Address::ZERO, now_held: U256::from(5) });

    // Zero and one confirmations: nothing is dispatched.
    expect_no_event(&mut events).await;
    chain.mine_block();
    expect_no_event(&mut events).await;

    // Second confirmation releases the event, exactly once.
    chain.mine_block();
    let event = expect_event(&mut events).await;
    assert_eq!(event.channel_id, id);
    assert!(matches!(event.detail, ChainEventDetail::Deposited { .. }));
    // The block timestamp rode along with the event.
    assert_eq!(event.block.timestamp, event.block.block_num * 12);

    chain.mine_blocks(3);
    expect_no_event(&mut events).await;

    service.close().await;
}

#[tokio::test]
async fn reorged_events_are_discarded() {
    env_logger::try_init().ok();
    let chain = MockChain::new(SIGNER);
    let (service, mut events) = start_service(&chain).await;

    let id = channel_id(2);
    chain.emit_log(id, LogPayload::Concluded);
    let reorg_point = chain.latest_block_num();

    // The event's block is replaced before it confirms.
    chain.reorg(reorg_point);
    chain.mine_blocks(3);
    expect_no_event(&mut events).await;

    // The chain still works for later events.
    chain.emit_log(id, LogPayload::Concluded);
    chain.mine_blocks(2);
    let event = expect_event(&mut events).await;
    assert!(matches!(event.detail, ChainEventDetail::Concluded));

    service.close().await;
}

#[tokio::test]
async fn startup_recovers_missed_events() {
    env_logger::try_init().ok();
    let chain = MockChain::new(SIGNER);

    // Logs emitted before the service exists, spread over more blocks than
    // one query chunk covers.
    let id = channel_id(3);
    chain.emit_log(id, LogPayload::Deposited { asset: Address::ZERO, now_held: U256::from(1) });
    chain.mine_blocks(15);
    chain.emit_log(id, LogPayload::Deposited { asset: Address::ZERO, now_held: U256::from(2) });
    chain.mine_blocks(2);

    let (service, mut events) = start_service(&chain).await;
    // Already-confirmed history needs one fresh block to trigger a drain.
    chain.mine_block();

    let first = expect_event(&mut events).await;
    let second = expect_event(&mut events).await;
    match (&first.detail, &second.detail) {
        (
            ChainEventDetail::Deposited { now_held: a, .. },
            ChainEventDetail::Deposited { now_held: b, .. },
        ) => {
            assert_eq!(*a, U256::from(1));
            assert_eq!(*b, U256::from(2));
        }
        other => panic!("expected two deposit events, got {:?}", other),
    }
    assert!(first.ordering_key() < second.ordering_key());

    service.close().await;
}

#[tokio::test]
async fn dropped_subscriptions_recover_without_losing_events() {
    env_logger::try_init().ok();
    let chain = MockChain::new(SIGNER);
    let (service, mut events) = start_service(&chain).await;

    // Both subscriptions die; an event fires while we are disconnected.
    chain.drop_subscriptions();
    let id = channel_id(4);
    chain.emit_log(id, LogPayload::Deposited { asset: Address::ZERO, now_held: U256::from(9) });
    chain.mine_blocks(2);

    // Resubscription runs missed-event recovery; fresh blocks let the head
    // listener drain the queue once it is back.
    let event = timeout(Duration::from_secs(10), async {
        loop {
            chain.mine_block();
            if let Ok(Some(event)) = timeout(Duration::from_millis(100), events.recv()).await {
                return event;
            }
        }
    })
    .await
    .expect("service should recover the event after resubscribing");

    assert_eq!(event.channel_id, id);
    assert!(matches!(event.detail, ChainEventDetail::Deposited { .. }));

    service.close().await;
}

#[tokio::test]
async fn stalled_consumer_is_a_fatal_error() {
    env_logger::try_init().ok();
    let chain = MockChain::new(SIGNER);
    let mut config = test_config();
    config.event_buffer_capacity = 1;
    let mut service = ChainService::new(chain.clone(), ADJUDICATOR, SIGNER, 0, config)
        .await
        .expect("chain service should start");
    // Take the feed but never read it.
    let _events = service.event_feed().unwrap();
    let mut errors = service.error_feed().unwrap();

    let id = channel_id(5);
    chain.emit_log(id, LogPayload::Concluded);
    chain.emit_log(id, LogPayload::Concluded);
    chain.mine_blocks(3);

    let err = timeout(Duration::from_secs(5), errors.recv())
        .await
        .expect("timed out waiting for a fatal error")
        .expect("error feed closed");
    assert!(matches!(err, ChainServiceError::EventBufferFull));

    service.close().await;
}

#[tokio::test]
async fn watermark_trails_the_head() {
    env_logger::try_init().ok();
    let chain = MockChain::new(SIGNER);
    let (service, _events) = start_service(&chain).await;

    assert_eq!(service.get_last_confirmed_block_num(), 0);
    chain.mine_blocks(5);
    // Wait for the head listener to observe the final block.
    timeout(Duration::from_secs(5), async {
        while service.latest_block().block_num < 5 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("head listener should observe mined blocks");
    assert_eq!(service.get_last_confirmed_block_num(), 3);

    service.close().await;
}
