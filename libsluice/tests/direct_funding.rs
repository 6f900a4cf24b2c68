//! End-to-end direct funding between two parties sharing a mock chain: each
//! runs its own chain service and a miniature crank loop standing in for the
//! engine.

use alloy_primitives::{Address, U256};
use libsluice::chain::mock::MockChain;
use libsluice::chain::service::{ChainService, ChainServiceConfig};
use libsluice::chain::ChainEvent;
use libsluice::channel::PRE_FUND_TURN_NUM;
use libsluice::crypto::SecretKey;
use libsluice::messages::Message;
use libsluice::objective::direct_fund::{self, DirectFundObjective};
use libsluice::objective::{Objective, ObjectiveStatus, SideEffects};
use libsluice::outcome::{Allocation, Exit, SingleAssetExit};
use libsluice::state::{FixedPart, State, VariablePart};
use libsluice::types::Destination;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const ALICE_SK: &str = "2d999770f7b5d49b694080f987b82bbc9fc9ac2b4dcc10b0f8aba7d700f69c6d";
const BOB_SK: &str = "0279651921cd800ac560c21ceea27aab0107b67daf436cdd25ce84cad30159b4";

const ADJUDICATOR: Address = Address::repeat_byte(0x0a);

fn test_config() -> ChainServiceConfig {
    ChainServiceConfig {
        required_confirmations: 2,
        min_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_secs(5),
        resub_interval: Duration::from_secs(600),
        max_query_block_range: 100,
        event_buffer_capacity: 64,
    }
}

fn prefund_state(alice: &SecretKey, bob: &SecretKey) -> State {
    State {
        fixed: FixedPart {
            participants: vec![alice.address(), bob.address()],
            channel_nonce: 777,
            app_definition: Address::repeat_byte(0x01),
            challenge_duration: 60,
        },
        variable: VariablePart {
            app_data: vec![],
            outcome: Exit(vec![SingleAssetExit {
                asset: Address::ZERO,
                metadata: vec![],
                allocations: vec![
                    Allocation::simple(Destination::from_address(alice.address()), U256::from(6)),
                    Allocation::simple(Destination::from_address(bob.address()), U256::from(4)),
                ],
            }]),
            turn_num: PRE_FUND_TURN_NUM,
            is_final: false,
        },
    }
}

/// One participant's engine-in-miniature: a signing key, a chain service and
/// the funding objective.
struct Party {
    key: SecretKey,
    objective: Objective,
    service: ChainService<MockChain>,
    events: mpsc::Receiver<ChainEvent>,
}

impl Party {
    async fn start(chain: &MockChain, key: SecretKey, objective: DirectFundObjective) -> Party {
        let client = chain.for_signer(key.address());
        let mut service = ChainService::new(client, ADJUDICATOR, key.address(), 0, test_config())
            .await
            .expect("chain service should start");
        let events = service.event_feed().unwrap();
        Party { key, objective: Objective::DirectFund(objective), service, events }
    }

    /// Cranks the objective and performs its side effects, returning the
    /// messages to relay to the counterparty.
    async fn crank(&mut self) -> Vec<Message> {
        let (updated, effects, _waiting_for) = self.objective.crank(&self.key).expect("crank should succeed");
        self.objective = updated;
        self.perform(effects).await
    }

    async fn perform(&mut self, effects: SideEffects) -> Vec<Message> {
        for tx in &effects.transactions_to_submit {
            self.service.send_transaction(tx).await.expect("transaction submission should succeed");
        }
        effects.messages_to_send
    }

    fn receive(&mut self, messages: &[Message]) {
        for message in messages {
            assert_eq!(message.to, self.key.address());
            self.objective = self.objective.update(&message.payload).expect("update should succeed");
        }
    }

    /// Applies the next confirmed chain event to the objective.
    async fn apply_next_event(&mut self) {
        let event = timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for a chain event")
            .expect("event feed closed");
        self.objective = self.objective.update_with_chain_event(&event).expect("event should apply");
    }

    fn channel(&self) -> &libsluice::channel::Channel {
        self.objective.related()[0]
    }
}

#[tokio::test]
async fn two_party_direct_funding() {
    env_logger::try_init().ok();

    let alice_key = SecretKey::from_hex(ALICE_SK).unwrap();
    let bob_key = SecretKey::from_hex(BOB_SK).unwrap();
    let chain = MockChain::new(alice_key.address());

    // Alice proposes the channel; the proposal payload reaches Bob.
    let alice_objective = DirectFundObjective::new(prefund_state(&alice_key, &bob_key), 0, true).unwrap();
    let mut alice = Party::start(&chain, alice_key.clone(), alice_objective).await;

    let to_bob = alice.crank().await;
    assert_eq!(to_bob.len(), 1);
    let bob_objective = DirectFundObjective::from_payload(&to_bob[0].payload, bob_key.address(), true).unwrap();
    let mut bob = Party::start(&chain, bob_key.clone(), bob_objective).await;

    // Bob signs the pre-fund and his signature flows back to Alice.
    let to_alice = bob.crank().await;
    alice.receive(&to_alice);
    assert!(alice.channel().pre_fund_complete());
    assert!(bob.channel().pre_fund_complete());

    // Alice deposits her share first; both observe the Deposited event.
    let to_bob = alice.crank().await;
    assert!(to_bob.is_empty());
    chain.mine_blocks(2);
    alice.apply_next_event().await;
    bob.apply_next_event().await;
    assert_eq!(alice.channel().on_chain.holdings.held(&Address::ZERO), U256::from(6));

    // Now it is Bob's turn to fund the shortfall.
    let to_alice = bob.crank().await;
    assert!(to_alice.is_empty());
    chain.mine_blocks(2);
    alice.apply_next_event().await;
    bob.apply_next_event().await;
    assert_eq!(bob.channel().on_chain.holdings.held(&Address::ZERO), U256::from(10));

    // Fully funded: both sides agree the outcome is affordable.
    let alice_allocation: BTreeMap<_, _> = [(
        Address::ZERO,
        Allocation::simple(Destination::from_address(alice.key.address()), U256::from(6)),
    )]
    .into_iter()
    .collect();
    for party in [&alice, &bob] {
        assert!(party.channel().affords(&alice_allocation, &party.channel().on_chain.holdings));
    }

    // Post-fund exchange completes the objective on both sides.
    let to_bob = alice.crank().await;
    bob.receive(&to_bob);
    let to_alice = bob.crank().await;
    alice.receive(&to_alice);

    let (alice_final, _, waiting_for) = alice.objective.crank(&alice.key).unwrap();
    assert_eq!(waiting_for.0, "WaitingForNothing");
    alice.objective = alice_final;

    assert_eq!(alice.objective.status(), ObjectiveStatus::Completed);
    assert_eq!(bob.objective.status(), ObjectiveStatus::Completed);
    assert!(alice.channel().has_supported_state());
    assert!(bob.channel().has_supported_state());
    assert!(alice.channel().post_fund_complete());
    assert_eq!(chain.holdings_for(alice.channel().id, Address::ZERO), U256::from(10));
    assert!(direct_fund::is_direct_fund_objective(&alice.objective.id()));

    // The confirmed watermark trails the head by the confirmation depth.
    assert_eq!(alice.service.get_last_confirmed_block_num(), chain.latest_block_num() - 2);

    futures::future::join(alice.service.close(), bob.service.close()).await;
}
