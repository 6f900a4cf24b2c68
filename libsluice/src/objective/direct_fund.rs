//! Directly funds a new ledger channel: exchange the pre-fund state, deposit
//! on-chain collateral in participant order, then exchange the post-fund
//! state once the channel is fully funded.

use super::{ObjectiveError, ObjectiveId, ObjectiveStatus, SideEffects, WaitingFor};
use crate::chain::ChainTransaction;
use crate::channel::{Channel, ChannelType};
use crate::crypto::SecretKey;
use crate::messages::{create_objective_payload_messages, create_rejection_notice_messages, ObjectivePayload};
use crate::signed_state::SignedState;
use crate::state::State;
use crate::types::{Destination, Funds};
use alloy_primitives::{Address, U256};
use log::*;
use serde::{Deserialize, Serialize};

pub const OBJECTIVE_PREFIX: &str = "DirectFunding-";
pub const SIGNED_STATE_PAYLOAD: &str = "SignedStatePayload";

pub const WAITING_FOR_COMPLETE_PREFUND: WaitingFor = WaitingFor("WaitingForCompletePrefund");
pub const WAITING_FOR_MY_TURN_TO_FUND: WaitingFor = WaitingFor("WaitingForMyTurnToFund");
pub const WAITING_FOR_COMPLETE_FUNDING: WaitingFor = WaitingFor("WaitingForCompleteFunding");
pub const WAITING_FOR_COMPLETE_POSTFUND: WaitingFor = WaitingFor("WaitingForCompletePostFund");
pub const WAITING_FOR_NOTHING: WaitingFor = WaitingFor("WaitingForNothing");

/// The direct-funding protocol instance for one channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectFundObjective {
    pub status: ObjectiveStatus,
    pub c: Channel,
    /// Holdings that must be reached before it is safe for me to deposit:
    /// the total allocated to participants ahead of me in payout order.
    my_deposit_safety_threshold: Funds,
    /// Holdings after my own deposit is included.
    my_deposit_target: Funds,
    /// Holdings at which the channel is fully collateralized.
    fully_funded_threshold: Funds,
    /// Whether a deposit transaction has been declared as a side effect by a
    /// previous crank.
    transaction_submitted: bool,
}

impl DirectFundObjective {
    /// Starts a funding objective from a freshly proposed pre-fund state.
    pub fn new(pre_fund_state: State, my_index: usize, pre_approve: bool) -> Result<Self, ObjectiveError> {
        let c = Channel::new(pre_fund_state, my_index, ChannelType::Ledger)?;
        let my_destination = c.my_destination();
        let outcome = &c.pre_fund_state()?.variable.outcome;

        let mut safety = Funds::new();
        let mut target = Funds::new();
        let mut total = Funds::new();
        for sae in &outcome.0 {
            let mut allocated_before_me = U256::ZERO;
            let mut allocated_to_me = U256::ZERO;
            let mut seen_me = false;
            for allocation in &sae.allocations {
                if allocation.destination == my_destination {
                    allocated_to_me += allocation.amount;
                    seen_me = true;
                } else if !seen_me {
                    allocated_before_me += allocation.amount;
                }
            }
            safety.insert(sae.asset, allocated_before_me);
            target.insert(sae.asset, allocated_before_me + allocated_to_me);
            total.insert(sae.asset, sae.total_allocated());
        }

        Ok(DirectFundObjective {
            status: if pre_approve { ObjectiveStatus::Approved } else { ObjectiveStatus::Unapproved },
            c,
            my_deposit_safety_threshold: safety,
            my_deposit_target: target,
            fully_funded_threshold: total,
            transaction_submitted: false,
        })
    }

    /// Builds the counterparty's view of the objective from an inbound
    /// pre-fund payload.
    pub fn from_payload(
        payload: &ObjectivePayload,
        my_address: Address,
        pre_approve: bool,
    ) -> Result<Self, ObjectiveError> {
        let ss = signed_state_payload(payload)?;
        let state = ss.state().clone();
        state.validate()?;

        let my_index = state
            .fixed
            .participants
            .iter()
            .position(|p| *p == my_address)
            .ok_or(ObjectiveError::NotAParticipant(my_address))?;

        let mut objective = DirectFundObjective::new(state, my_index, pre_approve)?;
        let expected = objective.id();
        if payload.objective_id != expected {
            return Err(ObjectiveError::WrongObjective { expected, got: payload.objective_id.clone() });
        }
        objective.c.add_signed_state(ss);
        Ok(objective)
    }

    pub fn id(&self) -> ObjectiveId {
        ObjectiveId::for_channel(OBJECTIVE_PREFIX, self.c.id)
    }

    pub fn owns_channel(&self) -> Destination {
        self.c.id
    }

    pub fn approve(&self) -> Self {
        let mut updated = self.clone();
        updated.status = ObjectiveStatus::Approved;
        updated
    }

    pub fn reject(&self) -> (Self, SideEffects) {
        let mut updated = self.clone();
        updated.status = ObjectiveStatus::Rejected;
        let effects = SideEffects {
            messages_to_send: create_rejection_notice_messages(self.id(), &self.c.other_participants()),
            ..SideEffects::default()
        };
        (updated, effects)
    }

    /// Folds an inbound signed setup state into the channel. Duplicate or
    /// stale deliveries are ignored, so the message transport may redeliver
    /// freely.
    pub fn update(&self, payload: &ObjectivePayload) -> Result<Self, ObjectiveError> {
        if payload.objective_id != self.id() {
            return Err(ObjectiveError::WrongObjective { expected: self.id(), got: payload.objective_id.clone() });
        }
        let ss = signed_state_payload(payload)?;
        let mut updated = self.clone();
        if !updated.c.add_signed_state(ss) {
            debug!("{}: ignoring duplicate, stale or invalid signed state", self.id());
        }
        Ok(updated)
    }

    pub fn crank(&self, key: &SecretKey) -> Result<(Self, SideEffects, WaitingFor), ObjectiveError> {
        if self.status != ObjectiveStatus::Approved {
            return Err(ObjectiveError::NotApproved);
        }
        let mut updated = self.clone();
        let mut effects = SideEffects::default();

        // Setup round 1: everyone signs the pre-fund state.
        if !updated.c.pre_fund_signed_by_me() {
            let ss = updated.c.sign_and_add_prefund(key)?;
            effects.messages_to_send.extend(create_objective_payload_messages(
                updated.id(),
                &ss,
                SIGNED_STATE_PAYLOAD,
                &updated.c.other_participants(),
            )?);
        }
        if !updated.c.pre_fund_complete() {
            return Ok((updated, effects, WAITING_FOR_COMPLETE_PREFUND));
        }

        // Collateralization: deposit my share once everyone ahead of me in
        // payout order has deposited theirs.
        let held = updated.c.on_chain.holdings.clone();
        if !held.covers(&updated.fully_funded_threshold) {
            if !held.covers(&updated.my_deposit_safety_threshold) {
                return Ok((updated, effects, WAITING_FOR_MY_TURN_TO_FUND));
            }
            let deposit = held.shortfall_to(&updated.my_deposit_target);
            if deposit.is_non_zero() && !updated.transaction_submitted {
                effects
                    .transactions_to_submit
                    .push(ChainTransaction::Deposit { channel_id: updated.c.id, deposit });
                updated.transaction_submitted = true;
            }
            return Ok((updated, effects, WAITING_FOR_COMPLETE_FUNDING));
        }

        // Setup round 2: everyone signs the post-fund state.
        if !updated.c.post_fund_signed_by_me() {
            let ss = updated.c.sign_and_add_postfund(key)?;
            effects.messages_to_send.extend(create_objective_payload_messages(
                updated.id(),
                &ss,
                SIGNED_STATE_PAYLOAD,
                &updated.c.other_participants(),
            )?);
        }
        if !updated.c.post_fund_complete() {
            return Ok((updated, effects, WAITING_FOR_COMPLETE_POSTFUND));
        }

        info!("{}: channel funded and post-fund complete", updated.id());
        updated.status = ObjectiveStatus::Completed;
        Ok((updated, effects, WAITING_FOR_NOTHING))
    }
}

/// True if the objective id belongs to a direct-funding objective.
pub fn is_direct_fund_objective(id: &ObjectiveId) -> bool {
    id.has_prefix(OBJECTIVE_PREFIX)
}

fn signed_state_payload(payload: &ObjectivePayload) -> Result<SignedState, ObjectiveError> {
    if payload.payload_type != SIGNED_STATE_PAYLOAD {
        return Err(ObjectiveError::MalformedPayload(format!("unexpected payload type {}", payload.payload_type)));
    }
    Ok(serde_json::from_slice(&payload.payload_data)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::PRE_FUND_TURN_NUM;
    use crate::messages::REJECTION_NOTICE_PAYLOAD;
    use crate::outcome::{Allocation, Exit, SingleAssetExit};
    use crate::state::{FixedPart, VariablePart};
    use alloy_primitives::U256;

    pub const ALICE_SK: &str = "2d999770f7b5d49b694080f987b82bbc9fc9ac2b4dcc10b0f8aba7d700f69c6d";
    pub const BOB_SK: &str = "0279651921cd800ac560c21ceea27aab0107b67daf436cdd25ce84cad30159b4";

    pub fn keys() -> (SecretKey, SecretKey) {
        (SecretKey::from_hex(ALICE_SK).unwrap(), SecretKey::from_hex(BOB_SK).unwrap())
    }

    pub fn prefund_state(alice: &SecretKey, bob: &SecretKey) -> State {
        State {
            fixed: FixedPart {
                participants: vec![alice.address(), bob.address()],
                channel_nonce: 400_001,
                app_definition: Address::repeat_byte(0x01),
                challenge_duration: 60,
            },
            variable: VariablePart {
                app_data: vec![],
                outcome: Exit(vec![SingleAssetExit {
                    asset: Address::ZERO,
                    metadata: vec![],
                    allocations: vec![
                        Allocation::simple(Destination::from_address(alice.address()), U256::from(7)),
                        Allocation::simple(Destination::from_address(bob.address()), U256::from(3)),
                    ],
                }]),
                turn_num: PRE_FUND_TURN_NUM,
                is_final: false,
            },
        }
    }

    fn payload_for(ss: &SignedState, id: ObjectiveId) -> ObjectivePayload {
        ObjectivePayload {
            objective_id: id,
            payload_type: SIGNED_STATE_PAYLOAD.to_string(),
            payload_data: serde_json::to_vec(ss).unwrap(),
        }
    }

    #[test]
    fn funding_milestones_follow_payout_order() {
        let (alice, bob) = keys();
        let state = prefund_state(&alice, &bob);

        let for_alice = DirectFundObjective::new(state.clone(), 0, true).unwrap();
        assert_eq!(for_alice.my_deposit_safety_threshold.held(&Address::ZERO), U256::ZERO);
        assert_eq!(for_alice.my_deposit_target.held(&Address::ZERO), U256::from(7));
        assert_eq!(for_alice.fully_funded_threshold.held(&Address::ZERO), U256::from(10));

        let for_bob = DirectFundObjective::new(state, 1, true).unwrap();
        assert_eq!(for_bob.my_deposit_safety_threshold.held(&Address::ZERO), U256::from(7));
        assert_eq!(for_bob.my_deposit_target.held(&Address::ZERO), U256::from(10));
    }

    #[test]
    fn crank_requires_approval() {
        let (alice, bob) = keys();
        let objective = DirectFundObjective::new(prefund_state(&alice, &bob), 0, false).unwrap();
        assert!(matches!(objective.crank(&alice), Err(ObjectiveError::NotApproved)));

        let approved = objective.approve();
        assert_eq!(approved.status, ObjectiveStatus::Approved);
        // The original is untouched.
        assert_eq!(objective.status, ObjectiveStatus::Unapproved);
        assert!(approved.crank(&alice).is_ok());
    }

    #[test]
    fn reject_notifies_counterparties() {
        let (alice, bob) = keys();
        let objective = DirectFundObjective::new(prefund_state(&alice, &bob), 0, false).unwrap();
        let (rejected, effects) = objective.reject();
        assert_eq!(rejected.status, ObjectiveStatus::Rejected);
        assert_eq!(effects.messages_to_send.len(), 1);
        assert_eq!(effects.messages_to_send[0].to, bob.address());
        assert_eq!(effects.messages_to_send[0].payload.payload_type, REJECTION_NOTICE_PAYLOAD);
    }

    #[test]
    fn first_crank_signs_and_sends_prefund() {
        let (alice, bob) = keys();
        let objective = DirectFundObjective::new(prefund_state(&alice, &bob), 0, true).unwrap();

        let (updated, effects, waiting_for) = objective.crank(&alice).unwrap();
        assert_eq!(waiting_for, WAITING_FOR_COMPLETE_PREFUND);
        assert!(updated.c.pre_fund_signed_by_me());
        assert_eq!(effects.messages_to_send.len(), 1);
        assert!(effects.transactions_to_submit.is_empty());

        // Crank again with no new information: same pause point, no new
        // side effects.
        let (again, effects2, waiting_for2) = updated.crank(&alice).unwrap();
        assert_eq!(waiting_for2, waiting_for);
        assert!(effects2.is_empty());
        assert!(again.c.pre_fund_signed_by_me());
    }

    #[test]
    fn deposits_wait_for_participants_ahead() {
        let (alice, bob) = keys();
        let state = prefund_state(&alice, &bob);

        // Bob's view, with the pre-fund round complete.
        let mut objective = DirectFundObjective::new(state.clone(), 1, true).unwrap();
        let prefund = objective.c.pre_fund_state().unwrap().clone();
        objective.c.sign_and_add_state(prefund.clone(), &bob).unwrap();
        let mut alices = SignedState::new(prefund.clone());
        alices.add_signature(prefund.sign(&alice).unwrap()).unwrap();
        assert!(objective.c.add_signed_state(alices));

        // Nothing deposited yet: it is not Bob's turn.
        let (updated, effects, waiting_for) = objective.crank(&bob).unwrap();
        assert_eq!(waiting_for, WAITING_FOR_MY_TURN_TO_FUND);
        assert!(effects.is_empty());

        // Alice's deposit lands; now Bob owes the difference.
        let mut funded = updated.clone();
        funded.c.on_chain.holdings.insert(Address::ZERO, U256::from(7));
        let (after, effects, waiting_for) = funded.crank(&bob).unwrap();
        assert_eq!(waiting_for, WAITING_FOR_COMPLETE_FUNDING);
        assert_eq!(effects.transactions_to_submit.len(), 1);
        match &effects.transactions_to_submit[0] {
            ChainTransaction::Deposit { channel_id, deposit } => {
                assert_eq!(*channel_id, after.c.id);
                assert_eq!(deposit.held(&Address::ZERO), U256::from(3));
            }
            other => panic!("expected a deposit transaction, got {}", other.name()),
        }

        // The deposit is only ever declared once.
        let (_, effects, waiting_for) = after.crank(&bob).unwrap();
        assert_eq!(waiting_for, WAITING_FOR_COMPLETE_FUNDING);
        assert!(effects.transactions_to_submit.is_empty());
    }

    #[test]
    fn update_is_tolerant_of_redelivery() {
        let (alice, bob) = keys();
        let state = prefund_state(&alice, &bob);
        let objective = DirectFundObjective::new(state.clone(), 0, true).unwrap();

        let mut ss = SignedState::new(state.clone());
        ss.add_signature(state.sign(&bob).unwrap()).unwrap();
        let payload = payload_for(&ss, objective.id());

        let updated = objective.update(&payload).unwrap();
        assert!(updated.c.signed_pre_fund_state().unwrap().has_signature_for(1));
        // Redelivery changes nothing and does not error.
        let again = updated.update(&payload).unwrap();
        assert_eq!(
            again.c.signed_pre_fund_state().unwrap(),
            updated.c.signed_pre_fund_state().unwrap()
        );

        let wrong = ObjectivePayload {
            objective_id: ObjectiveId("DirectFunding-0xdeadbeef".to_string()),
            ..payload.clone()
        };
        assert!(matches!(updated.update(&wrong), Err(ObjectiveError::WrongObjective { .. })));
    }

    #[test]
    fn counterparty_view_from_payload() {
        let (alice, bob) = keys();
        let state = prefund_state(&alice, &bob);
        let mut alices = DirectFundObjective::new(state.clone(), 0, true).unwrap();
        let ss = alices.c.sign_and_add_prefund(&alice).unwrap();
        let payload = payload_for(&ss, alices.id());

        let bobs = DirectFundObjective::from_payload(&payload, bob.address(), true).unwrap();
        assert_eq!(bobs.c.my_index, 1);
        assert_eq!(bobs.id(), alices.id());
        // Alice's signature came along with the payload.
        assert!(bobs.c.signed_pre_fund_state().unwrap().has_signature_for(0));

        let carol = Address::repeat_byte(0xcc);
        assert!(matches!(
            DirectFundObjective::from_payload(&payload, carol, true),
            Err(ObjectiveError::NotAParticipant(_))
        ));
    }
}
