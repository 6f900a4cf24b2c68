//! Defunds a directly-funded channel: exchange a final state, let the first
//! participant withdraw everything on chain, and wait for the holdings to
//! drain. When the counterparty is unresponsive the channel is finalized
//! through a challenge instead.

use super::{ObjectiveError, ObjectiveId, ObjectiveStatus, SideEffects, WaitingFor};
use crate::chain::ChainTransaction;
use crate::channel::{Channel, ChannelMode};
use crate::crypto::SecretKey;
use crate::messages::{create_objective_payload_messages, create_rejection_notice_messages, ObjectivePayload};
use crate::signed_state::SignedState;
use crate::types::Destination;
use log::*;
use serde::{Deserialize, Serialize};

pub const OBJECTIVE_PREFIX: &str = "DirectDefunding-";
pub const SIGNED_STATE_PAYLOAD: &str = "SignedStatePayload";

pub const WAITING_FOR_FINALIZATION: WaitingFor = WaitingFor("WaitingForFinalization");
pub const WAITING_FOR_WITHDRAW: WaitingFor = WaitingFor("WaitingForWithdraw");
pub const WAITING_FOR_CHALLENGE: WaitingFor = WaitingFor("WaitingForChallenge");
pub const WAITING_FOR_NOTHING: WaitingFor = WaitingFor("WaitingForNothing");

/// The direct-defunding protocol instance for one channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectDefundObjective {
    pub status: ObjectiveStatus,
    pub c: Channel,
    /// Turn number the closing final state is expected to carry.
    final_turn_num: u64,
    /// Defund through an on-chain challenge instead of a cooperative close.
    pub is_challenge: bool,
    withdraw_transaction_submitted: bool,
    challenge_transaction_submitted: bool,
}

impl DirectDefundObjective {
    /// Starts defunding the supplied channel. Refused while the channel has
    /// an update in flight: the latest signed state must be supported or
    /// final, so only the agreed allocation can be paid out.
    pub fn new(channel: Channel, is_challenge: bool, pre_approve: bool) -> Result<Self, ObjectiveError> {
        if !is_in_consensus_or_final_state(&channel) {
            return Err(ObjectiveError::ChannelUpdateInProgress);
        }
        let latest_supported = channel.latest_supported_state()?;
        let final_turn_num =
            if latest_supported.is_final() { latest_supported.turn_num() } else { latest_supported.turn_num() + 1 };

        Ok(DirectDefundObjective {
            status: if pre_approve { ObjectiveStatus::Approved } else { ObjectiveStatus::Unapproved },
            c: channel,
            final_turn_num,
            is_challenge,
            withdraw_transaction_submitted: false,
            challenge_transaction_submitted: false,
        })
    }

    /// Builds the counterparty's view from an inbound closing payload.
    /// Implicit in the wire protocol is that the message signalling closure
    /// carries a final state.
    pub fn from_payload(
        channel: Channel,
        payload: &ObjectivePayload,
        pre_approve: bool,
    ) -> Result<Self, ObjectiveError> {
        let ss = signed_state_payload(payload)?;
        if !ss.state().is_final() {
            return Err(ObjectiveError::NonFinalState);
        }
        let mut objective = DirectDefundObjective::new(channel, false, pre_approve)?;
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

    /// Folds the counterparty's signature on the closing state into the
    /// channel. Only final states at the agreed turn number are accepted.
    pub fn update(&self, payload: &ObjectivePayload) -> Result<Self, ObjectiveError> {
        if payload.objective_id != self.id() {
            return Err(ObjectiveError::WrongObjective { expected: self.id(), got: payload.objective_id.clone() });
        }
        let ss = signed_state_payload(payload)?;
        if ss.signatures().is_empty() {
            return Err(ObjectiveError::MissingSignatures);
        }
        if !ss.state().is_final() {
            return Err(ObjectiveError::NonFinalState);
        }
        if ss.state().turn_num() != self.final_turn_num {
            return Err(ObjectiveError::UnexpectedTurnNum {
                expected: self.final_turn_num,
                got: ss.state().turn_num(),
            });
        }
        let mut updated = self.clone();
        if !updated.c.add_signed_state(ss) {
            debug!("{}: ignoring duplicate or stale final state", self.id());
        }
        Ok(updated)
    }

    pub fn crank(&self, key: &SecretKey) -> Result<(Self, SideEffects, WaitingFor), ObjectiveError> {
        if self.status != ObjectiveStatus::Approved {
            return Err(ObjectiveError::NotApproved);
        }
        let updated = self.clone();
        if updated.is_challenge || updated.c.on_chain.channel_mode != ChannelMode::Open {
            self.crank_with_challenge(updated, key)
        } else {
            self.crank_cooperative(updated, key)
        }
    }

    fn crank_cooperative(
        &self,
        mut updated: Self,
        key: &SecretKey,
    ) -> Result<(Self, SideEffects, WaitingFor), ObjectiveError> {
        let mut effects = SideEffects::default();
        let latest = updated.c.latest_signed_state()?.clone();

        // Sign and circulate a final state if we have not yet.
        if !latest.state().is_final() || !latest.has_signature_for(updated.c.my_index) {
            let mut to_sign = latest.state().clone();
            if !to_sign.is_final() {
                to_sign.variable.turn_num += 1;
                to_sign.variable.is_final = true;
            }
            let ss = updated.c.sign_and_add_state(to_sign, key)?;
            effects.messages_to_send.extend(create_objective_payload_messages(
                updated.id(),
                &ss,
                SIGNED_STATE_PAYLOAD,
                &updated.c.other_participants(),
            )?);
        }

        if !updated.c.latest_supported_state()?.is_final() {
            return Ok((updated, effects, WAITING_FOR_FINALIZATION));
        }

        if updated.c.on_chain.holdings.is_non_zero() {
            // The first participant submits the withdrawal; everyone waits
            // for the holdings to drain.
            if updated.c.my_index == 0 && !updated.withdraw_transaction_submitted {
                let signed_state = updated.c.latest_supported_signed_state()?.clone();
                effects
                    .transactions_to_submit
                    .push(ChainTransaction::WithdrawAll { channel_id: updated.c.id, signed_state });
                updated.withdraw_transaction_submitted = true;
            }
            return Ok((updated, effects, WAITING_FOR_WITHDRAW));
        }

        updated.status = ObjectiveStatus::Completed;
        Ok((updated, effects, WAITING_FOR_NOTHING))
    }

    fn crank_with_challenge(
        &self,
        mut updated: Self,
        key: &SecretKey,
    ) -> Result<(Self, SideEffects, WaitingFor), ObjectiveError> {
        let mut effects = SideEffects::default();

        if updated.is_challenge && !updated.challenge_transaction_submitted {
            let candidate = updated.c.latest_supported_signed_state()?.clone();
            let challenger_sig = key.sign_hash(candidate.state().challenge_hash())?;
            effects.transactions_to_submit.push(ChainTransaction::Challenge {
                channel_id: updated.c.id,
                candidate,
                proof: Vec::new(),
                challenger_sig,
            });
            updated.challenge_transaction_submitted = true;
            return Ok((updated, effects, WAITING_FOR_CHALLENGE));
        }

        match updated.c.on_chain.channel_mode {
            ChannelMode::Challenge => Ok((updated, effects, WAITING_FOR_FINALIZATION)),
            ChannelMode::Finalized => {
                if updated.c.on_chain.holdings.is_non_zero() {
                    if !updated.withdraw_transaction_submitted {
                        let transfer_state = updated.c.latest_supported_signed_state()?.clone();
                        effects
                            .transactions_to_submit
                            .push(ChainTransaction::TransferAll { channel_id: updated.c.id, transfer_state });
                        updated.withdraw_transaction_submitted = true;
                    }
                    Ok((updated, effects, WAITING_FOR_WITHDRAW))
                } else {
                    info!("{}: challenge finalized and assets paid out", updated.id());
                    updated.status = ObjectiveStatus::Completed;
                    Ok((updated, effects, WAITING_FOR_NOTHING))
                }
            }
            ChannelMode::Open => {
                if updated.is_challenge {
                    // Our challenge transaction has not been observed yet.
                    Ok((updated, effects, WAITING_FOR_CHALLENGE))
                } else {
                    // The challenge we were defending against was cleared.
                    updated.status = ObjectiveStatus::Completed;
                    Ok((updated, effects, WAITING_FOR_NOTHING))
                }
            }
        }
    }
}

fn is_in_consensus_or_final_state(channel: &Channel) -> bool {
    match channel.latest_signed_state() {
        // No signed states at all counts as consensus.
        Err(_) => true,
        Ok(latest) => {
            latest.state().is_final()
                || channel
                    .latest_supported_state()
                    .map(|supported| supported == latest.state())
                    .unwrap_or(false)
        }
    }
}

/// True if the objective id belongs to a direct-defunding objective.
pub fn is_direct_defund_objective(id: &ObjectiveId) -> bool {
    id.has_prefix(OBJECTIVE_PREFIX)
}

fn signed_state_payload(payload: &ObjectivePayload) -> Result<SignedState, ObjectiveError> {
    if payload.payload_type != SIGNED_STATE_PAYLOAD {
        return Err(ObjectiveError::MalformedPayload(format!("unexpected payload type {}", payload.payload_type)));
    }
    Ok(serde_json::from_slice(&payload.payload_data)?)
}
