//! Chain-facing types and services: confirmed adjudicator events, outbound
//! transactions, and the confirmation pipeline that produces the former.

pub mod client;
#[cfg(feature = "mock_chain")]
pub mod mock;
pub mod service;
pub(crate) mod tracker;

use crate::crypto::Signature;
use crate::outcome::Exit;
use crate::signed_state::SignedState;
use crate::state::VariablePart;
use crate::types::{Destination, Funds};
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// The block an event occurred in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub block_num: u64,
    pub timestamp: u64,
}

/// A confirmed adjudicator event, dispatched once its block is buried under
/// the required number of confirmations and still part of the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub channel_id: Destination,
    pub block: Block,
    /// Position of the emitting transaction within its block; the ordering
    /// tiebreaker for events in the same block.
    pub tx_index: u64,
    pub tx_hash: B256,
    pub detail: ChainEventDetail,
}

impl ChainEvent {
    /// Strictly-increasing ordering key for per-channel event application.
    pub fn ordering_key(&self) -> (u64, u64) {
        (self.block.block_num, self.tx_index)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEventDetail {
    /// Funds were deposited against the channel; `now_held` is the total the
    /// adjudicator holds for the asset after the deposit.
    Deposited { asset: Address, now_held: U256 },
    /// The channel's holdings for an asset changed through a payout.
    AllocationUpdated { asset: Address, amount: U256 },
    /// The channel was concluded on chain.
    Concluded,
    /// A challenge was registered with the given candidate state.
    ChallengeRegistered {
        candidate: VariablePart,
        candidate_signatures: Vec<Signature>,
        finalizes_at: u64,
        is_initiated_by_me: bool,
    },
    /// A registered challenge was cleared by a checkpoint or a later state.
    ChallengeCleared { new_turn_num_record: u64 },
    /// Guarantee funds for a finalized target were folded back into the
    /// channel; `remaining_held` is what the adjudicator still holds.
    Reclaimed { asset: Address, remaining_held: U256 },
    /// The adjudicator's stored status hash for the channel was replaced.
    StatusUpdated { state_hash: B256 },
}

impl ChainEventDetail {
    pub fn name(&self) -> &'static str {
        match self {
            ChainEventDetail::Deposited { .. } => "Deposited",
            ChainEventDetail::AllocationUpdated { .. } => "AllocationUpdated",
            ChainEventDetail::Concluded => "Concluded",
            ChainEventDetail::ChallengeRegistered { .. } => "ChallengeRegistered",
            ChainEventDetail::ChallengeCleared { .. } => "ChallengeCleared",
            ChainEventDetail::Reclaimed { .. } => "Reclaimed",
            ChainEventDetail::StatusUpdated { .. } => "StatusUpdated",
        }
    }
}

impl Display for ChainEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} event for channel {} at block {} (tx index {})",
            self.detail.name(),
            self.channel_id,
            self.block.block_num,
            self.tx_index
        )
    }
}

/// Arguments for reclaiming guarantee funds from a finalized target channel
/// back into its funding source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimArgs {
    pub source_channel_id: Destination,
    pub source_state: SignedState,
    pub source_asset_index: u64,
    pub index_of_target_in_source: u64,
    pub target_state_hash: B256,
    pub target_outcome: Exit,
    pub target_asset_index: u64,
}

/// An outbound adjudicator transaction. Each variant maps to exactly one
/// contract call; submission failures surface synchronously to the caller
/// and retries are the requesting objective's decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainTransaction {
    /// Top up the channel's holdings by the given per-asset amounts.
    Deposit { channel_id: Destination, deposit: Funds },
    /// Register a challenge with a candidate state and supporting proof.
    Challenge {
        channel_id: Destination,
        candidate: SignedState,
        proof: Vec<SignedState>,
        challenger_sig: Signature,
    },
    /// Refresh the adjudicator's turn number record to clear a challenge.
    Checkpoint { channel_id: Destination, candidate: SignedState, proof: Vec<SignedState> },
    /// Pay out a finalized channel's outcome.
    TransferAll { channel_id: Destination, transfer_state: SignedState },
    /// Conclude a finally-signed channel and pay out in one call.
    WithdrawAll { channel_id: Destination, signed_state: SignedState },
    /// Fold guarantee funds for a finalized target back into this channel.
    Reclaim { channel_id: Destination, args: ReclaimArgs },
    /// Record the link between a mirrored channel and its counterpart on the
    /// other chain.
    SetMirroredChannel { channel_id: Destination, mirror_channel_id: Destination },
    /// Replace the mirrored channel's recorded state and holdings.
    UpdateMirroredChannelState {
        channel_id: Destination,
        state_hash: B256,
        outcome: Exit,
        asset: Address,
        amount: U256,
    },
}

impl ChainTransaction {
    pub fn channel_id(&self) -> Destination {
        match self {
            ChainTransaction::Deposit { channel_id, .. }
            | ChainTransaction::Challenge { channel_id, .. }
            | ChainTransaction::Checkpoint { channel_id, .. }
            | ChainTransaction::TransferAll { channel_id, .. }
            | ChainTransaction::WithdrawAll { channel_id, .. }
            | ChainTransaction::Reclaim { channel_id, .. }
            | ChainTransaction::SetMirroredChannel { channel_id, .. }
            | ChainTransaction::UpdateMirroredChannelState { channel_id, .. } => *channel_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChainTransaction::Deposit { .. } => "Deposit",
            ChainTransaction::Challenge { .. } => "Challenge",
            ChainTransaction::Checkpoint { .. } => "Checkpoint",
            ChainTransaction::TransferAll { .. } => "TransferAll",
            ChainTransaction::WithdrawAll { .. } => "WithdrawAll",
            ChainTransaction::Reclaim { .. } => "Reclaim",
            ChainTransaction::SetMirroredChannel { .. } => "SetMirroredChannel",
            ChainTransaction::UpdateMirroredChannelState { .. } => "UpdateMirroredChannelState",
        }
    }
}
