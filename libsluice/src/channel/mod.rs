mod error;

pub use error::ChannelError;

use crate::chain::{ChainEvent, ChainEventDetail};
use crate::crypto::{SecretKey, Signature};
use crate::outcome::{Allocation, Exit};
use crate::signed_state::SignedState;
use crate::state::{FixedPart, State};
use crate::types::{Destination, Funds};
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Turn number of the pre-fund setup round.
pub const PRE_FUND_TURN_NUM: u64 = 0;
/// Turn number of the post-fund setup round.
pub const POST_FUND_TURN_NUM: u64 = 1;
/// Reserved value meaning "there is not yet a supported state".
pub const MAX_TURN_NUM: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelType {
    Ledger,
    Virtual,
    Swap,
}

/// The dispute status of a channel as derived from on-chain data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMode {
    /// No finalization is scheduled.
    #[default]
    Open,
    /// A challenge is registered and its clock is still running.
    Challenge,
    /// The finalization time has passed; the outcome can be paid out.
    Finalized,
}

impl Display for ChannelMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelMode::Open => write!(f, "Open"),
            ChannelMode::Challenge => write!(f, "Challenge"),
            ChannelMode::Finalized => write!(f, "Finalized"),
        }
    }
}

/// Ordering key of the last chain event applied to a channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainUpdateData {
    pub block_num: u64,
    pub tx_index: u64,
}

/// What the chain has told us about the channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainData {
    pub holdings: Funds,
    pub outcome: Exit,
    pub state_hash: B256,
    /// Unix timestamp at which a registered dispute finalizes; zero means no
    /// finalization is scheduled.
    pub finalizes_at: u64,
    pub is_challenge_initiated_by_me: bool,
    pub channel_mode: ChannelMode,
}

/// The channel's signed-state ledger. Rounds are only ever added, never
/// removed; the pre-fund and post-fund rounds are present from construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffChainData {
    signed_states: BTreeMap<u64, SignedState>,
    latest_supported_turn_num: u64,
}

impl OffChainData {
    pub fn signed_state_for(&self, turn_num: u64) -> Option<&SignedState> {
        self.signed_states.get(&turn_num)
    }

    pub fn latest_supported_turn_num(&self) -> u64 {
        self.latest_supported_turn_num
    }
}

/// An off-chain account between participants, combining the fixed
/// parameters, the signed-state ledger and the observed on-chain data.
///
/// Not internally synchronized: the owner must guarantee a single writer per
/// channel id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Destination,
    pub my_index: usize,
    pub channel_type: ChannelType,
    pub fixed: FixedPart,
    pub on_chain: OnChainData,
    off_chain: OffChainData,
    pub last_chain_update: ChainUpdateData,
}

impl Channel {
    /// Constructs a channel from its pre-fund state. The post-fund round is
    /// derived and stored alongside it, unsigned; on-chain holdings start at
    /// zero for every asset the outcome allocates.
    pub fn new(state: State, my_index: usize, channel_type: ChannelType) -> Result<Channel, ChannelError> {
        state.validate()?;
        if my_index >= state.fixed.participants.len() {
            return Err(ChannelError::InvalidMyIndex { index: my_index, participants: state.fixed.participants.len() });
        }
        if state.turn_num() != PRE_FUND_TURN_NUM {
            return Err(ChannelError::NotPreFundState(state.turn_num()));
        }

        let id = state.channel_id();
        let fixed = state.fixed.clone();

        let mut holdings = Funds::new();
        for (asset, _) in state.variable.outcome.total_allocated().iter() {
            holdings.insert(*asset, U256::ZERO);
        }

        let post_fund = state.with_turn_num(POST_FUND_TURN_NUM);
        let mut signed_states = BTreeMap::new();
        signed_states.insert(PRE_FUND_TURN_NUM, SignedState::new(state));
        signed_states.insert(POST_FUND_TURN_NUM, SignedState::new(post_fund));

        Ok(Channel {
            id,
            my_index,
            channel_type,
            fixed,
            on_chain: OnChainData { holdings, ..OnChainData::default() },
            off_chain: OffChainData { signed_states, latest_supported_turn_num: MAX_TURN_NUM },
            last_chain_update: ChainUpdateData::default(),
        })
    }

    pub fn off_chain(&self) -> &OffChainData {
        &self.off_chain
    }

    /// My own address, as a destination.
    pub fn my_destination(&self) -> Destination {
        Destination::from_address(self.fixed.participants[self.my_index])
    }

    /// The channel's counterparties, in participant order.
    pub fn other_participants(&self) -> Vec<Address> {
        self.fixed
            .participants
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.my_index)
            .map(|(_, p)| *p)
            .collect()
    }

    /// Adds a signed state to the ledger, updating the supported turn number
    /// when the round reaches full quorum. This is the single commit point of
    /// off-chain consensus.
    ///
    /// Returns false and leaves the channel untouched if the state belongs to
    /// a different channel, is stale (older than the supported turn number),
    /// carries an invalid signature, or conflicts with a recorded signature.
    pub fn add_signed_state(&mut self, ss: SignedState) -> bool {
        let state = ss.state();
        if state.channel_id() != self.id {
            log::debug!("discarding state for channel {}, expected {}", state.channel_id(), self.id);
            return false;
        }
        if self.off_chain.latest_supported_turn_num != MAX_TURN_NUM
            && state.turn_num() < self.off_chain.latest_supported_turn_num
        {
            // Stale round: consensus has already moved past it.
            return false;
        }
        if ss.verify().is_err() {
            return false;
        }

        let turn_num = state.turn_num();
        match self.off_chain.signed_states.get_mut(&turn_num) {
            None => {
                self.off_chain.signed_states.insert(turn_num, ss);
            }
            Some(existing) => {
                if existing.merge(&ss).is_err() {
                    return false;
                }
            }
        }

        if self.off_chain.signed_states[&turn_num].has_all_signatures() {
            self.off_chain.latest_supported_turn_num = turn_num;
        }
        true
    }

    /// Wraps a state and signature as a `SignedState` and adds it.
    pub fn add_state_with_signature(&mut self, state: State, signature: Signature) -> bool {
        let mut ss = SignedState::new(state);
        if ss.add_signature(signature).is_err() {
            return false;
        }
        self.add_signed_state(ss)
    }

    /// Signs the state with the local key and adds it to the ledger,
    /// returning the signed state for transmission to peers.
    pub fn sign_and_add_state(&mut self, state: State, key: &SecretKey) -> Result<SignedState, ChannelError> {
        let signature = state.sign(key)?;
        let mut ss = SignedState::new(state);
        ss.add_signature(signature)?;
        if !self.add_signed_state(ss.clone()) {
            return Err(ChannelError::StateRejected);
        }
        Ok(ss)
    }

    pub fn sign_and_add_prefund(&mut self, key: &SecretKey) -> Result<SignedState, ChannelError> {
        self.sign_and_add_state(self.pre_fund_state()?.clone(), key)
    }

    pub fn sign_and_add_postfund(&mut self, key: &SecretKey) -> Result<SignedState, ChannelError> {
        self.sign_and_add_state(self.post_fund_state()?.clone(), key)
    }

    fn bootstrap_round(&self, turn_num: u64) -> Result<&SignedState, ChannelError> {
        self.off_chain.signed_states.get(&turn_num).ok_or(ChannelError::MissingBootstrapRound(turn_num))
    }

    pub fn pre_fund_state(&self) -> Result<&State, ChannelError> {
        Ok(self.bootstrap_round(PRE_FUND_TURN_NUM)?.state())
    }

    pub fn post_fund_state(&self) -> Result<&State, ChannelError> {
        Ok(self.bootstrap_round(POST_FUND_TURN_NUM)?.state())
    }

    pub fn signed_pre_fund_state(&self) -> Result<&SignedState, ChannelError> {
        self.bootstrap_round(PRE_FUND_TURN_NUM)
    }

    pub fn signed_post_fund_state(&self) -> Result<&SignedState, ChannelError> {
        self.bootstrap_round(POST_FUND_TURN_NUM)
    }

    pub fn pre_fund_signed_by_me(&self) -> bool {
        self.round_signed_by_me(PRE_FUND_TURN_NUM)
    }

    pub fn post_fund_signed_by_me(&self) -> bool {
        self.round_signed_by_me(POST_FUND_TURN_NUM)
    }

    fn round_signed_by_me(&self, turn_num: u64) -> bool {
        self.off_chain
            .signed_states
            .get(&turn_num)
            .is_some_and(|ss| ss.has_signature_for(self.my_index))
    }

    /// True once every participant has signed the pre-fund round.
    pub fn pre_fund_complete(&self) -> bool {
        self.off_chain
            .signed_states
            .get(&PRE_FUND_TURN_NUM)
            .is_some_and(|ss| ss.has_all_signatures())
    }

    /// True once every participant has signed the post-fund round.
    pub fn post_fund_complete(&self) -> bool {
        self.off_chain
            .signed_states
            .get(&POST_FUND_TURN_NUM)
            .is_some_and(|ss| ss.has_all_signatures())
    }

    /// True if I have signed some final state.
    pub fn final_signed_by_me(&self) -> bool {
        self.off_chain
            .signed_states
            .values()
            .any(|ss| ss.state().is_final() && ss.has_signature_for(self.my_index))
    }

    /// True if the latest supported state is final.
    pub fn final_completed(&self) -> bool {
        self.latest_supported_state().map(|s| s.is_final()).unwrap_or(false)
    }

    pub fn has_supported_state(&self) -> bool {
        self.off_chain.latest_supported_turn_num != MAX_TURN_NUM
    }

    /// The latest round signed by every participant.
    pub fn latest_supported_signed_state(&self) -> Result<&SignedState, ChannelError> {
        if !self.has_supported_state() {
            return Err(ChannelError::NoSupportedState);
        }
        self.off_chain
            .signed_states
            .get(&self.off_chain.latest_supported_turn_num)
            .ok_or(ChannelError::NoSupportedState)
    }

    pub fn latest_supported_state(&self) -> Result<&State, ChannelError> {
        Ok(self.latest_supported_signed_state()?.state())
    }

    /// The highest-turn-number round signed by at least one participant.
    pub fn latest_signed_state(&self) -> Result<&SignedState, ChannelError> {
        self.off_chain
            .signed_states
            .values()
            .rev()
            .find(|ss| !ss.signatures().is_empty())
            .ok_or(ChannelError::NoSignedStates)
    }

    /// The per-asset total the pre-fund outcome allocates, i.e. the collateral
    /// the channel needs to be fully funded.
    pub fn total(&self) -> Result<Funds, ChannelError> {
        Ok(self.pre_fund_state()?.variable.outcome.total_allocated())
    }

    /// True if the latest supported state's outcome can satisfy the given
    /// allocations with the given funding.
    pub fn affords(&self, allocation_map: &BTreeMap<Address, Allocation>, funding: &Funds) -> bool {
        match self.latest_supported_state() {
            Ok(s) => s.variable.outcome.affords(allocation_map, funding),
            Err(_) => false,
        }
    }

    /// True if the event is strictly newer than the last one applied, by
    /// `(block number, tx index)` ordering.
    fn is_new_chain_event(&self, event: &ChainEvent) -> bool {
        event.block.block_num > self.last_chain_update.block_num
            || (event.block.block_num == self.last_chain_update.block_num
                && event.tx_index > self.last_chain_update.tx_index)
    }

    /// Applies a confirmed chain event to the on-chain side. Rejects events
    /// that are not strictly newer than the last applied one, making
    /// re-delivery a safe no-op for the caller to ignore.
    pub fn update_with_chain_event(&mut self, event: &ChainEvent) -> Result<(), ChannelError> {
        if !self.is_new_chain_event(event) {
            return Err(ChannelError::StaleChainEvent {
                block_num: event.block.block_num,
                tx_index: event.tx_index,
            });
        }

        match &event.detail {
            ChainEventDetail::Deposited { asset, now_held } => {
                self.on_chain.holdings.insert(*asset, *now_held);
            }
            ChainEventDetail::AllocationUpdated { asset, amount } => {
                self.on_chain.holdings.insert(*asset, *amount);
            }
            ChainEventDetail::Concluded => {
                // Conclusion finalizes the channel as of the concluding block.
                self.on_chain.finalizes_at = event.block.timestamp;
            }
            ChainEventDetail::ChallengeRegistered {
                candidate,
                candidate_signatures,
                finalizes_at,
                is_initiated_by_me,
            } => {
                let disputed = State::from_parts(&self.fixed, candidate);
                let mut ss = SignedState::new(disputed.clone());
                for signature in candidate_signatures {
                    ss.add_signature(*signature)?;
                }

                self.on_chain.state_hash = disputed.hash();
                self.on_chain.outcome = candidate.outcome.clone();
                self.on_chain.finalizes_at = *finalizes_at;
                self.on_chain.is_challenge_initiated_by_me = *is_initiated_by_me;

                // The challenge may concern a mirrored counterpart with a
                // different id; only fold the disputed state into our own
                // ledger when it is really ours.
                if event.channel_id == self.id {
                    self.add_signed_state(ss);
                }
            }
            ChainEventDetail::ChallengeCleared { .. } => {
                self.on_chain.state_hash = B256::ZERO;
                self.on_chain.outcome = Exit::default();
                self.on_chain.finalizes_at = 0;
            }
            ChainEventDetail::Reclaimed { asset, remaining_held } => {
                self.on_chain.holdings.insert(*asset, *remaining_held);
            }
            ChainEventDetail::StatusUpdated { state_hash } => {
                self.on_chain.state_hash = *state_hash;
            }
        }

        self.last_chain_update = ChainUpdateData { block_num: event.block.block_num, tx_index: event.tx_index };
        Ok(())
    }

    /// Rederives the channel mode from the finalization time and the latest
    /// block timestamp. Must be called whenever either changes; the result is
    /// never cached across on-chain updates.
    pub fn update_channel_mode(&mut self, latest_block_timestamp: u64) {
        self.on_chain.channel_mode = if self.on_chain.finalizes_at == 0 {
            ChannelMode::Open
        } else if self.on_chain.finalizes_at <= latest_block_timestamp {
            ChannelMode::Finalized
        } else {
            ChannelMode::Challenge
        };
    }
}
