use crate::signed_state::SignedStateError;
use crate::state::StateError;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    InvalidState(#[from] StateError),
    #[error("My participant index {index} is out of range for {participants} participants")]
    InvalidMyIndex { index: usize, participants: usize },
    #[error("A channel must be constructed from its pre-fund state, got turn number {0}")]
    NotPreFundState(u64),
    #[error("No state is yet supported")]
    NoSupportedState,
    #[error("No states are signed")]
    NoSignedStates,
    #[error("The bootstrap round for turn number {0} is missing")]
    MissingBootstrapRound(u64),
    #[error("The signed state was rejected by the channel")]
    StateRejected,
    #[error("Chain event at block {block_num} (tx index {tx_index}) is not newer than the channel's last update")]
    StaleChainEvent { block_num: u64, tx_index: u64 },
    #[error(transparent)]
    SignedState(#[from] SignedStateError),
}
