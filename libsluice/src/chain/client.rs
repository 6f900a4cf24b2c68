use crate::crypto::Signature;
use crate::outcome::Exit;
use crate::signed_state::SignedState;
use crate::state::VariablePart;
use crate::types::Destination;
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Clone, Debug, Error)]
pub enum ChainClientError {
    #[error("RPC request failed: {0}")]
    Rpc(String),
    #[error("No block at height {0}")]
    BlockNotFound(u64),
    #[error("No transaction with hash {0}")]
    TransactionNotFound(B256),
    #[error("Could not establish subscription: {0}")]
    SubscriptionFailed(String),
    #[error("Transaction submission failed: {0}")]
    SubmissionFailed(String),
}

/// A block header as observed from the head subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub block_num: u64,
    pub block_hash: B256,
    pub timestamp: u64,
}

/// The decoded payload of an adjudicator log, before confirmation. Fields
/// that require extra lookups (block timestamps, the submitting sender) are
/// attached at dispatch time, once the log has confirmed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogPayload {
    Deposited { asset: Address, now_held: U256 },
    AllocationUpdated { asset: Address, amount: U256 },
    Concluded,
    ChallengeRegistered { candidate: VariablePart, candidate_signatures: Vec<Signature>, finalizes_at: u64 },
    ChallengeCleared { new_turn_num_record: u64 },
    Reclaimed { asset: Address, remaining_held: U256 },
    StatusUpdated { state_hash: B256 },
}

/// A raw adjudicator log together with its position in the chain. The block
/// hash recorded at arrival is compared against the chain's current view
/// before dispatch to detect reorgs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub channel_id: Destination,
    pub block_num: u64,
    pub block_hash: B256,
    pub tx_index: u64,
    pub tx_hash: B256,
    pub payload: LogPayload,
}

/// Selects adjudicator logs by block range. An unset end means "to head".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub adjudicator: Address,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
}

/// Status of a submitted transaction as reported by the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionInfo {
    pub tx_hash: B256,
    pub pending: bool,
}

/// Live subscription streams. Dropping the receiver unsubscribes; the
/// upstream closing its side signals a broken subscription and the consumer
/// is expected to resubscribe.
pub type HeadStream = mpsc::Receiver<BlockHeader>;
pub type LogStream = mpsc::Receiver<Log>;

/// The minimal Ethereum-style RPC surface the confirmation pipeline needs.
pub trait ChainClient: Send + Sync {
    /// Fetch a block header by height; `None` fetches the chain head.
    fn block_by_number(&self, block_num: Option<u64>) -> impl Future<Output = Result<BlockHeader, ChainClientError>> + Send;

    /// Query historical adjudicator logs. Providers cap the queryable block
    /// range, so callers chunk their requests.
    fn filter_logs(&self, filter: &LogFilter) -> impl Future<Output = Result<Vec<Log>, ChainClientError>> + Send;

    /// Subscribe to adjudicator logs from the current head onwards.
    fn subscribe_logs(&self, filter: &LogFilter) -> impl Future<Output = Result<LogStream, ChainClientError>> + Send;

    /// Subscribe to new block headers.
    fn subscribe_new_heads(&self) -> impl Future<Output = Result<HeadStream, ChainClientError>> + Send;

    fn chain_id(&self) -> impl Future<Output = Result<u64, ChainClientError>> + Send;

    fn transaction_by_hash(&self, tx_hash: B256) -> impl Future<Output = Result<TransactionInfo, ChainClientError>> + Send;

    /// The address that submitted the given mined transaction.
    fn transaction_sender(&self, tx_hash: B256) -> impl Future<Output = Result<Address, ChainClientError>> + Send;
}

/// The adjudicator contract's write surface, kept opaque: one method per
/// chain transaction variant, each submitting exactly one contract call and
/// resolving once the transaction is accepted by the RPC node (not mined).
pub trait AdjudicatorClient: Send + Sync {
    /// The amount the adjudicator currently holds for the channel and asset.
    fn holdings(
        &self,
        channel_id: Destination,
        asset: Address,
    ) -> impl Future<Output = Result<U256, ChainClientError>> + Send;

    fn deposit(
        &self,
        channel_id: Destination,
        asset: Address,
        expected_held: U256,
        amount: U256,
    ) -> impl Future<Output = Result<B256, ChainClientError>> + Send;

    fn challenge(
        &self,
        channel_id: Destination,
        candidate: &SignedState,
        proof: &[SignedState],
        challenger_sig: Signature,
    ) -> impl Future<Output = Result<B256, ChainClientError>> + Send;

    fn checkpoint(
        &self,
        channel_id: Destination,
        candidate: &SignedState,
        proof: &[SignedState],
    ) -> impl Future<Output = Result<B256, ChainClientError>> + Send;

    fn transfer_all_assets(
        &self,
        channel_id: Destination,
        transfer_state: &SignedState,
    ) -> impl Future<Output = Result<B256, ChainClientError>> + Send;

    fn conclude_and_transfer_all_assets(
        &self,
        channel_id: Destination,
        signed_state: &SignedState,
    ) -> impl Future<Output = Result<B256, ChainClientError>> + Send;

    fn reclaim(&self, args: &super::ReclaimArgs) -> impl Future<Output = Result<B256, ChainClientError>> + Send;

    fn set_mirrored_channel(
        &self,
        channel_id: Destination,
        mirror_channel_id: Destination,
    ) -> impl Future<Output = Result<B256, ChainClientError>> + Send;

    fn update_mirrored_channel_state(
        &self,
        channel_id: Destination,
        state_hash: B256,
        outcome: &Exit,
        asset: Address,
        amount: U256,
    ) -> impl Future<Output = Result<B256, ChainClientError>> + Send;
}
