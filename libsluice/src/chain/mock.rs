//! An in-memory chain double for exercising the confirmation pipeline and
//! funding protocols without a real node. Blocks are mined on demand, every
//! adjudicator call lands in its own block, and reorgs and dropped
//! subscriptions can be injected at will.

use super::client::{
    AdjudicatorClient, BlockHeader, ChainClient, ChainClientError, HeadStream, Log, LogFilter, LogPayload, LogStream,
    TransactionInfo,
};
use super::ReclaimArgs;
use crate::crypto::Signature;
use crate::outcome::Exit;
use crate::signed_state::SignedState;
use crate::types::Destination;
use alloy_primitives::{keccak256, Address, B256, U256};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const SUBSCRIPTION_BUFFER: usize = 256;
const BLOCK_INTERVAL_SECS: u64 = 12;

struct Inner {
    chain_id: u64,
    /// Index is the block number.
    blocks: Vec<BlockHeader>,
    /// Salt mixed into block hashes; bumped on reorg so rewritten blocks
    /// hash differently.
    salt: u64,
    logs: Vec<Log>,
    head_subs: Vec<mpsc::Sender<BlockHeader>>,
    log_subs: Vec<mpsc::Sender<Log>>,
    holdings: BTreeMap<(Destination, Address), U256>,
    tx_senders: HashMap<B256, Address>,
    tx_counter: u64,
}

impl Inner {
    fn block_hash(&self, block_num: u64) -> B256 {
        let mut data = Vec::with_capacity(26);
        data.extend_from_slice(&block_num.to_be_bytes());
        data.extend_from_slice(&self.salt.to_be_bytes());
        data.extend_from_slice(b"mock block");
        keccak256(&data)
    }

    fn mine(&mut self) -> BlockHeader {
        let block_num = self.blocks.len() as u64;
        let header = BlockHeader {
            block_num,
            block_hash: self.block_hash(block_num),
            timestamp: block_num * BLOCK_INTERVAL_SECS,
        };
        self.blocks.push(header);
        self.head_subs.retain(|sub| sub.try_send(header).is_ok());
        header
    }

    /// Mines a block carrying a single adjudicator log.
    fn emit(&mut self, channel_id: Destination, payload: LogPayload, sender: Address) -> B256 {
        self.tx_counter += 1;
        let mut data = Vec::with_capacity(15);
        data.extend_from_slice(&self.tx_counter.to_be_bytes());
        data.extend_from_slice(b"mock tx");
        let tx_hash = keccak256(&data);

        let header = self.mine();
        let log = Log {
            channel_id,
            block_num: header.block_num,
            block_hash: header.block_hash,
            tx_index: 0,
            tx_hash,
            payload,
        };
        self.logs.push(log.clone());
        self.tx_senders.insert(tx_hash, sender);
        self.log_subs.retain(|sub| sub.try_send(log.clone()).is_ok());
        tx_hash
    }

    fn held(&self, channel_id: Destination, asset: Address) -> U256 {
        self.holdings.get(&(channel_id, asset)).copied().unwrap_or(U256::ZERO)
    }
}

/// A handle onto a shared mock chain. Handles are cheap to clone;
/// [`MockChain::for_signer`] derives a handle whose adjudicator calls are
/// attributed to a different sender, so multiple parties can share one
/// chain.
#[derive(Clone)]
pub struct MockChain {
    inner: Arc<Mutex<Inner>>,
    signer: Address,
}

impl MockChain {
    pub fn new(signer: Address) -> Self {
        let mut inner = Inner {
            chain_id: 1337,
            blocks: Vec::new(),
            salt: 0,
            logs: Vec::new(),
            head_subs: Vec::new(),
            log_subs: Vec::new(),
            holdings: BTreeMap::new(),
            tx_senders: HashMap::new(),
            tx_counter: 0,
        };
        inner.mine(); // genesis
        MockChain { inner: Arc::new(Mutex::new(inner)), signer }
    }

    /// A handle on the same chain submitting transactions as `signer`.
    pub fn for_signer(&self, signer: Address) -> MockChain {
        MockChain { inner: Arc::clone(&self.inner), signer }
    }

    pub fn mine_block(&self) -> BlockHeader {
        self.inner.lock().unwrap().mine()
    }

    pub fn mine_blocks(&self, n: u64) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..n {
            inner.mine();
        }
    }

    pub fn latest_block_num(&self) -> u64 {
        self.inner.lock().unwrap().blocks.len() as u64 - 1
    }

    /// Rewrites every block from `from_block` onwards, as a reorg would.
    /// Logs emitted in the rewritten range disappear from history.
    pub fn reorg(&self, from_block: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.salt = rand::rng().random();
        for num in from_block..inner.blocks.len() as u64 {
            let rewritten = inner.block_hash(num);
            inner.blocks[num as usize].block_hash = rewritten;
        }
        inner.logs.retain(|log| log.block_num < from_block);
    }

    /// Kills every live subscription; consumers observe a closed stream.
    pub fn drop_subscriptions(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.head_subs.clear();
        inner.log_subs.clear();
    }

    /// Emits an arbitrary adjudicator log, attributed to this handle's
    /// signer.
    pub fn emit_log(&self, channel_id: Destination, payload: LogPayload) -> B256 {
        self.inner.lock().unwrap().emit(channel_id, payload, self.signer)
    }

    pub fn holdings_for(&self, channel_id: Destination, asset: Address) -> U256 {
        self.inner.lock().unwrap().held(channel_id, asset)
    }
}

impl ChainClient for MockChain {
    async fn block_by_number(&self, block_num: Option<u64>) -> Result<BlockHeader, ChainClientError> {
        let inner = self.inner.lock().unwrap();
        let num = block_num.unwrap_or(inner.blocks.len() as u64 - 1);
        inner.blocks.get(num as usize).copied().ok_or(ChainClientError::BlockNotFound(num))
    }

    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<Log>, ChainClientError> {
        let inner = self.inner.lock().unwrap();
        let from = filter.from_block.unwrap_or(0);
        let to = filter.to_block.unwrap_or(u64::MAX);
        Ok(inner.logs.iter().filter(|log| log.block_num >= from && log.block_num <= to).cloned().collect())
    }

    async fn subscribe_logs(&self, _filter: &LogFilter) -> Result<LogStream, ChainClientError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.inner.lock().unwrap().log_subs.push(tx);
        Ok(rx)
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream, ChainClientError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.inner.lock().unwrap().head_subs.push(tx);
        Ok(rx)
    }

    async fn chain_id(&self) -> Result<u64, ChainClientError> {
        Ok(self.inner.lock().unwrap().chain_id)
    }

    async fn transaction_by_hash(&self, tx_hash: B256) -> Result<TransactionInfo, ChainClientError> {
        let inner = self.inner.lock().unwrap();
        if inner.tx_senders.contains_key(&tx_hash) {
            Ok(TransactionInfo { tx_hash, pending: false })
        } else {
            Err(ChainClientError::TransactionNotFound(tx_hash))
        }
    }

    async fn transaction_sender(&self, tx_hash: B256) -> Result<Address, ChainClientError> {
        let inner = self.inner.lock().unwrap();
        inner
            .tx_senders
            .get(&tx_hash)
            .copied()
            .ok_or(ChainClientError::TransactionNotFound(tx_hash))
    }
}

impl AdjudicatorClient for MockChain {
    async fn holdings(&self, channel_id: Destination, asset: Address) -> Result<U256, ChainClientError> {
        Ok(self.inner.lock().unwrap().held(channel_id, asset))
    }

    async fn deposit(
        &self,
        channel_id: Destination,
        asset: Address,
        expected_held: U256,
        amount: U256,
    ) -> Result<B256, ChainClientError> {
        let mut inner = self.inner.lock().unwrap();
        let held = inner.held(channel_id, asset);
        if held != expected_held {
            return Err(ChainClientError::SubmissionFailed(format!(
                "deposit expected {expected_held} held but found {held}"
            )));
        }
        let now_held = held + amount;
        inner.holdings.insert((channel_id, asset), now_held);
        Ok(inner.emit(channel_id, LogPayload::Deposited { asset, now_held }, self.signer))
    }

    async fn challenge(
        &self,
        channel_id: Destination,
        candidate: &SignedState,
        _proof: &[SignedState],
        _challenger_sig: Signature,
    ) -> Result<B256, ChainClientError> {
        let mut inner = self.inner.lock().unwrap();
        let now = (inner.blocks.len() as u64 - 1) * BLOCK_INTERVAL_SECS;
        let payload = LogPayload::ChallengeRegistered {
            candidate: candidate.state().variable.clone(),
            candidate_signatures: candidate.signatures(),
            finalizes_at: now + candidate.state().fixed.challenge_duration as u64,
        };
        Ok(inner.emit(channel_id, payload, self.signer))
    }

    async fn checkpoint(
        &self,
        channel_id: Destination,
        candidate: &SignedState,
        _proof: &[SignedState],
    ) -> Result<B256, ChainClientError> {
        let mut inner = self.inner.lock().unwrap();
        let payload = LogPayload::ChallengeCleared { new_turn_num_record: candidate.state().turn_num() };
        Ok(inner.emit(channel_id, payload, self.signer))
    }

    async fn transfer_all_assets(
        &self,
        channel_id: Destination,
        transfer_state: &SignedState,
    ) -> Result<B256, ChainClientError> {
        let mut inner = self.inner.lock().unwrap();
        let mut last = B256::ZERO;
        for sae in &transfer_state.state().variable.outcome.0 {
            inner.holdings.insert((channel_id, sae.asset), U256::ZERO);
            last = inner.emit(
                channel_id,
                LogPayload::AllocationUpdated { asset: sae.asset, amount: U256::ZERO },
                self.signer,
            );
        }
        Ok(last)
    }

    async fn conclude_and_transfer_all_assets(
        &self,
        channel_id: Destination,
        signed_state: &SignedState,
    ) -> Result<B256, ChainClientError> {
        let mut inner = self.inner.lock().unwrap();
        inner.emit(channel_id, LogPayload::Concluded, self.signer);
        let mut last = B256::ZERO;
        for sae in &signed_state.state().variable.outcome.0 {
            inner.holdings.insert((channel_id, sae.asset), U256::ZERO);
            last = inner.emit(
                channel_id,
                LogPayload::AllocationUpdated { asset: sae.asset, amount: U256::ZERO },
                self.signer,
            );
        }
        Ok(last)
    }

    async fn reclaim(&self, args: &ReclaimArgs) -> Result<B256, ChainClientError> {
        let mut inner = self.inner.lock().unwrap();
        let asset = args
            .source_state
            .state()
            .variable
            .outcome
            .0
            .get(args.source_asset_index as usize)
            .map(|sae| sae.asset)
            .ok_or_else(|| ChainClientError::SubmissionFailed("no asset at source asset index".into()))?;
        let remaining_held = inner.held(args.source_channel_id, asset);
        Ok(inner.emit(args.source_channel_id, LogPayload::Reclaimed { asset, remaining_held }, self.signer))
    }

    async fn set_mirrored_channel(
        &self,
        _channel_id: Destination,
        _mirror_channel_id: Destination,
    ) -> Result<B256, ChainClientError> {
        let mut inner = self.inner.lock().unwrap();
        inner.tx_counter += 1;
        let tx_hash = keccak256(inner.tx_counter.to_be_bytes());
        inner.tx_senders.insert(tx_hash, self.signer);
        Ok(tx_hash)
    }

    async fn update_mirrored_channel_state(
        &self,
        channel_id: Destination,
        state_hash: B256,
        _outcome: &Exit,
        _asset: Address,
        _amount: U256,
    ) -> Result<B256, ChainClientError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.emit(channel_id, LogPayload::StatusUpdated { state_hash }, self.signer))
    }
}
