use super::client::{
    AdjudicatorClient, BlockHeader, ChainClient, ChainClientError, HeadStream, Log, LogFilter, LogPayload, LogStream,
};
use super::tracker::EventTracker;
use super::{Block, ChainEvent, ChainEventDetail, ChainTransaction};
use alloy_primitives::Address;
use log::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::Instant;

/// Tuning knobs for the confirmation pipeline. The defaults are production
/// values; tests inject smaller ones.
#[derive(Clone, Debug)]
pub struct ChainServiceConfig {
    /// Blocks that must be mined on top of an event's block before the event
    /// is dispatched.
    pub required_confirmations: u64,
    /// Initial delay before a resubscription attempt; doubles on every
    /// failure.
    pub min_backoff: Duration,
    /// Backoff ceiling. Once reached, the service gives up and reports a
    /// fatal error rather than retrying forever.
    pub max_backoff: Duration,
    /// How often to proactively refresh a live log subscription. Long-lived
    /// subscriptions are silently starved by some upstream nodes.
    pub resub_interval: Duration,
    /// Largest block range a single historical log query may span; RPC
    /// providers cap this.
    pub max_query_block_range: u64,
    /// Capacity of the outbound event feed. A full feed is a fatal
    /// condition: the consumer has stalled and events must not be dropped.
    pub event_buffer_capacity: usize,
}

impl Default for ChainServiceConfig {
    fn default() -> Self {
        ChainServiceConfig {
            required_confirmations: 2,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            resub_interval: Duration::from_secs(15),
            max_query_block_range: 2000,
            event_buffer_capacity: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChainServiceError {
    #[error(transparent)]
    Client(#[from] ChainClientError),
    #[error("Failed to re-establish the {0} subscription before exhausting backoff")]
    ResubscriptionExhausted(&'static str),
    #[error("The event feed is full; the consumer has stalled")]
    EventBufferFull,
    #[error("The {0} feed has already been taken")]
    FeedAlreadyTaken(&'static str),
}

/// Watches an adjudicator contract and submits transactions to it.
///
/// Two subscription tasks (block headers and contract logs) feed an
/// [`EventTracker`]; once a log is buried under the configured number of
/// confirmations and its block is still canonical it is dispatched on the
/// event feed as a typed [`ChainEvent`]. Subscriptions are refreshed
/// periodically and re-established with exponential backoff after errors,
/// re-scanning missed history each time. Unrecoverable failures surface on
/// the error feed and stop the service.
pub struct ChainService<C> {
    shared: Shared<C>,
    event_rx: Option<mpsc::Receiver<ChainEvent>>,
    error_rx: Option<mpsc::Receiver<ChainServiceError>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

struct Shared<C> {
    client: Arc<C>,
    tracker: Arc<Mutex<EventTracker>>,
    config: Arc<ChainServiceConfig>,
    filter: LogFilter,
    /// The address our adjudicator client submits transactions from; used to
    /// attribute observed challenges to ourselves.
    signer_address: Address,
    event_tx: mpsc::Sender<ChainEvent>,
    fatal_tx: mpsc::Sender<ChainServiceError>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<C> Clone for Shared<C> {
    fn clone(&self) -> Self {
        Shared {
            client: Arc::clone(&self.client),
            tracker: Arc::clone(&self.tracker),
            config: Arc::clone(&self.config),
            filter: self.filter.clone(),
            signer_address: self.signer_address,
            event_tx: self.event_tx.clone(),
            fatal_tx: self.fatal_tx.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
        }
    }
}

impl<C> ChainService<C>
where
    C: ChainClient + AdjudicatorClient + 'static,
{
    /// Connects the service: establishes both subscriptions, scans for
    /// events missed since `start_block_num`, and spawns the listener tasks.
    pub async fn new(
        client: C,
        adjudicator: Address,
        signer_address: Address,
        start_block_num: u64,
        config: ChainServiceConfig,
    ) -> Result<Self, ChainServiceError> {
        let client = Arc::new(client);
        let start_block = client.block_by_number(Some(start_block_num)).await?;
        let tracker = Arc::new(Mutex::new(EventTracker::new(start_block)));

        let (event_tx, event_rx) = mpsc::channel(config.event_buffer_capacity);
        let (fatal_tx, fatal_rx) = mpsc::channel(8);
        let (error_tx, error_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let filter = LogFilter { adjudicator, from_block: None, to_block: None };
        let shared = Shared {
            client: Arc::clone(&client),
            tracker,
            config: Arc::new(config),
            filter,
            signer_address,
            event_tx,
            fatal_tx,
            shutdown_rx,
        };

        // Subscribe before scanning history so no event can fall between the
        // scan and live delivery. Duplicates are handled downstream by each
        // channel's ordering check.
        let log_stream = client.subscribe_logs(&shared.filter).await?;
        let head_stream = client.subscribe_new_heads().await?;
        shared.check_for_missed_events(start_block.block_num).await?;

        let handles = vec![
            tokio::spawn(shared.clone().run_log_listener(log_stream)),
            tokio::spawn(shared.clone().run_head_listener(head_stream)),
            tokio::spawn(run_error_watchdog(fatal_rx, error_tx, shared.shutdown_rx.clone())),
        ];

        Ok(ChainService { shared, event_rx: Some(event_rx), error_rx: Some(error_rx), shutdown_tx, handles })
    }

    /// The stream of confirmed, reorg-checked chain events. Can be taken
    /// once.
    pub fn event_feed(&mut self) -> Result<mpsc::Receiver<ChainEvent>, ChainServiceError> {
        self.event_rx.take().ok_or(ChainServiceError::FeedAlreadyTaken("event"))
    }

    /// Fatal service errors. Receiving on this feed means the service has
    /// stopped observing the chain; continuing without it risks acting on
    /// stale data. Can be taken once.
    pub fn error_feed(&mut self) -> Result<mpsc::Receiver<ChainServiceError>, ChainServiceError> {
        self.error_rx.take().ok_or(ChainServiceError::FeedAlreadyTaken("error"))
    }

    /// Submits one transaction to the adjudicator, blocking until the RPC
    /// node acknowledges submission (not until mined). Failures are returned
    /// to the caller and not retried here: only the requesting objective
    /// knows whether a retry is still relevant.
    pub async fn send_transaction(&self, tx: &ChainTransaction) -> Result<(), ChainServiceError> {
        debug!("submitting {} transaction for channel {}", tx.name(), tx.channel_id());
        let client = &*self.shared.client;
        match tx {
            ChainTransaction::Deposit { channel_id, deposit } => {
                for (asset, amount) in deposit.iter() {
                    let held = client.holdings(*channel_id, *asset).await?;
                    client.deposit(*channel_id, *asset, held, *amount).await?;
                }
            }
            ChainTransaction::Challenge { channel_id, candidate, proof, challenger_sig } => {
                client.challenge(*channel_id, candidate, proof, *challenger_sig).await?;
            }
            ChainTransaction::Checkpoint { channel_id, candidate, proof } => {
                client.checkpoint(*channel_id, candidate, proof).await?;
            }
            ChainTransaction::TransferAll { channel_id, transfer_state } => {
                client.transfer_all_assets(*channel_id, transfer_state).await?;
            }
            ChainTransaction::WithdrawAll { channel_id, signed_state } => {
                client.conclude_and_transfer_all_assets(*channel_id, signed_state).await?;
            }
            ChainTransaction::Reclaim { args, .. } => {
                client.reclaim(args).await?;
            }
            ChainTransaction::SetMirroredChannel { channel_id, mirror_channel_id } => {
                client.set_mirrored_channel(*channel_id, *mirror_channel_id).await?;
            }
            ChainTransaction::UpdateMirroredChannelState { channel_id, state_hash, outcome, asset, amount } => {
                client
                    .update_mirrored_channel_state(*channel_id, *state_hash, outcome, *asset, *amount)
                    .await?;
            }
        }
        Ok(())
    }

    /// The highest block number considered safe from reorgs: the watermark
    /// consumers may persist and resume from.
    pub fn get_last_confirmed_block_num(&self) -> u64 {
        let tracker = self.shared.tracker.lock().unwrap();
        tracker.last_confirmed_block_num(self.shared.config.required_confirmations)
    }

    /// The most recent block header observed on the head subscription.
    pub fn latest_block(&self) -> Block {
        let header = self.shared.tracker.lock().unwrap().latest_block();
        Block { block_num: header.block_num, timestamp: header.timestamp }
    }

    pub async fn chain_id(&self) -> Result<u64, ChainServiceError> {
        Ok(self.shared.client.chain_id().await?)
    }

    /// Signals all tasks to stop, waits for them to unsubscribe and exit.
    pub async fn close(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

impl<C> Shared<C>
where
    C: ChainClient + AdjudicatorClient + 'static,
{
    async fn run_log_listener(mut self, mut stream: LogStream) {
        let period = self.config.resub_interval;
        let mut resub = time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => return,

                _ = resub.tick() => {
                    // Proactively replace the subscription before the
                    // upstream filter times out.
                    match self.resubscribe_logs().await {
                        Some(new_stream) => stream = new_stream,
                        None => return,
                    }
                }

                maybe_log = stream.recv() => match maybe_log {
                    Some(log) => {
                        debug!("queueing new chain event from block {}", log.block_num);
                        self.update_tracker(None, Some(log)).await;
                    }
                    None => {
                        warn!("chain log subscription closed");
                        match self.resubscribe_logs().await {
                            Some(new_stream) => stream = new_stream,
                            None => return,
                        }
                    }
                },
            }
        }
    }

    async fn run_head_listener(mut self, mut stream: HeadStream) {
        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => return,

                maybe_header = stream.recv() => match maybe_header {
                    Some(header) => {
                        trace!("detected new block {}", header.block_num);
                        self.update_tracker(Some(header), None).await;
                    }
                    None => {
                        warn!("chain new block subscription closed");
                        match self.resubscribe_heads().await {
                            Some(new_stream) => stream = new_stream,
                            None => return,
                        }
                    }
                },
            }
        }
    }

    /// Re-establishes the log subscription with exponential backoff, then
    /// re-scans history from the last confirmed block so nothing emitted
    /// while disconnected is lost. Returns `None` once backoff is exhausted
    /// or shutdown was requested; a fatal error has been reported in the
    /// former case.
    async fn resubscribe_logs(&mut self) -> Option<LogStream> {
        let resume_from = {
            let tracker = self.tracker.lock().unwrap();
            tracker.last_confirmed_block_num(self.config.required_confirmations)
        };

        let mut backoff = self.config.min_backoff;
        while backoff < self.config.max_backoff {
            tokio::select! {
                _ = self.shutdown_rx.changed() => return None,
                _ = time::sleep(backoff) => {}
            }
            match self.client.subscribe_logs(&self.filter).await {
                Ok(stream) => {
                    debug!("resubscribed to chain events");
                    if let Err(e) = self.check_for_missed_events(resume_from).await {
                        self.fatal(e).await;
                        return None;
                    }
                    return Some(stream);
                }
                Err(e) => {
                    warn!("failed to resubscribe to chain events, retrying after {backoff:?}: {e}");
                    backoff *= 2;
                }
            }
        }
        self.fatal(ChainServiceError::ResubscriptionExhausted("log")).await;
        None
    }

    async fn resubscribe_heads(&mut self) -> Option<HeadStream> {
        let mut backoff = self.config.min_backoff;
        while backoff < self.config.max_backoff {
            tokio::select! {
                _ = self.shutdown_rx.changed() => return None,
                _ = time::sleep(backoff) => {}
            }
            match self.client.subscribe_new_heads().await {
                Ok(stream) => {
                    debug!("resubscribed to chain new blocks");
                    return Some(stream);
                }
                Err(e) => {
                    warn!("failed to resubscribe to new blocks, retrying after {backoff:?}: {e}");
                    backoff *= 2;
                }
            }
        }
        self.fatal(ChainServiceError::ResubscriptionExhausted("new block")).await;
        None
    }

    /// Queries historical logs from `start_block` to the current head in
    /// bounded chunks and feeds them into the tracker.
    async fn check_for_missed_events(&self, start_block: u64) -> Result<(), ChainServiceError> {
        let latest = self.client.block_by_number(None).await?;
        info!("checking for missed chain events from block {start_block} to {}", latest.block_num);

        let mut current_start = start_block;
        while current_start <= latest.block_num {
            let current_end = latest.block_num.min(current_start + self.config.max_query_block_range);
            let chunk = LogFilter {
                adjudicator: self.filter.adjudicator,
                from_block: Some(current_start),
                to_block: Some(current_end),
            };
            let missed = match self.client.filter_logs(&chunk).await {
                Ok(logs) => logs,
                Err(e) => {
                    error!("failed to retrieve old chain logs: {e}");
                    return Err(e.into());
                }
            };
            debug!(
                "finished checking for missed chain events in blocks {current_start}..={current_end}, found {}",
                missed.len()
            );
            {
                let mut tracker = self.tracker.lock().unwrap();
                for log in missed {
                    tracker.push(log);
                }
            }
            current_start = current_end + 1;
        }
        Ok(())
    }

    /// Feeds a new header and/or log into the tracker, then dispatches every
    /// sufficiently confirmed event whose block is still canonical. The
    /// tracker lock is held only across the mutate-and-drain step, never
    /// across chain requests or dispatch.
    async fn update_tracker(&self, header: Option<BlockHeader>, log: Option<Log>) {
        let confirmed = {
            let mut tracker = self.tracker.lock().unwrap();
            if let Some(header) = header {
                tracker.observe_block(header);
            }
            if let Some(log) = log {
                tracker.push(log);
                debug!("event added to queue, queue length now {}", tracker.len());
            }
            let mut drained = Vec::new();
            while let Some(log) = tracker.pop_confirmed(self.config.required_confirmations) {
                drained.push(log);
            }
            drained
        };

        for log in confirmed {
            let current = match self.client.block_by_number(Some(log.block_num)).await {
                Ok(header) => header,
                Err(e) => {
                    self.fatal(e.into()).await;
                    return;
                }
            };
            if current.block_hash != log.block_hash {
                warn!(
                    "dropping event at block {} because its block is no longer in the chain (possible re-org)",
                    log.block_num
                );
                continue;
            }

            match self.to_chain_event(log, current.timestamp).await {
                Ok(event) => {
                    if !self.dispatch(event).await {
                        return;
                    }
                }
                Err(e) => {
                    self.fatal(e).await;
                    return;
                }
            }
        }
    }

    /// Converts a confirmed log into a typed event, attaching the block
    /// timestamp and, for challenges, whether we submitted the transaction.
    async fn to_chain_event(&self, log: Log, block_timestamp: u64) -> Result<ChainEvent, ChainServiceError> {
        let detail = match log.payload {
            LogPayload::Deposited { asset, now_held } => ChainEventDetail::Deposited { asset, now_held },
            LogPayload::AllocationUpdated { asset, amount } => ChainEventDetail::AllocationUpdated { asset, amount },
            LogPayload::Concluded => ChainEventDetail::Concluded,
            LogPayload::ChallengeRegistered { candidate, candidate_signatures, finalizes_at } => {
                let info = self.client.transaction_by_hash(log.tx_hash).await?;
                if info.pending {
                    return Err(ChainClientError::Rpc(
                        "expected transaction to be part of the chain, but it is pending".into(),
                    )
                    .into());
                }
                let sender = self.client.transaction_sender(log.tx_hash).await?;
                ChainEventDetail::ChallengeRegistered {
                    candidate,
                    candidate_signatures,
                    finalizes_at,
                    is_initiated_by_me: sender == self.signer_address,
                }
            }
            LogPayload::ChallengeCleared { new_turn_num_record } => {
                ChainEventDetail::ChallengeCleared { new_turn_num_record }
            }
            LogPayload::Reclaimed { asset, remaining_held } => ChainEventDetail::Reclaimed { asset, remaining_held },
            LogPayload::StatusUpdated { state_hash } => ChainEventDetail::StatusUpdated { state_hash },
        };
        Ok(ChainEvent {
            channel_id: log.channel_id,
            block: Block { block_num: log.block_num, timestamp: block_timestamp },
            tx_index: log.tx_index,
            tx_hash: log.tx_hash,
            detail,
        })
    }

    /// Hands an event to the consumer. A full feed is fatal: silently
    /// dropping a confirmed event would desynchronize every channel that
    /// depends on it. Returns false if the listener should stop.
    async fn dispatch(&self, event: ChainEvent) -> bool {
        trace!("dispatching {event}");
        match self.event_tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.fatal(ChainServiceError::EventBufferFull).await;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Consumer went away; shutdown is in progress.
                debug!("event feed closed, stopping dispatch");
                false
            }
        }
    }

    async fn fatal(&self, err: ChainServiceError) {
        error!("chain service error: {err}");
        let _ = self.fatal_tx.send(err).await;
    }
}

/// Forwards fatal errors from the listener tasks to the public error feed.
async fn run_error_watchdog(
    mut fatal_rx: mpsc::Receiver<ChainServiceError>,
    error_tx: mpsc::Sender<ChainServiceError>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            maybe_err = fatal_rx.recv() => match maybe_err {
                Some(err) => {
                    let _ = error_tx.send(err).await;
                }
                None => return,
            },
        }
    }
}
