use super::client::{BlockHeader, Log};
use std::collections::VecDeque;

/// Holds received logs in arrival order until they are buried under the
/// required number of confirmations. The upstream log stream is ordered by
/// block number then log index, so arrival order is dispatch order.
///
/// The tracker itself is not synchronized; the chain service wraps it in a
/// mutex held only across the mutate-and-drain step.
#[derive(Debug)]
pub(crate) struct EventTracker {
    latest_block: BlockHeader,
    events: VecDeque<Log>,
}

impl EventTracker {
    pub fn new(start_block: BlockHeader) -> Self {
        EventTracker { latest_block: start_block, events: VecDeque::new() }
    }

    pub fn latest_block(&self) -> BlockHeader {
        self.latest_block
    }

    /// Records a newer head. Older headers (e.g. replayed after a
    /// resubscription) never move the watermark backwards.
    pub fn observe_block(&mut self, header: BlockHeader) {
        if header.block_num > self.latest_block.block_num {
            self.latest_block = header;
        }
    }

    pub fn push(&mut self, log: Log) {
        self.events.push_back(log);
    }

    /// Pops the oldest buffered log if it has at least `required_confirmations`
    /// blocks mined on top of it.
    pub fn pop_confirmed(&mut self, required_confirmations: u64) -> Option<Log> {
        let front_block = self.events.front()?.block_num;
        if self.latest_block.block_num >= front_block + required_confirmations {
            self.events.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// The highest block number considered safe from reorgs, floored at zero.
    pub fn last_confirmed_block_num(&self, required_confirmations: u64) -> u64 {
        self.latest_block.block_num.saturating_sub(required_confirmations)
    }
}
