//! Bounded per-round buffers.

use std::collections::{BTreeMap, VecDeque};

use orca_core::{Epoch, OracleId, SeqNr};

use crate::messages::OutcomeGenerationMessage;

/// One sender's contribution to a round, with a cached verification verdict
#[derive(Debug, Clone)]
pub struct PoolEntry<T> {
    pub item: T,
    pub verified: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    Inserted,
    /// The sender already contributed to this round; the first one is kept
    Duplicate,
    OutOfWindow,
}

/// Items keyed by sequence number and sender, limited to a sliding window
#[derive(Debug)]
pub struct Pool<T> {
    rounds: BTreeMap<SeqNr, BTreeMap<OracleId, PoolEntry<T>>>,
    width: u64,
}

impl<T> Pool<T> {
    /// Pool accepting `[low, low + width]` for the caller-supplied `low`
    pub fn new(width: u64) -> Self {
        Pool {
            rounds: BTreeMap::new(),
            width,
        }
    }

    pub fn put(&mut self, low: SeqNr, seq_nr: SeqNr, sender: OracleId, item: T) -> PutResult {
        if seq_nr < low || seq_nr > low.saturating_add(self.width) {
            return PutResult::OutOfWindow;
        }
        let round = self.rounds.entry(seq_nr).or_default();
        if round.contains_key(&sender) {
            return PutResult::Duplicate;
        }
        round.insert(
            sender,
            PoolEntry {
                item,
                verified: None,
            },
        );
        PutResult::Inserted
    }

    pub fn round_mut(&mut self, seq_nr: SeqNr) -> Option<&mut BTreeMap<OracleId, PoolEntry<T>>> {
        self.rounds.get_mut(&seq_nr)
    }

    /// Forget every round below `seq_nr`
    pub fn reap_below(&mut self, seq_nr: SeqNr) {
        self.rounds = self.rounds.split_off(&seq_nr);
    }

    pub fn len(&self) -> usize {
        self.rounds.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}

/// Messages from epochs ahead of ours, kept in a small ring per sender
#[derive(Debug)]
pub struct FutureEpochBuffer {
    per_sender: Vec<VecDeque<OutcomeGenerationMessage>>,
    capacity: usize,
}

impl FutureEpochBuffer {
    pub fn new(n: usize, capacity: usize) -> Self {
        FutureEpochBuffer {
            per_sender: (0..n).map(|_| VecDeque::with_capacity(capacity)).collect(),
            capacity,
        }
    }

    /// Buffer a message, evicting the sender's oldest when full
    pub fn push(&mut self, sender: OracleId, message: OutcomeGenerationMessage) {
        let Some(ring) = self.per_sender.get_mut(sender.index()) else {
            return;
        };
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(message);
    }

    /// Remove and return, per sender in arrival order, the messages for
    /// `epoch`. Messages for older epochs are discarded.
    pub fn take_ready(&mut self, epoch: Epoch) -> Vec<(OracleId, OutcomeGenerationMessage)> {
        let mut ready = Vec::new();
        for (index, ring) in self.per_sender.iter_mut().enumerate() {
            let sender = OracleId(index as u8);
            let mut later = VecDeque::with_capacity(self.capacity);
            for message in ring.drain(..) {
                if message.epoch() == epoch {
                    ready.push((sender, message));
                } else if message.epoch() > epoch {
                    later.push_back(message);
                }
            }
            *ring = later;
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.per_sender.iter().map(VecDeque::len).sum()
    }
}
