//! Per-player inbound and outbound queues for both traffic classes.
//!
//! Net queues are plain FIFOs. Game queues are ordered by game time, with
//! ties broken by arrival order, so every peer replays the same sequence.
//! Arrival order is a single counter shared by all queues in a [`QueueSet`].

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};

use crate::messages::{Envelope, MAX_CONNECTED_PLAYERS, PlayerIndex, TrafficClass};

/// An envelope stamped with its arrival sequence number.
#[derive(Debug, Clone)]
struct Queued {
    seq: u64,
    envelope: Envelope,
}

impl Queued {
    fn key(&self) -> (u32, u64) {
        (self.envelope.game_time, self.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// FIFO of net envelopes.
#[derive(Debug, Default)]
pub struct NetQueue {
    items: VecDeque<Queued>,
}

impl NetQueue {
    fn push(&mut self, seq: u64, envelope: Envelope) {
        self.items.push_back(Queued { seq, envelope });
    }

    fn front_seq(&self) -> Option<u64> {
        self.items.front().map(|q| q.seq)
    }

    fn pop(&mut self) -> Option<Envelope> {
        self.items.pop_front().map(|q| q.envelope)
    }

    /// Number of queued envelopes.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Game envelopes ordered by `(game_time, arrival)`.
#[derive(Debug, Default)]
pub struct GameQueue {
    heap: BinaryHeap<Reverse<Queued>>,
}

impl GameQueue {
    fn push(&mut self, seq: u64, envelope: Envelope) {
        self.heap.push(Reverse(Queued { seq, envelope }));
    }

    fn peek_key(&self) -> Option<(u32, u64)> {
        self.heap.peek().map(|Reverse(q)| q.key())
    }

    fn pop(&mut self) -> Option<Envelope> {
        self.heap.pop().map(|Reverse(q)| q.envelope)
    }

    /// Number of queued envelopes.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[derive(Debug, Default)]
struct PlayerQueues {
    net_in: NetQueue,
    game_in: GameQueue,
    net_out: VecDeque<Envelope>,
    game_out: VecDeque<Envelope>,
}

/// One inbound and one outbound queue per (player, traffic class).
#[derive(Debug)]
pub struct QueueSet {
    players: Vec<PlayerQueues>,
    next_seq: u64,
}

impl Default for QueueSet {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueSet {
    /// Create queues for every player slot.
    pub fn new() -> Self {
        Self {
            players: (0..MAX_CONNECTED_PLAYERS)
                .map(|_| PlayerQueues::default())
                .collect(),
            next_seq: 0,
        }
    }

    fn slot(&mut self, player: PlayerIndex) -> Option<&mut PlayerQueues> {
        self.players.get_mut(player.as_usize())
    }

    /// Queue an envelope received from `envelope.source` for local delivery.
    ///
    /// Returns `false` if the source slot does not exist.
    pub fn push_inbound(&mut self, envelope: Envelope) -> bool {
        let seq = self.next_seq;
        let Some(q) = self.players.get_mut(envelope.source.as_usize()) else {
            return false;
        };
        match envelope.class() {
            TrafficClass::Net => q.net_in.push(seq, envelope),
            TrafficClass::Game => q.game_in.push(seq, envelope),
        }
        self.next_seq += 1;
        true
    }

    /// Queue an envelope for transmission on the connection of `to`.
    pub fn push_outbound(&mut self, to: PlayerIndex, envelope: Envelope) -> bool {
        let Some(q) = self.slot(to) else {
            return false;
        };
        match envelope.class() {
            TrafficClass::Net => q.net_out.push_back(envelope),
            TrafficClass::Game => q.game_out.push_back(envelope),
        }
        true
    }

    /// Take every outbound envelope for `to`, net traffic first.
    pub fn drain_outbound(&mut self, to: PlayerIndex) -> Vec<Envelope> {
        match self.slot(to) {
            Some(q) => q.net_out.drain(..).chain(q.game_out.drain(..)).collect(),
            None => Vec::new(),
        }
    }

    /// Next net envelope across all players, in global arrival order.
    pub fn pop_net(&mut self) -> Option<Envelope> {
        let (slot, _) = self
            .players
            .iter()
            .enumerate()
            .filter_map(|(i, q)| q.net_in.front_seq().map(|seq| (i, seq)))
            .min_by_key(|&(_, seq)| seq)?;
        self.players[slot].net_in.pop()
    }

    /// Next game envelope whose game time is strictly below `threshold`.
    ///
    /// Across all players the minimum `(game_time, arrival)` is released first.
    pub fn pop_game(&mut self, threshold: u32) -> Option<Envelope> {
        let (slot, (time, _)) = self
            .players
            .iter()
            .enumerate()
            .filter_map(|(i, q)| q.game_in.peek_key().map(|key| (i, key)))
            .min_by_key(|&(_, key)| key)?;
        if time >= threshold {
            return None;
        }
        self.players[slot].game_in.pop()
    }

    /// Queued inbound envelopes of one class for one player.
    pub fn inbound_len(&self, player: PlayerIndex, class: TrafficClass) -> usize {
        self.players
            .get(player.as_usize())
            .map_or(0, |q| match class {
                TrafficClass::Net => q.net_in.len(),
                TrafficClass::Game => q.game_in.len(),
            })
    }

    /// Forget everything queued for and from `player`.
    pub fn clear_player(&mut self, player: PlayerIndex) {
        if let Some(q) = self.slot(player) {
            *q = PlayerQueues::default();
        }
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        for q in &mut self.players {
            *q = PlayerQueues::default();
        }
    }
}
