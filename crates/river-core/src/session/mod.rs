// Session bookkeeping shared by the client and server session tasks:
// identity, seq/ack send buffer, replay, and the aborted-stream tombstones.
//
// A session survives transport disconnects. Identity is the
// (local id, remote id) pair minted at handshake; a reconnect preserves
// both, a fresh session mints fresh ones. The send buffer holds every
// sequenced outbound message until the peer acks it, which is what makes
// replay-in-order possible after a reconnect.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use river_protocol::TransportMessage;
use uuid::Uuid;

pub(crate) mod client_session;
pub(crate) mod server_session;

pub use crate::events::SessionStateKind;

/// Tunables for session behavior. Heartbeat must be orders of magnitude
/// shorter than grace.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between outbound `ACK_ONLY` heartbeats while connected.
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat intervals with no inbound traffic before the
    /// connection is presumed dead.
    pub heartbeats_until_dead: u32,
    /// How long a disconnected session waits for a reconnect before it is
    /// destroyed.
    pub grace_period: Duration,
    /// Capacity of the per-session aborted-stream tombstone set.
    pub max_aborted_stream_tombstones_per_session: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            heartbeat_interval: Duration::from_secs(1),
            heartbeats_until_dead: 2,
            grace_period: Duration::from_secs(10),
            max_aborted_stream_tombstones_per_session: 5,
        }
    }
}

/// How an inbound sequenced message relates to what we've already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvClass {
    /// Exactly the next expected seq.
    Fresh,
    /// Already processed (a replay duplicate); drop silently.
    Duplicate,
    /// Skips past the contiguous tail; protocol invariant violation.
    Gap,
}

/// Identity, counters, and the unacked send buffer for one session
/// incarnation.
#[derive(Debug)]
pub(crate) struct SessionCore {
    pub local_id: String,
    pub remote_id: Option<String>,
    next_seq: u64,
    last_recv_seq: u64,
    last_peer_ack: u64,
    send_buffer: VecDeque<TransportMessage>,
}

impl SessionCore {
    pub fn new() -> Self {
        SessionCore {
            local_id: Uuid::new_v4().to_string(),
            remote_id: None,
            next_seq: 1,
            last_recv_seq: 0,
            last_peer_ack: 0,
            send_buffer: VecDeque::new(),
        }
    }

    /// Stamp a sequenced outbound message and retain a copy until acked.
    pub fn stamp_and_buffer(&mut self, msg: &mut TransportMessage) {
        msg.seq = self.next_seq;
        msg.ack = self.last_recv_seq;
        self.next_seq += 1;
        self.send_buffer.push_back(msg.clone());
    }

    /// Stamp an `ACK_ONLY` message. Not sequenced, not buffered; carries
    /// the current counters so the peer's ack window advances.
    pub fn stamp_ack_only(&mut self, msg: &mut TransportMessage) {
        msg.seq = self.next_seq.saturating_sub(1);
        msg.ack = self.last_recv_seq;
    }

    /// Release buffered messages the peer has now acknowledged. `Err` on an
    /// ack regression (the peer's ack must be non-decreasing).
    pub fn apply_ack(&mut self, ack: u64) -> Result<(), String> {
        if ack < self.last_peer_ack {
            return Err(format!(
                "ack regressed from {} to {}",
                self.last_peer_ack, ack
            ));
        }
        self.last_peer_ack = ack;
        while self
            .send_buffer
            .front()
            .is_some_and(|front| front.seq <= ack)
        {
            self.send_buffer.pop_front();
        }
        Ok(())
    }

    /// Classify an inbound sequenced message; advances the contiguous tail
    /// on `Fresh`.
    pub fn classify_recv(&mut self, seq: u64) -> RecvClass {
        if seq <= self.last_recv_seq {
            RecvClass::Duplicate
        } else if seq == self.last_recv_seq + 1 {
            self.last_recv_seq = seq;
            RecvClass::Fresh
        } else {
            RecvClass::Gap
        }
    }

    /// Unacked messages in seq order, with their ack fields refreshed, for
    /// replay after a reconnect.
    pub fn replay_messages(&self) -> Vec<TransportMessage> {
        let ack = self.last_recv_seq;
        self.send_buffer
            .iter()
            .cloned()
            .map(|mut msg| {
                msg.ack = ack;
                msg
            })
            .collect()
    }

    #[cfg(test)]
    pub fn buffered_len(&self) -> usize {
        self.send_buffer.len()
    }
}

/// Bounded FIFO set of aborted stream ids.
///
/// While an id is tombstoned, further messages for it are dropped and no
/// second abort is emitted. Eviction is insertion-order; a reused id that
/// was evicted earns a fresh abort but never a re-open.
#[derive(Debug)]
pub(crate) struct TombstoneSet {
    capacity: usize,
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl TombstoneSet {
    pub fn new(capacity: usize) -> Self {
        TombstoneSet {
            capacity,
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    pub fn insert(&mut self, stream_id: &str) {
        if self.capacity == 0 || self.set.contains(stream_id) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.order.push_back(stream_id.to_owned());
        self.set.insert(stream_id.to_owned());
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.set.contains(stream_id)
    }
}
