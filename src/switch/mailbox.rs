//! The per-link mailbox: bounded in ownership rather than size, it carries
//! peer wire messages and outbound forwarding packets, replays un-acked
//! packets across link restarts, and keeps the dust accounting for the
//! channel's commitments.

use super::circuit::CircuitKey;
use super::SwitchPacket;
use crate::wire::Message;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Which commitment a dust HTLC weighs on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommitmentSide {
    Local,
    Remote,
}

/// Decides whether an HTLC of the given amount is dust on the given
/// commitment side at the channel's current fee and dust parameters.
pub type DustClosure = Box<dyn Fn(u64, CommitmentSide) -> bool + Send + Sync>;

struct PacketEntry {
    packet: SwitchPacket,
    deadline: Instant,
}

#[derive(Default)]
struct MailboxState {
    messages: VecDeque<Message>,
    packets: VecDeque<PacketEntry>,
    /// Add packets handed to the link but not yet acked, in delivery order.
    unacked: Vec<(CircuitKey, SwitchPacket)>,
    /// Circuits acked (or torn down) before their packet was delivered;
    /// their packets are dropped silently.
    acked: HashSet<CircuitKey>,
    dust: Option<DustClosure>,
}

/// A mailbox is owned by exactly one link; the switch and peer reader only
/// deposit into it.
pub struct Mailbox {
    state: Mutex<MailboxState>,
    message_notify: Notify,
    packet_notify: Notify,
    delivery_timeout: Duration,
}

impl Mailbox {
    pub fn new(delivery_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MailboxState::default()),
            message_notify: Notify::new(),
            packet_notify: Notify::new(),
            delivery_timeout,
        }
    }

    // ----- wire messages -----

    pub fn add_message(&self, message: Message) {
        self.state
            .lock()
            .expect("mailbox lock")
            .messages
            .push_back(message);
        self.message_notify.notify_one();
    }

    pub async fn next_message(&self) -> Message {
        loop {
            let notified = self.message_notify.notified();
            if let Some(message) = self.state.lock().expect("mailbox lock").messages.pop_front()
            {
                return message;
            }
            notified.await;
        }
    }

    pub fn reset_messages(&self) {
        // Messages are at-most-once; a restart drops whatever was queued and
        // relies on channel reestablishment to resynchronize.
        self.state.lock().expect("mailbox lock").messages.clear();
    }

    // ----- forwarding packets -----

    /// Enqueue an outbound forwarding packet. A packet for an already-acked
    /// circuit, or one already pending, is dropped.
    pub fn add_packet(&self, packet: SwitchPacket) {
        let mut state = self.state.lock().expect("mailbox lock");
        let in_key = packet.in_key();
        if state.acked.contains(&in_key) {
            trace!("dropping packet for torn-down circuit {}", in_key);
            return;
        }
        if packet.is_add() {
            let pending = state
                .unacked
                .iter()
                .any(|(key, _)| *key == in_key)
                || state
                    .packets
                    .iter()
                    .any(|entry| entry.packet.is_add() && entry.packet.in_key() == in_key);
            if pending {
                trace!("dropping duplicate add packet for {}", in_key);
                return;
            }
        }
        state.packets.push_back(PacketEntry {
            packet,
            deadline: Instant::now() + self.delivery_timeout,
        });
        drop(state);
        self.packet_notify.notify_one();
    }

    /// Dequeue the next packet. Adds move to the un-acked set and stay there
    /// until the circuit is closed and `ack_packet` is called.
    pub async fn next_packet(&self) -> SwitchPacket {
        loop {
            let notified = self.packet_notify.notified();
            let popped = {
                let mut state = self.state.lock().expect("mailbox lock");
                loop {
                    match state.packets.pop_front() {
                        Some(entry) => {
                            let in_key = entry.packet.in_key();
                            if state.acked.contains(&in_key) {
                                continue;
                            }
                            if entry.packet.is_add() {
                                state.unacked.push((in_key, entry.packet.clone()));
                            }
                            break Some(entry.packet);
                        }
                        None => break None,
                    }
                }
            };
            if let Some(packet) = popped {
                return packet;
            }
            notified.await;
        }
    }

    /// Drop the un-acked packet for this circuit; called once the circuit is
    /// closed and the resolution has been delivered.
    pub fn ack_packet(&self, in_key: CircuitKey) -> bool {
        let mut state = self.state.lock().expect("mailbox lock");
        let before = state.unacked.len();
        state.unacked.retain(|(key, _)| *key != in_key);
        let removed = state.unacked.len() != before;
        if !removed {
            // The ack raced delivery; remember it so the queued packet is
            // dropped instead of delivered.
            state.acked.insert(in_key);
        }
        debug!("acked packet for circuit {} (removed: {})", in_key, removed);
        removed
    }

    /// Re-queue un-acked packets ahead of everything else so the restarting
    /// link replays them first.
    pub fn reset_packets(&self) {
        let mut state = self.state.lock().expect("mailbox lock");
        let unacked: Vec<SwitchPacket> = state
            .unacked
            .drain(..)
            .map(|(_, packet)| packet)
            .collect();
        for packet in unacked.into_iter().rev() {
            state.packets.push_front(PacketEntry {
                packet,
                deadline: Instant::now() + self.delivery_timeout,
            });
        }
        drop(state);
        self.packet_notify.notify_one();
    }

    /// Remove and return queued packets whose delivery deadline has passed;
    /// the link fails them upward with a temporary channel failure.
    pub fn take_expired(&self, now: Instant) -> Vec<SwitchPacket> {
        let mut state = self.state.lock().expect("mailbox lock");
        let mut expired = Vec::new();
        let mut keep = VecDeque::with_capacity(state.packets.len());
        while let Some(entry) = state.packets.pop_front() {
            if entry.deadline <= now {
                expired.push(entry.packet);
            } else {
                keep.push_back(entry);
            }
        }
        state.packets = keep;
        expired
    }

    // ----- dust accounting -----

    /// Install the predicate that classifies an HTLC as dust at the
    /// channel's current fee and dust-limit parameters.
    pub fn set_dust_closure(&self, closure: DustClosure) {
        self.state.lock().expect("mailbox lock").dust = Some(closure);
    }

    /// The sum of dust HTLC amounts among the packets this mailbox currently
    /// holds, on the given commitment side.
    pub fn get_dust_sum(&self, side: CommitmentSide) -> u64 {
        let state = self.state.lock().expect("mailbox lock");
        let Some(dust) = &state.dust else {
            return 0;
        };
        let queued = state
            .packets
            .iter()
            .filter(|entry| entry.packet.is_add())
            .map(|entry| entry.packet.amount);
        let unacked = state.unacked.iter().map(|(_, packet)| packet.amount);
        queued
            .chain(unacked)
            .filter(|amount| dust(*amount, side))
            .sum()
    }

    pub fn len_packets(&self) -> usize {
        let state = self.state.lock().expect("mailbox lock");
        state.packets.len() + state.unacked.len()
    }
}
