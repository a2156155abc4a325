//! # Channel Reliability
//!
//! Each channel runs an independent reliable byte-command stream: its own
//! sequence space, its own resend ledger, its own reorder buffer. A stall
//! on one channel never blocks delivery on another.
//!
//! Acknowledgments are cumulative plus a 64-bit selective bitmap
//! ([`AckRecord`]). Retransmission timers back off exponentially per entry,
//! and entries that were ever retransmitted are excluded from RTT sampling.

use bytes::Bytes;
use quanta::Instant;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::trace;

use crate::wire::{AckRecord, Command, VarInt};

/// One in-order deliverable carried on a reliable sequence slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelItem {
    /// A complete packet payload.
    Packet(Bytes),
    /// One piece of a fragmented packet; reassembly happens upstream.
    Fragment {
        group: u64,
        index: u16,
        count: u16,
        payload: Bytes,
    },
    /// RTT probe occupying a sequence slot on the control channel.
    Ping,
}

struct ResendEntry {
    command: Command,
    /// Payload bytes charged against the congestion window.
    bytes: usize,
    sent_at: Instant,
    next_resend: Instant,
    retries: u32,
    /// Karn's rule: once retransmitted, never an RTT sample.
    retransmitted: bool,
}

/// Result of an ack pass over the resend ledger.
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Congestion-window bytes released.
    pub acked_bytes: usize,
    /// RTT sample from the most recently sent never-retransmitted entry.
    pub rtt_sample: Option<Duration>,
    /// Count of newly acknowledged entries.
    pub acked_count: usize,
}

/// Result of a retransmission scan.
#[derive(Debug, Default)]
pub struct RetransmitOutcome {
    pub commands: Vec<Command>,
    /// Some entry exceeded the retry budget; the peer must be torn down.
    pub exhausted: bool,
}

pub struct Channel {
    id: u8,
    // send half
    next_seq: u64,
    next_group: u64,
    pub(crate) unsent: VecDeque<Command>,
    resend: BTreeMap<u64, ResendEntry>,
    // receive half
    expected: u64,
    reorder: BTreeMap<u64, ChannelItem>,
    reorder_capacity: usize,
    ack_pending: bool,
}

impl Channel {
    pub fn new(id: u8, reorder_capacity: usize) -> Self {
        Channel {
            id,
            // Sequence 0 is never assigned, so a cumulative ack of 0 means
            // nothing has been delivered yet.
            next_seq: 1,
            next_group: 0,
            unsent: VecDeque::new(),
            resend: BTreeMap::new(),
            expected: 1,
            reorder: BTreeMap::new(),
            reorder_capacity,
            ack_pending: false,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    // ─── Send Half ──────────────────────────────────────────────────────

    pub fn assign_seq(&mut self) -> VarInt {
        let seq = self.next_seq;
        self.next_seq += 1;
        VarInt::from_u64(seq)
    }

    pub fn assign_group(&mut self) -> VarInt {
        let group = self.next_group;
        self.next_group += 1;
        VarInt::from_u64(group)
    }

    /// Record a first transmission in the resend ledger.
    pub fn on_sent(&mut self, seq: VarInt, command: Command, bytes: usize, now: Instant, rto: Duration) {
        self.resend.insert(
            seq.value(),
            ResendEntry {
                command,
                bytes,
                sent_at: now,
                next_resend: now + rto,
                retries: 0,
                retransmitted: false,
            },
        );
    }

    /// Collect commands whose retransmission timer elapsed. Each scan doubles
    /// the offending entry's timer, clamped to `rto_max`.
    pub fn due_retransmits(
        &mut self,
        now: Instant,
        rto: Duration,
        rto_max: Duration,
        retry_limit: u32,
    ) -> RetransmitOutcome {
        let mut out = RetransmitOutcome::default();
        for (seq, entry) in self.resend.iter_mut() {
            if entry.next_resend > now {
                continue;
            }
            entry.retries += 1;
            if entry.retries > retry_limit {
                trace!(channel = self.id, seq, "retry budget exhausted");
                out.exhausted = true;
                return out;
            }
            entry.retransmitted = true;
            let backoff = rto
                .checked_mul(1u32 << entry.retries.min(16))
                .unwrap_or(rto_max)
                .min(rto_max);
            entry.next_resend = now + backoff;
            out.commands.push(entry.command.clone());
        }
        out
    }

    /// Drop acknowledged entries per the cumulative point and selective
    /// bitmap of `record`.
    pub fn process_ack(&mut self, record: &AckRecord, now: Instant) -> AckOutcome {
        let mut out = AckOutcome::default();
        let mut sample_sent_at = None;
        let acked: Vec<u64> = self
            .resend
            .keys()
            .copied()
            .filter(|&seq| record.covers(seq))
            .collect();
        for seq in acked {
            let entry = match self.resend.remove(&seq) {
                Some(entry) => entry,
                None => continue,
            };
            out.acked_bytes += entry.bytes;
            out.acked_count += 1;
            if !entry.retransmitted && sample_sent_at.map_or(true, |t| entry.sent_at > t) {
                sample_sent_at = Some(entry.sent_at);
            }
        }
        out.rtt_sample = sample_sent_at.map(|t| now.duration_since(t));
        out
    }

    /// Unacknowledged entries still on the ledger.
    pub fn in_flight(&self) -> usize {
        self.resend.len()
    }

    /// Whether anything is waiting to go out or be acknowledged.
    pub fn is_idle(&self) -> bool {
        self.unsent.is_empty() && self.resend.is_empty()
    }

    // ─── Receive Half ───────────────────────────────────────────────────

    /// Feed an arriving sequenced item. Returns the run of items now
    /// deliverable in order, which is empty when the item filled a gap
    /// behind other missing sequences.
    ///
    /// Duplicates are dropped but still re-armed for acknowledgment, so a
    /// sender whose ack was lost stops retransmitting. An item beyond the
    /// reorder buffer's capacity is rejected unacknowledged; the sender
    /// retransmits it once the window drains.
    pub fn receive(&mut self, seq: VarInt, item: ChannelItem) -> Vec<ChannelItem> {
        let seq = seq.value();
        if seq < self.expected || self.reorder.contains_key(&seq) {
            self.ack_pending = true;
            return Vec::new();
        }
        if seq > self.expected && self.reorder.len() >= self.reorder_capacity {
            trace!(channel = self.id, seq, "reorder buffer full, arrival rejected");
            return Vec::new();
        }

        self.ack_pending = true;
        if seq != self.expected {
            self.reorder.insert(seq, item);
            return Vec::new();
        }

        let mut run = vec![item];
        self.expected += 1;
        while let Some(next) = self.reorder.remove(&self.expected) {
            run.push(next);
            self.expected += 1;
        }
        run
    }

    /// Build the acknowledgment record for this channel, clearing the dirty
    /// flag. `None` when nothing new arrived since the last ack.
    pub fn take_ack(&mut self) -> Option<AckRecord> {
        if !self.ack_pending {
            return None;
        }
        self.ack_pending = false;
        let cumulative = self.expected - 1;
        // Bitmap bit i acknowledges cumulative + 1 + i. The bit for
        // `expected` itself can never be set, but keeping the wire mapping
        // uniform is worth the dead bit.
        let mut bitmap = 0u64;
        for (&seq, _) in self.reorder.range(self.expected + 1..self.expected + 64) {
            bitmap |= 1 << (seq - self.expected);
        }
        Some(AckRecord {
            channel: self.id,
            cumulative: VarInt::from_u64(cumulative),
            bitmap,
        })
    }

    /// Whether an ack is owed.
    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    /// Mark the channel as owing an ack again, after a taken record could
    /// not be sent.
    pub fn rearm_ack(&mut self) {
        self.ack_pending = true;
    }

    /// Whether `seq` was already delivered or is sitting in the reorder
    /// buffer.
    pub fn is_duplicate(&self, seq: VarInt) -> bool {
        let seq = seq.value();
        seq < self.expected || self.reorder.contains_key(&seq)
    }
}
