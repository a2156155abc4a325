//! # Fragmentation
//!
//! Payloads too large for one datagram are split into numbered fragments,
//! each sized to fit the negotiated MTU, and reassembled on the receiving
//! side. Reliable fragments ride the channel's ordinary sequence space, so
//! retransmission and ordering need no extra machinery here; their groups
//! always complete unless the whole connection dies, and are exempt from
//! the reassembly timer. Unreliable fragments are best-effort; a group
//! making no progress for the fragment timeout is discarded whole.
//!
//! The assembler allocates per fragment as data arrives. It never reserves
//! `count * mtu` up front, so a hostile `count` cannot force a large
//! allocation from a single small datagram.

use bytes::{Bytes, BytesMut};
use quanta::Instant;
use std::collections::HashMap;
use std::time::Duration;
use tracing::trace;

use crate::MAX_FRAGMENT_COUNT;

/// Split `payload` into chunks of at most `chunk_size` bytes. Slices share
/// the original buffer; nothing is copied.
pub fn split(payload: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    debug_assert!(chunk_size > 0);
    let mut chunks = Vec::with_capacity(payload.len().div_ceil(chunk_size));
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + chunk_size).min(payload.len());
        chunks.push(payload.slice(offset..end));
        offset = end;
    }
    chunks
}

// ─── Reassembly ─────────────────────────────────────────────────────────────

struct PartialGroup {
    chunks: Vec<Option<Bytes>>,
    received: u16,
    /// Reliable groups never expire; the channel retry budget already
    /// guarantees every piece arrives or the peer is torn down.
    reliable: bool,
    last_progress: Instant,
}

impl PartialGroup {
    fn new(count: u16, reliable: bool, now: Instant) -> Self {
        PartialGroup {
            chunks: vec![None; count as usize],
            received: 0,
            reliable,
            last_progress: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received as usize == self.chunks.len()
    }

    fn assemble(self) -> Bytes {
        let total: usize = self.chunks.iter().map(|c| c.as_ref().map_or(0, |b| b.len())).sum();
        let mut out = BytesMut::with_capacity(total);
        for chunk in self.chunks {
            // is_complete guaranteed every slot before assembly
            if let Some(chunk) = chunk {
                out.extend_from_slice(&chunk);
            }
        }
        out.freeze()
    }
}

/// Per-peer reassembly table, keyed by channel and group id.
pub struct Assembler {
    groups: HashMap<(u8, u64), PartialGroup>,
    capacity: usize,
    timeout: Duration,
}

impl Assembler {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Assembler {
            groups: HashMap::new(),
            capacity,
            timeout,
        }
    }

    /// Feed one fragment. Returns the whole payload when it completes the
    /// group. Malformed fragments (index out of range, count disagreeing
    /// with earlier fragments of the same group, duplicate slot) are
    /// dropped without touching existing state.
    pub fn insert(
        &mut self,
        channel: u8,
        group: u64,
        index: u16,
        count: u16,
        reliable: bool,
        payload: Bytes,
        now: Instant,
    ) -> Option<Bytes> {
        if count == 0 || count as usize > MAX_FRAGMENT_COUNT || index >= count {
            trace!(channel, group, index, count, "malformed fragment dropped");
            return None;
        }

        let key = (channel, group);
        if !self.groups.contains_key(&key) {
            if self.groups.len() >= self.capacity {
                self.evict_oldest();
            }
            self.groups.insert(key, PartialGroup::new(count, reliable, now));
        }

        let partial = self.groups.get_mut(&key)?;
        if partial.chunks.len() != count as usize {
            trace!(channel, group, "fragment count mismatch, group discarded");
            self.groups.remove(&key);
            return None;
        }
        let slot = &mut partial.chunks[index as usize];
        if slot.is_some() {
            return None;
        }
        *slot = Some(payload);
        partial.received += 1;
        partial.last_progress = now;

        if partial.is_complete() {
            let partial = self.groups.remove(&key)?;
            Some(partial.assemble())
        } else {
            None
        }
    }

    /// Drop unreliable groups that made no progress within the fragment
    /// timeout. Reliable groups are exempt: their missing pieces are still
    /// on a retry timer somewhere. Returns how many were discarded.
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.groups.len();
        self.groups.retain(|(channel, group), partial| {
            let keep =
                partial.reliable || now.duration_since(partial.last_progress) < timeout;
            if !keep {
                trace!(channel, group, "stalled fragment group discarded");
            }
            keep
        });
        before - self.groups.len()
    }

    /// Pending group count, for stats.
    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    /// Make room for a new group, preferring to sacrifice a best-effort
    /// group over a reliable one.
    fn evict_oldest(&mut self) {
        if let Some(key) = self
            .groups
            .iter()
            .min_by_key(|(_, p)| (p.reliable, p.last_progress))
            .map(|(k, _)| *k)
        {
            self.groups.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler() -> Assembler {
        Assembler::new(8, Duration::from_secs(3))
    }

    #[test]
    fn split_covers_payload_exactly() {
        let payload = Bytes::from(vec![7u8; 2500]);
        let chunks = split(&payload, 1000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 1000);
        assert_eq!(chunks[2].len(), 500);
        let rejoined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(rejoined, payload.to_vec());
    }

    #[test]
    fn out_of_order_fragments_reassemble() {
        let mut asm = assembler();
        let now = Instant::now();
        assert!(asm.insert(0, 1, 2, 3, false, Bytes::from_static(b"cc"), now).is_none());
        assert!(asm.insert(0, 1, 0, 3, false, Bytes::from_static(b"aa"), now).is_none());
        let whole = asm.insert(0, 1, 1, 3, false, Bytes::from_static(b"bb"), now);
        assert_eq!(whole.as_deref(), Some(&b"aabbcc"[..]));
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn duplicate_fragment_ignored() {
        let mut asm = assembler();
        let now = Instant::now();
        assert!(asm.insert(0, 1, 0, 2, false, Bytes::from_static(b"xx"), now).is_none());
        assert!(asm.insert(0, 1, 0, 2, false, Bytes::from_static(b"yy"), now).is_none());
        let whole = asm.insert(0, 1, 1, 2, false, Bytes::from_static(b"zz"), now);
        assert_eq!(whole.as_deref(), Some(&b"xxzz"[..]));
    }

    #[test]
    fn malformed_fragments_rejected() {
        let mut asm = assembler();
        let now = Instant::now();
        assert!(asm.insert(0, 1, 0, 0, false, Bytes::new(), now).is_none());
        assert!(asm.insert(0, 1, 5, 5, false, Bytes::new(), now).is_none());
        assert!(asm
            .insert(0, 1, 0, MAX_FRAGMENT_COUNT as u16 + 1, false, Bytes::new(), now)
            .is_none());
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn count_mismatch_discards_group() {
        let mut asm = assembler();
        let now = Instant::now();
        assert!(asm.insert(0, 1, 0, 3, false, Bytes::from_static(b"a"), now).is_none());
        assert!(asm.insert(0, 1, 1, 4, false, Bytes::from_static(b"b"), now).is_none());
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn stalled_group_expires() {
        let mut asm = assembler();
        let now = Instant::now();
        asm.insert(0, 1, 0, 2, false, Bytes::from_static(b"a"), now);
        assert_eq!(asm.expire(now + Duration::from_secs(4)), 1);
        assert_eq!(asm.pending(), 0);
        // A late fragment of the expired group starts a fresh partial.
        let later = now + Duration::from_secs(5);
        assert!(asm.insert(0, 1, 1, 2, false, Bytes::from_static(b"b"), later).is_none());
        assert_eq!(asm.pending(), 1);
    }

    #[test]
    fn reliable_group_survives_stall_and_completes() {
        let mut asm = assembler();
        let now = Instant::now();
        asm.insert(0, 1, 0, 2, true, Bytes::from_static(b"re"), now);
        assert_eq!(asm.expire(now + Duration::from_secs(60)), 0);
        assert_eq!(asm.pending(), 1);
        let whole = asm.insert(0, 1, 1, 2, true, Bytes::from_static(b"tx"), now + Duration::from_secs(61));
        assert_eq!(whole.as_deref(), Some(&b"retx"[..]));
    }

    #[test]
    fn progress_refreshes_expiry_clock() {
        let mut asm = assembler();
        let now = Instant::now();
        asm.insert(0, 1, 0, 3, false, Bytes::from_static(b"a"), now);
        // A fragment arriving at t+2s keeps the group alive past t+4s.
        asm.insert(0, 1, 1, 3, false, Bytes::from_static(b"b"), now + Duration::from_secs(2));
        assert_eq!(asm.expire(now + Duration::from_secs(4)), 0);
        assert_eq!(asm.expire(now + Duration::from_secs(6)), 1);
    }

    #[test]
    fn capacity_evicts_unreliable_before_reliable() {
        let mut asm = Assembler::new(2, Duration::from_secs(3));
        let now = Instant::now();
        asm.insert(0, 1, 0, 2, true, Bytes::from_static(b"r"), now);
        asm.insert(0, 2, 0, 2, false, Bytes::from_static(b"u"), now + Duration::from_millis(1));
        asm.insert(0, 3, 0, 2, false, Bytes::from_static(b"v"), now + Duration::from_millis(2));
        // The unreliable group 2 made way, not the older reliable group 1.
        let whole = asm.insert(0, 1, 1, 2, true, Bytes::from_static(b"!"), now + Duration::from_millis(3));
        assert_eq!(whole.as_deref(), Some(&b"r!"[..]));
    }

    #[test]
    fn capacity_evicts_oldest_group() {
        let mut asm = Assembler::new(2, Duration::from_secs(3));
        let now = Instant::now();
        asm.insert(0, 1, 0, 2, false, Bytes::from_static(b"a"), now);
        asm.insert(0, 2, 0, 2, false, Bytes::from_static(b"b"), now + Duration::from_millis(1));
        asm.insert(0, 3, 0, 2, false, Bytes::from_static(b"c"), now + Duration::from_millis(2));
        assert_eq!(asm.pending(), 2);
        // Group 1 was evicted; completing it now cannot succeed.
        assert!(asm
            .insert(0, 1, 1, 2, false, Bytes::from_static(b"a2"), now + Duration::from_millis(3))
            .is_none());
    }

    #[test]
    fn channels_do_not_share_groups() {
        let mut asm = assembler();
        let now = Instant::now();
        asm.insert(0, 1, 0, 2, false, Bytes::from_static(b"a"), now);
        asm.insert(1, 1, 0, 2, false, Bytes::from_static(b"x"), now);
        let whole = asm.insert(1, 1, 1, 2, false, Bytes::from_static(b"y"), now);
        assert_eq!(whole.as_deref(), Some(&b"xy"[..]));
        assert_eq!(asm.pending(), 1);
    }
}
