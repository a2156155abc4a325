//! Traffic counters, exported per peer and per host.
//!
//! Counters are monotonic and serializable, intended for periodic snapshots
//! into logs or dashboards.

use serde::Serialize;

/// Per-peer traffic counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PeerStats {
    /// Datagrams handed to the transport.
    pub datagrams_sent: u64,
    /// Datagrams received and accepted for this peer.
    pub datagrams_received: u64,
    /// Bytes handed to the transport, headers included.
    pub bytes_sent: u64,
    /// Bytes received, headers included.
    pub bytes_received: u64,
    /// Application packets queued for send.
    pub packets_sent: u64,
    /// Application packets delivered to the caller.
    pub packets_received: u64,
    /// Reliable commands retransmitted.
    pub retransmits: u64,
    /// Arrivals dropped as duplicates of already-delivered sequences.
    pub duplicates: u64,
    /// Fragment groups discarded by timeout or eviction.
    pub fragments_abandoned: u64,
    /// Smoothed round-trip time, microseconds. Zero until the first sample.
    pub srtt_us: u64,
}

/// Host-wide counters, aggregated across the socket.
#[derive(Debug, Default, Clone, Serialize)]
pub struct HostStats {
    /// Datagrams read off the socket, including ones later dropped.
    pub datagrams_received: u64,
    /// Datagrams dropped as malformed, misaddressed, or stale-session.
    pub datagrams_dropped: u64,
    /// Datagrams written to the socket.
    pub datagrams_sent: u64,
    /// Sends deferred by the outgoing bandwidth throttle.
    pub throttle_deferrals: u64,
    /// Connect attempts refused because the peer table was full.
    pub connects_refused: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_serialize_to_json() {
        let stats = PeerStats {
            datagrams_sent: 10,
            bytes_sent: 4200,
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["datagrams_sent"], 10);
        assert_eq!(json["bytes_sent"], 4200);
        assert_eq!(json["retransmits"], 0);
    }
}
