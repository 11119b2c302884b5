//! Engine statistics

use tracing::info;

/// Counters kept by the mesh engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshStats {
    /// Connection messages received from neighbors
    pub messages_received: u64,
    /// Encrypted frames relayed to the next hop
    pub messages_forwarded: u64,
    /// Frames dropped because a connection queue was full
    pub dropped_buffer_full: u64,
    /// Frames or data dropped as duplicates or outside the window
    pub dropped_duplicate: u64,
    /// Frames dropped because their hop limit ran out
    pub dropped_ttl: u64,
    /// Messages dropped at transmit time by `drop_percent`
    pub dropped_testing: u64,
    /// Malformed or out-of-protocol messages
    pub protocol_violations: u64,
    /// Reliable data retransmissions
    pub data_retransmitted: u64,
    /// Payloads handed to local clients
    pub data_delivered: u64,
    pub connections_created: u64,
    pub connections_destroyed: u64,
    pub channels_created: u64,
    pub channels_destroyed: u64,
    pub tunnels_created: u64,
    pub tunnels_destroyed: u64,
}

impl MeshStats {
    /// Emit one summary line
    pub fn log(&self) {
        info!(
            "Stats: rx={} fwd={} drop(full={} dup={} ttl={} test={}) violations={} retx={} delivered={} conns={}/{} channels={}/{} tunnels={}/{}",
            self.messages_received,
            self.messages_forwarded,
            self.dropped_buffer_full,
            self.dropped_duplicate,
            self.dropped_ttl,
            self.dropped_testing,
            self.protocol_violations,
            self.data_retransmitted,
            self.data_delivered,
            self.connections_created,
            self.connections_destroyed,
            self.channels_created,
            self.channels_destroyed,
            self.tunnels_created,
            self.tunnels_destroyed,
        );
    }
}
