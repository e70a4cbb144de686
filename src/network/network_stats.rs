/// Connection quality towards one remote peer.
///
/// Returned by [`RollbackSession::network_stats`](crate::RollbackSession::network_stats).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// Input rows waiting to be acknowledged by the peer.
    pub send_queue_len: usize,
    /// Round trip time in milliseconds.
    pub ping: u128,
    /// Estimated outgoing bandwidth in kilobits per second.
    pub kbps_sent: usize,
    /// How many frames the local simulation is behind the peer.
    pub local_frames_behind: i32,
    /// How many frames the peer reports being behind us.
    pub remote_frames_behind: i32,
    /// Milliseconds since the last packet from the peer.
    pub last_received_ms: u128,
}

impl NetworkStats {
    /// Creates zeroed stats.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NetworkStats {{ ping: {}ms, queue: {}, kbps: {}, local_behind: {}, remote_behind: {}, last_recv: {}ms }}",
            self.ping,
            self.send_queue_len,
            self.kbps_sent,
            self.local_frames_behind,
            self.remote_frames_behind,
            self.last_received_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_ping_and_queue() {
        let stats = NetworkStats {
            ping: 42,
            send_queue_len: 3,
            ..NetworkStats::new()
        };
        let text = stats.to_string();
        assert!(text.contains("ping: 42ms"));
        assert!(text.contains("queue: 3"));
    }
}
