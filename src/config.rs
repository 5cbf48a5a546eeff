use std::time::Duration;

/// Tunables for the swarm engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on one blocking poll call. Connect deadlines are
    /// re-checked every loop iteration, so this is also their granularity.
    pub poll_interval: Duration,
    /// Largest wire frame a peer may send before the connection is
    /// treated as abusive and closed.
    pub max_frame_bytes: usize,
    /// Target number of outstanding block requests per unchoked peer.
    pub request_pipeline: usize,
    /// Size of the allowed-fast set granted to each peer.
    pub allowed_fast_slots: usize,
    /// Maximum number of concurrent peer connections.
    pub max_peers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_frame_bytes: 1024 * 1024,
            request_pipeline: 16,
            allowed_fast_slots: 10,
            max_peers: 50,
        }
    }
}
